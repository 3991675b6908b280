//! Session error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the session layer.
pub type Result<T> = std::result::Result<T, SessionError>;

/// A single per-field validation message returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Offending field, when the backend names one.
    pub field: Option<String>,
    pub message: String,
}

/// Errors surfaced by session operations and authenticated requests.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No response was received (connection failure or timeout).
    #[error("Network error: {message}")]
    Network { message: String, timed_out: bool },

    /// HTTP 401 before any refresh was attempted.
    ///
    /// Absorbed by the refresh coordinator; callers of
    /// [`SessionManager::request`](crate::SessionManager::request) never see it.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The credential could not be renewed, or a replayed call was still unauthorized.
    #[error("Session expired - re-login required")]
    AuthExpired,

    /// The call was waiting for a refresh when the session was torn down.
    #[error("Session terminated")]
    SessionTerminated,

    /// Login rejected by the backend.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        fields: Vec<FieldError>,
    },

    #[error("Rate limited - try again later")]
    RateLimited,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Request failed ({status}): {message}")]
    Unclassified { status: u16, message: String },

    /// The backend answered, but not with anything usable.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SessionError {
    pub fn network(message: impl Into<String>, timed_out: bool) -> Self {
        Self::Network {
            message: message.into(),
            timed_out,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Whether an automatic credential refresh may be attempted for this error.
    #[inline]
    pub fn is_refresh_eligible(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Check if this error is transient and may be retried by the user.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::RateLimited | Self::Server { .. }
        )
    }

    /// Check if the user has to sign in again.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::AuthExpired | Self::SessionTerminated | Self::InvalidCredentials(_)
        )
    }

    /// HTTP status behind this error, if one was received.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Unauthorized(_) => Some(401),
            Self::Forbidden(_) => Some(403),
            Self::NotFound(_) => Some(404),
            Self::Validation { .. } => Some(422),
            Self::RateLimited => Some(429),
            Self::Server { status, .. } | Self::Unclassified { status, .. } => Some(*status),
            _ => None,
        }
    }
}
