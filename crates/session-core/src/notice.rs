//! User-facing notices for failed calls.

use serde::Serialize;
use tracing::{info, warn};

use crate::error::{FieldError, SessionError};

/// What the user can do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeAction {
    /// Transient; trying again may help.
    Retry,
    /// Sign in again.
    Reauthenticate,
    /// Fix the submitted input.
    CorrectInput,
    None,
}

/// Presentation of a failure, independent of how it is rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub action: NoticeAction,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldError>,
}

impl Notice {
    pub fn for_error(error: &SessionError) -> Self {
        let (action, message, fields) = match error {
            SessionError::Network { timed_out: true, .. } => (
                NoticeAction::Retry,
                "Request timed out, check your network connection".to_string(),
                Vec::new(),
            ),
            SessionError::Network { .. } => (
                NoticeAction::Retry,
                "Network error, check your network connection".to_string(),
                Vec::new(),
            ),
            SessionError::Server { message, .. } => {
                (NoticeAction::Retry, message.clone(), Vec::new())
            }
            SessionError::RateLimited => (
                NoticeAction::Retry,
                "Too many requests, try again later".to_string(),
                Vec::new(),
            ),
            SessionError::Validation { message, fields } => {
                (NoticeAction::CorrectInput, message.clone(), fields.clone())
            }
            SessionError::Unauthorized(_) | SessionError::AuthExpired => (
                NoticeAction::Reauthenticate,
                "Your session has expired, please sign in again".to_string(),
                Vec::new(),
            ),
            SessionError::SessionTerminated => (
                NoticeAction::Reauthenticate,
                "You have been signed out".to_string(),
                Vec::new(),
            ),
            SessionError::InvalidCredentials(message) => {
                (NoticeAction::Reauthenticate, message.clone(), Vec::new())
            }
            other => (NoticeAction::None, other.to_string(), Vec::new()),
        };

        Self {
            action,
            message,
            fields,
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        self.action == NoticeAction::Retry
    }
}

/// Receives notices for failures that reached a caller.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: &Notice);
}

/// Default notifier: writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: &Notice) {
        match notice.action {
            NoticeAction::Reauthenticate => {
                info!(message = %notice.message, "Re-authentication required")
            }
            _ => warn!(
                action = ?notice.action,
                message = %notice.message,
                fields = notice.fields.len(),
                "Request failed"
            ),
        }
    }
}
