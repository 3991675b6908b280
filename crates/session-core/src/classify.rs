//! Inbound failure classification.
//!
//! Pure mapping from a transport failure (status + body) to a
//! [`SessionError`]. Presentation is handled separately in
//! [`notice`](crate::notice).

use serde_json::Value;

use crate::error::{FieldError, SessionError};
use crate::transport::TransportError;

/// Classify a transport failure.
pub fn classify(error: TransportError) -> SessionError {
    match error {
        TransportError::Timeout(message) => SessionError::network(message, true),
        TransportError::Connect(message) => SessionError::network(message, false),
        TransportError::Status { status, body } => classify_status(status, &body),
    }
}

/// Classify an HTTP status and its response body.
pub fn classify_status(status: u16, body: &Value) -> SessionError {
    let message = body_message(body);

    match status {
        401 => SessionError::Unauthorized(message.unwrap_or_else(|| "Unauthorized".to_string())),
        403 => SessionError::Forbidden(
            message.unwrap_or_else(|| "Access to this resource is not allowed".to_string()),
        ),
        404 => SessionError::NotFound(
            message.unwrap_or_else(|| "The requested resource does not exist".to_string()),
        ),
        422 => {
            let fields = field_errors(body);
            let message = message
                .or_else(|| fields.first().map(|f| f.message.clone()))
                .unwrap_or_else(|| "Invalid request parameters".to_string());
            SessionError::Validation { message, fields }
        }
        429 => SessionError::RateLimited,
        500..=599 => SessionError::Server {
            status,
            message: message.unwrap_or_else(|| server_default_message(status).to_string()),
        },
        _ => SessionError::Unclassified {
            status,
            message: message.unwrap_or_else(|| format!("Request failed ({})", status)),
        },
    }
}

fn server_default_message(status: u16) -> &'static str {
    match status {
        502 => "Bad gateway",
        503 => "Service temporarily unavailable",
        504 => "Gateway timeout",
        _ => "Internal server error",
    }
}

/// `message` field of a JSON body, or the body itself when it is plain text.
fn body_message(body: &Value) -> Option<String> {
    let text = match body {
        Value::Object(map) => map.get("message").and_then(Value::as_str),
        Value::String(text) => Some(text.as_str()),
        _ => None,
    }?;

    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Per-field messages from an `errors` array.
///
/// Entries are either bare strings or objects carrying `message` (or `msg`)
/// and optionally `field`.
fn field_errors(body: &Value) -> Vec<FieldError> {
    let Some(entries) = body.get("errors").and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(message) => Some(FieldError {
                field: None,
                message: message.clone(),
            }),
            Value::Object(map) => {
                let message = map
                    .get("message")
                    .or_else(|| map.get("msg"))
                    .and_then(Value::as_str)?;
                Some(FieldError {
                    field: map.get("field").and_then(Value::as_str).map(str::to_string),
                    message: message.to_string(),
                })
            }
            _ => None,
        })
        .collect()
}
