//! Outbound request decoration.

use chrono::{SecondsFormat, Utc};

use crate::models::Credential;
use crate::transport::ApiRequest;

pub const AUTHORIZATION_HEADER: &str = "authorization";
pub const REQUEST_TIME_HEADER: &str = "x-request-time";

/// Attach the bearer credential (when there is one) and the issue timestamp.
///
/// Called for every attempt, so a replay carries the credential current at
/// replay time rather than the one it originally failed with.
pub fn decorate(request: &mut ApiRequest, credential: Option<&Credential>) {
    match credential.filter(|c| !c.is_empty()) {
        Some(credential) => {
            request.set_header(AUTHORIZATION_HEADER, credential.bearer());
            request.set_sent_with(Some(credential.clone()));
        }
        None => {
            request.remove_header(AUTHORIZATION_HEADER);
            request.set_sent_with(None);
        }
    }

    request.set_header(
        REQUEST_TIME_HEADER,
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    );
}
