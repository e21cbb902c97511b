//! Blocking HTTP plumbing shared by the provider clients.

use crate::error::BackendError;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use std::time::Duration;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for short catalog/liveness requests.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Blocking client without a total request timeout, since streams can run long.
///
/// Must be built, used and dropped off the async runtime threads.
pub(crate) fn blocking_client() -> Result<Client, BackendError> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None)
        .build()
        .map_err(|e| BackendError::UnknownFailure(format!("failed to build HTTP client: {e}")))
}

/// Pass successful responses through; turn the rest into a classified error.
pub(crate) fn check_status(resp: Response) -> Result<Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(classify_status(status, &body))
}

pub(crate) fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let msg = format!("HTTP {status}: {}", error_detail(body));
    match status.as_u16() {
        401 | 403 => BackendError::AuthenticationFailure(msg),
        429 => BackendError::RateLimited(msg),
        400 | 404 | 422 => BackendError::InvalidRequest(msg),
        500..=599 => BackendError::ProviderUnavailable(msg),
        _ => BackendError::UnknownFailure(msg),
    }
}

pub(crate) fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_connect() || e.is_timeout() {
        BackendError::ProviderUnavailable(format!("connection failed: {e}"))
    } else if e.is_decode() {
        BackendError::ProtocolError(format!("undecodable response: {e}"))
    } else if e.is_builder() {
        BackendError::InvalidRequest(format!("bad request: {e}"))
    } else {
        BackendError::UnknownFailure(e.to_string())
    }
}

/// Pull the human part out of the usual `{"error": ...}` bodies.
fn error_detail(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let err = &value["error"];
    if let Some(s) = err.as_str() {
        return s.to_string();
    }
    if let Some(s) = err["message"].as_str() {
        return s.to_string();
    }
    body.trim().to_string()
}
