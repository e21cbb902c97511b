use std::fmt;

/// Coarse failure category, independent of the provider that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotConfigured,
    InvalidRequest,
    AuthenticationFailure,
    RateLimited,
    ContentBlocked,
    ProviderUnavailable,
    ProtocolError,
    UnknownFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotConfigured => "not configured",
            ErrorKind::InvalidRequest => "invalid request",
            ErrorKind::AuthenticationFailure => "authentication failure",
            ErrorKind::RateLimited => "rate limited",
            ErrorKind::ContentBlocked => "content blocked",
            ErrorKind::ProviderUnavailable => "provider unavailable",
            ErrorKind::ProtocolError => "protocol error",
            ErrorKind::UnknownFailure => "unknown failure",
        };
        f.write_str(s)
    }
}

/// Errors raised by backends and the stream bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    NotConfigured(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    AuthenticationFailure(String),
    #[error("{0}")]
    RateLimited(String),
    #[error("{0}")]
    ContentBlocked(String),
    #[error("{0}")]
    ProviderUnavailable(String),
    #[error("{0}")]
    ProtocolError(String),
    #[error("{0}")]
    UnknownFailure(String),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotConfigured(_) => ErrorKind::NotConfigured,
            BackendError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            BackendError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            BackendError::RateLimited(_) => ErrorKind::RateLimited,
            BackendError::ContentBlocked(_) => ErrorKind::ContentBlocked,
            BackendError::ProviderUnavailable(_) => ErrorKind::ProviderUnavailable,
            BackendError::ProtocolError(_) => ErrorKind::ProtocolError,
            BackendError::UnknownFailure(_) => ErrorKind::UnknownFailure,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            BackendError::NotConfigured(m)
            | BackendError::InvalidRequest(m)
            | BackendError::AuthenticationFailure(m)
            | BackendError::RateLimited(m)
            | BackendError::ContentBlocked(m)
            | BackendError::ProviderUnavailable(m)
            | BackendError::ProtocolError(m)
            | BackendError::UnknownFailure(m) => m,
        }
    }

    /// Same kind, message prefixed with `context`.
    pub fn context(self, context: impl fmt::Display) -> Self {
        let msg = format!("{context}: {}", self.message());
        match self.kind() {
            ErrorKind::NotConfigured => BackendError::NotConfigured(msg),
            ErrorKind::InvalidRequest => BackendError::InvalidRequest(msg),
            ErrorKind::AuthenticationFailure => BackendError::AuthenticationFailure(msg),
            ErrorKind::RateLimited => BackendError::RateLimited(msg),
            ErrorKind::ContentBlocked => BackendError::ContentBlocked(msg),
            ErrorKind::ProviderUnavailable => BackendError::ProviderUnavailable(msg),
            ErrorKind::ProtocolError => BackendError::ProtocolError(msg),
            ErrorKind::UnknownFailure => BackendError::UnknownFailure(msg),
        }
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::ProtocolError(format!("unexpected response shape: {e}"))
    }
}
