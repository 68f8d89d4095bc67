use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

/// Error taxonomy for the session core and transport pipeline.
///
/// Cloneable so a single shared refresh outcome can be fanned out to every
/// waiter that piled up behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("malformed token: {0}")]
    Decode(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("server error (status {0})")]
    Server(u16),
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("malformed response envelope: {0}")]
    InvalidResponse(String),
    #[error("session expired")]
    SessionExpired,
    #[error("refresh request timed out")]
    RefreshTimeout,
}

impl SessionError {
    /// Classify a non-success HTTP status into an error kind.
    ///
    /// `message` is the server-provided detail when the body carried one.
    pub fn from_status(status: u16, message: Option<String>) -> Self {
        match status {
            400 => Self::BadRequest(message.unwrap_or_else(|| "bad request".to_string())),
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            500..=599 => Self::Server(status),
            other => Self::UnexpectedStatus(other),
        }
    }

    /// Stable category string forwarded to the notification sink.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Decode(_) => "invalid_token",
            Self::Network(_) => "network",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Server(_) => "server_error",
            Self::UnexpectedStatus(_) => "unexpected_status",
            Self::InvalidResponse(_) => "invalid_response",
            Self::SessionExpired => "session_expired",
            Self::RefreshTimeout => "refresh_timeout",
        }
    }

    /// Kinds that tear the session down as a side effect of being raised.
    pub fn forces_logout(&self) -> bool {
        matches!(self, Self::SessionExpired | Self::RefreshTimeout)
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(value.to_string())
    }
}
