use std::fmt;

/// Classified core error surfaced to API callers. The kind tells the HTTP
/// layer which status to map to and tells internal retry loops whether the
/// operation is worth repeating.
#[derive(Debug)]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    /// Seconds to wait before retrying, when the provider told us.
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or revoked credential; the user must reconnect the provider.
    AuthRequired,
    /// A workflow for the same (user, source) or (user, plan) is in flight.
    Busy,
    /// Provider or LLM throttled us past the internal retry budget.
    RateLimited,
    /// Retryable network/5xx failure past the internal retry budget.
    Transient,
    /// Schema violation from the caller or the provider; never retried.
    InvalidRequest,
    /// Task sync conflict awaiting user resolution.
    Conflict,
    /// The operation completed but an optional stage failed.
    Degraded,
    /// Store or invariant failure not covered by the kinds above.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthRequired => "auth_required",
            ErrorKind::Busy => "busy",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Transient => "transient",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Degraded => "degraded",
            ErrorKind::Internal => "internal",
        }
    }
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn auth_required(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthRequired, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after_secs: Option<u64>) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: message.into(),
            retry_after_secs,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Whether repeating the same call may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::RateLimited | ErrorKind::Transient)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for CoreError {}

impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        // Preserve classification when an already-typed error bubbles
        // through an anyhow layer.
        match err.downcast::<CoreError>() {
            Ok(core) => core,
            Err(err) => CoreError::internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::internal(format!("store error: {}", err))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
