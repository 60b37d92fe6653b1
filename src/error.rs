pub type Result<T> = std::result::Result<T, CommError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CommError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("backend error: {message} (backend version {version})")]
    Backend { message: String, version: String },

    #[error("operation timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl CommError {
    /// Create an `InvalidArgument` error from anything string-like.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create an `Unsupported` error from anything string-like.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Create an `InvalidState` error from anything string-like.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a `Backend` error carrying the backend's version string.
    pub fn backend(message: impl Into<String>, version: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            version: version.into(),
        }
    }

    /// Create a `TimedOut` error from a duration.
    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        }
    }
}
