use statrpc_protocol::{ErrorCode, ErrorPayload};

/// Errors that can occur when talking over the bridge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection is disposed")]
    Disposed,

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("request id {0} is already pending")]
    DuplicateId(u64),

    #[error("backend error: {0}")]
    Remote(ErrorPayload),

    #[error("backend binary not found")]
    BackendNotFound,

    #[error("backend failed to start: {0}")]
    StartFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns the native error code when the backend reported one.
    pub fn code(&self) -> Option<&ErrorCode> {
        match self {
            Self::Remote(payload) => Some(&payload.code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(&ErrorCode::NotFound)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
