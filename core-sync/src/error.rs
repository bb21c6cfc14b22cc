use bridge_traits::BridgeError;
use core_cache::CacheError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Backend error{}: {message}", code_suffix(.code))]
    Backend {
        code: Option<String>,
        message: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Offline: {0}")]
    Offline(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Bridge error: {0}")]
    Bridge(BridgeError),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default()
}

impl From<BridgeError> for SyncError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Backend { code, message } => SyncError::Backend { code, message },
            BridgeError::Timeout(what) => SyncError::Timeout(what),
            other => SyncError::Bridge(other),
        }
    }
}

impl SyncError {
    /// Structured backend code (SQLSTATE, PostgREST code or HTTP status).
    pub fn code(&self) -> Option<&str> {
        match self {
            SyncError::Backend { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Message without the variant prefix, for substring classification.
    pub fn message(&self) -> String {
        match self {
            SyncError::Backend { message, .. } => message.clone(),
            SyncError::Timeout(what) => what.clone(),
            SyncError::Offline(reason) => reason.clone(),
            SyncError::InvalidPayload(reason) => reason.clone(),
            SyncError::Bridge(err) => err.to_string(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
