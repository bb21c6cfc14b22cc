use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Backend error{}: {message}", code_suffix(.code))]
    Backend {
        /// Structured error code reported by the backend (e.g. SQLSTATE `23505`)
        code: Option<String>,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn code_suffix(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default()
}

impl BridgeError {
    /// Structured error code, when the backend supplied one.
    pub fn code(&self) -> Option<&str> {
        match self {
            BridgeError::Backend { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_with_code() {
        let err = BridgeError::Backend {
            code: Some("23505".to_string()),
            message: "duplicate key value violates unique constraint".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Backend error [23505]: duplicate key value violates unique constraint"
        );
        assert_eq!(err.code(), Some("23505"));
    }

    #[test]
    fn test_backend_error_display_without_code() {
        let err = BridgeError::Backend {
            code: None,
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Backend error: boom");
        assert_eq!(err.code(), None);
        assert!(!err.is_timeout());
    }
}
