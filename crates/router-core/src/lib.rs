//! Core types shared by every router crate: the server and request model,
//! the retry policy, and the error taxonomy.

use thiserror::Error;

pub mod request;
pub mod retry;
pub mod server;

pub use request::Request;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use server::{ServerInfo, ServerStatus, TransportKind};

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Validation failed: {0}")]
    ValidationError(String),

    #[error("Authentication failed: {0}")]
    AuthError(String),

    #[error("Request timed out: {0}")]
    TimeoutError(String),

    #[error("Server process exited: {0}")]
    ProcessExited(String),

    #[error("Server error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    ServerError { code: Option<i64>, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl RouterError {
    pub fn server(message: impl Into<String>) -> Self {
        RouterError::ServerError {
            code: None,
            message: message.into(),
        }
    }

    /// Whether a fresh attempt (possibly against a respawned process) may succeed.
    ///
    /// Invalid responses are still considered retryable: a live process that
    /// emits garbage is respawned like one that timed out.
    pub fn is_retryable(&self) -> bool {
        match self {
            RouterError::TimeoutError(_)
            | RouterError::ProcessExited(_)
            | RouterError::TransportError(_)
            | RouterError::ServerError { .. }
            | RouterError::InvalidResponse(_)
            | RouterError::IoError(_) => true,
            RouterError::ValidationError(_)
            | RouterError::AuthError(_)
            | RouterError::ConfigError(_)
            | RouterError::QueueError(_)
            | RouterError::SerializationError(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RouterError::TimeoutError("read".into()).is_retryable());
        assert!(RouterError::ProcessExited("eof".into()).is_retryable());
        assert!(RouterError::server("boom").is_retryable());
        assert!(!RouterError::ValidationError("empty".into()).is_retryable());
        assert!(!RouterError::AuthError("401".into()).is_retryable());
    }

    #[test]
    fn test_server_error_display() {
        let err = RouterError::ServerError {
            code: Some(-32601),
            message: "Method not found".into(),
        };
        assert_eq!(err.to_string(), "Server error (-32601): Method not found");
        assert_eq!(RouterError::server("down").to_string(), "Server error: down");
    }
}
