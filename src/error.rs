//! Crate-level error type
//!
//! Wraps the component errors so the binary and embedding gateways can use a
//! single `Result` type.

use crate::config::ConfigError;
use crate::observability::redact_secrets;
use crate::supervisor::SupervisorError;
use crate::transport::SessionError;
use thiserror::Error;

/// Main error type for connector operations
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectorError {
    /// Error text safe to print or log; secret values are masked
    pub fn user_message(&self) -> String {
        redact_secrets(&self.to_string())
    }
}

/// Result type alias for connector operations
pub type ConnectorResult<T> = Result<T, ConnectorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_conversions() {
        let err: ConnectorError = SessionError::InvalidQos(2).into();
        assert!(matches!(err, ConnectorError::Session(SessionError::InvalidQos(2))));

        let err: ConnectorError = SupervisorError::ConnectTimeout(Duration::from_secs(5)).into();
        assert!(err.to_string().starts_with("Supervisor error"));

        let err: ConnectorError = ConfigError::EnvVarNotFound("IOTHUB_TOKEN".to_string()).into();
        assert!(err.to_string().contains("IOTHUB_TOKEN"));
    }

    #[test]
    fn test_user_message_masks_secrets() {
        let err = ConnectorError::InvalidInput {
            message: "bad credentials password=hunter2".to_string(),
        };
        let message = err.user_message();
        assert!(!message.contains("hunter2"));
        assert!(message.contains("password=***"));
    }
}
