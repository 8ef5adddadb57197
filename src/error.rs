//! Error types for the points relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: String, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Chain {chain_id} not found")]
    ChainNotFound { chain_id: String },

    #[error("Workflow {id} not found")]
    WorkflowNotFound { id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::ChainConnection { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::Database(_)
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::Config(_)
                | RelayerError::ChainNotFound { .. }
                | RelayerError::Wallet(_)
        )
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_failures_are_retryable() {
        let err = RelayerError::ChainConnection {
            chain_id: "AELF".to_string(),
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.should_alert());

        let err = RelayerError::Timeout {
            operation: "send_raw_transaction".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_config_errors_alert_and_do_not_retry() {
        let err = RelayerError::ChainNotFound {
            chain_id: "tDVW".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.should_alert());

        let err = RelayerError::InvalidInput("empty business id".to_string());
        assert!(!err.is_retryable());
        assert!(!err.should_alert());
    }
}
