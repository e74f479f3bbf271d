use crate::types::BackendKind;
use thiserror::Error;

/// Unified error type for all backend and dispatch operations
#[derive(Error, Debug)]
pub enum DataError {
    /// Backend unreachable, authentication failed or liveness check failed
    #[error("Connection to {kind} failed: {reason}")]
    ConnectionFailed { kind: BackendKind, reason: String },

    /// Query execution failed on the backend
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Result set could not be decoded into records
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Query timeout
    #[error("Query timeout after {0}ms")]
    QueryTimeout(u64),

    /// Target identifier not present in the registry
    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    /// Structurally invalid batch (empty request list)
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// Payload not understood by the backend kind
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Operation not supported by this backend
    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DataError {
    /// Create a connection error for a backend kind
    pub fn connection_failed(kind: BackendKind, reason: impl ToString) -> Self {
        DataError::ConnectionFailed {
            kind,
            reason: reason.to_string(),
        }
    }

    pub fn query_failed(msg: impl Into<String>) -> Self {
        DataError::QueryFailed(msg.into())
    }

    pub fn read_failed(msg: impl Into<String>) -> Self {
        DataError::ReadFailed(msg.into())
    }

    /// Create an invalid query error
    pub fn invalid_query(msg: impl Into<String>) -> Self {
        DataError::InvalidQuery(msg.into())
    }

    /// Create an operation not supported error
    pub fn operation_not_supported(msg: impl Into<String>) -> Self {
        DataError::OperationNotSupported(msg.into())
    }

    /// Create an invalid configuration error
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        DataError::InvalidConfiguration(msg.into())
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, DataError::ConnectionFailed { .. })
    }
}

pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_carries_kind() {
        let err = DataError::connection_failed(BackendKind::Postgres, "refused");
        assert!(err.is_connection_error());
        assert_eq!(err.to_string(), "Connection to postgres failed: refused");
    }

    #[test]
    fn test_unknown_target_message_names_target() {
        let err = DataError::UnknownTarget("X".to_string());
        assert!(err.to_string().contains('X'));
    }
}
