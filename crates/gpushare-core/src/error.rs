//! Error types for gpushare

use thiserror::Error;

/// Main error type for gpushare
#[derive(Error, Debug)]
pub enum GpushareError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The actor may not perform this operation
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// The caller could not be identified
    #[error("Not authenticated: {0}")]
    Unauthenticated(String),

    /// Unknown device, GPU, reservation or user
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request is well-formed and authorized but breaks a queue policy
    #[error("Policy violation: {0}")]
    Policy(String),

    /// A collector report could not be fetched or applied
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// Notification delivery failed
    #[error("Notification error: {0}")]
    Notification(String),

    /// Snapshot publication failed
    #[error("Broadcast error: {0}")]
    Broadcast(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for gpushare operations
pub type GpushareResult<T> = Result<T, GpushareError>;

impl From<serde_json::Error> for GpushareError {
    fn from(err: serde_json::Error) -> Self {
        GpushareError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for GpushareError {
    fn from(err: toml::de::Error) -> Self {
        GpushareError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GpushareError::Policy("reservation is current".to_string());
        assert_eq!(err.to_string(), "Policy violation: reservation is current");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GpushareError = io_err.into();
        assert!(matches!(err, GpushareError::Io(_)));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<u32>("not a number").unwrap_err();
        let err: GpushareError = json_err.into();
        assert!(matches!(err, GpushareError::Serialization(_)));
    }
}
