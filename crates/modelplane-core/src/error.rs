//! Error types for modelplane

use thiserror::Error;

/// Main error type for modelplane
#[derive(Error, Debug)]
pub enum ModelPlaneError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input (missing group, type mismatch, bad chunk number)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Model content exceeds the configured maximum size
    #[error("Model size {size} bytes exceeds the limit of {limit} bytes")]
    SizeLimitExceeded { size: u64, limit: u64 },

    /// Model, group, chunk, task or connector is missing
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Per-node cap, running-task cap, open circuit breaker, rate limit
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// A deploy is already in flight or the model is already initialized on this node
    #[error("Duplicate deploy model task: {0}")]
    DuplicateTask(String),

    /// Reassembled content does not match the declared digest
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Optimistic-concurrency token did not match
    #[error("Version conflict on {0}, retry the request")]
    VersionConflict(String),

    /// Router found no node able to host the model
    #[error("No eligible nodes: {0}")]
    NoEligibleNodes(String),

    /// Persistence backend temporarily unavailable
    #[error("Storage unavailable: {0}")]
    TransientInfra(String),

    /// Predictor construction or execution error
    #[error("Runtime error: {0}")]
    Runtime(String),

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

/// Result type for modelplane operations
pub type ModelPlaneResult<T> = Result<T, ModelPlaneError>;

/// Coarse error category, used for propagation policy and status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    ResourceNotFound,
    LimitExceeded,
    Integrity,
    TransientInfra,
    Internal,
}

impl ModelPlaneError {
    /// Category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ModelPlaneError::Config(_)
            | ModelPlaneError::Validation(_)
            | ModelPlaneError::SizeLimitExceeded { .. }
            | ModelPlaneError::NoEligibleNodes(_) => ErrorKind::Validation,
            ModelPlaneError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            ModelPlaneError::LimitExceeded(_) | ModelPlaneError::DuplicateTask(_) => {
                ErrorKind::LimitExceeded
            }
            ModelPlaneError::Integrity(_) => ErrorKind::Integrity,
            ModelPlaneError::TransientInfra(_) | ModelPlaneError::VersionConflict(_) => {
                ErrorKind::TransientInfra
            }
            ModelPlaneError::Runtime(_)
            | ModelPlaneError::Io(_)
            | ModelPlaneError::Serialization(_)
            | ModelPlaneError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientInfra
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::ResourceNotFound(msg.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }
}

impl From<serde_json::Error> for ModelPlaneError {
    fn from(err: serde_json::Error) -> Self {
        ModelPlaneError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ModelPlaneError {
    fn from(err: toml::de::Error) -> Self {
        ModelPlaneError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModelPlaneError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");

        let err = ModelPlaneError::SizeLimitExceeded {
            size: 10,
            limit: 5,
        };
        assert_eq!(
            err.to_string(),
            "Model size 10 bytes exceeds the limit of 5 bytes"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ModelPlaneError = io_err.into();
        assert!(matches!(err, ModelPlaneError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ModelPlaneError::DuplicateTask("m".into()).kind(),
            ErrorKind::LimitExceeded
        );
        assert_eq!(
            ModelPlaneError::SizeLimitExceeded { size: 2, limit: 1 }.kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ModelPlaneError::Integrity("digest".into()).kind(),
            ErrorKind::Integrity
        );
    }

    #[test]
    fn test_retryable() {
        assert!(ModelPlaneError::VersionConflict("group".into()).is_retryable());
        assert!(ModelPlaneError::TransientInfra("store".into()).is_retryable());
        assert!(!ModelPlaneError::not_found("model").is_retryable());
        assert!(!ModelPlaneError::Integrity("digest".into()).is_retryable());
    }
}
