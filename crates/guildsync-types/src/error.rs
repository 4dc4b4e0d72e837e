use thiserror::Error;

/// Errors produced by key and content operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid blob key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("blob kind mismatch: expected {expected}, got {actual}")]
    KindMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for type operations.
pub type Result<T> = std::result::Result<T, TypeError>;
