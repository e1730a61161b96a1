//! Error types for the Ethos core library

use thiserror::Error;

/// Core error type for Ethos operations
#[derive(Error, Debug)]
pub enum EthosError {
    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Action definition failed validation
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// Dimension mismatch between vectors or tensors
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Length the model was built for
        expected: usize,
        /// Length received
        actual: usize,
    },

    /// Model construction, training or persistence failed
    #[error("Model error: {0}")]
    Model(String),

    /// Event log or dataset persistence failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Approval collaborator failed
    #[error("Approval error: {0}")]
    Approval(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for Ethos operations
pub type Result<T> = std::result::Result<T, EthosError>;
