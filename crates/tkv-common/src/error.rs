//! Error types for tkv.

use thiserror::Error;

/// Result type alias using TkvError.
pub type Result<T> = std::result::Result<T, TkvError>;

/// Errors that can occur in tkv operations.
///
/// Missing keys, missing tags, chain ends and duplicate keys are not errors:
/// lookups return `Option` and `put` returns `false`.
#[derive(Debug, Error)]
pub enum TkvError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Read out of bounds: offset {offset}, length {length}, log size {size}")]
    ReadOutOfBounds { offset: u64, length: u64, size: u64 },

    #[error("Value log is {actual}, expected {expected}")]
    InvalidPhase { expected: String, actual: String },

    // Input validation errors
    #[error("Key must not be empty")]
    EmptyKey,

    #[error("Key too large: {size} bytes (max {max})")]
    KeyTooLarge { size: usize, max: usize },

    #[error("Tag name too large: {size} bytes (max {max})")]
    TagTooLarge { size: usize, max: usize },

    #[error("Too many tags: {count} (max {max})")]
    TooManyTags { count: usize, max: usize },

    // Index errors
    #[error("Index corrupted at position {position}: {reason}")]
    IndexCorrupted { position: u64, reason: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TkvError {
    /// Returns true for the "not implemented" kind, as opposed to a failure.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, TkvError::Unsupported(_))
    }
}
