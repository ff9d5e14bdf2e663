//! Error types for the Tally engine.

use crate::{RecordId, Resource};
use thiserror::Error;

/// All possible errors from the Tally engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("resource mismatch: expected {expected}, got {actual}")]
    ResourceMismatch { expected: Resource, actual: Resource },

    #[error("empty patch for {0}")]
    EmptyPatch(Resource),

    // Local state errors
    #[error("record not found: {resource}/{id}")]
    RecordNotFound { resource: Resource, id: RecordId },

    #[error("record is deleted: {resource}/{id}")]
    RecordDeleted { resource: Resource, id: RecordId },

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Shorthand for a structural validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }

    /// Whether this error marks an operation as permanently malformed.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::ResourceMismatch { .. } | Error::EmptyPatch(_)
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
