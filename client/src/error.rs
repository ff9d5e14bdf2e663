//! Error types for the device runtime.

use std::time::Duration;
use thiserror::Error;

/// Failure to get a well-formed answer from the server.
///
/// Always transient from the queue's point of view: the batch stays queued
/// and is retried.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection lost while the request was in flight")]
    Aborted,

    #[error("server unreachable")]
    Unreachable,

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failure of the device's durable storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt device state: {0}")]
    Corrupt(#[from] tally_engine::Error),

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// All possible errors from the device runtime.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A mutation that can never be applied (malformed, or against a missing record)
    #[error(transparent)]
    Invalid(#[from] tally_engine::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Setup(#[from] crate::transport::TransportBuildError),
}

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, ClientError>;
