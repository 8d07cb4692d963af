//! Error types for the sync and transcode engine.

use thiserror::Error;

/// Main error type for engine operations.
///
/// Recoverable per-item failures (stat, copy, mkdir, remove, progress
/// parsing) never cross the orchestrator boundary; they are logged and
/// folded into the batch counters. The variants here cover batch
/// preconditions and environment problems; cancellation is not an error
/// and is reported through the batch result instead.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Source path does not exist: {0}")]
    SourceNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Size mismatch for {path}: expected {expected} bytes, copied {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("Encoder executable not found: {0}")]
    EncoderNotFound(String),

    #[error("Encoder process failed: {0}")]
    ProcessFailed(String),

    #[error("Invalid extension pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;
