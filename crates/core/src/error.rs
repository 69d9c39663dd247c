//! Error types for the ferry job queue library.

use thiserror::Error;

/// The main error type for the ferry library.
#[derive(Error, Debug)]
pub enum FerryError {
    /// Job options or arguments rejected at enqueue time. The job is never created.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A job with the caller-supplied id already exists in the queue.
    #[error("Duplicate job: {0}")]
    Duplicate(String),

    /// The store could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store rejected or failed an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// The job is held by a worker lease and cannot be modified.
    #[error("Job is locked by an active lease: {0}")]
    JobLocked(String),

    /// The caller's lease on the job expired or was taken over.
    #[error("Lease lost for job: {0}")]
    LeaseLost(String),

    /// The queue's persisted state is inconsistent; processing is halted.
    #[error("Queue corrupted: {0}")]
    Corrupted(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl FerryError {
    /// Whether the error halts processing of the queue rather than being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FerryError::Corrupted(_))
    }
}

/// Result type alias using FerryError.
pub type Result<T> = std::result::Result<T, FerryError>;
