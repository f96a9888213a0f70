//! Error taxonomy for the queue engine.
//!
//! Errors local to one job never terminate a worker: processor failures feed
//! the retry policy, lost leases drop the finalize, and store errors during
//! the claim loop are logged and retried after a cooldown.

use thiserror::Error;

use crate::job::{JobId, JobState};

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad input to `Queue::add` or job construction; rejected before persistence.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Store I/O failure. Surfaced as `JobEvent::WorkerError` from the claim loop.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// A state transition the job's lifecycle does not allow.
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    /// A finalize was attempted without lock ownership. The result is dropped
    /// and stall recovery reconciles the job's state.
    #[error("lease lost for job {job_id}")]
    LeaseLost { job_id: JobId },
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Persistence(e.to_string())
    }
}

/// Failure raised by a user processor. Drives the retry-vs-fail decision;
/// never crashes the worker.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProcessingError {
    pub message: String,
    pub stacktrace: Option<String>,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn with_stacktrace(message: impl Into<String>, stacktrace: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: Some(stacktrace.into()),
        }
    }
}

impl From<String> for ProcessingError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProcessingError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Lets processors use `?` on queue operations such as progress updates.
impl From<QueueError> for ProcessingError {
    fn from(e: QueueError) -> Self {
        Self::new(e.to_string())
    }
}
