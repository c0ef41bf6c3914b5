//! Errors surfaced across the queue API.
//!
//! Job-level failures are never reported here; they end up as a status and a
//! [`crate::JobFailure`] payload. These variants are contract violations by
//! the caller or setup problems.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("another thread is already running the queue")]
    AlreadyRunning,

    #[error("queue is shutting down and does not accept new jobs")]
    ShutdownRequested,

    #[error("queue has been run and must be reset before it is used again")]
    NotOpen,

    #[error("job index {index} out of range (active size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("invalid run path {}: {reason}", path.display())]
    InvalidRunPath { path: PathBuf, reason: String },

    #[error("driver cannot be replaced while the queue is running")]
    DriverBusy,

    #[error("failed to start queue threads: {0}")]
    ThreadPool(String),

    #[error("invalid queue config: {0}")]
    Config(String),
}
