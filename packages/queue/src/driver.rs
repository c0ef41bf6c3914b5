//! Execution backend trait.

use std::path::Path;

use jobq_core::JobStatus;
use thiserror::Error;

/// Status a driver reports for a job it holds a handle to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Pending,
    Running,
    Done,
    Exit,
}

impl From<DriverStatus> for JobStatus {
    fn from(status: DriverStatus) -> Self {
        match status {
            DriverStatus::Pending => JobStatus::Pending,
            DriverStatus::Running => JobStatus::Running,
            DriverStatus::Done => JobStatus::Done,
            DriverStatus::Exit => JobStatus::Exit,
        }
    }
}

/// Error returned by a driver that could not accept a job.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("driver unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a driver needs to start one job.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    pub run_command: &'a str,
    pub args: &'a [String],
    pub num_cpu: u32,
    pub run_path: &'a Path,
    pub job_name: &'a str,
}

/// Trait for execution backends.
///
/// A driver starts jobs somewhere (local processes, a cluster scheduler) and
/// answers status questions about them through an opaque handle. The queue
/// guarantees that a handle is never used after it has been passed to
/// [`Driver::release`], and that `kill` and `release` never run concurrently
/// with `status` for the same handle. Calls for different handles may arrive
/// from different threads at the same time.
pub trait Driver: Send + Sync + 'static {
    /// Driver-owned reference to one submitted job.
    type Handle: Send + Sync + 'static;

    /// Start a job.
    fn submit(&self, request: &SubmitRequest<'_>) -> Result<Self::Handle, DriverError>;

    /// Report where the job stands.
    fn status(&self, handle: &Self::Handle) -> DriverStatus;

    /// Stop the job. The handle stays valid until released.
    fn kill(&self, handle: &Self::Handle);

    /// Free whatever the driver keeps for this job.
    fn release(&self, handle: Self::Handle);

    /// Concurrency limit, 0 = unlimited.
    fn max_running(&self) -> usize;

    fn set_max_running(&self, max_running: usize);
}
