//! Embedded batch job queue.
//!
//! Dispatches externally executed jobs through a pluggable [`Driver`],
//! polls them, retries failures and verifies success through sentinel files
//! written into each job's run directory.
//!
//! # Architecture
//!
//! - `JobQueue` - owns the job slots and runs the single scheduling loop
//! - `StatusBoard` - the one place a job's status is changed; keeps the
//!   per-status histogram in step with every change
//! - `Finalizer` - bounded worker pool that verifies finished jobs off the
//!   scheduling thread
//! - `CompletionVerifier` - checks OK/EXIT sentinel files
//!
//! # Usage
//!
//! ```ignore
//! use jobq::{JobQueue, JobSpec, QueueConfig};
//!
//! let queue = JobQueue::new(QueueConfig::default().with_ok_file("OK"), driver)?;
//! let index = queue.add_job(JobSpec::new("run_model", "/runs/real-0", "real-0"))?;
//! queue.run_jobs(1, true)?;
//! println!("{}", queue.status(index)?);
//! ```

mod board;
mod driver;
mod finalizer;
mod job;
mod node;
mod queue;
mod run;
mod store;
mod verifier;

pub use driver::{Driver, DriverError, DriverStatus, SubmitRequest};
pub use job::{CallbackResult, DoneCallback, ExitCallback, JobCallbacks, JobInfo, JobSpec, RetryCallback};
pub use queue::JobQueue;
pub use verifier::{CompletionVerifier, Verdict, parse_exit_file, read_exit_file};

pub use jobq_core::{
    JobFailure, JobId, JobSnapshot, JobStatus, QueueConfig, QueueError, QueueEvent, StatusSummary,
};
