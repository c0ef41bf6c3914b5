//! Job descriptions and per-job callbacks.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use jobq_core::JobId;

/// Result type for done callbacks. `Err` carries a reason and sends the job
/// down the EXIT path.
pub type CallbackResult = Result<(), String>;

/// Called after a job's sentinel files confirmed success.
pub type DoneCallback = Arc<dyn Fn(&JobInfo) -> CallbackResult + Send + Sync>;

/// Called once submit attempts are spent. Returning true grants a fresh set
/// of attempts.
pub type RetryCallback = Arc<dyn Fn(&JobInfo) -> bool + Send + Sync>;

/// Called when a job is given up and marked failed.
pub type ExitCallback = Arc<dyn Fn(&JobInfo) + Send + Sync>;

/// What a callback gets to see about its job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub index: usize,
    pub id: JobId,
    pub job_name: String,
    pub run_path: PathBuf,
    pub submit_attempt: u32,
}

/// Optional hooks invoked by the finalizer.
#[derive(Clone, Default)]
pub struct JobCallbacks {
    pub done: Option<DoneCallback>,
    pub retry: Option<RetryCallback>,
    pub exit: Option<ExitCallback>,
}

impl fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCallbacks")
            .field("done", &self.done.is_some())
            .field("retry", &self.retry.is_some())
            .field("exit", &self.exit.is_some())
            .finish()
    }
}

/// Description of a job to add to the queue.
///
/// ```ignore
/// let spec = JobSpec::new("run_model", "/runs/real-7", "real-7")
///     .with_args(["--case", "BASE"])
///     .with_num_cpu(4)
///     .on_done(|job| load_results(&job.run_path));
/// ```
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub run_command: String,
    pub run_path: PathBuf,
    pub job_name: String,
    pub args: Vec<String>,
    pub num_cpu: u32,
    pub callbacks: JobCallbacks,
}

impl JobSpec {
    /// Create a new single-cpu job with no arguments and no callbacks.
    pub fn new(
        run_command: impl Into<String>,
        run_path: impl Into<PathBuf>,
        job_name: impl Into<String>,
    ) -> Self {
        Self {
            run_command: run_command.into(),
            run_path: run_path.into(),
            job_name: job_name.into(),
            args: Vec::new(),
            num_cpu: 1,
            callbacks: JobCallbacks::default(),
        }
    }

    /// Set the command arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the number of cpus requested from the driver.
    pub fn with_num_cpu(mut self, num_cpu: u32) -> Self {
        self.num_cpu = num_cpu;
        self
    }

    /// Set the done callback.
    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobInfo) -> CallbackResult + Send + Sync + 'static,
    {
        self.callbacks.done = Some(Arc::new(callback));
        self
    }

    /// Set the retry callback.
    pub fn on_retry<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobInfo) -> bool + Send + Sync + 'static,
    {
        self.callbacks.retry = Some(Arc::new(callback));
        self
    }

    /// Set the exit callback.
    pub fn on_exit<F>(mut self, callback: F) -> Self
    where
        F: Fn(&JobInfo) + Send + Sync + 'static,
    {
        self.callbacks.exit = Some(Arc::new(callback));
        self
    }
}
