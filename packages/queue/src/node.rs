//! A single job record and the operations the scheduler performs on it.
//!
//! Lock order, outermost first: the record's handle lock, the board's
//! histogram lock, the record's state lock. The handle lock is held across
//! driver calls so that a status poll, a kill and a release of the same
//! handle never overlap.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use jobq_core::{JobFailure, JobId, JobSnapshot, JobStatus};
use parking_lot::{Mutex, RwLock};

use crate::board::StatusBoard;
use crate::driver::{Driver, SubmitRequest};
use crate::job::{JobCallbacks, JobInfo, JobSpec};

/// Mutable part of a record, guarded by one lock.
#[derive(Debug, Default)]
pub(crate) struct NodeState {
    pub status: JobStatus,
    pub submit_attempt: u32,
    pub driver_failures: u32,
    pub submit_time: Option<DateTime<Utc>>,
    pub run_start: Option<DateTime<Utc>>,
    pub run_end: Option<DateTime<Utc>>,
    pub failure: Option<JobFailure>,
}

/// Result of one submission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    Submitted,
    /// The driver refused; the record stays WAITING.
    DriverFailed,
    /// The record left WAITING before it could be submitted.
    Skipped,
}

pub(crate) struct JobNode<H> {
    pub index: usize,
    pub id: JobId,
    pub job_name: String,
    pub run_path: PathBuf,
    pub run_command: String,
    pub args: Vec<String>,
    pub num_cpu: u32,
    pub exit_file: Option<PathBuf>,
    pub ok_file: Option<PathBuf>,
    pub callbacks: JobCallbacks,
    pub(crate) state: Mutex<NodeState>,
    handle: RwLock<Option<H>>,
}

impl<H> JobNode<H> {
    /// Build a record in NOT_ACTIVE. `run_path` must already be absolute;
    /// the sentinel basenames are resolved against it.
    pub fn new(
        index: usize,
        spec: JobSpec,
        run_path: PathBuf,
        exit_file: Option<&str>,
        ok_file: Option<&str>,
    ) -> Self {
        Self {
            index,
            id: JobId::new(),
            job_name: spec.job_name,
            exit_file: exit_file.map(|name| run_path.join(name)),
            ok_file: ok_file.map(|name| run_path.join(name)),
            run_path,
            run_command: spec.run_command,
            args: spec.args,
            num_cpu: spec.num_cpu,
            callbacks: spec.callbacks,
            state: Mutex::new(NodeState::default()),
            handle: RwLock::new(None),
        }
    }

    pub fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    pub fn submit_attempt(&self) -> u32 {
        self.state.lock().submit_attempt
    }

    pub fn has_handle(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Status and handle presence read together. Every change to the handle
    /// holds its write lock, so the pair is consistent.
    pub fn handle_state(&self) -> (JobStatus, bool) {
        let slot = self.handle.read();
        (self.status(), slot.is_some())
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            index: self.index,
            id: self.id,
            job_name: self.job_name.clone(),
            run_path: self.run_path.clone(),
            submit_attempt: self.submit_attempt(),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state.lock();
        JobSnapshot {
            id: self.id,
            index: self.index,
            job_name: self.job_name.clone(),
            run_path: self.run_path.clone(),
            status: state.status,
            submit_attempt: state.submit_attempt,
            submit_time: state.submit_time,
            run_start: state.run_start,
            run_end: state.run_end,
            failure: state.failure.clone(),
        }
    }

    /// Run `f` and turn a panic into `fallback`.
    fn guarded<T>(&self, what: &str, fallback: T, f: impl FnOnce() -> T) -> T {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(value) => value,
            Err(_) => {
                tracing::error!("{} callback for job {} panicked", what, self.job_name);
                fallback
            }
        }
    }

    /// Run the done callback. No callback counts as success.
    pub fn run_done_callback(&self) -> bool {
        let Some(callback) = self.callbacks.done.clone() else {
            return true;
        };
        let info = self.info();
        match self.guarded("done", Err("panicked".to_string()), || callback(&info)) {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!("Done callback rejected job {}: {}", self.job_name, reason);
                false
            }
        }
    }

    /// Ask the retry callback for another round of attempts.
    pub fn run_retry_callback(&self) -> bool {
        let Some(callback) = self.callbacks.retry.clone() else {
            return false;
        };
        let info = self.info();
        self.guarded("retry", false, || callback(&info))
    }

    pub fn run_exit_callback(&self) {
        if let Some(callback) = self.callbacks.exit.clone() {
            let info = self.info();
            self.guarded("exit", (), || callback(&info));
        }
    }

    pub fn reset_attempts(&self) {
        self.state.lock().submit_attempt = 0;
    }
}

impl<H: Send + Sync + 'static> JobNode<H> {
    /// Hand a WAITING record to the driver.
    ///
    /// The handle lock is held for the whole call, so a concurrent kill
    /// either finds the record still WAITING or finds it SUBMITTED with its
    /// handle in place.
    pub fn submit<D>(&self, board: &StatusBoard, driver: &D) -> SubmitOutcome
    where
        D: Driver<Handle = H>,
    {
        let mut slot = self.handle.write();
        if self.status() != JobStatus::Waiting {
            return SubmitOutcome::Skipped;
        }

        let request = SubmitRequest {
            run_command: &self.run_command,
            args: &self.args,
            num_cpu: self.num_cpu,
            run_path: &self.run_path,
            job_name: &self.job_name,
        };
        match driver.submit(&request) {
            Ok(handle) => {
                if let Some(stale) = slot.replace(handle) {
                    driver.release(stale);
                }
                {
                    let mut state = self.state.lock();
                    state.submit_attempt += 1;
                    state.driver_failures = 0;
                    state.submit_time = Some(Utc::now());
                }
                board.transition_from(self, JobStatus::Waiting, JobStatus::Submitted);
                SubmitOutcome::Submitted
            }
            Err(e) => {
                self.state.lock().driver_failures += 1;
                tracing::warn!("Failed to submit job {}: {}", self.job_name, e);
                SubmitOutcome::DriverFailed
            }
        }
    }

    /// Poll the driver and record what it reports. Returns true on a change.
    pub fn update_status<D>(&self, board: &StatusBoard, driver: &D) -> bool
    where
        D: Driver<Handle = H>,
    {
        let slot = self.handle.read();
        let current = self.status();
        if !current.can_poll() {
            return false;
        }
        let Some(handle) = slot.as_ref() else {
            return false;
        };
        let reported = JobStatus::from(driver.status(handle));
        board.transition_from(self, current, reported)
    }

    /// Kill a record on request and mark it USER_KILLED.
    pub fn kill<D>(&self, board: &StatusBoard, driver: &D) -> bool
    where
        D: Driver<Handle = H>,
    {
        self.stop(board, driver, JobStatus::can_kill, JobStatus::UserKilled)
    }

    /// Stop a record because the whole queue is shutting down.
    ///
    /// Also covers DONE and EXIT records that were not yet handed to the
    /// finalizer. Records being finalized are left alone.
    pub fn abandon<D>(&self, board: &StatusBoard, driver: &D) -> bool
    where
        D: Driver<Handle = H>,
    {
        let abandonable = |status: JobStatus| {
            status.can_kill() || matches!(status, JobStatus::Done | JobStatus::Exit)
        };
        self.stop(board, driver, abandonable, JobStatus::UserExit)
    }

    fn stop<D>(
        &self,
        board: &StatusBoard,
        driver: &D,
        allowed: impl Fn(JobStatus) -> bool,
        to: JobStatus,
    ) -> bool
    where
        D: Driver<Handle = H>,
    {
        let mut slot = self.handle.write();
        let current = self.status();
        if !allowed(current) {
            return false;
        }
        if let Some(handle) = slot.take() {
            driver.kill(&handle);
            driver.release(handle);
        }
        board.transition_from(self, current, to)
    }

    /// Give the handle back to the driver.
    pub fn release<D>(&self, driver: &D)
    where
        D: Driver<Handle = H>,
    {
        let mut slot = self.handle.write();
        if let Some(handle) = slot.take() {
            driver.release(handle);
        }
    }

    /// Kill and release whatever the driver still holds, without touching
    /// the status. Used when records are discarded.
    pub fn discard<D>(&self, driver: &D)
    where
        D: Driver<Handle = H>,
    {
        let mut slot = self.handle.write();
        if let Some(handle) = slot.take() {
            driver.kill(&handle);
            driver.release(handle);
        }
    }

    /// Put a record back to WAITING with a fresh attempt count.
    ///
    /// Refused while the record is being finalized.
    pub fn restart<D>(&self, board: &StatusBoard, driver: &D) -> bool
    where
        D: Driver<Handle = H>,
    {
        let mut slot = self.handle.write();
        let current = self.status();
        if matches!(current, JobStatus::NotActive | JobStatus::RunningCallback) {
            return false;
        }
        if let Some(handle) = slot.take() {
            driver.kill(&handle);
            driver.release(handle);
        }
        self.reset_attempts();
        board.transition_from(self, current, JobStatus::Waiting);
        true
    }

    /// Force a record onto the EXIT path.
    ///
    /// A live job is killed; its handle stays for the finalizer to release.
    pub fn force_fail<D>(&self, board: &StatusBoard, driver: &D) -> bool
    where
        D: Driver<Handle = H>,
    {
        let slot = self.handle.write();
        let current = self.status();
        if matches!(
            current,
            JobStatus::NotActive | JobStatus::RunningCallback | JobStatus::Exit
        ) {
            return false;
        }
        if let Some(handle) = slot.as_ref() {
            driver.kill(handle);
        }
        board.transition_from(self, current, JobStatus::Exit)
    }
}
