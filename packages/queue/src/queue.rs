//! The job queue handle: adding jobs, controls and queries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobq_core::{
    JobFailure, JobSnapshot, JobStatus, QueueConfig, QueueError, QueueEvent, StatusSummary,
};
use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::broadcast;

use crate::board::StatusBoard;
use crate::driver::Driver;
use crate::job::JobSpec;
use crate::node::JobNode;
use crate::store::JobStore;
use crate::verifier::CompletionVerifier;

/// State shared between the queue handle, the scheduling loop and the
/// finalizer tasks.
pub(crate) struct Inner<D: Driver> {
    pub config: QueueConfig,
    pub verifier: CompletionVerifier,
    pub driver: RwLock<Arc<D>>,
    pub store: RwLock<JobStore<D::Handle>>,
    pub board: StatusBoard,
    /// Held for the whole of a run; `try_lock` decides who gets to run.
    pub run_permit: Mutex<()>,
    pub open: AtomicBool,
    pub running: AtomicBool,
    pub user_exit: AtomicBool,
    pub paused: AtomicBool,
    pub submission_complete: AtomicBool,
    pub grow_requested: AtomicBool,
    /// Bumped by the scheduling loop each time it grows the store.
    pub growth: Mutex<u64>,
    pub growth_done: Condvar,
    pub max_submit: AtomicU32,
    pub max_job_duration: Mutex<Option<Duration>>,
    pub stop_time: Mutex<Option<DateTime<Utc>>>,
}

/// Thread-safe batch job queue.
///
/// Cloning is cheap and every clone refers to the same queue, so a clone can
/// be handed to the thread that calls [`JobQueue::run_jobs`] while others
/// keep adding jobs and querying status.
pub struct JobQueue<D: Driver> {
    pub(crate) inner: Arc<Inner<D>>,
}

impl<D: Driver> Clone for JobQueue<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Driver> JobQueue<D> {
    /// Create an open, empty queue.
    pub fn new(config: QueueConfig, driver: D) -> Result<Self, QueueError> {
        config.validate()?;

        let inner = Inner {
            verifier: CompletionVerifier::from_config(&config),
            driver: RwLock::new(Arc::new(driver)),
            store: RwLock::new(JobStore::with_capacity(config.initial_capacity)),
            board: StatusBoard::new(),
            run_permit: Mutex::new(()),
            open: AtomicBool::new(true),
            running: AtomicBool::new(false),
            user_exit: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            submission_complete: AtomicBool::new(false),
            grow_requested: AtomicBool::new(false),
            growth: Mutex::new(0),
            growth_done: Condvar::new(),
            max_submit: AtomicU32::new(config.max_submit),
            max_job_duration: Mutex::new(config.max_job_duration()),
            stop_time: Mutex::new(None),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Register a job. Returns its slot index.
    ///
    /// If every slot is taken while a run is active, this blocks until the
    /// scheduling loop has grown the store.
    pub fn add_job(&self, spec: JobSpec) -> Result<usize, QueueError> {
        let inner = &self.inner;
        if !inner.open.load(Ordering::SeqCst) {
            return Err(QueueError::NotOpen);
        }
        let run_path = resolve_run_path(&spec.run_path)?;

        loop {
            if inner.user_exit.load(Ordering::SeqCst) {
                return Err(QueueError::ShutdownRequested);
            }

            {
                let mut store = inner.store.write();
                let running = inner.running.load(Ordering::SeqCst);
                // A run can finish while we wait for growth; it closes the
                // queue before clearing `running`.
                if !inner.open.load(Ordering::SeqCst) {
                    return Err(QueueError::NotOpen);
                }
                if store.is_full() && !running {
                    store.grow();
                }
                if !store.is_full() {
                    let index = store.next_index();
                    let node = Arc::new(JobNode::new(
                        index,
                        spec,
                        run_path,
                        inner.config.exit_file.as_deref(),
                        inner.config.ok_file.as_deref(),
                    ));
                    inner.board.register(node.as_ref());
                    store.push(Arc::clone(&node));
                    inner.board.transition(node.as_ref(), JobStatus::Waiting);
                    tracing::debug!("Added job {} ({})", index, node.job_name);
                    return Ok(index);
                }
            }

            // Full during a run: ask the loop to grow and wait one poll
            // interval for it, then look again.
            inner.grow_requested.store(true, Ordering::SeqCst);
            let mut generation = inner.growth.lock();
            if inner.running.load(Ordering::SeqCst) {
                tracing::debug!("Job store full at generation {}, waiting", *generation);
                inner
                    .growth_done
                    .wait_for(&mut generation, inner.config.poll_interval());
            }
        }
    }

    /// Clone of the current driver.
    pub fn driver(&self) -> Arc<D> {
        self.inner.driver.read().clone()
    }

    /// Swap the driver. Refused while a run is active or while any record
    /// still holds a handle from the current driver.
    pub fn set_driver(&self, driver: D) -> Result<(), QueueError> {
        let inner = &self.inner;
        let Some(_permit) = inner.run_permit.try_lock() else {
            return Err(QueueError::DriverBusy);
        };
        if inner.running.load(Ordering::SeqCst) {
            return Err(QueueError::DriverBusy);
        }
        if inner.store.read().iter().any(|node| node.has_handle()) {
            return Err(QueueError::DriverBusy);
        }
        *inner.driver.write() = Arc::new(driver);
        Ok(())
    }

    /// Discard every record and reopen the queue. Capacity is kept.
    pub fn reset(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        let Some(_permit) = inner.run_permit.try_lock() else {
            return Err(QueueError::AlreadyRunning);
        };
        let driver = self.driver();

        {
            let mut store = inner.store.write();
            for node in store.iter() {
                node.discard(driver.as_ref());
            }
            store.clear();
            inner.board.clear();
        }

        inner.user_exit.store(false, Ordering::SeqCst);
        inner.paused.store(false, Ordering::SeqCst);
        inner.submission_complete.store(false, Ordering::SeqCst);
        inner.grow_requested.store(false, Ordering::SeqCst);
        *inner.stop_time.lock() = None;
        inner.open.store(true, Ordering::SeqCst);
        tracing::info!("Job queue reset");
        Ok(())
    }

    // --- controls ---

    /// Kill a job. Returns false if its status does not allow a kill.
    pub fn kill_job(&self, index: usize) -> Result<bool, QueueError> {
        let node = self.node(index)?;
        let killed = node.kill(&self.inner.board, self.driver().as_ref());
        if killed {
            tracing::info!("Killed job {} ({})", index, node.job_name);
        }
        Ok(killed)
    }

    /// Send a job back to WAITING with a fresh set of submit attempts.
    ///
    /// Returns false while the job is being finalized.
    pub fn restart_job(&self, index: usize) -> Result<bool, QueueError> {
        let node = self.node(index)?;
        Ok(node.restart(&self.inner.board, self.driver().as_ref()))
    }

    /// Force a job onto the EXIT path, e.g. after its results were found to
    /// be invalid. A running job is killed first.
    pub fn force_fail(&self, index: usize) -> Result<bool, QueueError> {
        let node = self.node(index)?;
        let forced = node.force_fail(&self.inner.board, self.driver().as_ref());
        if forced {
            tracing::info!("Forced job {} ({}) to exit", index, node.job_name);
        }
        Ok(forced)
    }

    pub fn max_running(&self) -> usize {
        self.driver().max_running()
    }

    /// Set the driver's concurrency limit, 0 = unlimited.
    pub fn set_max_running(&self, max_running: usize) {
        self.driver().set_max_running(max_running);
    }

    /// Adjust the concurrency limit by `delta`, clamped at 0.
    pub fn inc_max_running(&self, delta: isize) -> usize {
        let driver = self.driver();
        let max_running = driver.max_running().saturating_add_signed(delta);
        driver.set_max_running(max_running);
        max_running
    }

    pub fn max_submit(&self) -> u32 {
        self.inner.max_submit.load(Ordering::SeqCst)
    }

    /// Set the submit attempt limit; values below 1 are raised to 1.
    pub fn set_max_submit(&self, max_submit: u32) {
        self.inner.max_submit.store(max_submit.max(1), Ordering::SeqCst);
    }

    /// Stop submitting. Polling and finalization carry on.
    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        tracing::info!("Job queue paused");
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
        tracing::info!("Job queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Tell a run started with `total_expected == 0` that no more jobs will
    /// be added.
    pub fn signal_submission_complete(&self) {
        self.inner.submission_complete.store(true, Ordering::SeqCst);
    }

    /// Shut the queue down: the running loop kills everything in flight and
    /// returns, and new jobs are refused until [`JobQueue::reset`].
    pub fn request_user_exit(&self) {
        self.inner.user_exit.store(true, Ordering::SeqCst);
        tracing::info!("User exit requested");
    }

    pub fn is_user_exit_requested(&self) -> bool {
        self.inner.user_exit.load(Ordering::SeqCst)
    }

    /// Kill running jobs that have been running longer than `max`.
    pub fn set_max_job_duration(&self, max: Option<Duration>) {
        *self.inner.max_job_duration.lock() = max;
    }

    pub fn max_job_duration(&self) -> Option<Duration> {
        *self.inner.max_job_duration.lock()
    }

    /// Kill every job still running at `stop_time`.
    pub fn set_job_stop_time(&self, stop_time: Option<DateTime<Utc>>) {
        *self.inner.stop_time.lock() = stop_time;
    }

    pub fn job_stop_time(&self) -> Option<DateTime<Utc>> {
        *self.inner.stop_time.lock()
    }

    /// Derive a stop time from the jobs that already succeeded: now plus a
    /// quarter of their mean run time. Returns `None` and leaves the stop
    /// time alone if no successful job has a known run time.
    pub fn set_auto_job_stop_time(&self) -> Option<DateTime<Utc>> {
        let runtimes: Vec<chrono::Duration> = self
            .snapshots()
            .into_iter()
            .filter(|snap| snap.status == JobStatus::Success)
            .filter_map(|snap| snap.run_duration())
            .collect();
        if runtimes.is_empty() {
            return None;
        }

        let total = runtimes
            .iter()
            .fold(chrono::Duration::zero(), |acc, runtime| acc + *runtime);
        let mean = total / runtimes.len() as i32;
        let stop_time = Utc::now() + mean / 4;
        tracing::info!(
            "Auto stop time set to {} (mean run time {}s over {} jobs)",
            stop_time,
            mean.num_seconds(),
            runtimes.len()
        );
        self.set_job_stop_time(Some(stop_time));
        Some(stop_time)
    }

    /// Receive every event emitted from now on.
    ///
    /// The channel is bounded: a subscriber that falls far behind gets
    /// [`broadcast::error::TryRecvError::Lagged`] and skips the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.board.subscribe()
    }

    // --- queries ---

    pub(crate) fn node(&self, index: usize) -> Result<Arc<JobNode<D::Handle>>, QueueError> {
        let store = self.inner.store.read();
        store
            .get(index)
            .cloned()
            .ok_or_else(|| QueueError::IndexOutOfRange {
                index,
                size: store.len(),
            })
    }

    pub fn status(&self, index: usize) -> Result<JobStatus, QueueError> {
        Ok(self.node(index)?.status())
    }

    pub fn snapshot(&self, index: usize) -> Result<JobSnapshot, QueueError> {
        Ok(self.node(index)?.snapshot())
    }

    /// Snapshots of every record, in index order.
    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        let nodes = self.inner.store.read().snapshot();
        nodes.iter().map(|node| node.snapshot()).collect()
    }

    pub fn run_path(&self, index: usize) -> Result<PathBuf, QueueError> {
        Ok(self.node(index)?.run_path.clone())
    }

    pub fn job_name(&self, index: usize) -> Result<String, QueueError> {
        Ok(self.node(index)?.job_name.clone())
    }

    pub fn submit_attempt(&self, index: usize) -> Result<u32, QueueError> {
        Ok(self.node(index)?.submit_attempt())
    }

    pub fn submit_time(&self, index: usize) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.node(index)?.state.lock().submit_time)
    }

    pub fn run_start(&self, index: usize) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.node(index)?.state.lock().run_start)
    }

    pub fn run_end(&self, index: usize) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self.node(index)?.state.lock().run_end)
    }

    /// Name of the sub-job that failed, from the EXIT file.
    pub fn failed_job(&self, index: usize) -> Result<Option<String>, QueueError> {
        self.failure_field(index, |f| f.failed_job.clone())
    }

    pub fn error_reason(&self, index: usize) -> Result<Option<String>, QueueError> {
        self.failure_field(index, |f| f.reason.clone())
    }

    pub fn stderr_capture(&self, index: usize) -> Result<Option<String>, QueueError> {
        self.failure_field(index, |f| f.stderr_capture.clone())
    }

    pub fn stderr_file(&self, index: usize) -> Result<Option<PathBuf>, QueueError> {
        self.failure_field(index, |f| f.stderr_file.clone())
    }

    fn failure_field<T>(
        &self,
        index: usize,
        field: impl Fn(&JobFailure) -> Option<T>,
    ) -> Result<Option<T>, QueueError> {
        let node = self.node(index)?;
        let state = node.state.lock();
        Ok(state.failure.as_ref().and_then(field))
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.inner.board.count(status)
    }

    pub fn status_summary(&self) -> StatusSummary {
        self.inner.board.summary()
    }

    /// Active size and summary read together, so that the summary total
    /// always equals the size.
    pub fn summary_with_size(&self) -> (usize, StatusSummary) {
        let store = self.inner.store.read();
        (store.len(), self.inner.board.summary())
    }

    /// True if any job changed status since the previous call.
    pub fn status_changed(&self) -> bool {
        self.inner.board.take_changed()
    }

    /// Number of records.
    pub fn active_size(&self) -> usize {
        self.inner.store.read().len()
    }

    /// Status of a job and whether the driver currently holds a handle
    /// for it, read atomically.
    pub fn handle_state(&self, index: usize) -> Result<(JobStatus, bool), QueueError> {
        Ok(self.node(index)?.handle_state())
    }

    /// Number of slots before the store has to grow.
    pub fn capacity(&self) -> usize {
        self.inner.store.read().capacity()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// False after a run has finished until [`JobQueue::reset`].
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn num_waiting(&self) -> usize {
        self.count(JobStatus::Waiting)
    }

    /// Jobs handed to the driver but not yet running.
    pub fn num_pending(&self) -> usize {
        let summary = self.status_summary();
        summary.submitted + summary.pending
    }

    pub fn num_running(&self) -> usize {
        self.count(JobStatus::Running)
    }

    /// Jobs being finalized, including those about to be.
    pub fn num_callback(&self) -> usize {
        let summary = self.status_summary();
        summary.done + summary.exit + summary.running_callback
    }

    pub fn num_complete(&self) -> usize {
        self.count(JobStatus::Success)
    }

    pub fn num_failed(&self) -> usize {
        self.count(JobStatus::Failed)
    }

    pub fn num_killed(&self) -> usize {
        self.count(JobStatus::UserKilled)
    }
}

fn resolve_run_path(path: &Path) -> Result<PathBuf, QueueError> {
    let absolute = std::path::absolute(path).map_err(|e| QueueError::InvalidRunPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !absolute.is_dir() {
        return Err(QueueError::InvalidRunPath {
            path: absolute,
            reason: "not an existing directory".to_string(),
        });
    }
    Ok(absolute)
}
