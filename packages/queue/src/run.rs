//! The scheduling loop and the finalization tasks it dispatches.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use jobq_core::{JobFailure, JobStatus, QueueError, QueueEvent};
use tracing::{debug, info, warn};

use crate::driver::Driver;
use crate::finalizer::Finalizer;
use crate::node::{JobNode, SubmitOutcome};
use crate::queue::{Inner, JobQueue};

type Nodes<D> = [Arc<JobNode<<D as Driver>::Handle>>];

impl<D: Driver> JobQueue<D> {
    /// Run the queue on the calling thread until it is finished.
    ///
    /// With `total_expected > 0` the run ends once that many jobs are in a
    /// terminal state. With `0` it ends once every job is terminal and
    /// [`JobQueue::signal_submission_complete`] has been called. A user exit
    /// ends it early. Jobs may be added from other threads while it runs.
    ///
    /// Only one run at a time; a concurrent call gets
    /// [`QueueError::AlreadyRunning`]. After the run the queue keeps its
    /// records for inspection and refuses new jobs until reset.
    pub fn run_jobs(&self, total_expected: usize, verbose: bool) -> Result<(), QueueError> {
        let inner = &self.inner;
        let Some(_permit) = inner.run_permit.try_lock() else {
            warn!("Job queue is already running, ignoring second run");
            return Err(QueueError::AlreadyRunning);
        };

        inner.running.store(true, Ordering::SeqCst);
        let result = self.run_with_permit(total_expected, verbose);
        inner.running.store(false, Ordering::SeqCst);
        // Writers blocked on a full store wake up to a closed queue.
        self.finish_growth();
        result
    }

    /// Run the queue on a new thread.
    ///
    /// [`JobQueue::is_running`] is true as soon as this returns.
    pub fn start_manager_thread(
        &self,
        total_expected: usize,
        verbose: bool,
    ) -> Result<JoinHandle<Result<(), QueueError>>, QueueError> {
        self.inner.running.store(true, Ordering::SeqCst);
        let queue = self.clone();
        thread::Builder::new()
            .name("jobq-manager".to_string())
            .spawn(move || queue.run_jobs(total_expected, verbose))
            .map_err(|e| {
                self.inner.running.store(false, Ordering::SeqCst);
                QueueError::ThreadPool(e.to_string())
            })
    }

    fn run_with_permit(&self, total_expected: usize, verbose: bool) -> Result<(), QueueError> {
        let inner = &self.inner;
        if !inner.open.load(Ordering::SeqCst) {
            return Err(QueueError::NotOpen);
        }

        let finalizer = Finalizer::new(inner.config.finalizer_threads)?;
        let driver = self.driver();
        info!(
            "Job queue starting: {} jobs registered, {} expected, {} finalizer threads",
            self.active_size(),
            total_expected,
            inner.config.finalizer_threads
        );
        inner.board.publish(QueueEvent::RunStarted {
            total_expected,
            timestamp: Utc::now(),
        });

        self.schedule(&finalizer, &driver, total_expected, verbose);

        debug!("Waiting for {} finalizer tasks", finalizer.in_flight());
        finalizer.drain();
        if inner.user_exit.load(Ordering::SeqCst) {
            self.abandon_unfinished(driver.as_ref());
        }
        inner.open.store(false, Ordering::SeqCst);

        let summary = inner.board.summary();
        info!("Job queue finished. {}", summary);
        inner.board.publish(QueueEvent::RunFinished {
            summary,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    fn schedule(&self, finalizer: &Finalizer, driver: &Arc<D>, total_expected: usize, verbose: bool) {
        let inner = &self.inner;
        let mut reported_version = None;

        loop {
            let nodes = inner.store.read().snapshot();

            let final_iteration = inner.user_exit.load(Ordering::SeqCst);
            if final_iteration {
                let abandoned = nodes
                    .iter()
                    .filter(|node| node.abandon(&inner.board, driver.as_ref()))
                    .count();
                info!("User exit: {} jobs stopped", abandoned);
            }

            self.check_expired(&nodes, driver.as_ref());

            let mut progressed = false;
            for node in &nodes {
                progressed |= node.update_status(&inner.board, driver.as_ref());
            }

            if verbose {
                let version = inner.board.version();
                if reported_version != Some(version) {
                    reported_version = Some(version);
                    info!("{}", inner.board.summary());
                }
            }

            let summary = inner.board.summary();
            let complete = if total_expected > 0 {
                summary.finished() >= total_expected
            } else {
                inner.submission_complete.load(Ordering::SeqCst)
                    && summary.finished() == summary.total()
            };

            if !complete && !final_iteration {
                progressed |= self.submit_waiting(&nodes, driver.as_ref()) > 0;
                progressed |= self.dispatch_finished(&nodes, finalizer, driver) > 0;
            }

            if inner.grow_requested.swap(false, Ordering::SeqCst) {
                self.grow_store();
                progressed = true;
            }

            if complete || final_iteration {
                break;
            }
            if !progressed {
                thread::sleep(inner.config.poll_interval());
            }
        }
    }

    /// Stop whatever the finalizer left behind after a user exit. A task
    /// that was already running when the exit came in may have sent its
    /// job back to WAITING or on to EXIT.
    fn abandon_unfinished(&self, driver: &D) {
        let inner = &self.inner;
        let nodes = inner.store.read().snapshot();
        let abandoned = nodes
            .iter()
            .filter(|node| node.abandon(&inner.board, driver))
            .count();
        if abandoned > 0 {
            info!("User exit: {} jobs stopped after finalization", abandoned);
        }
    }

    /// Submit up to one batch of WAITING jobs, within the driver's
    /// concurrency limit. Returns the number submitted.
    fn submit_waiting(&self, nodes: &Nodes<D>, driver: &D) -> usize {
        let inner = &self.inner;
        let summary = inner.board.summary();
        if summary.waiting == 0 {
            return 0;
        }

        let batch = inner.config.submit_batch_size;
        let budget = match driver.max_running() {
            0 => batch,
            max_running => batch.min(max_running.saturating_sub(summary.pending + summary.running)),
        };

        let mut submitted = 0;
        for node in nodes {
            if submitted >= budget || self.submission_closed() {
                break;
            }
            if node.status() != JobStatus::Waiting {
                continue;
            }
            match node.submit(&inner.board, driver) {
                SubmitOutcome::Submitted => submitted += 1,
                SubmitOutcome::Skipped => {}
                SubmitOutcome::DriverFailed => {
                    self.check_driver_failures(node);
                    break;
                }
            }
        }

        if submitted > 0 {
            debug!("Submitted {} jobs", submitted);
        }
        submitted
    }

    fn submission_closed(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst) || self.inner.user_exit.load(Ordering::SeqCst)
    }

    /// Fail a job the driver keeps rejecting, once the configured bound is
    /// reached.
    fn check_driver_failures(&self, node: &JobNode<D::Handle>) {
        let bound = self.inner.config.max_driver_failures;
        if bound == 0 {
            return;
        }
        let failures = node.state.lock().driver_failures;
        if failures < bound {
            return;
        }

        warn!(
            "Job {} rejected by the driver {} times, giving up",
            node.job_name, failures
        );
        let failure = JobFailure::with_reason(format!(
            "driver rejected the job {failures} times"
        ));
        if self.inner.board.fail_with(node, JobStatus::Waiting, failure) {
            node.run_exit_callback();
        }
    }

    /// Hand DONE and EXIT jobs to the finalizer. Returns the number
    /// dispatched.
    fn dispatch_finished(&self, nodes: &Nodes<D>, finalizer: &Finalizer, driver: &Arc<D>) -> usize {
        let mut dispatched = 0;
        for node in nodes {
            let status = node.status();
            let resolve: fn(&Inner<D>, &D, &JobNode<D::Handle>) = match status {
                JobStatus::Done => resolve_done::<D>,
                JobStatus::Exit => resolve_exit::<D>,
                _ => continue,
            };
            if !self
                .inner
                .board
                .transition_from(node.as_ref(), status, JobStatus::RunningCallback)
            {
                continue;
            }

            let inner = Arc::clone(&self.inner);
            let driver = Arc::clone(driver);
            let node = Arc::clone(node);
            finalizer.dispatch(move || resolve(&inner, &driver, &node));
            dispatched += 1;
        }
        dispatched
    }

    /// Kill RUNNING jobs past the duration limit or the stop time.
    fn check_expired(&self, nodes: &Nodes<D>, driver: &D) {
        let max_duration = *self.inner.max_job_duration.lock();
        let stop_time = *self.inner.stop_time.lock();
        if max_duration.is_none() && stop_time.is_none() {
            return;
        }

        let now = Utc::now();
        let past_stop_time = stop_time.is_some_and(|stop| now >= stop);
        for node in nodes {
            let (status, run_start) = {
                let state = node.state.lock();
                (state.status, state.run_start)
            };
            if status != JobStatus::Running {
                continue;
            }
            let over_duration = match (max_duration, run_start) {
                (Some(max), Some(start)) => (now - start).to_std().is_ok_and(|elapsed| elapsed > max),
                _ => false,
            };
            if (over_duration || past_stop_time) && node.kill(&self.inner.board, driver) {
                warn!("Job {} ({}) ran past its time limit and was killed", node.index, node.job_name);
                node.run_exit_callback();
            }
        }
    }

    fn grow_store(&self) {
        self.inner.store.write().grow();
        self.finish_growth();
    }

    fn finish_growth(&self) {
        let mut generation = self.inner.growth.lock();
        *generation += 1;
        self.inner.growth_done.notify_all();
    }
}

/// Finalize a job the driver reported as done.
///
/// Releases the handle first, then checks the sentinel files and the done
/// callback. Success is terminal; anything else goes down the EXIT path.
fn resolve_done<D: Driver>(inner: &Inner<D>, driver: &D, node: &JobNode<D::Handle>) {
    node.release(driver);

    let verdict = inner
        .verifier
        .check(node.exit_file.as_deref(), node.ok_file.as_deref());
    let next = if !verdict.is_ok() {
        info!("Job {} failed verification: {:?}", node.job_name, verdict);
        JobStatus::Exit
    } else if node.run_done_callback() {
        JobStatus::Success
    } else {
        JobStatus::Exit
    };

    inner
        .board
        .transition_from(node, JobStatus::RunningCallback, next);
}

/// Finalize a failed job: resubmit while attempts remain, then ask the
/// retry callback, then give up.
fn resolve_exit<D: Driver>(inner: &Inner<D>, driver: &D, node: &JobNode<D::Handle>) {
    node.release(driver);

    let attempt = node.submit_attempt();
    let max_submit = inner.max_submit.load(Ordering::SeqCst);
    let next = if attempt < max_submit {
        info!(
            "Job {} failed on attempt {}/{}, resubmitting",
            node.job_name, attempt, max_submit
        );
        JobStatus::Waiting
    } else if node.run_retry_callback() {
        info!("Job {} granted new attempts by its retry callback", node.job_name);
        node.reset_attempts();
        JobStatus::Waiting
    } else {
        warn!("Job {} failed after {} attempts", node.job_name, attempt);
        node.run_exit_callback();
        JobStatus::Failed
    };

    inner
        .board
        .transition_from(node, JobStatus::RunningCallback, next);
}
