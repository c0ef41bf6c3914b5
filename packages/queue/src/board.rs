//! Status bookkeeping shared by every thread that touches a job.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use jobq_core::{JobFailure, JobStatus, QueueEvent, StatusHistogram, StatusSummary};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::node::JobNode;
use crate::verifier;

/// Events a subscriber may fall behind by before it starts losing the oldest.
const EVENT_CAPACITY: usize = 1024;

/// Owner of the per-status histogram and the event broadcaster.
///
/// All status writes go through [`StatusBoard::transition`] or one of its
/// conditional variants. The histogram lock is taken before the record's
/// state lock, so a reader of the histogram never sees a count that
/// disagrees with the records.
pub(crate) struct StatusBoard {
    histogram: Mutex<StatusHistogram>,
    reported_version: AtomicU64,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            histogram: Mutex::new(StatusHistogram::default()),
            reported_version: AtomicU64::new(0),
            event_tx,
        }
    }

    /// Count a freshly created record and announce it.
    pub fn register<H>(&self, node: &JobNode<H>) {
        let mut histogram = self.histogram.lock();
        histogram.insert(node.status());
        self.publish(QueueEvent::JobAdded {
            index: node.index,
            job_id: node.id,
            job_name: node.job_name.clone(),
            timestamp: Utc::now(),
        });
    }

    /// Move a record to `to` whatever its current status.
    pub fn transition<H>(&self, node: &JobNode<H>, to: JobStatus) -> bool {
        self.apply(node, None, to, None)
    }

    /// Move a record to `to` only if it is still in `from`.
    pub fn transition_from<H>(&self, node: &JobNode<H>, from: JobStatus, to: JobStatus) -> bool {
        self.apply(node, Some(from), to, None)
    }

    /// Move a record from `from` to FAILED with an explicit payload instead
    /// of the one read from its EXIT file.
    pub fn fail_with<H>(&self, node: &JobNode<H>, from: JobStatus, failure: JobFailure) -> bool {
        self.apply(node, Some(from), JobStatus::Failed, Some(failure))
    }

    fn apply<H>(
        &self,
        node: &JobNode<H>,
        expected: Option<JobStatus>,
        to: JobStatus,
        failure: Option<JobFailure>,
    ) -> bool {
        // File I/O stays outside the locks.
        let failure = match (to, failure) {
            (JobStatus::Failed, Some(failure)) => Some(failure),
            (JobStatus::Failed, None) => verifier::load_failure(node.exit_file.as_deref()),
            _ => None,
        };

        let mut histogram = self.histogram.lock();
        let mut state = node.state.lock();
        let from = state.status;
        if expected.is_some_and(|expected| expected != from) {
            return false;
        }
        if !histogram.transition(from, to) {
            return false;
        }

        let now = Utc::now();
        state.status = to;
        match to {
            JobStatus::Running => state.run_start = Some(now),
            JobStatus::Done | JobStatus::Exit if from == JobStatus::Running => {
                state.run_end = Some(now)
            }
            JobStatus::Failed => state.failure = failure,
            JobStatus::Waiting => state.failure = None,
            _ => {}
        }
        drop(state);

        tracing::debug!("Job {} ({}) {} -> {}", node.index, node.job_name, from, to);
        self.publish(QueueEvent::StatusChanged {
            index: node.index,
            job_id: node.id,
            old_status: from,
            new_status: to,
            timestamp: now,
        });
        true
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.histogram.lock().count(status)
    }

    pub fn summary(&self) -> StatusSummary {
        self.histogram.lock().summary()
    }

    pub fn version(&self) -> u64 {
        self.histogram.lock().version()
    }

    /// True if the histogram changed since the previous call.
    pub fn take_changed(&self) -> bool {
        let version = self.version();
        self.reported_version.swap(version, Ordering::AcqRel) != version
    }

    pub fn clear(&self) {
        self.histogram.lock().clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Broadcast an event. Having no subscribers is not an error.
    pub fn publish(&self, event: QueueEvent) {
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::JobSpec;

    fn node(index: usize) -> JobNode<()> {
        let spec = JobSpec::new("true", "/tmp", format!("job-{index}"));
        JobNode::new(index, spec, PathBuf::from("/tmp"), None, None)
    }

    #[test]
    fn histogram_follows_transitions() {
        let board = StatusBoard::new();
        let a = node(0);
        let b = node(1);
        board.register(&a);
        board.register(&b);
        assert!(board.transition(&a, JobStatus::Waiting));
        assert!(board.transition(&b, JobStatus::Waiting));
        assert!(board.transition(&a, JobStatus::Running));

        let summary = board.summary();
        assert_eq!(summary.total(), 2);
        assert_eq!(summary.waiting, 1);
        assert_eq!(summary.running, 1);
        assert!(a.snapshot().run_start.is_some());
    }

    #[test]
    fn conditional_transition_checks_current_status() {
        let board = StatusBoard::new();
        let a = node(0);
        board.register(&a);
        board.transition(&a, JobStatus::Waiting);

        assert!(!board.transition_from(&a, JobStatus::Running, JobStatus::Done));
        assert_eq!(a.status(), JobStatus::Waiting);
        assert!(board.transition_from(&a, JobStatus::Waiting, JobStatus::Submitted));
        assert!(!board.transition(&a, JobStatus::Submitted));
    }

    #[test]
    fn failed_without_exit_file_has_no_payload() {
        let board = StatusBoard::new();
        let a = node(0);
        board.register(&a);
        board.transition(&a, JobStatus::Exit);
        board.transition(&a, JobStatus::Failed);
        assert!(a.snapshot().failure.is_none());

        let b = node(1);
        board.register(&b);
        board.transition(&b, JobStatus::Waiting);
        assert!(board.fail_with(&b, JobStatus::Waiting, JobFailure::with_reason("rejected")));
        assert_eq!(
            b.snapshot().failure.unwrap().reason.as_deref(),
            Some("rejected")
        );
    }

    #[test]
    fn events_reach_subscribers() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        let a = node(4);
        board.register(&a);
        board.transition(&a, JobStatus::Waiting);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].description(), "Job 4 not_active -> waiting");
    }

    #[test]
    fn slow_subscriber_is_bounded() {
        let board = StatusBoard::new();
        let mut rx = board.subscribe();
        let a = node(0);
        board.register(&a);
        for _ in 0..EVENT_CAPACITY {
            board.transition(&a, JobStatus::Waiting);
            board.transition(&a, JobStatus::Submitted);
        }

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(_))
        ));
        let mut kept = 0;
        while rx.try_recv().is_ok() {
            kept += 1;
        }
        assert_eq!(kept, EVENT_CAPACITY);
    }

    #[test]
    fn take_changed_reports_once() {
        let board = StatusBoard::new();
        let a = node(0);
        board.register(&a);
        assert!(board.take_changed());
        assert!(!board.take_changed());
        board.transition(&a, JobStatus::Waiting);
        assert!(board.take_changed());
    }
}
