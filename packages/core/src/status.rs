//! Job lifecycle states and the per-status histogram.

use serde::{Deserialize, Serialize};

/// Current status of a job slot in its lifecycle.
///
/// The queue moves a record through these states; a `Driver` only ever
/// reports `Pending`, `Running`, `Done` or `Exit`. Everything else is decided
/// by the queue itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Unused slot.
    #[default]
    NotActive,
    /// Registered and ready to be submitted when a slot opens.
    Waiting,
    /// Handed to the driver, not yet confirmed by a status poll.
    Submitted,
    /// The driver has the job queued.
    Pending,
    /// The driver reports the job as running.
    Running,
    /// The driver reports a finished job; not verified yet.
    Done,
    /// The driver (or a failed verification) reports a failed job.
    Exit,
    /// Finalization is running on the worker pool.
    RunningCallback,
    /// Verified success.
    Success,
    /// Failed after all submit attempts were spent.
    Failed,
    /// Killed by an explicit request.
    UserKilled,
    /// Abandoned because the whole queue was shut down.
    UserExit,
}

impl JobStatus {
    /// Number of distinct states.
    pub const COUNT: usize = 12;

    /// Every state, in declaration order.
    pub const ALL: [JobStatus; Self::COUNT] = [
        JobStatus::NotActive,
        JobStatus::Waiting,
        JobStatus::Submitted,
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Done,
        JobStatus::Exit,
        JobStatus::RunningCallback,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::UserKilled,
        JobStatus::UserExit,
    ];

    /// Position of this state in [`JobStatus::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Check if the job has reached a state it will never leave on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::UserKilled | JobStatus::UserExit
        )
    }

    /// States an explicit kill request may act on.
    pub fn can_kill(self) -> bool {
        matches!(
            self,
            JobStatus::Waiting | JobStatus::Submitted | JobStatus::Pending | JobStatus::Running
        )
    }

    /// States whose driver status is polled by the scheduling loop.
    pub fn can_poll(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted | JobStatus::Pending | JobStatus::Running
        )
    }

    /// States in which the driver may still reference the job.
    pub fn may_hold_handle(self) -> bool {
        matches!(
            self,
            JobStatus::Submitted
                | JobStatus::Pending
                | JobStatus::Running
                | JobStatus::Done
                | JobStatus::Exit
                | JobStatus::RunningCallback
        )
    }

    /// Get a simple status string for display.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::NotActive => "not_active",
            JobStatus::Waiting => "waiting",
            JobStatus::Submitted => "submitted",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Exit => "exit",
            JobStatus::RunningCallback => "running_callback",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
            JobStatus::UserKilled => "user_killed",
            JobStatus::UserExit => "user_exit",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count of records per status.
///
/// The only mutators are [`StatusHistogram::insert`],
/// [`StatusHistogram::transition`] and [`StatusHistogram::clear`]; the queue
/// calls them under the same lock that writes a record's status, so the
/// buckets always sum to the number of live records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusHistogram {
    counts: [usize; JobStatus::COUNT],
    version: u64,
}

impl StatusHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a new record entering in `status`.
    pub fn insert(&mut self, status: JobStatus) {
        self.counts[status.index()] += 1;
        self.version += 1;
    }

    /// Move one record from `from` to `to`. Returns false if nothing changed.
    pub fn transition(&mut self, from: JobStatus, to: JobStatus) -> bool {
        if from == to {
            return false;
        }
        debug_assert!(self.counts[from.index()] > 0, "empty bucket {from}");
        self.counts[from.index()] = self.counts[from.index()].saturating_sub(1);
        self.counts[to.index()] += 1;
        self.version += 1;
        true
    }

    /// Number of records currently in `status`.
    pub fn count(&self, status: JobStatus) -> usize {
        self.counts[status.index()]
    }

    /// Sum over all buckets.
    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Monotonic change counter; bumps on every mutation.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Drop all counts. The version still advances so observers see the change.
    pub fn clear(&mut self) {
        self.counts = [0; JobStatus::COUNT];
        self.version += 1;
    }

    /// Snapshot the buckets into a serializable summary.
    pub fn summary(&self) -> StatusSummary {
        StatusSummary {
            not_active: self.count(JobStatus::NotActive),
            waiting: self.count(JobStatus::Waiting),
            submitted: self.count(JobStatus::Submitted),
            pending: self.count(JobStatus::Pending),
            running: self.count(JobStatus::Running),
            done: self.count(JobStatus::Done),
            exit: self.count(JobStatus::Exit),
            running_callback: self.count(JobStatus::RunningCallback),
            success: self.count(JobStatus::Success),
            failed: self.count(JobStatus::Failed),
            user_killed: self.count(JobStatus::UserKilled),
            user_exit: self.count(JobStatus::UserExit),
        }
    }
}

/// Point-in-time counts of records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSummary {
    pub not_active: usize,
    pub waiting: usize,
    pub submitted: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub exit: usize,
    pub running_callback: usize,
    pub success: usize,
    pub failed: usize,
    pub user_killed: usize,
    pub user_exit: usize,
}

impl StatusSummary {
    /// Total number of records.
    pub fn total(&self) -> usize {
        self.not_active + self.in_progress() + self.finished()
    }

    /// Records that are queued, in flight or being finalized.
    pub fn in_progress(&self) -> usize {
        self.waiting
            + self.submitted
            + self.pending
            + self.running
            + self.done
            + self.exit
            + self.running_callback
    }

    /// Records in a terminal state.
    pub fn finished(&self) -> usize {
        self.success + self.failed + self.user_killed + self.user_exit
    }

    /// Success rate over finished records as a percentage.
    pub fn success_rate(&self) -> Option<f64> {
        let finished = self.finished();
        if finished == 0 {
            None
        } else {
            Some((self.success as f64 / finished as f64) * 100.0)
        }
    }
}

impl std::fmt::Display for StatusSummary {
    // DONE and EXIT count as running: their sentinel files are not checked yet.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Waiting: {:3}    Pending: {:3}    Running: {:3}    Checking/Loading: {:3}    Failed: {:3}    Complete: {:3}",
            self.waiting,
            self.pending + self.submitted,
            self.running + self.done + self.exit,
            self.running_callback,
            self.failed,
            self.success
        )
    }
}
