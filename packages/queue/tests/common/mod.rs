#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use jobq::{Driver, DriverError, DriverStatus, QueueConfig, SubmitRequest};
use tempfile::TempDir;

/// How a stub job ends once it has been polled a few times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Exit,
    /// Runs until killed.
    Hang,
}

pub struct StubHandle {
    pub id: usize,
    pub job_name: String,
    outcome: Outcome,
    polls: AtomicUsize,
    finished: AtomicBool,
}

/// In-memory driver with scripted outcomes and call counters.
///
/// Each job reports `Pending` on its first poll, `Running` until
/// `polls_to_finish`, then its outcome.
pub struct StubDriver {
    default_outcome: Outcome,
    scripted: Mutex<HashMap<String, VecDeque<Outcome>>>,
    polls_to_finish: usize,
    reject_next: AtomicUsize,
    max_running: AtomicUsize,
    next_id: AtomicUsize,
    pub submits: AtomicUsize,
    pub kills: AtomicUsize,
    pub releases: AtomicUsize,
    active: AtomicUsize,
    pub peak_active: AtomicUsize,
    submitted_names: Mutex<Vec<String>>,
}

impl StubDriver {
    pub fn new(default_outcome: Outcome) -> Self {
        Self {
            default_outcome,
            scripted: Mutex::new(HashMap::new()),
            polls_to_finish: 3,
            reject_next: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            submits: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
            submitted_names: Mutex::new(Vec::new()),
        }
    }

    /// Outcomes for successive submissions of `job_name`; the default
    /// applies once the script runs out.
    pub fn with_script(self, job_name: &str, outcomes: &[Outcome]) -> Self {
        self.scripted
            .lock()
            .unwrap()
            .insert(job_name.to_string(), outcomes.iter().copied().collect());
        self
    }

    pub fn with_max_running(self, max_running: usize) -> Self {
        self.max_running.store(max_running, Ordering::SeqCst);
        self
    }

    pub fn with_polls_to_finish(mut self, polls: usize) -> Self {
        self.polls_to_finish = polls;
        self
    }

    /// Reject the next `count` submissions.
    pub fn reject_next(&self, count: usize) {
        self.reject_next.store(count, Ordering::SeqCst);
    }

    pub fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Handles handed out and not yet released.
    pub fn live_handles(&self) -> usize {
        self.submits() - self.releases()
    }

    pub fn peak_active(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    pub fn submissions_of(&self, job_name: &str) -> usize {
        self.submitted_names
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.as_str() == job_name)
            .count()
    }

    fn finish(&self, handle: &StubHandle) {
        if !handle.finished.swap(true, Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Driver for StubDriver {
    type Handle = StubHandle;

    fn submit(&self, request: &SubmitRequest<'_>) -> Result<StubHandle, DriverError> {
        let rejected = self
            .reject_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(DriverError::Unavailable("stub rejects".to_string()));
        }

        let outcome = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(request.job_name)
            .and_then(VecDeque::pop_front)
            .unwrap_or(self.default_outcome);

        self.submits.fetch_add(1, Ordering::SeqCst);
        self.submitted_names
            .lock()
            .unwrap()
            .push(request.job_name.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);

        Ok(StubHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            job_name: request.job_name.to_string(),
            outcome,
            polls: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        })
    }

    fn status(&self, handle: &StubHandle) -> DriverStatus {
        let polls = handle.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls == 1 {
            return DriverStatus::Pending;
        }
        if polls < self.polls_to_finish {
            return DriverStatus::Running;
        }
        match handle.outcome {
            Outcome::Hang => DriverStatus::Running,
            Outcome::Done => {
                self.finish(handle);
                DriverStatus::Done
            }
            Outcome::Exit => {
                self.finish(handle);
                DriverStatus::Exit
            }
        }
    }

    fn kill(&self, handle: &StubHandle) {
        self.kills.fetch_add(1, Ordering::SeqCst);
        self.finish(handle);
    }

    fn release(&self, handle: StubHandle) {
        self.finish(&handle);
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn set_max_running(&self, max_running: usize) {
        self.max_running.store(max_running, Ordering::SeqCst);
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("jobq=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Config tuned for tests: short sleeps and a short OK-file window.
pub fn fast_config() -> QueueConfig {
    QueueConfig::default()
        .with_poll_interval(Duration::from_millis(5))
        .with_ok_poll_interval(Duration::from_millis(20))
        .with_max_ok_wait(Duration::from_secs(1))
        .with_finalizer_threads(4)
}

/// A temp directory holding `count` run directories.
pub fn run_dirs(count: usize) -> (TempDir, Vec<PathBuf>) {
    let root = tempfile::tempdir().expect("create temp dir");
    let dirs = (0..count)
        .map(|i| {
            let dir = root.path().join(format!("real-{i}"));
            std::fs::create_dir(&dir).expect("create run dir");
            dir
        })
        .collect();
    (root, dirs)
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub const EXIT_XML: &str = "<error>\n  <job>ECLIPSE100</job>\n  <reason>Process exited with status 1</reason>\n  <stderr>Error: no grid</stderr>\n  <stderr_file>/runs/ECLIPSE100.stderr</stderr_file>\n</error>\n";
