//! Worker pool that finalizes finished jobs off the scheduling thread.

use std::sync::Arc;

use jobq_core::QueueError;
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

/// Decrements the in-flight count when a task ends, even by panic.
struct TaskGuard(Arc<InFlight>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

/// Bounded pool for finalization tasks.
///
/// Tasks are fire-and-forget; [`Finalizer::drain`] blocks until every
/// dispatched task has returned.
pub(crate) struct Finalizer {
    pool: ThreadPool,
    in_flight: Arc<InFlight>,
}

impl Finalizer {
    pub fn new(threads: usize) -> Result<Self, QueueError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("jobq-finalizer-{i}"))
            .panic_handler(|_| tracing::error!("Finalizer task panicked"))
            .build()
            .map_err(|e| QueueError::ThreadPool(e.to_string()))?;

        Ok(Self {
            pool,
            in_flight: Arc::new(InFlight::default()),
        })
    }

    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.in_flight.count.lock() += 1;
        let guard = TaskGuard(Arc::clone(&self.in_flight));
        self.pool.spawn(move || {
            let _guard = guard;
            task();
        });
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    /// Block until no task is running or queued.
    pub fn drain(&self) {
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.drained.wait(&mut count);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn drain_waits_for_all_tasks() {
        let finalizer = Finalizer::new(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let done = Arc::clone(&done);
            finalizer.dispatch(move || {
                std::thread::sleep(Duration::from_millis(20));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        finalizer.drain();

        assert_eq!(done.load(Ordering::SeqCst), 6);
        assert_eq!(finalizer.in_flight(), 0);
    }

    #[test]
    fn panicking_task_still_counts_down() {
        let finalizer = Finalizer::new(1).unwrap();
        finalizer.dispatch(|| panic!("task failed"));
        finalizer.drain();
        assert_eq!(finalizer.in_flight(), 0);
    }

    #[test]
    fn drain_on_idle_pool_returns() {
        let finalizer = Finalizer::new(1).unwrap();
        finalizer.drain();
    }
}
