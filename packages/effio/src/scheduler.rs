//! The scheduler boundary: deferred execution of units of work.
//!
//! The engine never blocks a native thread; all suspension is expressed as
//! handing a continuation to a scheduler. Work submitted via [`Scheduler::asap`]
//! is guaranteed to never run synchronously within the submitting call, and
//! the returned handle prevents the work from running if cancelled in time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::error;

use crate::cancellation::Cancellable;

/// A unit of deferred work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Externally supplied scheduling capability.
pub trait Scheduler: Send + Sync {
    /// Schedule work for execution at the next opportunity.
    ///
    /// The work must never run inside this call. The returned handle is
    /// cancel-idempotent; cancelling it prevents the work from running if it
    /// has not run yet.
    fn asap(&self, job: Job) -> Arc<dyn Cancellable>;
}

/// Cancel flag for a scheduled job, consulted immediately before the job
/// runs.
pub struct JobHandle {
    cancelled: AtomicBool,
}

impl JobHandle {
    pub fn new() -> Self {
        JobHandle {
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellable for JobHandle {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

struct ScheduledJob {
    handle: Arc<JobHandle>,
    job: Job,
}

impl ScheduledJob {
    fn run(self) {
        if self.handle.is_cancelled() {
            return;
        }
        // A panicking job must not take the worker down with it.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(self.job));
        if result.is_err() {
            error!("scheduled job panicked");
        }
    }
}

/// Scheduler backed by detached worker threads draining an MPMC channel.
///
/// Workers exit when every handle to the scheduler has been dropped and the
/// queue has drained.
pub struct ThreadScheduler {
    tx: crossbeam_channel::Sender<ScheduledJob>,
}

impl ThreadScheduler {
    /// Single-worker scheduler: jobs run in strict submission order.
    pub fn new() -> Self {
        Self::with_workers(1)
    }

    /// Scheduler with `workers` threads. With more than one worker, jobs
    /// may run concurrently and complete out of submission order.
    pub fn with_workers(workers: usize) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded::<ScheduledJob>();
        for i in 0..workers.max(1) {
            let rx = rx.clone();
            thread::Builder::new()
                .name(format!("effio-worker-{}", i))
                .spawn(move || {
                    while let Ok(scheduled) = rx.recv() {
                        scheduled.run();
                    }
                })
                .expect("failed to spawn worker thread");
        }
        ThreadScheduler { tx }
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn asap(&self, job: Job) -> Arc<dyn Cancellable> {
        let handle = Arc::new(JobHandle::new());
        let scheduled = ScheduledJob {
            handle: handle.clone(),
            job,
        };
        // Send fails only when every worker has exited, which requires the
        // sender side to be gone; unreachable from here.
        let _ = self.tx.send(scheduled);
        handle
    }
}

/// Deterministic scheduler for tests: jobs queue up until the test drains
/// them on its own thread.
pub struct TestScheduler {
    queue: Mutex<VecDeque<ScheduledJob>>,
}

impl TestScheduler {
    pub fn new() -> Self {
        TestScheduler {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Run the next non-cancelled job. Returns false when the queue is
    /// empty. The job runs outside the queue lock, so it may schedule more
    /// work.
    pub fn run_one(&self) -> bool {
        loop {
            let next = {
                let mut queue = self.queue.lock().expect("scheduler lock poisoned");
                queue.pop_front()
            };
            match next {
                None => return false,
                Some(scheduled) if scheduled.handle.is_cancelled() => continue,
                Some(scheduled) => {
                    scheduled.run();
                    return true;
                }
            }
        }
    }

    /// Drain the queue to quiescence, including work scheduled by the jobs
    /// themselves. Returns the number of jobs that actually ran, i.e. the
    /// scheduler turn count.
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Jobs currently queued (cancelled ones included).
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("scheduler lock poisoned").len()
    }
}

impl Default for TestScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TestScheduler {
    fn asap(&self, job: Job) -> Arc<dyn Cancellable> {
        let handle = Arc::new(JobHandle::new());
        self.queue
            .lock()
            .expect("scheduler lock poisoned")
            .push_back(ScheduledJob {
                handle: handle.clone(),
                job,
            });
        handle
    }
}
