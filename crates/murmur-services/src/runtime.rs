//! Execution collaborators — the serialized dispatch loop that runs packet
//! handlers and the deferred-task scheduler that fires collection timeouts.
//!
//! Both are traits so tests and embedders can supply their own. The tokio
//! implementations here are what the daemon uses.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// A unit of work posted to a loop or scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serialized job queue. Jobs run one at a time, in posting order, and a job
/// never starts while another is running.
pub trait DispatchLoop: Send + Sync {
    fn post(&self, job: Job);
}

/// Deferred-task scheduler.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, job: Job) -> TimerHandle;
}

/// Cancels a scheduled job. Dropping the handle leaves the job scheduled.
pub struct TimerHandle {
    cancel: Box<dyn FnOnce() + Send + Sync>,
}

impl TimerHandle {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Box::new(cancel),
        }
    }

    pub fn cancel(self) {
        (self.cancel)();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle").finish_non_exhaustive()
    }
}

// ── Tokio dispatch loop ───────────────────────────────────────────────────────

/// Dispatch loop backed by an unbounded channel drained by a single task.
#[derive(Clone)]
pub struct TokioDispatchLoop {
    job_tx: mpsc::UnboundedSender<Job>,
}

impl TokioDispatchLoop {
    /// Spawn the loop task on `handle`. The task exits once every clone of
    /// the loop has been dropped.
    pub fn spawn(handle: &Handle) -> Self {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        handle.spawn(async move {
            while let Some(job) = job_rx.recv().await {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::warn!("dispatch job panicked");
                }
            }
            tracing::debug!("dispatch loop exiting");
        });
        Self { job_tx }
    }

    /// Spawn on the current runtime. Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::spawn(&Handle::current())
    }
}

impl DispatchLoop for TokioDispatchLoop {
    fn post(&self, job: Job) {
        if self.job_tx.send(job).is_err() {
            tracing::warn!("dispatch loop closed, dropping job");
        }
    }
}

// ── Tokio scheduler ───────────────────────────────────────────────────────────

/// Scheduler that sleeps on a spawned task per job.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Schedule on the current runtime. Panics outside a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, job: Job) -> TimerHandle {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                tracing::warn!("scheduled job panicked");
            }
        });
        TimerHandle::new(move || task.abort())
    }
}
