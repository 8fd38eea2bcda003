//! The three schedulers a task can be bound to.
//!
//! Every scheduler accepts opaque [`Job`]s. Ordering guarantees differ:
//! - [`ConcurrentScheduler`]: none between independent jobs
//! - [`ExclusiveScheduler`]: global FIFO on one worker thread
//! - [`UiScheduler`]: FIFO per queue on the cooperative [`SyncContextPump`]
//!
//! Chain order across schedulers is the continuation protocol's job, not the
//! scheduler's: a continuation is only submitted once its predecessors ended.

pub mod concurrent;
pub mod exclusive;
pub mod pump;
pub mod ui;

pub use concurrent::ConcurrentScheduler;
pub use exclusive::ExclusiveScheduler;
pub use pump::SyncContextPump;
pub use ui::UiScheduler;

use crate::core::Affinity;
use crate::error::Result;

/// A unit of work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run jobs for one affinity.
pub trait Scheduler: Send + Sync {
    fn affinity(&self) -> Affinity;

    /// Queue a job. Never runs the job inline and never blocks.
    fn schedule(&self, job: Job) -> Result<()>;

    /// Stop accepting work. Jobs already queued still run.
    fn shutdown(&self);

    fn is_shut_down(&self) -> bool;

    /// Queue several jobs back to back. Ordered schedulers keep them
    /// contiguous so no other job runs in between.
    fn schedule_batch(&self, jobs: Vec<Job>) -> Result<()> {
        for job in jobs {
            self.schedule(job)?;
        }
        Ok(())
    }
}

/// Run a job, logging instead of unwinding if it panics.
pub(crate) fn run_contained(job: Job, owner: &str) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        let err = crate::error::TaskError::from_panic(payload);
        crate::rlog_error!("{}: job panicked: {}", owner, err);
    }
}

/// The scheduler set owned by a task manager, one per affinity.
pub struct Schedulers {
    pub concurrent: ConcurrentScheduler,
    pub exclusive: ExclusiveScheduler,
    pub ui: UiScheduler,
}

impl Schedulers {
    pub fn for_affinity(&self, affinity: Affinity) -> &dyn Scheduler {
        match affinity {
            Affinity::Concurrent => &self.concurrent,
            Affinity::Exclusive => &self.exclusive,
            Affinity::Ui => &self.ui,
        }
    }

    pub fn schedule(&self, affinity: Affinity, job: Job) -> Result<()> {
        self.for_affinity(affinity).schedule(job)
    }

    pub fn schedule_batch(&self, affinity: Affinity, jobs: Vec<Job>) -> Result<()> {
        self.for_affinity(affinity).schedule_batch(jobs)
    }

    pub fn shutdown(&self) {
        self.ui.shutdown();
        self.exclusive.shutdown();
        self.concurrent.shutdown();
    }
}
