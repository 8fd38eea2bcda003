//! Scheduler for `Affinity::Ui`, posting onto the cooperative pump.

use std::sync::Arc;
use std::thread::ThreadId;

use super::{run_contained, Job, Scheduler, SyncContextPump};
use crate::core::Affinity;
use crate::error::{Error, Result};

pub struct UiScheduler {
    pump: Arc<SyncContextPump>,
}

impl UiScheduler {
    pub fn new(pump: Arc<SyncContextPump>) -> Self {
        Self { pump }
    }

    pub fn pump(&self) -> &Arc<SyncContextPump> {
        &self.pump
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.pump.thread_id()
    }
}

impl Scheduler for UiScheduler {
    fn affinity(&self) -> Affinity {
        Affinity::Ui
    }

    /// Hand-offs always go through `post`: a continuation scheduled from the
    /// pump thread itself must not block on `send`.
    fn schedule(&self, job: Job) -> Result<()> {
        self.pump.post(job).map_err(|_| Error::SchedulerShutdown {
            affinity: Affinity::Ui,
        })
    }

    fn schedule_batch(&self, jobs: Vec<Job>) -> Result<()> {
        self.schedule(Box::new(move || {
            for job in jobs {
                run_contained(job, "UiScheduler");
            }
        }))
    }

    fn shutdown(&self) {
        self.pump.stop();
    }

    fn is_shut_down(&self) -> bool {
        self.pump.is_stopped()
    }
}
