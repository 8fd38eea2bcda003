//! Single-thread FIFO scheduler for `Affinity::Exclusive`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use tokio_util::sync::CancellationToken;

use super::{run_contained, Job, Scheduler};
use crate::core::Affinity;
use crate::error::{Error, Result};
use crate::{rlog_debug, rlog_trace};

const IDLE_POLL: Duration = Duration::from_millis(50);

/// One dedicated worker thread draining a FIFO queue.
///
/// Every exclusive job runs in submission order, whichever chain it belongs to.
pub struct ExclusiveScheduler {
    tx: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    closed: AtomicBool,
}

impl ExclusiveScheduler {
    pub fn new(token: CancellationToken) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let worker = thread::Builder::new()
            .name("ravel-exclusive".to_string())
            .spawn(move || {
                let mut announced = false;
                loop {
                    match rx.recv_timeout(IDLE_POLL) {
                        Ok(job) => {
                            rlog_trace!("ExclusiveScheduler: running job, {} queued", rx.len());
                            run_job(job);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            // Keep draining after cancellation so finally handlers
                            // still get their turn; exit once the queue is closed.
                            if token.is_cancelled() && !announced {
                                rlog_debug!("ExclusiveScheduler: cancellation observed");
                                announced = true;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                rlog_debug!("ExclusiveScheduler: worker exiting");
            })?;
        let thread_id = worker.thread().id();
        rlog_debug!("ExclusiveScheduler::new thread={:?}", thread_id);
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            thread_id,
            closed: AtomicBool::new(false),
        })
    }

    /// Id of the worker thread every exclusive job runs on.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    fn sender(&self) -> Option<Sender<Job>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn run_job(job: Job) {
    // A panicking job must not take the only worker thread down with it.
    run_contained(job, "ExclusiveScheduler");
}

impl Scheduler for ExclusiveScheduler {
    fn affinity(&self) -> Affinity {
        Affinity::Exclusive
    }

    fn schedule(&self, job: Job) -> Result<()> {
        let shut_down = || Error::SchedulerShutdown {
            affinity: Affinity::Exclusive,
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(shut_down());
        }
        let tx = self.sender().ok_or_else(shut_down)?;
        tx.send(job).map_err(|_| shut_down())
    }

    fn schedule_batch(&self, jobs: Vec<Job>) -> Result<()> {
        self.schedule(Box::new(move || {
            for job in jobs {
                run_job(job);
            }
        }))
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        rlog_debug!("ExclusiveScheduler::shutdown");
        match self.tx.lock() {
            Ok(mut guard) => drop(guard.take()),
            Err(poisoned) => drop(poisoned.into_inner().take()),
        }
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Joining from the worker itself would deadlock; it exits on its own
        // once the queue drains.
        if let Some(worker) = worker {
            if thread::current().id() != self.thread_id {
                let _ = worker.join();
            }
        }
    }

    fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ExclusiveScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
