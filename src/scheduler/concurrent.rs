//! Thread-pool scheduler for `Affinity::Concurrent`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::runtime::{Builder, Handle, Runtime};

use super::{Job, Scheduler};
use crate::core::Affinity;
use crate::error::{Error, Result};
use crate::rlog_debug;

/// Runs jobs on the blocking pool of a private tokio runtime.
///
/// Task bodies are synchronous closures, so they go through `spawn_blocking`
/// rather than the async workers. Independent jobs run in any order.
pub struct ConcurrentScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    closed: AtomicBool,
}

impl ConcurrentScheduler {
    /// Create a pool that runs at most `threads` jobs at the same time.
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads.max(1))
            .thread_name("ravel-concurrent")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        rlog_debug!("ConcurrentScheduler::new threads={}", threads);
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            closed: AtomicBool::new(false),
        })
    }

    /// Handle of the backing runtime, for async helpers that need one.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Scheduler for ConcurrentScheduler {
    fn affinity(&self) -> Affinity {
        Affinity::Concurrent
    }

    fn schedule(&self, job: Job) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::SchedulerShutdown {
                affinity: Affinity::Concurrent,
            });
        }
        drop(self.handle.spawn_blocking(job));
        Ok(())
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        rlog_debug!("ConcurrentScheduler::shutdown");
        let runtime = match self.runtime.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        // Running blocking jobs finish on their own threads; safe to call from
        // inside another runtime, unlike dropping the runtime.
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }

    fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for ConcurrentScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
