//! Cooperative single-thread pump backing the UI affinity.
//!
//! The pump owns two queues:
//! - a priority queue fed by blocking [`SyncContextPump::send`] calls
//! - a FIFO queue fed by non-blocking [`SyncContextPump::post`] calls
//!
//! Each tick drains the whole priority queue, then runs posted work up to a
//! per-tick budget, re-checking the priority queue between posted items. Ticks
//! are paced so the pump can sit next to a host's own frame loop, either on a
//! dedicated thread ([`SyncContextPump::spawn`]) or driven by the host calling
//! [`SyncContextPump::run_once`] once per frame.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

use super::Job;
use crate::error::{Error, Result, TaskError};
use crate::{rlog_debug, rlog_error, rlog_trace, rlog_warn};

/// Posted items run per tick before yielding back to the host.
const MAX_POSTED_PER_TICK: usize = 256;

struct SendRequest {
    id: u64,
    job: Job,
}

pub struct SyncContextPump {
    posted_tx: Sender<Job>,
    posted_rx: Receiver<Job>,
    priority_tx: Sender<SendRequest>,
    priority_rx: Receiver<SendRequest>,
    next_request: AtomicU64,
    completed: Mutex<HashSet<u64>>,
    completed_cv: Condvar,
    thread: OnceLock<ThreadId>,
    /// Write-locked to stop; read-locked around every enqueue so nothing lands
    /// in a queue after the final drain.
    stopped: RwLock<bool>,
    drained: AtomicBool,
    tick: Duration,
    send_timeout: Duration,
}

impl SyncContextPump {
    pub fn new(tick: Duration, send_timeout: Duration) -> Self {
        let (posted_tx, posted_rx) = crossbeam_channel::unbounded();
        let (priority_tx, priority_rx) = crossbeam_channel::unbounded();
        Self {
            posted_tx,
            posted_rx,
            priority_tx,
            priority_rx,
            next_request: AtomicU64::new(0),
            completed: Mutex::new(HashSet::new()),
            completed_cv: Condvar::new(),
            thread: OnceLock::new(),
            stopped: RwLock::new(false),
            drained: AtomicBool::new(false),
            tick,
            send_timeout,
        }
    }

    /// Start a pump on a dedicated `ravel-ui` thread, ticking until `token` is
    /// cancelled or the pump is stopped.
    pub fn spawn(
        tick: Duration,
        send_timeout: Duration,
        token: CancellationToken,
    ) -> Result<(Arc<Self>, JoinHandle<()>)> {
        let pump = Arc::new(Self::new(tick, send_timeout));
        let runner = pump.clone();
        let handle = thread::Builder::new()
            .name("ravel-ui".to_string())
            .spawn(move || {
                if let Err(e) = runner.run(&token) {
                    rlog_error!("SyncContextPump: loop failed: {}", e);
                }
            })?;
        let _ = pump.thread.set(handle.thread().id());
        rlog_debug!("SyncContextPump::spawn thread={:?}", handle.thread().id());
        Ok((pump, handle))
    }

    /// Pin the pump to the calling thread. Fails if another thread owns it.
    pub fn attach_current_thread(&self) -> Result<()> {
        let current = thread::current().id();
        let owner = *self.thread.get_or_init(|| current);
        if owner == current {
            Ok(())
        } else {
            Err(Error::SchedulerFault(format!(
                "UI pump is owned by {:?}, cannot attach {:?}",
                owner, current
            )))
        }
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.get().copied()
    }

    pub fn is_pump_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.read().map(|s| *s).unwrap_or(true)
    }

    /// Number of items waiting in both queues.
    pub fn pending(&self) -> usize {
        self.posted_rx.len() + self.priority_rx.len()
    }

    /// Queue `job` for a later tick. Never blocks and never runs inline.
    pub fn post(&self, job: Job) -> Result<()> {
        let stopped = self.stopped.read().map_err(|_| Error::PumpStopped)?;
        if *stopped {
            return Err(Error::PumpStopped);
        }
        self.posted_tx.send(job).map_err(|_| Error::PumpStopped)
    }

    /// Run `job` on the pump thread and block until it has run.
    ///
    /// Called from the pump thread itself, the job runs inline. Never call this
    /// while holding something the pump thread may need.
    pub fn send(&self, job: Job) -> Result<()> {
        if self.is_pump_thread() {
            execute(job);
            return Ok(());
        }

        let id = self.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let stopped = self.stopped.read().map_err(|_| Error::PumpStopped)?;
            if *stopped {
                return Err(Error::PumpStopped);
            }
            self.priority_tx
                .send(SendRequest { id, job })
                .map_err(|_| Error::PumpStopped)?;
        }
        rlog_trace!("SyncContextPump::send request={} queued", id);
        self.wait_for(id)
    }

    /// Like [`send`](Self::send), handing back what `f` returned.
    pub fn send_with_result<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        if self.is_pump_thread() {
            return Ok(f());
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(Box::new(move || {
            let _ = tx.send(f());
        }))?;
        rx.try_recv()
            .map_err(|_| Error::Task(TaskError::Panicked("UI send body panicked".to_string())))
    }

    fn wait_for(&self, id: u64) -> Result<()> {
        let deadline = Instant::now() + self.send_timeout;
        let mut completed = self
            .completed
            .lock()
            .map_err(|_| Error::SchedulerFault("UI pump lock poisoned".to_string()))?;
        loop {
            if completed.remove(&id) {
                return Ok(());
            }
            if self.drained.load(Ordering::Acquire) {
                return Err(Error::PumpStopped);
            }
            let now = Instant::now();
            if now >= deadline {
                rlog_warn!("SyncContextPump::send request={} timed out", id);
                return Err(Error::Timeout(self.send_timeout));
            }
            completed = self
                .completed_cv
                .wait_timeout(completed, deadline - now)
                .map_err(|_| Error::SchedulerFault("UI pump lock poisoned".to_string()))?
                .0;
        }
    }

    fn mark_completed(&self, id: u64) {
        if let Ok(mut completed) = self.completed.lock() {
            completed.insert(id);
        }
        self.completed_cv.notify_all();
    }

    fn drain_priority(&self) -> usize {
        let mut ran = 0;
        while let Ok(request) = self.priority_rx.try_recv() {
            execute(request.job);
            self.mark_completed(request.id);
            ran += 1;
        }
        ran
    }

    /// One tick: all pending sends, then up to a budget of posted items.
    ///
    /// Must be called on the pump thread; the first caller becomes the owner.
    /// Returns how many items ran.
    pub fn run_once(&self) -> Result<usize> {
        self.attach_current_thread()?;
        if self.is_stopped() {
            return Ok(self.finish());
        }
        let mut ran = self.drain_priority();
        for _ in 0..MAX_POSTED_PER_TICK {
            let Ok(job) = self.posted_rx.try_recv() else { break };
            execute(job);
            ran += 1;
            ran += self.drain_priority();
        }
        if ran > 0 {
            rlog_trace!("SyncContextPump: tick ran {} items", ran);
        }
        Ok(ran)
    }

    /// Tick at most once per `tick` until `token` is cancelled or the pump is
    /// stopped, then drain what is left.
    pub fn run(&self, token: &CancellationToken) -> Result<()> {
        self.attach_current_thread()?;
        rlog_debug!("SyncContextPump::run tick={:?}", self.tick);
        while !token.is_cancelled() && !self.is_stopped() {
            let started = Instant::now();
            self.run_once()?;
            let elapsed = started.elapsed();
            if elapsed < self.tick {
                thread::sleep(self.tick - elapsed);
            }
        }
        let ran = self.finish();
        rlog_debug!("SyncContextPump: loop exited, drained {} items", ran);
        Ok(())
    }

    /// Stop accepting work. The loop drains what was queued before exiting.
    pub fn stop(&self) {
        if let Ok(mut stopped) = self.stopped.write() {
            *stopped = true;
        }
        self.completed_cv.notify_all();
    }

    fn finish(&self) -> usize {
        self.stop();
        if self.drained.load(Ordering::Acquire) {
            return 0;
        }
        let mut ran = self.drain_priority();
        while let Ok(job) = self.posted_rx.try_recv() {
            execute(job);
            ran += 1;
            ran += self.drain_priority();
        }
        self.drained.store(true, Ordering::Release);
        self.completed_cv.notify_all();
        ran
    }
}

fn execute(job: Job) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        rlog_error!(
            "SyncContextPump: work item panicked: {}",
            TaskError::from_panic(payload)
        );
    }
}
