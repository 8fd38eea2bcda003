//! Task manager: owns the schedulers and hands out tasks bound to them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{JoinHandle, ThreadId};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationSource;
use crate::config::RuntimeConfig;
use crate::core::{Affinity, Task, TaskContext, TaskId, TaskRef, TaskState, TaskValue};
use crate::error::{Error, Result, TaskError};
use crate::process::{self, ProcessEnvironment, ProcessOutput, ProcessSpec};
use crate::scheduler::{
    ConcurrentScheduler, ExclusiveScheduler, Schedulers, SyncContextPump, UiScheduler,
};
use crate::{rlog_debug, rlog_error};

/// Called when a fault reaches the end of a chain nobody watches.
pub type UnobservedFaultHandler = Arc<dyn Fn(TaskId, &TaskError) + Send + Sync>;

/// State shared by the manager and every node it created.
pub(crate) struct RuntimeCore {
    schedulers: Schedulers,
    cancel: CancellationSource,
    unobserved: RwLock<Option<UnobservedFaultHandler>>,
}

impl RuntimeCore {
    pub fn schedulers(&self) -> &Schedulers {
        &self.schedulers
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.token()
    }

    pub fn ui_pump(&self) -> &Arc<SyncContextPump> {
        self.schedulers.ui.pump()
    }

    pub fn report_unobserved(&self, id: TaskId, err: &TaskError) {
        let handler = self
            .unobserved
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().cloned());
        match handler {
            Some(handler) => handler(id, err),
            None => rlog_error!("Unobserved fault in task {}: {}", id.short(), err),
        }
    }
}

/// Entry point for building and running task chains.
///
/// A manager owns one scheduler per [`Affinity`], a cancellation source and
/// the UI pump. Dropping it cancels outstanding work and stops every
/// scheduler.
///
/// # Example
///
/// ```ignore
/// use ravel::{Affinity, RuntimeConfig, TaskManager};
///
/// let tm = TaskManager::new(RuntimeConfig::default())?;
/// let status = tm
///     .task(|_| Ok(2))
///     .then_on(Affinity::Exclusive, |_, n| Ok(n * 21))
///     .then_in_ui(|_, n| Ok(format!("answer: {}", n)));
/// assert_eq!(status.wait()?, "answer: 42");
/// ```
pub struct TaskManager {
    core: Arc<RuntimeCore>,
    ui_thread: Mutex<Option<JoinHandle<()>>>,
    /// Ends the pump loop. Not linked to the cancellation source: a cancelled
    /// chain still needs the pump for its UI finally handlers.
    ui_loop: CancellationToken,
    process_env: ProcessEnvironment,
    stopped: AtomicBool,
}

impl TaskManager {
    /// Create a manager whose UI pump runs on its own `ravel-ui` thread.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let ui_loop = CancellationToken::new();
        let (pump, handle) =
            SyncContextPump::spawn(config.ui_tick, config.send_timeout, ui_loop.clone())?;
        Self::assemble(config, CancellationSource::new(), pump, Some(handle), ui_loop)
    }

    /// Create a manager around a pump the host drives itself, one
    /// [`SyncContextPump::run_once`] per frame.
    pub fn with_ui_pump(config: RuntimeConfig, pump: Arc<SyncContextPump>) -> Result<Self> {
        Self::assemble(config, CancellationSource::new(), pump, None, CancellationToken::new())
    }

    fn assemble(
        config: RuntimeConfig,
        cancel: CancellationSource,
        pump: Arc<SyncContextPump>,
        ui_thread: Option<JoinHandle<()>>,
        ui_loop: CancellationToken,
    ) -> Result<Self> {
        let schedulers = Schedulers {
            concurrent: ConcurrentScheduler::new(config.concurrent_threads)?,
            exclusive: ExclusiveScheduler::new(cancel.token())?,
            ui: UiScheduler::new(pump),
        };
        rlog_debug!(
            "TaskManager: concurrent={} ui_tick={:?} send_timeout={:?}",
            config.concurrent_threads,
            config.ui_tick,
            config.send_timeout
        );
        Ok(Self {
            core: Arc::new(RuntimeCore {
                schedulers,
                cancel,
                unobserved: RwLock::new(None),
            }),
            ui_thread: Mutex::new(ui_thread),
            ui_loop,
            process_env: ProcessEnvironment::default(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Environment used by [`TaskManager::process`].
    pub fn with_process_environment(mut self, env: ProcessEnvironment) -> Self {
        self.process_env = env;
        self
    }

    pub fn process_environment(&self) -> &ProcessEnvironment {
        &self.process_env
    }

    pub fn token(&self) -> CancellationToken {
        self.core.token()
    }

    pub fn cancellation(&self) -> &CancellationSource {
        &self.core.cancel
    }

    /// Request cancellation without stopping the schedulers, so finally
    /// handlers still get to run.
    pub fn cancel(&self) {
        self.core.cancel.cancel();
    }

    pub fn ui_pump(&self) -> &Arc<SyncContextPump> {
        self.core.ui_pump()
    }

    /// Thread UI-affine tasks run on, once the pump has an owner.
    pub fn ui_thread_id(&self) -> Option<ThreadId> {
        self.core.ui_pump().thread_id()
    }

    pub fn exclusive_thread_id(&self) -> ThreadId {
        self.core.schedulers.exclusive.thread_id()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// A task on the concurrent scheduler.
    pub fn task<T, F>(&self, f: F) -> Task<T>
    where
        T: TaskValue,
        F: FnOnce(&TaskContext) -> std::result::Result<T, TaskError> + Send + 'static,
    {
        self.task_on(Affinity::Concurrent, f)
    }

    pub fn task_on<T, F>(&self, affinity: Affinity, f: F) -> Task<T>
    where
        T: TaskValue,
        F: FnOnce(&TaskContext) -> std::result::Result<T, TaskError> + Send + 'static,
    {
        Task::root(self.core.clone(), affinity, f)
    }

    /// A task run for its side effects only.
    pub fn action<F>(&self, affinity: Affinity, f: F) -> Task<()>
    where
        F: FnOnce(&TaskContext) -> std::result::Result<(), TaskError> + Send + 'static,
    {
        self.task_on(affinity, f)
    }

    /// A task running an external program on the concurrent scheduler.
    ///
    /// Exits with a nonzero code fault with [`TaskError::ProcessFailed`];
    /// cancellation kills the child.
    pub fn process(&self, spec: ProcessSpec) -> Task<ProcessOutput> {
        let env = self.process_env.clone();
        let name = spec.display_name();
        self.task(move |cx| process::run(&env, spec, cx)).named(name)
    }

    fn owns(&self, task: &TaskRef) -> bool {
        Arc::ptr_eq(task.runtime(), &self.core)
    }

    /// Start the chain `task` belongs to.
    pub fn schedule<T>(&self, task: &Task<T>) -> Result<()> {
        self.schedule_ref(&TaskRef::from(task))
    }

    fn schedule_ref(&self, task: &TaskRef) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SchedulerShutdown {
                affinity: task.affinity(),
            });
        }
        if !self.owns(task) {
            return Err(Error::Validation(format!(
                "task {} belongs to another manager",
                task.id().short()
            )));
        }
        task.start();
        Ok(())
    }

    /// Start several chains. Returns how many were started.
    pub fn schedule_all<I>(&self, tasks: I) -> Result<usize>
    where
        I: IntoIterator<Item = TaskRef>,
    {
        let mut started = 0;
        for task in tasks {
            self.schedule_ref(&task)?;
            started += 1;
        }
        Ok(started)
    }

    /// Start every task and resolve once all of them ended, with their final
    /// states in input order.
    pub async fn when_all<I>(&self, tasks: I) -> Vec<TaskState>
    where
        I: IntoIterator<Item = TaskRef>,
    {
        let pending: Vec<_> = tasks
            .into_iter()
            .map(|task| {
                let done = task.completion();
                task.start();
                done
            })
            .collect();
        join_all(pending).await
    }

    /// Run `f` on the UI pump thread and wait for its result.
    pub fn send_to_ui<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        self.core.ui_pump().send_with_result(f)
    }

    /// Queue `f` for the UI pump without waiting.
    pub fn post_to_ui<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.core.ui_pump().post(Box::new(f))
    }

    /// Replace the default handler, which logs at ERROR.
    pub fn set_unobserved_fault_handler<F>(&self, handler: F)
    where
        F: Fn(TaskId, &TaskError) + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.core.unobserved.write() {
            *slot = Some(Arc::new(handler));
        }
    }

    pub fn clear_unobserved_fault_handler(&self) {
        if let Ok(mut slot) = self.core.unobserved.write() {
            *slot = None;
        }
    }

    /// Cancel outstanding work and shut every scheduler down.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        rlog_debug!("TaskManager::stop");
        self.core.cancel.cancel();
        self.core.schedulers.shutdown();
        self.ui_loop.cancel();

        let handle = match self.ui_thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.stop();
    }
}
