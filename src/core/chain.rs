//! Typed task handles and the combinators that build chains.
//!
//! A [`Task<T>`] is a thin typed view over a shared node. Cloning a handle
//! never clones the work; every clone observes the same node.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::core::dag::ChainGraph;
use crate::core::node::{Body, CatchBody, Node, Outcome, RecoverBody, Value};
use crate::core::task::{Affinity, RunCondition, TaskContext, TaskId, TaskState};
use crate::error::{Error, Result, TaskError};
use crate::manager::RuntimeCore;
use crate::{rlog_error, rlog_trace, rlog_warn};

/// Anything a task can produce.
pub trait TaskValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TaskValue for T {}

fn erase<T: TaskValue>(value: T) -> Value {
    Arc::new(value)
}

fn downcast<T: TaskValue>(value: &Value) -> std::result::Result<T, TaskError> {
    value.downcast_ref::<T>().cloned().ok_or_else(|| {
        TaskError::Scheduler(format!(
            "predecessor did not produce a {}",
            std::any::type_name::<T>()
        ))
    })
}

fn outcome_result<T: TaskValue>(outcome: &Outcome) -> std::result::Result<T, TaskError> {
    match outcome {
        Outcome::Succeeded(value) => downcast(value),
        Outcome::Faulted(fault) => Err(fault.error.clone()),
        Outcome::Cancelled => Err(TaskError::Cancelled),
    }
}

/// Untyped handle to a task node.
#[derive(Clone)]
pub struct TaskRef {
    pub(crate) node: Arc<Node>,
}

impl TaskRef {
    pub(crate) fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn id(&self) -> TaskId {
        self.node.id()
    }

    pub fn name(&self) -> String {
        self.node.name()
    }

    pub fn state(&self) -> TaskState {
        self.node.state()
    }

    pub fn affinity(&self) -> Affinity {
        self.node.affinity()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// True if this node joins more than one chain.
    pub fn is_merged(&self) -> bool {
        self.node.is_merged()
    }

    /// The error a faulted or cancelled node ended with.
    pub fn error(&self) -> Option<TaskError> {
        self.node.outcome().and_then(|o| o.error())
    }

    /// The primary predecessor.
    pub fn depends_on(&self) -> Option<TaskRef> {
        self.node.primary_dependency().map(TaskRef::new)
    }

    /// Every predecessor with the condition it was attached under, primary
    /// first, merge dependencies after.
    pub fn dependencies(&self) -> Vec<(TaskRef, RunCondition)> {
        self.node
            .dependencies()
            .into_iter()
            .map(|d| (TaskRef::new(d.node), d.condition))
            .collect()
    }

    /// Continuations still waiting on this node. Empty once it finished.
    pub fn pending_continuations(&self) -> usize {
        self.node.continuation_count()
    }

    /// This node followed by its primary predecessors, nearest first.
    pub fn primary_chain(&self) -> Vec<TaskRef> {
        let mut chain = vec![self.clone()];
        while let Some(prev) = chain.last().and_then(|t| t.depends_on()) {
            chain.push(prev);
        }
        chain
    }

    /// Snapshot of every node reachable backwards from this one.
    pub fn topology(&self) -> ChainGraph {
        ChainGraph::from_tail(self)
    }

    /// Submit the top-most created node(s) of the chain.
    pub fn start(&self) {
        self.node.start();
    }

    pub fn on_start<F>(&self, f: F) -> &Self
    where
        F: FnOnce(TaskId) + Send + 'static,
    {
        self.node.on_start(Box::new(f));
        self
    }

    /// Observe the terminal state. Fires right away on a finished node.
    pub fn on_end<F>(&self, f: F) -> &Self
    where
        F: FnOnce(TaskState, Option<&TaskError>) + Send + 'static,
    {
        self.node.on_end(Box::new(move |outcome: &Outcome| {
            let error = outcome.error();
            f(outcome.state(), error.as_ref())
        }));
        self
    }

    /// Future resolving with the terminal state, whatever it is.
    pub(crate) fn completion(&self) -> impl Future<Output = TaskState> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.node.set_awaited();
        self.node.on_end(Box::new(move |outcome: &Outcome| {
            let _ = tx.send(outcome.state());
        }));
        async move { rx.await.unwrap_or(TaskState::Cancelled) }
    }

    pub(crate) fn runtime(&self) -> &Arc<RuntimeCore> {
        self.node.runtime()
    }
}

impl PartialEq for TaskRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }
}

impl Eq for TaskRef {}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id().short())
            .field("name", &self.name())
            .field("state", &self.state())
            .field("affinity", &self.affinity())
            .finish()
    }
}

/// Typed handle to a task producing a `T`.
pub struct Task<T> {
    inner: TaskRef,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Deref for Task<T> {
    type Target = TaskRef;

    fn deref(&self) -> &TaskRef {
        &self.inner
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<T> From<&Task<T>> for TaskRef {
    fn from(task: &Task<T>) -> Self {
        task.inner.clone()
    }
}

impl<T> From<Task<T>> for TaskRef {
    fn from(task: Task<T>) -> Self {
        task.inner
    }
}

impl<T: TaskValue> Task<T> {
    fn from_node(node: Arc<Node>) -> Self {
        Self {
            inner: TaskRef::new(node),
            _marker: PhantomData,
        }
    }

    pub(crate) fn root<F>(runtime: Arc<RuntimeCore>, affinity: Affinity, f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> std::result::Result<T, TaskError> + Send + 'static,
    {
        let body = Body::Root(Box::new(move |cx: &TaskContext| f(cx).map(erase)));
        Self::from_node(Node::new(runtime, affinity, body))
    }

    fn follow<U: TaskValue>(&self, affinity: Affinity, body: Body, condition: RunCondition) -> Task<U> {
        let node = Node::new(self.runtime().clone(), affinity, body);
        // A fresh node is still created and has no edges, so this only fails
        // on a broken attach.
        let attached = Node::attach(&self.inner.node, &node, condition);
        if let Err(e) = &attached {
            rlog_error!("Task::follow: {}", e);
        }
        debug_assert!(attached.is_ok(), "new continuation refused: {:?}", attached);
        Task::from_node(node)
    }

    /// Give the node a name for logs and topology dumps.
    pub fn named(self, name: impl Into<String>) -> Self {
        self.inner.node.set_name(name.into());
        self
    }

    /// Move a not yet queued node to another scheduler.
    pub fn with_affinity(self, affinity: Affinity) -> Self {
        if !self.inner.node.set_affinity(affinity) {
            rlog_warn!(
                "Task {} already {}; affinity left at {}",
                self.id().short(),
                self.state(),
                self.affinity()
            );
        }
        self
    }

    pub fn untyped(&self) -> TaskRef {
        self.inner.clone()
    }

    /// Continue with `f` on the concurrent scheduler once this task succeeded.
    pub fn then<U, F>(&self, f: F) -> Task<U>
    where
        U: TaskValue,
        F: FnOnce(&TaskContext, T) -> std::result::Result<U, TaskError> + Send + 'static,
    {
        self.then_on(Affinity::Concurrent, f)
    }

    pub fn then_on<U, F>(&self, affinity: Affinity, f: F) -> Task<U>
    where
        U: TaskValue,
        F: FnOnce(&TaskContext, T) -> std::result::Result<U, TaskError> + Send + 'static,
    {
        let body = Body::Map(Box::new(move |cx: &TaskContext, value: Value| {
            let input = downcast::<T>(&value)?;
            f(cx, input).map(erase)
        }));
        self.follow(affinity, body, RunCondition::OnSuccess)
    }

    pub fn then_in_ui<U, F>(&self, f: F) -> Task<U>
    where
        U: TaskValue,
        F: FnOnce(&TaskContext, T) -> std::result::Result<U, TaskError> + Send + 'static,
    {
        self.then_on(Affinity::Ui, f)
    }

    /// Make an existing task run after this one.
    ///
    /// A `next` without predecessors is simply appended. A `next` that already
    /// has one becomes a join: it runs once both chains delivered and is
    /// reported as merged. Use [`Task::with_affinity`] on `next` beforehand to
    /// retarget it.
    pub fn then_task<U: TaskValue>(&self, next: &Task<U>, condition: RunCondition) -> Result<Task<U>> {
        Node::attach(&self.inner.node, &next.inner.node, condition)?;
        rlog_trace!(
            "Task {} -> {} ({}), merged={}",
            self.id().short(),
            next.id().short(),
            condition,
            next.is_merged()
        );
        Ok(next.clone())
    }

    /// Observe a fault reaching this point. The outcome passes through unchanged.
    pub fn catch<F>(&self, f: F) -> Task<T>
    where
        F: FnOnce(&TaskError) + Send + 'static,
    {
        let handler: CatchBody = Box::new(move |err: &TaskError| {
            f(err);
            false
        });
        let affinity = self.affinity();
        self.follow(
            affinity,
            Body::Catch {
                handler,
                recover: None,
            },
            RunCondition::Always,
        )
    }

    /// Like [`Task::catch`], but returning `true` recovers from the fault.
    ///
    /// The chain then continues on its success path with `None`: `OnSuccess`
    /// continuations run, later catches and `OnFailure` continuations do not,
    /// and a downstream finally sees a success. Without a fault the value
    /// passes through as `Some`. Returning `false` forwards the fault.
    pub fn catch_and_absorb<F>(&self, f: F) -> Task<Option<T>>
    where
        F: FnOnce(&TaskError) -> bool + Send + 'static,
    {
        let recover: RecoverBody = Box::new(|value: Option<Value>| {
            let value = value.map(|v| downcast::<T>(&v)).transpose()?;
            Ok(erase(value))
        });
        let affinity = self.affinity();
        self.follow(
            affinity,
            Body::Catch {
                handler: Box::new(f),
                recover: Some(recover),
            },
            RunCondition::Always,
        )
    }

    /// Run `f` once this task ended, however it ended.
    pub fn finally<F>(&self, affinity: Affinity, f: F) -> Task<()>
    where
        F: FnOnce(bool, Option<TaskError>) + Send + 'static,
    {
        self.finally_with_result(affinity, move |success, error, _: Option<T>| f(success, error))
    }

    pub fn finally_with_result<U, F>(&self, affinity: Affinity, f: F) -> Task<U>
    where
        U: TaskValue,
        F: FnOnce(bool, Option<TaskError>, Option<T>) -> U + Send + 'static,
    {
        let body = Body::Finally(Box::new(
            move |_cx: &TaskContext, success: bool, error: Option<TaskError>, value: Option<Value>| {
                let value = value.and_then(|v| downcast::<T>(&v).ok());
                Ok(erase(f(success, error, value)))
            },
        ));
        self.follow(affinity, body, RunCondition::Always)
    }

    /// Start the chain this task belongs to.
    pub fn start(&self) -> Task<T> {
        self.inner.start();
        self.clone()
    }

    /// Start the chain and await this task's outcome.
    pub fn start_as_async(&self) -> TaskFuture<T> {
        let (tx, rx) = oneshot::channel();
        self.inner.node.set_awaited();
        self.inner.node.on_end(Box::new(move |outcome: &Outcome| {
            let _ = tx.send(outcome.clone());
        }));
        self.inner.start();
        TaskFuture {
            rx,
            _marker: PhantomData,
        }
    }

    /// Start and await, turning any error into `None`.
    pub async fn start_and_swallow_exception(&self) -> Option<T> {
        match self.start_as_async().await {
            Ok(value) => Some(value),
            Err(e) => {
                rlog_trace!("Task {} swallowed: {}", self.id().short(), e);
                None
            }
        }
    }

    /// Start and block the calling thread until this task ended.
    ///
    /// On the UI pump thread the pump keeps ticking while waiting, so UI-bound
    /// work in the chain still makes progress.
    pub fn wait(&self) -> std::result::Result<T, TaskError> {
        self.wait_inner(None).map_err(TaskError::from)
    }

    /// [`Task::wait`] with an upper bound; elapsing yields `Error::Timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> Result<T> {
        let (tx, rx) = crossbeam_channel::bounded::<Outcome>(1);
        self.inner.node.set_awaited();
        self.inner.node.on_end(Box::new(move |outcome: &Outcome| {
            let _ = tx.send(outcome.clone());
        }));
        self.inner.start();

        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        let pump = self.runtime().ui_pump().clone();
        let outcome = if pump.is_pump_thread() {
            loop {
                match rx.try_recv() {
                    Ok(outcome) => break outcome,
                    Err(crossbeam_channel::TryRecvError::Disconnected) => {
                        return Err(Error::Task(TaskError::Scheduler(
                            "task dropped before completion".to_string(),
                        )))
                    }
                    Err(crossbeam_channel::TryRecvError::Empty) => {}
                }
                if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
                    return Err(Error::Timeout(timeout.unwrap_or_default()));
                }
                if pump.run_once()? == 0 {
                    std::thread::sleep(pump.tick());
                }
            }
        } else {
            match timeout {
                Some(t) => rx.recv_timeout(t).map_err(|e| match e {
                    crossbeam_channel::RecvTimeoutError::Timeout => Error::Timeout(t),
                    crossbeam_channel::RecvTimeoutError::Disconnected => Error::Task(
                        TaskError::Scheduler("task dropped before completion".to_string()),
                    ),
                })?,
                None => rx.recv().map_err(|_| {
                    Error::Task(TaskError::Scheduler(
                        "task dropped before completion".to_string(),
                    ))
                })?,
            }
        };
        Ok(outcome_result(&outcome)?)
    }

    /// The value of a succeeded task.
    pub fn result(&self) -> Option<T> {
        match self.inner.node.outcome() {
            Some(Outcome::Succeeded(value)) => downcast(&value).ok(),
            _ => None,
        }
    }
}

/// Future returned by [`Task::start_as_async`].
pub struct TaskFuture<T> {
    rx: oneshot::Receiver<Outcome>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskValue> Future for TaskFuture<T> {
    type Output = std::result::Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome_result(&outcome)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Scheduler(
                "task dropped before completion".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}
