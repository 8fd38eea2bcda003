//! Type-erased task node and the settle/deliver protocol.
//!
//! A node holds strong references both ways: to its dependencies (so a chain
//! can be started from its tail) and to its continuations (so a successor
//! nobody else holds still runs). The forward edges are taken when the node
//! completes, which breaks the cycle once a chain has run.
//!
//! Node locks are never held while user code or another node's lock runs.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::task::{Affinity, RunCondition, TaskContext, TaskId, TaskState};
use crate::error::{Error, Result, TaskError};
use crate::manager::RuntimeCore;
use crate::{rlog_debug, rlog_error, rlog_trace, rlog_warn};

pub(crate) type Value = Arc<dyn Any + Send + Sync>;

pub(crate) type RootBody = Box<dyn FnOnce(&TaskContext) -> std::result::Result<Value, TaskError> + Send>;
pub(crate) type MapBody =
    Box<dyn FnOnce(&TaskContext, Value) -> std::result::Result<Value, TaskError> + Send>;
pub(crate) type CatchBody = Box<dyn FnOnce(&TaskError) -> bool + Send>;
/// Builds an absorbing catch's value: the upstream value, or nothing after
/// an absorbed fault.
pub(crate) type RecoverBody =
    Box<dyn FnOnce(Option<Value>) -> std::result::Result<Value, TaskError> + Send>;
pub(crate) type FinallyBody = Box<
    dyn FnOnce(&TaskContext, bool, Option<TaskError>, Option<Value>) -> std::result::Result<Value, TaskError>
        + Send,
>;
pub(crate) type StartCallback = Box<dyn FnOnce(TaskId) + Send>;
pub(crate) type EndCallback = Box<dyn FnOnce(&Outcome) + Send>;

/// A fault travelling down a chain.
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    pub error: TaskError,
    /// A catch or finally saw it.
    pub observed: bool,
}

impl Fault {
    pub fn new(error: TaskError) -> Self {
        Self {
            error,
            observed: false,
        }
    }
}

#[derive(Clone)]
pub(crate) enum Outcome {
    Succeeded(Value),
    Faulted(Fault),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> TaskState {
        match self {
            Outcome::Succeeded(_) => TaskState::Succeeded,
            Outcome::Faulted(_) => TaskState::Faulted,
            Outcome::Cancelled => TaskState::Cancelled,
        }
    }

    pub fn error(&self) -> Option<TaskError> {
        match self {
            Outcome::Succeeded(_) => None,
            Outcome::Faulted(fault) => Some(fault.error.clone()),
            Outcome::Cancelled => Some(TaskError::Cancelled),
        }
    }

    fn from_body(result: std::thread::Result<std::result::Result<Value, TaskError>>) -> Self {
        match result {
            Ok(Ok(value)) => Outcome::Succeeded(value),
            Ok(Err(TaskError::Cancelled)) => Outcome::Cancelled,
            Ok(Err(err)) => Outcome::Faulted(Fault::new(err)),
            Err(payload) => Outcome::Faulted(Fault::new(TaskError::from_panic(payload))),
        }
    }
}

pub(crate) enum Body {
    /// Ignores whatever its predecessors produced.
    Root(RootBody),
    /// Consumes the primary predecessor's value.
    Map(MapBody),
    /// Observes faults. With `recover`, a handler returning `true` turns the
    /// fault back into a success.
    Catch {
        handler: CatchBody,
        recover: Option<RecoverBody>,
    },
    Finally(FinallyBody),
}

impl Body {
    fn kind(&self) -> &'static str {
        match self {
            Body::Root(_) => "task",
            Body::Map(_) => "then",
            Body::Catch { .. } => "catch",
            Body::Finally(_) => "finally",
        }
    }
}

#[derive(Clone)]
pub(crate) struct Dependency {
    pub node: Arc<Node>,
    pub condition: RunCondition,
}

struct Delivery {
    from: TaskId,
    outcome: Outcome,
    condition: RunCondition,
}

/// What a node runs with once every dependency delivered.
struct RunInput {
    combined: Outcome,
    primary: Option<Outcome>,
    always: bool,
}

enum Decision {
    Run,
    Forward { own: Outcome, forward: Outcome },
}

struct Settlement {
    node: Arc<Node>,
    own: Outcome,
    forward: Outcome,
}

struct NodeState {
    state: TaskState,
    affinity: Affinity,
    name: String,
    body: Option<Body>,
    dependencies: Vec<Dependency>,
    merged: bool,
    continuations: Vec<Dependency>,
    inbox: Vec<Delivery>,
    ready: bool,
    input: Option<RunInput>,
    outcome: Option<Outcome>,
    forwarded: Option<Outcome>,
    on_start: Vec<StartCallback>,
    on_end: Vec<EndCallback>,
    start_fired: bool,
    awaited: bool,
}

impl NodeState {
    /// The only way `state` changes.
    fn advance(&mut self, id: TaskId, next: TaskState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(Error::SchedulerFault(format!(
                "task {} ({}) cannot move from {} to {}",
                id.short(),
                self.name,
                self.state,
                next
            )));
        }
        self.state = next;
        Ok(())
    }
}

pub(crate) struct Node {
    id: TaskId,
    runtime: Arc<RuntimeCore>,
    inner: Mutex<NodeState>,
}

impl Node {
    pub fn new(runtime: Arc<RuntimeCore>, affinity: Affinity, body: Body) -> Arc<Self> {
        let name = body.kind().to_string();
        Arc::new(Self {
            id: TaskId::new(),
            runtime,
            inner: Mutex::new(NodeState {
                state: TaskState::Created,
                affinity,
                name,
                body: Some(body),
                dependencies: Vec::new(),
                merged: false,
                continuations: Vec::new(),
                inbox: Vec::new(),
                ready: false,
                input: None,
                outcome: None,
                forwarded: None,
                on_start: Vec::new(),
                on_end: Vec::new(),
                start_fired: false,
                awaited: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn runtime(&self) -> &Arc<RuntimeCore> {
        &self.runtime
    }

    pub fn state(&self) -> TaskState {
        self.lock().state
    }

    pub fn affinity(&self) -> Affinity {
        self.lock().affinity
    }

    /// Retarget a node that has not been queued yet.
    pub fn set_affinity(&self, affinity: Affinity) -> bool {
        let mut st = self.lock();
        if st.state == TaskState::Created && !st.ready {
            st.affinity = affinity;
            true
        } else {
            false
        }
    }

    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn set_name(&self, name: String) {
        self.lock().name = name;
    }

    pub fn is_merged(&self) -> bool {
        self.lock().merged
    }

    pub fn dependencies(&self) -> Vec<Dependency> {
        self.lock().dependencies.clone()
    }

    pub fn primary_dependency(&self) -> Option<Arc<Node>> {
        self.lock().dependencies.first().map(|d| d.node.clone())
    }

    pub fn continuation_count(&self) -> usize {
        self.lock().continuations.len()
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.lock().outcome.clone()
    }

    pub fn set_awaited(&self) {
        self.lock().awaited = true;
    }

    pub fn on_start(&self, callback: StartCallback) {
        let fire_now = {
            let mut st = self.lock();
            if st.start_fired {
                Some(callback)
            } else {
                st.on_start.push(callback);
                None
            }
        };
        if let Some(callback) = fire_now {
            callback(self.id);
        }
    }

    pub fn on_end(&self, callback: EndCallback) {
        let fire_now = {
            let mut st = self.lock();
            match st.outcome.clone() {
                Some(outcome) => Some((callback, outcome)),
                None => {
                    st.on_end.push(callback);
                    None
                }
            }
        };
        if let Some((callback, outcome)) = fire_now {
            callback(&outcome);
        }
    }

    /// Whether `target` is reachable by walking dependencies from `self`.
    fn depends_transitively_on(self: &Arc<Self>, target: &Arc<Node>) -> bool {
        let mut stack = vec![self.clone()];
        let mut seen = HashSet::new();
        while let Some(node) = stack.pop() {
            if Arc::ptr_eq(&node, target) {
                return true;
            }
            if !seen.insert(node.id) {
                continue;
            }
            stack.extend(node.dependencies().into_iter().map(|d| d.node));
        }
        false
    }

    /// Record `parent` as a dependency of `child` and `child` as a
    /// continuation of `parent`.
    ///
    /// A child that already has a dependency becomes a join node flagged as
    /// merged. Fails if the child was already queued or the edge would close
    /// a cycle.
    pub fn attach(parent: &Arc<Node>, child: &Arc<Node>, condition: RunCondition) -> Result<()> {
        if parent.depends_transitively_on(child) {
            return Err(Error::Validation(format!(
                "attaching {} after {} would create a cycle",
                child.id.short(),
                parent.id.short()
            )));
        }
        {
            let mut st = child.lock();
            if st.state != TaskState::Created || st.ready {
                return Err(Error::SchedulerFault(format!(
                    "cannot attach {} ({}): it is already {}",
                    child.id.short(),
                    st.name,
                    st.state
                )));
            }
            if st.dependencies.iter().any(|d| Arc::ptr_eq(&d.node, parent)) {
                return Err(Error::SchedulerFault(format!(
                    "{} already depends on {}",
                    child.id.short(),
                    parent.id.short()
                )));
            }
            if !st.dependencies.is_empty() {
                st.merged = true;
                rlog_debug!(
                    "Node::attach merge: {} joins {} as extra dependency",
                    child.id.short(),
                    parent.id.short()
                );
            }
            st.dependencies.push(Dependency {
                node: parent.clone(),
                condition,
            });
        }
        parent.add_continuation(child.clone(), condition);
        Ok(())
    }

    /// Register a continuation. A parent that already finished delivers
    /// right away.
    fn add_continuation(self: &Arc<Self>, child: Arc<Node>, condition: RunCondition) {
        let finished = {
            let mut st = self.lock();
            match st.forwarded.clone() {
                Some(forward) => Some(forward),
                None => {
                    st.continuations.push(Dependency {
                        node: child.clone(),
                        condition,
                    });
                    None
                }
            }
        };
        if let Some(forward) = finished {
            rlog_trace!(
                "Node {} finished before continuation {} was added; delivering now",
                self.id.short(),
                child.id.short()
            );
            let mut work = VecDeque::new();
            deliver(child, self.id, forward, condition, &mut work);
            drain(work);
        }
    }

    /// Every still-created node without pending dependencies reachable
    /// backwards from `self`, primary chain first.
    fn created_roots(self: &Arc<Self>) -> Vec<Arc<Node>> {
        let mut roots = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(node) = stack.pop() {
            if !seen.insert(node.id) {
                continue;
            }
            let deps = {
                let st = node.lock();
                if st.state != TaskState::Created || st.ready {
                    continue;
                }
                st.dependencies.clone()
            };
            if deps.is_empty() {
                roots.push(node);
                continue;
            }
            // Reverse so the primary dependency is walked first.
            for dep in deps.into_iter().rev() {
                stack.push(dep.node);
            }
        }
        roots
    }

    /// Submit the top-most created node(s) of the chain. Already queued,
    /// running or finished nodes are left alone.
    pub fn start(self: &Arc<Self>) {
        let roots = self.created_roots();
        if roots.is_empty() {
            rlog_trace!("Node::start {}: nothing left to start", self.id.short());
            return;
        }
        let mut queued: Vec<Arc<Node>> = Vec::new();
        for root in roots {
            let mut st = root.lock();
            if st.ready || st.state != TaskState::Created || !st.dependencies.is_empty() {
                continue;
            }
            if let Err(e) = st.advance(root.id, TaskState::Queued) {
                rlog_error!("Node::start: {}", e);
                continue;
            }
            st.ready = true;
            st.input = None;
            drop(st);
            rlog_debug!("Node::start: submitting root {}", root.id.short());
            queued.push(root);
        }

        // Roots sharing an affinity go in as one batch so an ordered
        // scheduler runs them before any continuation they trigger.
        let mut work = VecDeque::new();
        let mut groups: Vec<(Affinity, Vec<Arc<Node>>)> = Vec::new();
        for root in queued {
            let affinity = root.affinity();
            match groups.iter_mut().find(|(a, _)| *a == affinity) {
                Some((_, group)) => group.push(root),
                None => groups.push((affinity, vec![root])),
            }
        }
        for (affinity, group) in groups {
            if group.len() == 1 {
                for root in group {
                    dispatch(root, &mut work);
                }
                continue;
            }
            let jobs = group
                .iter()
                .map(|root| {
                    let runner = root.clone();
                    Box::new(move || runner.run()) as crate::scheduler::Job
                })
                .collect();
            if let Err(e) = self.runtime.schedulers().schedule_batch(affinity, jobs) {
                rlog_warn!("Chain roots not scheduled: {}", e);
                for root in group {
                    work.push_back(Settlement {
                        node: root,
                        own: Outcome::Cancelled,
                        forward: Outcome::Cancelled,
                    });
                }
            }
        }
        drain(work);
    }

    /// Called on the owning scheduler's thread.
    fn run(self: Arc<Self>) {
        let (body, input, affinity) = {
            let mut st = self.lock();
            if let Err(e) = st.advance(self.id, TaskState::Running) {
                rlog_error!("Node::run: {}", e);
                return;
            }
            (st.body.take(), st.input.take(), st.affinity)
        };
        self.fire_start();
        rlog_trace!("Node {} running on {}", self.id.short(), affinity);

        let cx = TaskContext::new(self.id, affinity, self.runtime.token());
        let (own, forward) = match body {
            Some(body) => execute(body, &cx, input),
            None => {
                let err = TaskError::Scheduler(format!("task {} has no body", self.id.short()));
                let outcome = Outcome::Faulted(Fault::new(err));
                (outcome.clone(), outcome)
            }
        };
        let mut work = VecDeque::new();
        work.push_back(Settlement {
            node: self,
            own,
            forward,
        });
        drain(work);
    }

    fn fire_start(&self) {
        let callbacks = {
            let mut st = self.lock();
            if st.start_fired {
                return;
            }
            st.start_fired = true;
            std::mem::take(&mut st.on_start)
        };
        for callback in callbacks {
            callback(self.id);
        }
    }

    /// Move to a terminal state and hand back the continuations to deliver to.
    fn complete(&self, own: &Outcome, forward: &Outcome) -> Vec<Dependency> {
        self.fire_start();
        let (continuations, callbacks, unobserved, name) = {
            let mut st = self.lock();
            if let Err(e) = st.advance(self.id, own.state()) {
                rlog_error!("Node::complete: {}, ignoring", e);
                return Vec::new();
            }
            st.outcome = Some(own.clone());
            st.forwarded = Some(forward.clone());
            st.body = None;
            st.input = None;
            let continuations = std::mem::take(&mut st.continuations);
            let unobserved = match own {
                Outcome::Faulted(fault)
                    if continuations.is_empty()
                        && !st.awaited
                        && !fault.observed =>
                {
                    Some(fault.error.clone())
                }
                _ => None,
            };
            (
                continuations,
                std::mem::take(&mut st.on_end),
                unobserved,
                st.name.clone(),
            )
        };

        rlog_trace!(
            "Node {} ({}) -> {}, {} continuations",
            self.id.short(),
            name,
            own.state(),
            continuations.len()
        );
        if let Outcome::Faulted(fault) = own {
            if !fault.observed {
                rlog_warn!("Task {} ({}) faulted: {}", self.id.short(), name, fault.error);
            }
        }
        for callback in callbacks {
            callback(own);
        }
        if let Some(err) = unobserved {
            self.runtime.report_unobserved(self.id, &err);
        }
        continuations
    }

    /// Record one dependency's outcome. Once all are in, decide whether the
    /// node runs or forwards.
    fn receive(&self, from: TaskId, outcome: Outcome, condition: RunCondition) -> Option<Decision> {
        let mut st = self.lock();
        if st.ready || !st.state.can_advance_to(TaskState::Queued) {
            rlog_error!(
                "Node::receive {}: delivery from {} after node was {}",
                self.id.short(),
                from.short(),
                st.state
            );
            return None;
        }
        st.inbox.push(Delivery {
            from,
            outcome,
            condition,
        });
        if st.inbox.len() < st.dependencies.len() {
            return None;
        }
        st.ready = true;

        let mut inbox = std::mem::take(&mut st.inbox);
        let order: Vec<TaskId> = st.dependencies.iter().map(|d| d.node.id).collect();
        inbox.sort_by_key(|d| order.iter().position(|id| *id == d.from).unwrap_or(usize::MAX));

        let combined = combine(&inbox);
        let primary = inbox.first().map(|d| d.outcome.clone());
        let always = inbox.iter().all(|d| d.condition == RunCondition::Always);
        let conditions_met = inbox.iter().all(|d| condition_met(d.condition, &d.outcome));

        let run = match st.body.as_ref() {
            Some(Body::Root(_)) => conditions_met,
            Some(Body::Map(_)) => {
                conditions_met && matches!(primary, Some(Outcome::Succeeded(_)))
            }
            Some(Body::Catch { recover, .. }) => match &combined {
                Outcome::Faulted(_) => true,
                // An absorbing catch re-types the value it passes on.
                Outcome::Succeeded(_) => recover.is_some(),
                Outcome::Cancelled => false,
            },
            Some(Body::Finally(_)) => true,
            None => false,
        };

        if run {
            if let Err(e) = st.advance(self.id, TaskState::Queued) {
                rlog_error!("Node::receive: {}", e);
                return None;
            }
            st.input = Some(RunInput {
                combined,
                primary,
                always,
            });
            return Some(Decision::Run);
        }

        // Skipped: pass the incoming outcome on. A node skipped on the
        // success path never ran, so it ends cancelled itself.
        let own = match (&combined, st.body.as_ref()) {
            (Outcome::Succeeded(_), Some(Body::Catch { .. })) => combined.clone(),
            (Outcome::Succeeded(_), _) => Outcome::Cancelled,
            _ => combined.clone(),
        };
        Some(Decision::Forward {
            own,
            forward: combined,
        })
    }
}

fn condition_met(condition: RunCondition, outcome: &Outcome) -> bool {
    match (condition, outcome) {
        (RunCondition::Always, _) => true,
        (RunCondition::OnSuccess, Outcome::Succeeded(_)) => true,
        (RunCondition::OnFailure, Outcome::Faulted(_)) => true,
        _ => false,
    }
}

/// Cancellation wins over faults, faults over success; the primary
/// dependency comes first within each.
fn combine(inbox: &[Delivery]) -> Outcome {
    if inbox.iter().any(|d| matches!(d.outcome, Outcome::Cancelled)) {
        return Outcome::Cancelled;
    }
    if let Some(faulted) = inbox
        .iter()
        .find(|d| matches!(d.outcome, Outcome::Faulted(_)))
    {
        return faulted.outcome.clone();
    }
    inbox
        .first()
        .map(|d| d.outcome.clone())
        .unwrap_or(Outcome::Cancelled)
}

fn guarded<F>(f: F) -> Outcome
where
    F: FnOnce() -> std::result::Result<Value, TaskError>,
{
    Outcome::from_body(std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)))
}

fn execute(body: Body, cx: &TaskContext, input: Option<RunInput>) -> (Outcome, Outcome) {
    let always = input.as_ref().map(|i| i.always).unwrap_or(false);
    let cancelled = cx.is_cancelled();

    match body {
        Body::Root(f) => {
            let own = if cancelled && !always {
                Outcome::Cancelled
            } else {
                guarded(|| f(cx))
            };
            (own.clone(), own)
        }
        Body::Map(f) => {
            let own = match input.and_then(|i| i.primary) {
                _ if cancelled && !always => Outcome::Cancelled,
                Some(Outcome::Succeeded(value)) => guarded(|| f(cx, value)),
                _ => Outcome::Faulted(Fault::new(TaskError::Scheduler(
                    "continuation queued without a predecessor value".to_string(),
                ))),
            };
            (own.clone(), own)
        }
        Body::Catch { handler, recover } => {
            let own = match input.map(|i| i.combined) {
                Some(Outcome::Faulted(fault)) => {
                    let error = fault.error.clone();
                    let absorbed =
                        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            handler(&error)
                        })) {
                            Ok(absorbed) => absorbed,
                            Err(payload) => {
                                rlog_error!(
                                    "catch handler panicked: {}",
                                    TaskError::from_panic(payload)
                                );
                                false
                            }
                        };
                    match recover {
                        Some(recover) if absorbed => guarded(|| recover(None)),
                        _ => Outcome::Faulted(Fault {
                            error: fault.error,
                            observed: true,
                        }),
                    }
                }
                Some(Outcome::Succeeded(value)) => match recover {
                    Some(recover) => guarded(|| recover(Some(value))),
                    None => Outcome::Succeeded(value),
                },
                Some(Outcome::Cancelled) | None => Outcome::Cancelled,
            };
            (own.clone(), own)
        }
        Body::Finally(handler) => {
            let (success, error, value) = match input.map(|i| i.combined) {
                Some(Outcome::Succeeded(value)) => (true, None, Some(value)),
                Some(Outcome::Faulted(fault)) => (false, Some(fault.error), None),
                Some(Outcome::Cancelled) | None => (false, Some(TaskError::Cancelled), None),
            };
            let own = guarded(|| handler(cx, success, error, value));
            // A finally that itself fails starts a new, unobserved fault.
            (own.clone(), own)
        }
    }
}

fn deliver(
    child: Arc<Node>,
    from: TaskId,
    outcome: Outcome,
    condition: RunCondition,
    work: &mut VecDeque<Settlement>,
) {
    match child.receive(from, outcome, condition) {
        None => {}
        Some(Decision::Run) => dispatch(child, work),
        Some(Decision::Forward { own, forward }) => work.push_back(Settlement {
            node: child,
            own,
            forward,
        }),
    }
}

/// Hand a queued node to its scheduler. A scheduler that refuses the work
/// settles the node as cancelled.
fn dispatch(node: Arc<Node>, work: &mut VecDeque<Settlement>) {
    let affinity = node.affinity();
    let runner = node.clone();
    if let Err(e) = node
        .runtime
        .schedulers()
        .schedule(affinity, Box::new(move || runner.run()))
    {
        rlog_warn!("Task {} not scheduled: {}", node.id.short(), e);
        work.push_back(Settlement {
            node,
            own: Outcome::Cancelled,
            forward: Outcome::Cancelled,
        });
    }
}

/// Settle nodes breadth-first until no inline work is left. Iterative so
/// long runs of skipped nodes do not grow the stack.
fn drain(mut work: VecDeque<Settlement>) {
    while let Some(Settlement { node, own, forward }) = work.pop_front() {
        for continuation in node.complete(&own, &forward) {
            deliver(
                continuation.node,
                node.id,
                forward.clone(),
                continuation.condition,
                &mut work,
            );
        }
    }
}
