//! Identity, state and scheduling vocabulary shared by every task node.

use serde::{Deserialize, Serialize};
use std::thread::ThreadId;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;

/// Unique identifier for a task node.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The scheduler class a task runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// Unordered thread pool.
    #[default]
    Concurrent,
    /// Single worker thread, strict FIFO across all exclusive tasks.
    Exclusive,
    /// The cooperative UI pump thread.
    Ui,
}

impl std::fmt::Display for Affinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Affinity::Concurrent => write!(f, "concurrent"),
            Affinity::Exclusive => write!(f, "exclusive"),
            Affinity::Ui => write!(f, "ui"),
        }
    }
}

/// Task state in its lifecycle.
///
/// States only move forward: `Created → Queued → Running → terminal`, or
/// straight from `Created` to terminal when a node is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Created,
    Queued,
    Running,
    Faulted,
    Succeeded,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Faulted | TaskState::Succeeded | TaskState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a forward step. Only a queued
    /// node may start running; any live node may end.
    pub fn can_advance_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (TaskState::Created, TaskState::Queued) => true,
            (TaskState::Queued, TaskState::Running) => true,
            (from, to) => !from.is_terminal() && to.is_terminal(),
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Created => write!(f, "created"),
            TaskState::Queued => write!(f, "queued"),
            TaskState::Running => write!(f, "running"),
            TaskState::Faulted => write!(f, "faulted"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// When a continuation fires relative to its predecessor's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCondition {
    Always,
    #[default]
    OnSuccess,
    OnFailure,
}

impl std::fmt::Display for RunCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunCondition::Always => write!(f, "always"),
            RunCondition::OnSuccess => write!(f, "on_success"),
            RunCondition::OnFailure => write!(f, "on_failure"),
        }
    }
}

/// What a task body gets to see while it runs.
#[derive(Debug, Clone)]
pub struct TaskContext {
    id: TaskId,
    affinity: Affinity,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, affinity: Affinity, token: CancellationToken) -> Self {
        Self {
            id,
            affinity,
            token,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn affinity(&self) -> Affinity {
        self.affinity
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out of a body with `?` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), TaskError> {
        if self.token.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        std::thread::current().id()
    }
}
