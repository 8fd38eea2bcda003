use std::sync::Arc;

use thiserror::Error;

use crate::core::Affinity;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Scheduler fault: {0}")]
    SchedulerFault(String),

    #[error("{affinity} scheduler is shut down")]
    SchedulerShutdown { affinity: Affinity },

    #[error("UI pump is stopped")]
    PumpStopped,

    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Error carried by a faulted (or cancelled) task.
///
/// Cloned into every continuation a fault propagates through, so every
/// variant is cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("{message}")]
    Failed { message: String },

    #[error("task panicked: {0}")]
    Panicked(String),

    #[error("task was cancelled")]
    Cancelled,

    #[error("{program} exited with code {code:?}: {stderr}")]
    ProcessFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("scheduler: {0}")]
    Scheduler(String),

    #[error(transparent)]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Build a plain body failure from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        TaskError::Failed {
            message: message.into(),
        }
    }

    /// Wrap any error type.
    pub fn other<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TaskError::Other(Arc::new(err))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled)
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let text = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        TaskError::Panicked(text)
    }
}

impl From<Error> for TaskError {
    fn from(err: Error) -> Self {
        match err {
            Error::Task(inner) => inner,
            other => TaskError::other(other),
        }
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::other(err)
    }
}
