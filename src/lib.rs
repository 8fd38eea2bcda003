pub mod cancel;
pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod manager;
pub mod process;
pub mod scheduler;

pub use cancel::CancellationSource;
pub use config::{Config, RuntimeConfig};
pub use core::{
    Affinity, ChainGraph, RunCondition, Task, TaskContext, TaskFuture, TaskId, TaskRef, TaskState,
};
pub use error::{Error, Result, TaskError};
pub use manager::{TaskManager, UnobservedFaultHandler};
pub use process::{ProcessEnvironment, ProcessOutput, ProcessSpec};
pub use scheduler::SyncContextPump;
