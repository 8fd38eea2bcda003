//! Task graph core.
//!
//! Typed handles ([`Task`]) sit on top of type-erased nodes that own the
//! state machine and the continuation protocol. [`ChainGraph`] takes
//! read-only snapshots of a chain's shape.

pub mod chain;
pub mod dag;
pub(crate) mod node;
pub mod task;

pub use chain::{Task, TaskFuture, TaskRef, TaskValue};
pub use dag::{ChainEdge, ChainGraph, TaskInfo};
pub use task::{Affinity, RunCondition, TaskContext, TaskId, TaskState};
