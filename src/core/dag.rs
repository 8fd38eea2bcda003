//! Chain topology snapshots.
//!
//! A [`ChainGraph`] is a point-in-time petgraph copy of every node reachable
//! backwards from a task. It is detached from the live nodes and is meant for
//! inspection, diagnostics and checking execution traces.

use crate::core::chain::TaskRef;
use crate::core::task::{Affinity, RunCondition, TaskId, TaskState};
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A node as it looked when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub affinity: Affinity,
    pub merged: bool,
}

impl TaskInfo {
    fn capture(task: &TaskRef) -> Self {
        Self {
            id: task.id(),
            name: task.name(),
            state: task.state(),
            affinity: task.affinity(),
            merged: task.is_merged(),
        }
    }
}

/// Edge from a dependency to the node waiting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEdge {
    pub condition: RunCondition,
    /// Added by a graph merge rather than by building the chain.
    pub merge: bool,
}

impl std::fmt::Display for ChainEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.merge {
            write!(f, "{} (merge)", self.condition)
        } else {
            write!(f, "{}", self.condition)
        }
    }
}

pub struct ChainGraph {
    graph: DiGraph<TaskInfo, ChainEdge>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl ChainGraph {
    /// Walk dependencies backwards from `tail` and record everything found.
    pub fn from_tail(tail: &TaskRef) -> Self {
        let mut dag = Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        };
        let mut stack = vec![tail.clone()];
        let mut visited = HashSet::new();
        while let Some(task) = stack.pop() {
            if !visited.insert(task.id()) {
                continue;
            }
            let to = dag.add_task(&task);
            for (position, (dep, condition)) in task.dependencies().into_iter().enumerate() {
                let from = dag.add_task(&dep);
                dag.graph.add_edge(
                    from,
                    to,
                    ChainEdge {
                        condition,
                        merge: position > 0,
                    },
                );
                stack.push(dep);
            }
        }
        dag
    }

    fn add_task(&mut self, task: &TaskRef) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id()) {
            return index;
        }
        let index = self.graph.add_node(TaskInfo::capture(task));
        self.task_index.insert(task.id(), index);
        index
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskInfo> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    pub fn has_dependency(&self, from: &TaskId, to: &TaskId) -> bool {
        self.get_dependency(from, to).is_some()
    }

    pub fn get_dependency(&self, from: &TaskId, to: &TaskId) -> Option<&ChainEdge> {
        let from_idx = self.task_index.get(from)?;
        let to_idx = self.task_index.get(to)?;
        let edge = self.graph.find_edge(*from_idx, *to_idx)?;
        self.graph.edge_weight(edge)
    }

    /// Nodes `id` waits on.
    pub fn get_dependencies(&self, id: &TaskId) -> Vec<&TaskInfo> {
        self.neighbors(id, petgraph::Direction::Incoming)
    }

    /// Nodes waiting on `id`, within this snapshot.
    pub fn get_dependents(&self, id: &TaskId) -> Vec<&TaskInfo> {
        self.neighbors(id, petgraph::Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: petgraph::Direction) -> Vec<&TaskInfo> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Nodes without dependencies; the ones `start` submits.
    pub fn roots(&self) -> Vec<&TaskInfo> {
        self.graph
            .node_indices()
            .filter(|&i| {
                self.graph
                    .neighbors_directed(i, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|i| self.graph.node_weight(i))
            .collect()
    }

    pub fn all_tasks(&self) -> Vec<&TaskInfo> {
        self.graph.node_weights().collect()
    }

    /// Number of nodes that had not finished when the snapshot was taken.
    pub fn pending_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    pub fn graph(&self) -> &DiGraph<TaskInfo, ChainEdge> {
        &self.graph
    }

    /// One order in which every node comes after all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&TaskInfo>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.as_str())
                .unwrap_or("unknown");
            Error::Validation(format!("Cycle detected at task: {}", name))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Whether `trace` never lists a node before one of its dependencies.
    ///
    /// Ids outside the snapshot are ignored; nodes missing from the trace
    /// impose no constraint.
    pub fn is_valid_order(&self, trace: &[TaskId]) -> bool {
        let position: HashMap<TaskId, usize> = trace
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        self.graph.edge_indices().all(|edge| {
            let Some((from, to)) = self.graph.edge_endpoints(edge) else {
                return true;
            };
            let (Some(from), Some(to)) = (self.graph.node_weight(from), self.graph.node_weight(to))
            else {
                return true;
            };
            match (position.get(&from.id), position.get(&to.id)) {
                (Some(a), Some(b)) => a < b,
                _ => true,
            }
        })
    }
}

impl std::fmt::Debug for ChainGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
