//! Task DAG (Directed Acyclic Graph) for dependency management.
//!
//! Edges point from a dependency to its dependent: `a -> b` means `a` must
//! complete before `b` may start. Node indices follow insertion order, which
//! is the FIFO tie-break for scheduling.

use crate::core::task::{TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::collections::{BTreeMap, HashMap};

/// The task dependency graph.
pub struct TaskDAG {
    graph: DiGraph<TaskNode, ()>,
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
        }
    }

    /// Build a graph from tasks whose `dependencies` reference each other.
    ///
    /// Tasks are inserted in the given order. Fails on duplicate ids, unknown
    /// dependency ids, or cycles.
    pub fn from_tasks(tasks: Vec<TaskNode>) -> Result<Self> {
        let mut dag = Self::new();
        for task in &tasks {
            if dag.contains_task(&task.id) {
                return Err(Error::Decomposition(format!("duplicate task id {}", task.id)));
            }
            dag.add_task(task.clone());
        }
        for task in &tasks {
            for dep in &task.dependencies {
                if !dag.contains_task(dep) {
                    return Err(Error::TaskDependency {
                        task: task.id.to_string(),
                        dependency: dep.to_string(),
                    });
                }
                dag.add_edge(dep, &task.id)?;
            }
        }
        Ok(dag)
    }

    /// Add a task. If the id already exists the existing index is returned.
    pub fn add_task(&mut self, task: TaskNode) -> NodeIndex {
        if let Some(&index) = self.task_index.get(&task.id) {
            return index;
        }
        let id = task.id.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        index
    }

    /// Record that `dependent` depends on `dependency`, rejecting cycles.
    pub fn add_dependency(&mut self, dependency: &TaskId, dependent: &TaskId) -> Result<()> {
        self.add_edge(dependency, dependent)?;
        if let Some(task) = self.get_task_mut(dependent) {
            task.dependencies.insert(dependency.clone());
        }
        Ok(())
    }

    fn add_edge(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_index = self.index_of(from)?;
        let to_index = self.index_of(to)?;
        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from_index, to_index, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Decomposition(format!(
                "dependency {} -> {} would create a cycle",
                from, to
            )));
        }
        Ok(())
    }

    fn index_of(&self, id: &TaskId) -> Result<NodeIndex> {
        self.task_index
            .get(id)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn get_task(&self, id: &TaskId) -> Option<&TaskNode> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    pub fn get_task_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        let index = *self.task_index.get(id)?;
        self.graph.node_weight_mut(index)
    }

    pub fn task(&self, id: &TaskId) -> Result<&TaskNode> {
        self.get_task(id)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
    }

    pub fn task_mut(&mut self, id: &TaskId) -> Result<&mut TaskNode> {
        let index = self.index_of(id)?;
        self.graph
            .node_weight_mut(index)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))
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

    pub fn has_dependency(&self, dependency: &TaskId, dependent: &TaskId) -> bool {
        match (self.task_index.get(dependency), self.task_index.get(dependent)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, id: &TaskId) -> Vec<&TaskNode> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<&TaskNode> {
        match self.task_index.get(id) {
            Some(&index) => self
                .graph
                .neighbors_directed(index, direction)
                .filter_map(|n| self.graph.node_weight(n))
                .collect(),
            None => Vec::new(),
        }
    }

    /// All tasks in insertion order.
    pub fn all_tasks(&self) -> Vec<&TaskNode> {
        self.graph.node_weights().collect()
    }

    /// Every task reachable from `id` through dependent edges, excluding `id`.
    ///
    /// Single breadth-first traversal; results are in visit order.
    pub fn transitive_dependents(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut bfs = Bfs::new(&self.graph, start);
        let mut out = Vec::new();
        while let Some(index) = bfs.next(&self.graph) {
            if index == start {
                continue;
            }
            if let Some(task) = self.graph.node_weight(index) {
                out.push(task.id.clone());
            }
        }
        out
    }

    // ========== Scheduling Operations ==========

    /// Tasks that may be dispatched: `pending` or `ready` with every
    /// dependency `completed`.
    ///
    /// Ordered by ascending priority, then insertion order.
    pub fn ready_set(&self) -> Vec<&TaskNode> {
        let mut ready: Vec<(NodeIndex, &TaskNode)> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = self.graph.node_weight(index)?;
                if !task.can_start() {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        self.graph
                            .node_weight(dep)
                            .map(|d| d.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                deps_satisfied.then_some((index, task))
            })
            .collect();
        ready.sort_by_key(|(index, task)| (task.priority, index.index()));
        ready.into_iter().map(|(_, task)| task).collect()
    }

    /// Number of tasks per status.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        let mut counts = BTreeMap::new();
        for task in self.graph.node_weights() {
            *counts.entry(task.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn ids_with_status(&self, status: TaskStatus) -> Vec<TaskId> {
        self.graph
            .node_weights()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// True when no task can make further progress on its own.
    pub fn is_resolved(&self) -> bool {
        self.graph.node_weights().all(|t| t.is_finished())
    }

    pub fn all_complete(&self) -> bool {
        self.graph
            .node_weights()
            .all(|t| t.status == TaskStatus::Completed)
    }

    /// Tasks in an order where each task follows all of its dependencies.
    pub fn topological_order(&self) -> Result<Vec<&TaskNode>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let id = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::Decomposition(format!("cycle detected at task {}", id))
        })?;
        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }
}

impl Default for TaskDAG {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
