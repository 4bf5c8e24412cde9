//! Task DAG (Directed Acyclic Graph) and dependency resolution.
//!
//! `TaskDAG` mirrors the `depends_on` edges of a task map in a petgraph
//! `DiGraph` so that structure questions (cycles, topological layering,
//! transitive dependents) are answered by graph algorithms, while status
//! questions are answered against the task map it was built from.
//!
//! Edges point from a dependency to its dependent: `a -> b` means `b`
//! waits for `a`.

use crate::core::task::{Task, TaskError, TaskErrorKind, TaskId, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use petgraph::Direction;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Tasks keyed by id, as owned by a workflow.
pub type TaskMap = BTreeMap<TaskId, Task>;

/// The task dependency graph.
pub struct TaskDAG {
    /// The underlying directed graph. Node weights are task ids.
    graph: DiGraph<TaskId, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
}

impl TaskDAG {
    /// Build and validate the graph for a task map.
    ///
    /// # Errors
    /// - `UnknownDependency` if a `depends_on` id is not in the map
    /// - `GraphCycle` if the edges contain a cycle (a self-dependency is a
    ///   cycle of one); the error names every task on a cycle
    pub fn build(tasks: &TaskMap) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(tasks.len(), tasks.len());
        let mut task_index = HashMap::with_capacity(tasks.len());

        for id in tasks.keys() {
            let index = graph.add_node(id.clone());
            task_index.insert(id.clone(), index);
        }

        for (id, task) in tasks {
            let to = task_index[id];
            for dep in &task.depends_on {
                if dep == id {
                    return Err(Error::GraphCycle {
                        task_ids: vec![id.clone()],
                    });
                }
                let from = *task_index
                    .get(dep)
                    .ok_or_else(|| Error::UnknownDependency {
                        task_id: id.clone(),
                        dependency: dep.clone(),
                    })?;
                graph.add_edge(from, to, ());
            }
        }

        let dag = Self { graph, task_index };
        dag.check_acyclic()?;
        Ok(dag)
    }

    fn check_acyclic(&self) -> Result<()> {
        let mut on_cycle: Vec<TaskId> = tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| component.len() > 1)
            .flatten()
            .map(|index| self.graph[index].clone())
            .collect();

        if on_cycle.is_empty() {
            return Ok(());
        }
        on_cycle.sort();
        Err(Error::GraphCycle { task_ids: on_cycle })
    }

    /// Get the number of tasks in the DAG.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of dependency edges in the DAG.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains_task(&self, id: &TaskId) -> bool {
        self.task_index.contains_key(id)
    }

    /// Direct dependencies of a task, sorted by id.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that directly depend on the given task, sorted by id.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut ids: Vec<TaskId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every task that (transitively) depends on the given task.
    pub fn transitive_dependents(&self, id: &TaskId) -> BTreeSet<TaskId> {
        let Some(&start) = self.task_index.get(id) else {
            return BTreeSet::new();
        };
        let mut found = BTreeSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(index) = bfs.next(&self.graph) {
            if index != start {
                found.insert(self.graph[index].clone());
            }
        }
        found
    }

    /// Task ids in an order where every task follows its dependencies.
    pub fn topological_order(&self) -> Vec<TaskId> {
        // build() rejected cycles, so toposort cannot fail here.
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|i| self.graph[i].clone()).collect())
            .unwrap_or_default()
    }

    // ========== Scheduling Operations ==========

    /// The ready set: PENDING tasks whose every dependency is COMPLETED.
    ///
    /// Returned in dispatch order (priority descending, then id ascending).
    pub fn ready_set(&self, tasks: &TaskMap) -> Vec<TaskId> {
        let mut ready: Vec<TaskId> = self
            .graph
            .node_indices()
            .filter_map(|index| {
                let task = tasks.get(&self.graph[index])?;
                if task.status != TaskStatus::Pending {
                    return None;
                }
                let deps_satisfied = self
                    .graph
                    .neighbors_directed(index, Direction::Incoming)
                    .all(|dep| {
                        tasks
                            .get(&self.graph[dep])
                            .map(|t| t.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    });
                deps_satisfied.then(|| task.id.clone())
            })
            .collect();
        sort_for_dispatch(&mut ready, tasks);
        ready
    }

    /// Partition the runnable PENDING tasks into topological layers.
    ///
    /// Layer 0 is the current ready set; layer `k` holds the tasks whose
    /// dependencies are all COMPLETED or placed in a layer `< k`. Tasks that
    /// sit behind an unsuccessful (or still running) dependency are left out.
    pub fn stages(&self, tasks: &TaskMap) -> Vec<Vec<TaskId>> {
        let mut remaining: BTreeSet<&TaskId> = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && self.contains_task(&t.id))
            .map(|t| &t.id)
            .collect();
        let mut placed: HashSet<&TaskId> = HashSet::new();
        let mut stages = Vec::new();

        loop {
            let mut layer: Vec<TaskId> = remaining
                .iter()
                .filter(|id| {
                    tasks[**id].depends_on.iter().all(|dep| {
                        placed.contains(dep)
                            || tasks
                                .get(dep)
                                .map(|t| t.status == TaskStatus::Completed)
                                .unwrap_or(false)
                    })
                })
                .map(|id| (*id).clone())
                .collect();

            if layer.is_empty() {
                break;
            }

            for id in &layer {
                remaining.remove(id);
            }
            for id in &layer {
                if let Some((key, _)) = tasks.get_key_value(id) {
                    placed.insert(key);
                }
            }
            sort_for_dispatch(&mut layer, tasks);
            stages.push(layer);
        }

        stages
    }

    /// Skip every PENDING or READY task that has an unsuccessful dependency.
    ///
    /// Walks the graph in topological order so skips cascade through chains
    /// in a single pass. Returns the ids that were skipped, in that order.
    pub fn propagate_skips(&self, tasks: &mut TaskMap) -> Vec<TaskId> {
        let mut skipped = Vec::new();

        for id in self.topological_order() {
            let blocker = {
                let Some(task) = tasks.get(&id) else { continue };
                if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                    continue;
                }
                task.depends_on
                    .iter()
                    .find_map(|dep| {
                        let status = tasks.get(dep)?.status;
                        status.is_unsuccessful().then(|| (dep.clone(), status))
                    })
            };

            if let Some((dep, status)) = blocker {
                if let Some(task) = tasks.get_mut(&id) {
                    let error = TaskError::new(
                        TaskErrorKind::DependencyFailed,
                        format!("dependency {} ended {}", dep, status),
                    );
                    if task.skip(error).is_ok() {
                        skipped.push(id);
                    }
                }
            }
        }

        skipped
    }
}

/// Order task ids by priority descending, then id ascending.
pub fn sort_for_dispatch(ids: &mut [TaskId], tasks: &TaskMap) {
    ids.sort_by(|a, b| {
        let pa = tasks.get(a).map(|t| t.priority).unwrap_or_default();
        let pb = tasks.get(b).map(|t| t.priority).unwrap_or_default();
        pb.cmp(&pa).then_with(|| a.cmp(b))
    });
}

impl std::fmt::Debug for TaskDAG {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDAG")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
