//! Dynamic task expansion.
//!
//! At every executor barrier (each Hybrid stage, the end of a Parallel or
//! Sequential dispatch) newly completed tasks are offered to a
//! [`TaskExpander`], which may answer with follow-up task specs. Accepted
//! specs join the DAG before the next readiness evaluation.

use async_trait::async_trait;

use crate::core::{Task, TaskDAG, TaskId, TaskMap};
use crate::error::{Error, Result};
use crate::workflow::{ExpansionLimits, TaskSpec, Workflow};
use crate::{clog_debug, clog_warn};

/// Capability that grows the workflow from completed work.
#[async_trait]
pub trait TaskExpander: Send + Sync {
    /// Follow-up specs for a completed task. May be empty.
    async fn expand(&self, task: &Task) -> Vec<TaskSpec>;
}

/// Whether a completed task is still allowed to spawn more work.
pub fn can_expand(task: &Task, limits: &ExpansionLimits) -> bool {
    task.expansion_depth < limits.max_depth
}

/// Merge one expansion batch into the workflow.
///
/// Specs beyond `max_new_tasks` are dropped. New tasks get the parent's
/// expansion depth + 1. The batch is all-or-nothing: a duplicate id, an
/// unknown dependency or a cycle rejects every spec in it and leaves the
/// workflow untouched.
pub fn merge_expansion(
    workflow: &mut Workflow,
    parent: &TaskId,
    mut specs: Vec<TaskSpec>,
) -> Result<Vec<TaskId>> {
    let limits = workflow.config.expansion;
    let depth = workflow
        .task(parent)
        .map(|t| t.expansion_depth + 1)
        .ok_or_else(|| Error::Validation(format!("unknown expansion parent {}", parent)))?;

    if specs.len() > limits.max_new_tasks {
        clog_warn!(
            "Expansion of {} produced {} specs, keeping {}",
            parent,
            specs.len(),
            limits.max_new_tasks
        );
        specs.truncate(limits.max_new_tasks);
    }

    let mut candidate: TaskMap = workflow.tasks.clone();
    let mut added = Vec::with_capacity(specs.len());
    for spec in specs {
        let mut task = spec.into_task(workflow.config.default_max_retries);
        task.expansion_depth = depth;
        if candidate.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        added.push(task.id.clone());
        candidate.insert(task.id.clone(), task);
    }

    TaskDAG::build(&candidate)?;
    workflow.tasks = candidate;
    clog_debug!("Expansion of {} added {:?}", parent, added);
    Ok(added)
}
