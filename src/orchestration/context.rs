//! Shared state for one orchestrator iteration.

use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{TaskDAG, TaskId, TaskStatus};
use crate::workflow::{HaltReason, Workflow, WorkflowConfig, WorkflowId};
use crate::{clog, clog_debug, clog_error, clog_warn};

use super::expander::{can_expand, merge_expansion, TaskExpander};
use super::pool::WorkerPool;
use super::progress::{EventType, ProgressEvent, ProgressStream};
use super::runner::TaskRunner;

/// Stop conditions for a run: cancellation, the workflow deadline and
/// policy halts. The first reason observed sticks.
#[derive(Debug)]
pub struct RunControl {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    halt: OnceLock<HaltReason>,
}

impl RunControl {
    pub fn new(cancel: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            cancel,
            deadline,
            halt: OnceLock::new(),
        }
    }

    /// Record a halt. Returns the reason that is now in effect.
    pub fn halt(&self, reason: HaltReason) -> HaltReason {
        self.halt.get_or_init(|| reason).clone()
    }

    /// Why dispatch must stop, if it must.
    pub fn check(&self) -> Option<HaltReason> {
        if let Some(reason) = self.halt.get() {
            return Some(reason.clone());
        }
        if self.cancel.is_cancelled() {
            return Some(self.halt(HaltReason::Cancelled));
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Some(self.halt(HaltReason::WorkflowTimeout));
        }
        None
    }

    /// The recorded halt, without probing the clock or the token.
    pub fn halt_reason(&self) -> Option<HaltReason> {
        self.halt.get().cloned()
    }

    /// Resolves once the run is cancelled or its deadline passes.
    pub async fn stopped(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

/// What an executor reports for each task it dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

/// Everything executors and the retry controller share during a run.
pub struct ExecutionContext {
    pub workflow_id: WorkflowId,
    pub workflow: Arc<RwLock<Workflow>>,
    /// Replaced whenever an expansion adds tasks.
    pub dag: RwLock<Arc<TaskDAG>>,
    pub runner: Arc<dyn TaskRunner>,
    pub expander: Option<Arc<dyn TaskExpander>>,
    pub progress: ProgressStream,
    pub pool: WorkerPool,
    pub control: Arc<RunControl>,
    pub config: WorkflowConfig,
}

impl ExecutionContext {
    pub async fn dag(&self) -> Arc<TaskDAG> {
        Arc::clone(&*self.dag.read().await)
    }

    /// Move a ready-set snapshot from PENDING to READY.
    pub async fn mark_ready(&self, ids: &[TaskId]) -> Vec<TaskId> {
        let mut workflow = self.workflow.write().await;
        let mut marked = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(task) = workflow.tasks.get_mut(id) else {
                continue;
            };
            match task.mark_ready() {
                Ok(()) => marked.push(id.clone()),
                Err(e) => clog_error!("Cannot mark task {} ready: {}", id, e),
            }
        }
        marked
    }

    /// Fold finished results into the shared context (stage barrier).
    pub async fn merge_results(&self, reports: &[TaskReport]) {
        let ids: Vec<TaskId> = reports.iter().map(|r| r.task_id.clone()).collect();
        self.workflow.write().await.merge_results(&ids);
    }

    /// Skip everything downstream of an unsuccessful task.
    pub async fn propagate_skips(&self) -> Vec<TaskId> {
        let dag = self.dag().await;
        let mut workflow = self.workflow.write().await;
        let skipped = dag.propagate_skips(&mut workflow.tasks);
        for id in &skipped {
            clog_debug!("Task {} skipped", id);
            self.emit_task_terminal(&workflow, id);
        }
        skipped
    }

    /// Offer the tasks that succeeded in a dispatch to the expander.
    ///
    /// Runs at every barrier, so accepted tasks are visible to the next
    /// readiness evaluation. Returns whether the DAG grew.
    pub async fn expand(&self, reports: &[TaskReport]) -> bool {
        let Some(expander) = &self.expander else {
            return false;
        };
        let candidates = {
            let workflow = self.workflow.read().await;
            reports
                .iter()
                .filter(|r| r.succeeded())
                .filter_map(|r| workflow.task(&r.task_id))
                .filter(|t| can_expand(t, &workflow.config.expansion))
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut changed = false;
        for task in candidates {
            let specs = expander.expand(&task).await;
            if specs.is_empty() {
                continue;
            }
            let mut workflow = self.workflow.write().await;
            match merge_expansion(&mut workflow, &task.id, specs) {
                Ok(added) => {
                    clog!(
                        "Workflow {} task {} expanded into {} new tasks",
                        self.workflow_id.short(),
                        task.id,
                        added.len()
                    );
                    changed |= !added.is_empty();
                }
                Err(e) => clog_warn!("Rejected expansion of task {}: {}", task.id, e),
            }
        }
        if !changed {
            return false;
        }

        let workflow = self.workflow.read().await;
        match TaskDAG::build(&workflow.tasks) {
            Ok(dag) => {
                *self.dag.write().await = Arc::new(dag);
                true
            }
            Err(e) => {
                clog_error!("Expanded graph failed validation: {}", e);
                false
            }
        }
    }

    pub async fn status_of(&self, id: &TaskId) -> TaskStatus {
        self.workflow
            .read()
            .await
            .task(id)
            .map(|t| t.status)
            .unwrap_or_default()
    }

    /// Publish a task-scoped event with the workflow's current percent.
    pub fn emit_task(
        &self,
        workflow: &Workflow,
        event_type: EventType,
        id: &TaskId,
        message: String,
        data: Option<serde_json::Value>,
    ) {
        let name = workflow.task(id).map(|t| t.name.as_str()).unwrap_or("");
        let mut event = ProgressEvent::new(event_type, self.workflow_id, message)
            .with_task(id, name)
            .with_percent(workflow.progress_percent());
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.progress.emit(event);
    }

    /// Publish `task_completed` or `task_failed` for a task that just
    /// reached a terminal status.
    ///
    /// Tasks that were skipped or cancelled before dispatch get a
    /// `task_failed` with no `task_started` before it; `data.status` tells
    /// them apart from tasks that ran and failed.
    pub fn emit_task_terminal(&self, workflow: &Workflow, id: &TaskId) {
        let Some(task) = workflow.task(id) else {
            return;
        };
        if task.status == TaskStatus::Completed {
            self.emit_task(
                workflow,
                EventType::TaskCompleted,
                id,
                format!("Task {} completed", task.name),
                Some(serde_json::json!({ "attempts": task.attempts() })),
            );
        } else {
            let reason = task
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| task.status.to_string());
            self.emit_task(
                workflow,
                EventType::TaskFailed,
                id,
                format!("Task {} {}: {}", task.name, task.status, reason),
                Some(serde_json::json!({
                    "status": task.status,
                    "error": task.error,
                })),
            );
        }
    }
}
