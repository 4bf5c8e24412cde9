//! Orchestrator for workflow execution.
//!
//! The Orchestrator drives a workflow from PENDING to a terminal status. Each
//! iteration asks the DAG for the ready set, hands it to the configured
//! executor (which merges any expansion at its barriers), and propagates
//! skips. The loop ends when
//! nothing is left to run, `depth` iterations are spent, or a halt fires
//! (cancellation, workflow timeout, fail-fast policy).

use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{TaskError, TaskErrorKind, TaskId, TaskStatus};
use crate::error::Result;
use crate::log::Scope;
use crate::workflow::{HaltReason, Workflow, WorkflowResults, WorkflowStatus};
use crate::{clog, clog_debug, clog_error, clog_warn};

use super::context::{ExecutionContext, RunControl};
use super::executor::executor_for;
use super::expander::TaskExpander;
use super::pool::WorkerPool;
use super::progress::{EventType, ProgressEvent, ProgressStream, ProgressSubscription};
use super::runner::TaskRunner;

/// Drives one workflow run.
///
/// The progress feed closes after the run's terminal event, so an
/// orchestrator is meant to be used for a single workflow.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use conductor::core::{ContextMap, TaskKind};
/// use conductor::orchestration::{FnRunner, Orchestrator, TaskInvocation};
/// use conductor::workflow::WorkflowBuilder;
///
/// # async fn demo() -> conductor::Result<()> {
/// let workflow = WorkflowBuilder::new("hello")
///     .add_task("greet", ContextMap::new(), TaskKind::Sequential, &[])
///     .build()?;
///
/// let runner = FnRunner::new(|_inv: TaskInvocation| async { Ok(ContextMap::new()) });
/// let orchestrator = Orchestrator::new(Arc::new(runner));
/// let mut events = orchestrator.subscribe();
///
/// let finished = orchestrator.execute(workflow).await?;
/// while let Some(event) = events.recv().await {
///     println!("{} {}", event.event_type, event.message);
/// }
/// println!("{}", finished.status);
/// # Ok(())
/// # }
/// ```
pub struct Orchestrator {
    runner: Arc<dyn TaskRunner>,
    expander: Option<Arc<dyn TaskExpander>>,
    cancel: CancellationToken,
    progress: ProgressStream,
}

impl Orchestrator {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            expander: None,
            cancel: CancellationToken::new(),
            progress: ProgressStream::default(),
        }
    }

    pub fn with_expander(mut self, expander: Arc<dyn TaskExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.progress = ProgressStream::new(capacity);
        self
    }

    /// Publish on an existing stream, so subscribers can join before the run.
    pub fn with_progress(mut self, progress: ProgressStream) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a graceful stop: running tasks finish, nothing new starts.
    pub fn cancel(&self) {
        clog!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> &ProgressStream {
        &self.progress
    }

    /// Run a workflow to a terminal status and hand it back.
    pub async fn execute(&self, workflow: Workflow) -> Result<Workflow> {
        let shared = Arc::new(RwLock::new(workflow));
        self.execute_shared(&shared).await?;
        let workflow = match Arc::try_unwrap(shared) {
            Ok(lock) => lock.into_inner(),
            Err(shared) => shared.read().await.clone(),
        };
        Ok(workflow)
    }

    /// Run a workflow that others may read while it executes.
    ///
    /// # Errors
    /// Fails before anything runs if the workflow is not PENDING or its DAG
    /// or config is invalid.
    pub async fn execute_shared(&self, shared: &Arc<RwLock<Workflow>>) -> Result<()> {
        let id = shared.read().await.id;
        Scope::workflow(id).run(self.run(shared)).await
    }

    async fn run(&self, shared: &Arc<RwLock<Workflow>>) -> Result<()> {
        let (workflow_id, config, dag, total) = {
            let mut workflow = shared.write().await;
            let dag = workflow.validate()?;
            workflow.transition(WorkflowStatus::Running)?;
            (
                workflow.id,
                workflow.config.clone(),
                dag,
                workflow.tasks.len(),
            )
        };

        clog!(
            "Workflow {} started: {} tasks, strategy={}, breadth={}, depth={}",
            workflow_id.short(),
            total,
            config.strategy,
            config.breadth,
            config.depth
        );
        self.progress.emit(
            ProgressEvent::new(
                EventType::WorkflowStarted,
                workflow_id,
                format!("Workflow started with {} tasks", total),
            )
            .with_data(serde_json::json!({
                "total_tasks": total,
                "strategy": config.strategy,
                "breadth": config.breadth,
            })),
        );

        let started = Instant::now();
        let deadline = config.workflow_timeout().map(|t| started + t);
        let control = Arc::new(RunControl::new(self.cancel.clone(), deadline));
        let executor = executor_for(config.strategy);

        let ctx = Arc::new(ExecutionContext {
            workflow_id,
            workflow: Arc::clone(shared),
            dag: RwLock::new(Arc::new(dag)),
            runner: Arc::clone(&self.runner),
            expander: self.expander.clone(),
            progress: self.progress.clone(),
            pool: WorkerPool::new(config.breadth),
            control: Arc::clone(&control),
            config: config.clone(),
        });
        let mut iterations = 0;

        while iterations < config.depth {
            let ready = {
                let dag = ctx.dag().await;
                let workflow = shared.read().await;
                if !workflow.has_unresolved_tasks() {
                    break;
                }
                dag.ready_set(&workflow.tasks)
            };
            if let Some(reason) = control.check() {
                clog_debug!("Workflow {} halting: {}", workflow_id.short(), reason);
                break;
            }
            if ready.is_empty() {
                clog_warn!("Workflow {} has pending tasks but none ready", workflow_id.short());
                break;
            }

            iterations += 1;
            clog_debug!("Iteration {}: ready {:?}", iterations, ready);
            self.emit_iteration(shared, EventType::IterationStarted, iterations, ready.len())
                .await;

            let reports = executor.run(&ctx, ready).await;
            ctx.propagate_skips().await;

            self.emit_iteration(shared, EventType::IterationCompleted, iterations, reports.len())
                .await;
        }

        let mut workflow = shared.write().await;

        let halt = match control.halt_reason() {
            Some(reason) => Some(reason),
            None if workflow.has_unresolved_tasks() => Some(HaltReason::IterationLimit),
            None => None,
        };

        let leftover: Vec<TaskId> = workflow
            .tasks
            .values()
            .filter(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
            .map(|t| t.id.clone())
            .collect();
        for id in &leftover {
            let Some(task) = workflow.tasks.get_mut(id) else {
                continue;
            };
            let result = match &halt {
                Some(HaltReason::Cancelled) => task.cancel(TaskError::new(
                    TaskErrorKind::Cancelled,
                    "workflow cancelled before the task started",
                )),
                Some(HaltReason::WorkflowTimeout) => task.skip(TaskError::new(
                    TaskErrorKind::WorkflowTimeout,
                    "workflow timed out before the task started",
                )),
                Some(HaltReason::TaskFailure(failed)) => task.skip(TaskError::new(
                    TaskErrorKind::Aborted,
                    format!("workflow aborted after task {} failed", failed),
                )),
                Some(HaltReason::IterationLimit) | None => task.skip(TaskError::new(
                    TaskErrorKind::Aborted,
                    format!("iteration limit of {} reached", config.depth),
                )),
            };
            match result {
                Ok(()) => ctx.emit_task_terminal(&workflow, id),
                Err(e) => clog_error!("Cannot settle task {}: {}", id, e),
            }
        }

        let status = if halt == Some(HaltReason::Cancelled) {
            WorkflowStatus::Cancelled
        } else if halt.is_some() || workflow.tasks.values().any(|t| t.status.is_unsuccessful()) {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Completed
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let results = WorkflowResults::collect(&workflow.tasks, elapsed_ms, iterations, halt);
        let summary = serde_json::to_value(&results.summary).unwrap_or_default();
        workflow.results = Some(results);
        workflow.transition(status)?;

        let (event_type, message) = match status {
            WorkflowStatus::Completed => (EventType::WorkflowCompleted, "Workflow completed".to_string()),
            other => (EventType::WorkflowFailed, format!("Workflow {}", other)),
        };
        clog!(
            "Workflow {} {} after {} iterations in {}ms",
            workflow_id.short(),
            status,
            iterations,
            elapsed_ms
        );
        self.progress.emit(
            ProgressEvent::new(event_type, workflow_id, message)
                .with_percent(workflow.progress_percent())
                .with_data(serde_json::json!({
                    "status": status,
                    "summary": summary,
                })),
        );

        Ok(())
    }

    async fn emit_iteration(
        &self,
        shared: &Arc<RwLock<Workflow>>,
        event_type: EventType,
        iteration: usize,
        tasks: usize,
    ) {
        let workflow = shared.read().await;
        let verb = if event_type == EventType::IterationStarted {
            "dispatching"
        } else {
            "finished"
        };
        self.progress.emit(
            ProgressEvent::new(
                event_type,
                workflow.id,
                format!("Iteration {} {} {} tasks", iteration, verb, tasks),
            )
            .with_percent(workflow.progress_percent())
            .with_data(serde_json::json!({ "iteration": iteration, "tasks": tasks })),
        );
    }
}
