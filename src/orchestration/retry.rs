//! Per-task timeout and exponential-backoff retry.
//!
//! A single runner attempt is classified into an [`Outcome`]. The
//! [`RetryController`] drives one task from READY to a terminal status,
//! re-queueing it after each retryable failure until `max_retries` is spent.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::{ContextMap, TaskError, TaskErrorKind, TaskId, TaskStatus};
use crate::log::Scope;
use crate::workflow::{FailurePolicy, HaltReason};
use crate::{clog_debug, clog_error, clog_warn};

use super::context::{ExecutionContext, TaskReport};
use super::progress::EventType;
use super::runner::{TaskInvocation, TaskRunner};

/// Backoff timing. The delay before retry `n` (0-based) is
/// `base_delay_ms * 2^n`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt_count);
        let ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Classified result of one runner attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ContextMap),
    Retryable(TaskError),
    Fatal(TaskError),
}

impl From<Result<ContextMap, TaskError>> for Outcome {
    fn from(result: Result<ContextMap, TaskError>) -> Self {
        match result {
            Ok(output) => Outcome::Success(output),
            Err(e) if e.retryable => Outcome::Retryable(e),
            Err(e) => Outcome::Fatal(e),
        }
    }
}

/// Run one attempt under the per-task timeout.
///
/// A timeout is a retryable failure.
pub async fn run_attempt(
    runner: &dyn TaskRunner,
    invocation: TaskInvocation,
    timeout: Duration,
) -> Outcome {
    match tokio::time::timeout(timeout, runner.execute(invocation)).await {
        Ok(result) => Outcome::from(result),
        Err(_) => Outcome::Retryable(TaskError {
            kind: TaskErrorKind::Timeout,
            message: format!("timed out after {}s", timeout.as_secs_f64()),
            retryable: true,
        }),
    }
}

/// Drives a single task through its attempts.
pub struct RetryController<'a> {
    ctx: &'a ExecutionContext,
}

impl<'a> RetryController<'a> {
    pub fn new(ctx: &'a ExecutionContext) -> Self {
        Self { ctx }
    }

    /// Run a READY task until it reaches a terminal status.
    pub async fn run(&self, task_id: &TaskId) -> TaskReport {
        let scope = Scope::current()
            .unwrap_or_else(|| Scope::workflow(self.ctx.workflow_id))
            .with_task(task_id.clone());
        scope.run(self.attempts(task_id)).await
    }

    async fn attempts(&self, task_id: &TaskId) -> TaskReport {
        loop {
            let Some(invocation) = self.begin_attempt(task_id).await else {
                return self.report(task_id).await;
            };
            let attempt = invocation.attempt;

            let outcome = run_attempt(
                self.ctx.runner.as_ref(),
                invocation,
                self.ctx.config.task_timeout(),
            )
            .await;

            let error = match outcome {
                Outcome::Success(output) => return self.complete(task_id, output).await,
                Outcome::Fatal(error) => return self.fail(task_id, error).await,
                Outcome::Retryable(error) => error,
            };

            if !self.ctx.config.enable_retry {
                return self.fail(task_id, error).await;
            }

            let (attempt_count, max_retries) = {
                let workflow = self.ctx.workflow.read().await;
                match workflow.task(task_id) {
                    Some(task) => (task.attempt_count, task.max_retries),
                    None => return self.report(task_id).await,
                }
            };

            if attempt_count >= max_retries {
                let exhausted = TaskError::new(
                    TaskErrorKind::RetryExhausted,
                    format!("gave up after {} attempts: {}", attempt, error),
                );
                return self.fail(task_id, exhausted).await;
            }

            let delay = self.ctx.config.retry.delay_for(attempt_count);
            clog_debug!(
                "Task {} attempt {} failed ({}), retrying in {:?}",
                task_id,
                attempt,
                error,
                delay
            );

            if let Some(reason) = self.backoff(delay).await {
                return self.abandon(task_id, reason, error).await;
            }

            let requeued = {
                let mut workflow = self.ctx.workflow.write().await;
                workflow.tasks.get_mut(task_id).map(|t| t.requeue())
            };
            if let Some(Err(e)) = requeued {
                clog_error!("Cannot requeue task {}: {}", task_id, e);
                return self.report(task_id).await;
            }
        }
    }

    /// READY -> RUNNING, building the invocation from the current context.
    async fn begin_attempt(&self, task_id: &TaskId) -> Option<TaskInvocation> {
        let mut workflow = self.ctx.workflow.write().await;
        let input = workflow.task_input(task_id)?;
        let task = workflow.tasks.get_mut(task_id)?;

        if let Err(e) = task.start() {
            clog_error!("Cannot start task {}: {}", task_id, e);
            return None;
        }
        let invocation = TaskInvocation {
            task_id: task.id.clone(),
            name: task.name.clone(),
            kind: task.kind,
            attempt: task.attempts(),
            input,
        };

        if invocation.attempt == 1 {
            clog_debug!("Task {} started", task_id);
            self.ctx.emit_task(
                &workflow,
                EventType::TaskStarted,
                task_id,
                format!("Task {} started", invocation.name),
                None,
            );
        }
        Some(invocation)
    }

    /// Sleep out the backoff unless the run stops first.
    async fn backoff(&self, delay: Duration) -> Option<HaltReason> {
        if let Some(reason) = self.ctx.control.check() {
            return Some(reason);
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.ctx.control.stopped() => {}
        }
        self.ctx.control.check()
    }

    async fn complete(&self, task_id: &TaskId, output: ContextMap) -> TaskReport {
        let mut workflow = self.ctx.workflow.write().await;
        if let Some(task) = workflow.tasks.get_mut(task_id) {
            if let Err(e) = task.complete(output) {
                clog_error!("Cannot complete task {}: {}", task_id, e);
            }
        }
        self.ctx.emit_task_terminal(&workflow, task_id);
        self.snapshot(&workflow, task_id)
    }

    async fn fail(&self, task_id: &TaskId, error: TaskError) -> TaskReport {
        clog_warn!("Task {} failed: {}", task_id, error);
        let mut workflow = self.ctx.workflow.write().await;
        if let Some(task) = workflow.tasks.get_mut(task_id) {
            if let Err(e) = task.fail(error) {
                clog_error!("Cannot fail task {}: {}", task_id, e);
            }
        }
        if self.ctx.config.on_task_failure == FailurePolicy::AbortWorkflow {
            self.ctx.control.halt(HaltReason::TaskFailure(task_id.clone()));
        }
        self.ctx.emit_task_terminal(&workflow, task_id);
        self.snapshot(&workflow, task_id)
    }

    /// The run stopped while this task was waiting to retry.
    async fn abandon(&self, task_id: &TaskId, reason: HaltReason, last: TaskError) -> TaskReport {
        clog_debug!("Task {} retry abandoned: {}", task_id, reason);
        let mut workflow = self.ctx.workflow.write().await;
        if let Some(task) = workflow.tasks.get_mut(task_id) {
            let result = match &reason {
                HaltReason::Cancelled => task.cancel(TaskError::new(
                    TaskErrorKind::Cancelled,
                    format!("workflow cancelled before retry; last error: {}", last),
                )),
                HaltReason::WorkflowTimeout => task.fail(TaskError::new(
                    TaskErrorKind::WorkflowTimeout,
                    format!("workflow timed out before retry; last error: {}", last),
                )),
                other => task.fail(TaskError::new(
                    TaskErrorKind::Aborted,
                    format!("retry abandoned ({}); last error: {}", other, last),
                )),
            };
            if let Err(e) = result {
                clog_error!("Cannot abandon task {}: {}", task_id, e);
            }
        }
        self.ctx.emit_task_terminal(&workflow, task_id);
        self.snapshot(&workflow, task_id)
    }

    fn snapshot(&self, workflow: &crate::workflow::Workflow, task_id: &TaskId) -> TaskReport {
        TaskReport {
            task_id: task_id.clone(),
            status: workflow.task(task_id).map(|t| t.status).unwrap_or_default(),
        }
    }

    async fn report(&self, task_id: &TaskId) -> TaskReport {
        TaskReport {
            task_id: task_id.clone(),
            status: self.ctx.status_of(task_id).await,
        }
    }
}

impl TaskReport {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}
