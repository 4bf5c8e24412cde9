//! Execution strategies.
//!
//! Each executor takes a ready-set snapshot (already in dispatch order) and
//! drives it to terminal statuses through the [`RetryController`]. Every
//! barrier also offers the finished tasks to the expander. They differ in
//! how much runs at once and when results become visible in the shared
//! context:
//!
//! - [`SequentialExecutor`]: one task at a time, results merged immediately
//! - [`ParallelExecutor`]: up to `breadth` at once, results merged at the barrier
//! - [`HybridExecutor`]: topological stages in order, each run in parallel

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::{TaskError, TaskErrorKind, TaskId};
use crate::log::Scope;
use crate::workflow::ExecutionStrategy;
use crate::{clog_debug, clog_error};

use super::context::{ExecutionContext, TaskReport};
use super::pool::WorkerSlot;
use super::retry::RetryController;

#[async_trait]
pub trait Executor: Send + Sync {
    fn strategy(&self) -> ExecutionStrategy;

    /// Run a ready-set snapshot. Returns one report per dispatched task;
    /// tasks left undispatched because the run stopped stay READY.
    async fn run(&self, ctx: &Arc<ExecutionContext>, ready: Vec<TaskId>) -> Vec<TaskReport>;
}

pub fn executor_for(strategy: ExecutionStrategy) -> Box<dyn Executor> {
    match strategy {
        ExecutionStrategy::Sequential => Box::new(SequentialExecutor),
        ExecutionStrategy::Parallel => Box::new(ParallelExecutor),
        ExecutionStrategy::Hybrid => Box::new(HybridExecutor),
    }
}

pub struct SequentialExecutor;

#[async_trait]
impl Executor for SequentialExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Sequential
    }

    async fn run(&self, ctx: &Arc<ExecutionContext>, ready: Vec<TaskId>) -> Vec<TaskReport> {
        let queue = ctx.mark_ready(&ready).await;
        let mut reports = Vec::with_capacity(queue.len());

        for task_id in queue {
            if let Some(reason) = ctx.control.check() {
                clog_debug!("Sequential dispatch stopped: {}", reason);
                break;
            }
            let Some(_slot) = ctx.pool.acquire().await else {
                break;
            };

            let report = RetryController::new(ctx).run(&task_id).await;
            ctx.merge_results(std::slice::from_ref(&report)).await;
            reports.push(report);
        }

        ctx.expand(&reports).await;
        reports
    }
}

pub struct ParallelExecutor;

#[async_trait]
impl Executor for ParallelExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Parallel
    }

    async fn run(&self, ctx: &Arc<ExecutionContext>, ready: Vec<TaskId>) -> Vec<TaskReport> {
        let mut queue: VecDeque<TaskId> = ctx.mark_ready(&ready).await.into();
        let mut running = FuturesUnordered::new();
        let mut reports = Vec::with_capacity(queue.len());

        loop {
            while !queue.is_empty() {
                if let Some(reason) = ctx.control.check() {
                    clog_debug!(
                        "Parallel dispatch stopped with {} queued: {}",
                        queue.len(),
                        reason
                    );
                    queue.clear();
                    break;
                }
                let Some(slot) = ctx.pool.try_acquire() else {
                    break;
                };
                let Some(task_id) = queue.pop_front() else {
                    break;
                };
                running.push(spawn_task(Arc::clone(ctx), task_id, slot));
            }

            match running.next().await {
                Some(report) => reports.push(report),
                None => break,
            }
        }

        ctx.merge_results(&reports).await;
        ctx.expand(&reports).await;
        reports
    }
}

/// Run one task on its own tokio task, holding `slot` until it finishes.
async fn spawn_task(ctx: Arc<ExecutionContext>, task_id: TaskId, slot: WorkerSlot) -> TaskReport {
    let handle = {
        let ctx = Arc::clone(&ctx);
        let task_id = task_id.clone();
        let scope = Scope::current().unwrap_or_default();
        tokio::spawn(scope.run(async move {
            let _slot = slot;
            RetryController::new(&ctx).run(&task_id).await
        }))
    };

    match handle.await {
        Ok(report) => report,
        Err(e) => {
            clog_error!("Task {} runner panicked: {}", task_id, e);
            let mut workflow = ctx.workflow.write().await;
            if let Some(task) = workflow.tasks.get_mut(&task_id) {
                let error = TaskError::new(
                    TaskErrorKind::Execution,
                    format!("runner panicked: {}", e),
                );
                if let Err(e) = task.fail(error) {
                    clog_error!("Cannot fail task {} after panic: {}", task_id, e);
                }
            }
            ctx.emit_task_terminal(&workflow, &task_id);
            TaskReport {
                status: workflow.task(&task_id).map(|t| t.status).unwrap_or_default(),
                task_id,
            }
        }
    }
}

pub struct HybridExecutor;

#[async_trait]
impl Executor for HybridExecutor {
    fn strategy(&self) -> ExecutionStrategy {
        ExecutionStrategy::Hybrid
    }

    /// Runs stage after stage until the pending sub-DAG is exhausted. The
    /// first stage is the given ready set; each later stage is recomputed
    /// after the previous barrier so dependents of failures drop out and
    /// tasks added by expansion join.
    async fn run(&self, ctx: &Arc<ExecutionContext>, ready: Vec<TaskId>) -> Vec<TaskReport> {
        let planned = {
            let dag = ctx.dag().await;
            let workflow = ctx.workflow.read().await;
            dag.stages(&workflow.tasks)
        };
        clog_debug!(
            "Hybrid plan: {} stages {:?}",
            planned.len(),
            planned.iter().map(|s| s.len()).collect::<Vec<_>>()
        );

        let mut reports = Vec::new();
        let mut stage = ready;
        let mut index = 0;

        while !stage.is_empty() {
            if let Some(reason) = ctx.control.check() {
                clog_debug!("Hybrid stopped before stage {}: {}", index, reason);
                break;
            }
            clog_debug!("Stage {}: {:?}", index, stage);

            reports.extend(ParallelExecutor.run(ctx, stage).await);
            ctx.propagate_skips().await;

            index += 1;
            stage = {
                let dag = ctx.dag().await;
                let workflow = ctx.workflow.read().await;
                dag.stages(&workflow.tasks)
                    .into_iter()
                    .next()
                    .unwrap_or_default()
            };
        }

        reports
    }
}
