//! The task runner seam.
//!
//! Conductor never knows what a task does. Work is plugged in through a
//! [`TaskRunner`], which receives the task's merged input and returns either
//! a result map or a [`TaskError`] saying whether a retry could help.

use async_trait::async_trait;
use std::future::Future;

use crate::core::{ContextMap, TaskError, TaskId, TaskKind};

/// Everything a runner gets to see for one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInvocation {
    pub task_id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Shared context, then the task payload, then dependency results.
    pub input: ContextMap,
}

/// Capability that performs a task's work.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn execute(&self, invocation: TaskInvocation) -> Result<ContextMap, TaskError>;
}

/// Adapts an async closure into a [`TaskRunner`].
///
/// ```
/// use conductor::core::ContextMap;
/// use conductor::orchestration::{FnRunner, TaskInvocation};
///
/// let runner = FnRunner::new(|inv: TaskInvocation| async move {
///     let mut out = ContextMap::new();
///     out.insert(inv.task_id.to_string(), serde_json::json!("done"));
///     Ok(out)
/// });
/// # let _ = runner;
/// ```
pub struct FnRunner<F> {
    func: F,
}

impl<F, Fut> FnRunner<F>
where
    F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContextMap, TaskError>> + Send + 'static,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskRunner for FnRunner<F>
where
    F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ContextMap, TaskError>> + Send + 'static,
{
    async fn execute(&self, invocation: TaskInvocation) -> Result<ContextMap, TaskError> {
        (self.func)(invocation).await
    }
}
