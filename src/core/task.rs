//! Task data model for the execution DAG.
//!
//! Tasks are the atomic units of work handed to a [`TaskRunner`]. Each task
//! tracks its dependencies, status, retry bookkeeping and outcome.
//!
//! [`TaskRunner`]: crate::orchestration::TaskRunner

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Typed key-value payload carried into and out of tasks.
pub type ContextMap = BTreeMap<String, serde_json::Value>;

/// Unique identifier for a task within a workflow.
///
/// Ids are caller-chosen strings (`"plan"`, `"research_a"`); [`TaskId::generate`]
/// produces a short random one when the caller does not care.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create a task identifier from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create a random identifier of the form `task-1a2b3c4d`.
    pub fn generate() -> Self {
        Self(format!("task-{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scheduling hint describing how a task expects to be run.
///
/// This never changes what the task does; the runner owns that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Sequential,
    Parallel,
    Hybrid,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Sequential => write!(f, "sequential"),
            TaskKind::Parallel => write!(f, "parallel"),
            TaskKind::Hybrid => write!(f, "hybrid"),
        }
    }
}

/// Tie-break hint among ready tasks. Never overrides dependency order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskPriority::Low => write!(f, "low"),
            TaskPriority::Normal => write!(f, "normal"),
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Critical => write!(f, "critical"),
        }
    }
}

/// Task status in its lifecycle.
///
/// ```text
/// Pending -> Ready -> Running -> Completed
///                       |  \
///                       |   -> Ready (retry, attempt_count + 1)
///                       -> Failed (retries exhausted)
/// Pending/Ready --(dependency failed)--> Skipped
/// any non-terminal --(cancel)--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task created, dependencies not yet satisfied or not yet evaluated.
    #[default]
    Pending,
    /// Dependencies satisfied, waiting for a worker slot.
    Ready,
    /// The runner is executing the task.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed after exhausting its retries.
    Failed,
    /// Workflow was cancelled before the task finished.
    Cancelled,
    /// A dependency ended unsuccessfully, so the task can never run.
    Skipped,
}

impl TaskStatus {
    /// Whether no further transition may happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    /// Terminal states that block every dependent.
    pub fn is_unsuccessful(&self) -> bool {
        matches!(
            self,
            TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Skipped
        )
    }

    /// Check whether the state machine allows moving to `target`.
    pub fn can_transition(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, target),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Skipped)
                | (Ready, Cancelled)
                | (Ready, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Ready)
                | (Running, Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Ready => write!(f, "ready"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
            TaskStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Classification of a task-local failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// The runner reported an error.
    Execution,
    /// The runner exceeded the per-task timeout.
    Timeout,
    /// Terminal failure after `max_retries` retries.
    RetryExhausted,
    /// A dependency failed, was cancelled or was skipped.
    DependencyFailed,
    /// The workflow was cancelled.
    Cancelled,
    /// The workflow wall clock ran out.
    WorkflowTimeout,
    /// The workflow stopped dispatching (fail-fast policy or iteration limit).
    Aborted,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskErrorKind::Execution => write!(f, "execution"),
            TaskErrorKind::Timeout => write!(f, "timeout"),
            TaskErrorKind::RetryExhausted => write!(f, "retry_exhausted"),
            TaskErrorKind::DependencyFailed => write!(f, "dependency_failed"),
            TaskErrorKind::Cancelled => write!(f, "cancelled"),
            TaskErrorKind::WorkflowTimeout => write!(f, "workflow_timeout"),
            TaskErrorKind::Aborted => write!(f, "aborted"),
        }
    }
}

/// A task-local error, recorded on the task and reported in results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    /// Whether another attempt could succeed. Only meaningful for errors
    /// produced by a runner.
    #[serde(default)]
    pub retryable: bool,
}

impl TaskError {
    /// An execution error worth retrying.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
            retryable: true,
        }
    }

    /// An execution error that retrying cannot fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Execution,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TaskError {}

/// A single task in the execution DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier within the owning workflow.
    pub id: TaskId,
    /// Human-readable name for the task.
    pub name: String,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    /// Ids of tasks that must complete before this one may run.
    pub depends_on: BTreeSet<TaskId>,
    pub status: TaskStatus,
    /// Input payload, merged with dependency results before execution.
    pub context: ContextMap,
    /// Output recorded on success.
    pub result: Option<ContextMap>,
    /// Root cause recorded on unsuccessful terminal transitions.
    pub error: Option<TaskError>,
    /// Number of retries performed so far.
    pub attempt_count: u32,
    pub max_retries: u32,
    /// How many expansion generations separate this task from the original
    /// graph (0 for tasks created by the builder).
    #[serde(default)]
    pub expansion_depth: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task with no dependencies.
    pub fn new(id: impl Into<TaskId>, name: &str) -> Self {
        Self {
            id: id.into(),
            name: name.to_string(),
            kind: TaskKind::default(),
            priority: TaskPriority::default(),
            depends_on: BTreeSet::new(),
            status: TaskStatus::Pending,
            context: ContextMap::new(),
            result: None,
            error: None,
            attempt_count: 0,
            max_retries: 0,
            expansion_depth: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, target: TaskStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: format!("{} ({})", self.status, self.id),
                to: target.to_string(),
            });
        }
        self.status = target;
        Ok(())
    }

    /// Dependencies satisfied; the task may be dispatched.
    pub fn mark_ready(&mut self) -> Result<()> {
        self.transition(TaskStatus::Ready)
    }

    /// The runner is about to be invoked.
    ///
    /// `started_at` keeps the first attempt's time across retries.
    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskStatus::Running)?;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a successful outcome.
    pub fn complete(&mut self, result: ContextMap) -> Result<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Record a terminal failure.
    pub fn fail(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Failed)?;
        self.finish_with(error);
        Ok(())
    }

    /// Re-queue after a failed attempt.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(TaskStatus::Ready)?;
        self.attempt_count += 1;
        Ok(())
    }

    /// A dependency ended unsuccessfully; the task will never run.
    pub fn skip(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Skipped)?;
        self.finish_with(error);
        Ok(())
    }

    /// The workflow was cancelled before this task finished.
    pub fn cancel(&mut self, error: TaskError) -> Result<()> {
        self.transition(TaskStatus::Cancelled)?;
        self.finish_with(error);
        Ok(())
    }

    fn finish_with(&mut self, error: TaskError) {
        self.result = None;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    /// Total runner invocations so far, counting the one in flight.
    pub fn attempts(&self) -> u32 {
        self.attempt_count + 1
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall time between first start and terminal transition.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at? - self.started_at?)
    }
}
