//! Core workflow type definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::core::{ContextMap, Task, TaskDAG, TaskError, TaskId, TaskMap, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::RetryPolicy;

use super::state::{StatusHistoryEntry, WorkflowStatus};

/// Unique identifier for a workflow instance.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    /// Create a new unique workflow identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkflowId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// How the orchestrator drives a ready set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// One task at a time, results visible to the next task immediately.
    Sequential,
    /// The ready set runs concurrently, bounded by `breadth`.
    Parallel,
    /// Topological stages in order, each stage run in parallel.
    #[default]
    Hybrid,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStrategy::Sequential => write!(f, "sequential"),
            ExecutionStrategy::Parallel => write!(f, "parallel"),
            ExecutionStrategy::Hybrid => write!(f, "hybrid"),
        }
    }
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutionStrategy::Sequential),
            "parallel" => Ok(ExecutionStrategy::Parallel),
            "hybrid" => Ok(ExecutionStrategy::Hybrid),
            other => Err(format!(
                "unknown strategy '{}' (expected sequential, parallel or hybrid)",
                other
            )),
        }
    }
}

/// What happens to the rest of the workflow when a task fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip the failed task's dependents; independent branches keep going.
    #[default]
    ContinueIndependent,
    /// Stop dispatching new work after the first failed task.
    AbortWorkflow,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::ContinueIndependent => write!(f, "continue_independent"),
            FailurePolicy::AbortWorkflow => write!(f, "abort_workflow"),
        }
    }
}

/// Bounds on dynamic task expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpansionLimits {
    /// Tasks at this expansion depth are never expanded further.
    pub max_depth: u32,
    /// Upper bound on specs accepted from a single expansion.
    pub max_new_tasks: usize,
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_new_tasks: 10,
        }
    }
}

/// Configuration for workflow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Maximum number of tasks running at once.
    pub breadth: usize,
    /// Maximum number of orchestration iterations.
    pub depth: usize,
    /// Per-attempt task timeout.
    pub timeout_seconds: u64,
    pub enable_retry: bool,
    /// Retries granted to tasks that don't set their own.
    pub default_max_retries: u32,
    pub retry: RetryPolicy,
    pub strategy: ExecutionStrategy,
    pub on_task_failure: FailurePolicy,
    /// Wall clock budget for the whole run, unlimited when absent.
    pub workflow_timeout_seconds: Option<u64>,
    pub expansion: ExpansionLimits,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            breadth: 3,
            depth: 5,
            timeout_seconds: 300,
            enable_retry: true,
            default_max_retries: 3,
            retry: RetryPolicy::default(),
            strategy: ExecutionStrategy::default(),
            on_task_failure: FailurePolicy::default(),
            workflow_timeout_seconds: None,
            expansion: ExpansionLimits::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.breadth == 0 {
            return Err(Error::Validation("breadth must be at least 1".to_string()));
        }
        if self.depth == 0 {
            return Err(Error::Validation("depth must be at least 1".to_string()));
        }
        if self.timeout_seconds == 0 {
            return Err(Error::Validation(
                "timeout_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds)
    }

    pub fn workflow_timeout(&self) -> Option<std::time::Duration> {
        self.workflow_timeout_seconds
            .map(std::time::Duration::from_secs)
    }
}

/// Why the orchestrator stopped before resolving every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// An external cancel request.
    Cancelled,
    /// `workflow_timeout_seconds` elapsed.
    WorkflowTimeout,
    /// Fail-fast policy tripped on this task.
    TaskFailure(TaskId),
    /// `depth` iterations ran out with work left.
    IterationLimit,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Cancelled => write!(f, "cancelled"),
            HaltReason::WorkflowTimeout => write!(f, "workflow timeout"),
            HaltReason::TaskFailure(id) => write!(f, "task {} failed", id),
            HaltReason::IterationLimit => write!(f, "iteration limit reached"),
        }
    }
}

/// Counts and rates over the final task statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub total_tasks: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub cancelled_count: usize,
    /// `completed_count / total_tasks`, rounded to four decimals.
    pub success_rate: f64,
    pub elapsed_ms: u64,
    pub iterations: usize,
}

/// Root cause of one unsuccessful task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub task_name: String,
    pub status: TaskStatus,
    pub error: Option<TaskError>,
    pub attempts: u32,
}

/// Aggregated outcome, populated on the terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowResults {
    pub summary: WorkflowSummary,
    /// Results of every completed task.
    pub outputs: BTreeMap<TaskId, ContextMap>,
    /// Every task that did not complete, with its recorded error.
    pub failures: Vec<TaskFailure>,
    pub halt_reason: Option<HaltReason>,
}

impl WorkflowResults {
    /// Aggregate the final state of a task map.
    pub fn collect(
        tasks: &TaskMap,
        elapsed_ms: u64,
        iterations: usize,
        halt_reason: Option<HaltReason>,
    ) -> Self {
        let count = |status: TaskStatus| tasks.values().filter(|t| t.status == status).count();
        let total_tasks = tasks.len();
        let completed_count = count(TaskStatus::Completed);
        let success_rate = if total_tasks == 0 {
            1.0
        } else {
            ((completed_count as f64 / total_tasks as f64) * 10_000.0).round() / 10_000.0
        };

        let outputs = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| (t.id.clone(), t.result.clone().unwrap_or_default()))
            .collect();

        let failures = tasks
            .values()
            .filter(|t| t.status.is_unsuccessful())
            .map(|t| TaskFailure {
                task_id: t.id.clone(),
                task_name: t.name.clone(),
                status: t.status,
                error: t.error.clone(),
                attempts: if t.started_at.is_some() { t.attempts() } else { 0 },
            })
            .collect();

        Self {
            summary: WorkflowSummary {
                total_tasks,
                completed_count,
                failed_count: count(TaskStatus::Failed),
                skipped_count: count(TaskStatus::Skipped),
                cancelled_count: count(TaskStatus::Cancelled),
                success_rate,
                elapsed_ms,
                iterations,
            },
            outputs,
            failures,
            halt_reason,
        }
    }
}

/// A named DAG of tasks plus its execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config: WorkflowConfig,
    pub status: WorkflowStatus,
    pub tasks: TaskMap,
    /// Context visible to every task, grown by completed task results.
    #[serde(default)]
    pub shared_context: ContextMap,
    pub results: Option<WorkflowResults>,
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Workflow {
    /// Create an empty pending workflow.
    pub fn new(name: &str, config: WorkflowConfig) -> Self {
        let created_at = Utc::now();
        Self {
            id: WorkflowId::new(),
            name: name.to_string(),
            description: String::new(),
            config,
            status: WorkflowStatus::Pending,
            tasks: TaskMap::new(),
            shared_context: ContextMap::new(),
            results: None,
            status_history: vec![StatusHistoryEntry {
                status: WorkflowStatus::Pending,
                entered_at: created_at,
            }],
            created_at,
            started_at: None,
            completed_at: None,
        }
    }

    /// Check the config and the dependency graph.
    pub fn validate(&self) -> Result<TaskDAG> {
        self.config.validate()?;
        TaskDAG::build(&self.tasks)
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.values().filter(|t| t.status == status).count()
    }

    /// `completed / total * 100`.
    pub fn progress_percent(&self) -> f64 {
        if self.tasks.is_empty() {
            return if self.status.is_terminal() { 100.0 } else { 0.0 };
        }
        self.count_with_status(TaskStatus::Completed) as f64 / self.tasks.len() as f64 * 100.0
    }

    /// The input handed to a task's runner.
    ///
    /// Starts from the shared context, layers the task's own payload on top,
    /// then applies dependency results in completion order (ties by id), so
    /// a later result overrides an earlier one on key collision.
    pub fn task_input(&self, id: &TaskId) -> Option<ContextMap> {
        let task = self.tasks.get(id)?;
        let mut input = self.shared_context.clone();
        input.extend(task.context.clone());

        let deps = completion_order(task.depends_on.iter().filter_map(|d| self.tasks.get(d)));
        for dep in deps {
            if let Some(result) = &dep.result {
                input.extend(result.clone());
            }
        }
        Some(input)
    }

    /// Fold the results of completed tasks into the shared context, in
    /// completion order.
    pub fn merge_results(&mut self, ids: &[TaskId]) {
        let results: Vec<ContextMap> = completion_order(ids.iter().filter_map(|id| self.tasks.get(id)))
            .into_iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| t.result.clone())
            .collect();
        for result in results {
            self.shared_context.extend(result);
        }
    }

    /// Whether any task can still be dispatched.
    pub fn has_unresolved_tasks(&self) -> bool {
        self.tasks
            .values()
            .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Ready))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a serialized workflow and re-validate its DAG.
    pub fn from_json(json: &str) -> Result<Self> {
        let workflow: Self = serde_json::from_str(json)?;
        workflow.validate()?;
        Ok(workflow)
    }
}

fn completion_order<'a>(tasks: impl Iterator<Item = &'a Task>) -> Vec<&'a Task> {
    let mut ordered: Vec<&Task> = tasks.collect();
    ordered.sort_by(|a, b| {
        a.completed_at
            .cmp(&b.completed_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    ordered
}
