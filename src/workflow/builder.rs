//! Fluent construction of validated workflows.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::core::{ContextMap, Task, TaskDAG, TaskId, TaskKind, TaskPriority};
use crate::error::{Error, Result};

use super::{ExecutionStrategy, FailurePolicy, Workflow, WorkflowConfig};

/// Description of a task before it joins a workflow.
///
/// The task id defaults to the name, so small definitions can refer to
/// dependencies by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TaskId>,
    pub name: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub payload: ContextMap,
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Overrides the workflow's `default_max_retries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskSpec {
    pub fn new(name: &str) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            kind: TaskKind::default(),
            priority: TaskPriority::default(),
            payload: ContextMap::new(),
            depends_on: Vec::new(),
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: ContextMap) -> Self {
        self.payload = payload;
        self
    }

    pub fn depends_on<I, T>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TaskId>,
    {
        self.depends_on.extend(deps.into_iter().map(Into::into));
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// The id this spec will be stored under.
    pub fn task_id(&self) -> TaskId {
        self.id
            .clone()
            .unwrap_or_else(|| TaskId::new(self.name.clone()))
    }

    /// Materialize a pending task.
    pub fn into_task(self, default_max_retries: u32) -> Task {
        let mut task = Task::new(self.task_id(), &self.name);
        task.kind = self.kind;
        task.priority = self.priority;
        task.context = self.payload;
        task.depends_on = self.depends_on.into_iter().collect::<BTreeSet<_>>();
        task.max_retries = self.max_retries.unwrap_or(default_max_retries);
        task
    }
}

/// Builds a [`Workflow`], validating the DAG before handing it out.
///
/// # Example
///
/// ```
/// use conductor::core::{ContextMap, TaskKind};
/// use conductor::workflow::WorkflowBuilder;
///
/// let workflow = WorkflowBuilder::new("report")
///     .add_task("plan", ContextMap::new(), TaskKind::Sequential, &[])
///     .add_task("write", ContextMap::new(), TaskKind::Sequential, &["plan"])
///     .build()
///     .unwrap();
/// assert_eq!(workflow.tasks.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    description: String,
    config: WorkflowConfig,
    specs: Vec<TaskSpec>,
}

impl WorkflowBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            config: WorkflowConfig::default(),
            specs: Vec::new(),
        }
    }

    pub fn description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    /// Add a task with an explicit dependency list.
    pub fn add_task(
        mut self,
        name: &str,
        payload: ContextMap,
        kind: TaskKind,
        depends_on: &[&str],
    ) -> Self {
        self.specs.push(
            TaskSpec::new(name)
                .with_payload(payload)
                .with_kind(kind)
                .depends_on(depends_on.iter().copied()),
        );
        self
    }

    /// Add a fully specified task.
    pub fn add_spec(mut self, spec: TaskSpec) -> Self {
        self.specs.push(spec);
        self
    }

    /// Add tasks that share one dependency set; all are marked `Parallel`.
    pub fn add_parallel_tasks(mut self, specs: Vec<TaskSpec>, depends_on: &[&str]) -> Self {
        for spec in specs {
            self.specs.push(
                spec.with_kind(TaskKind::Parallel)
                    .depends_on(depends_on.iter().copied()),
            );
        }
        self
    }

    /// Set the three core limits, keeping the rest of the config.
    pub fn with_config(mut self, breadth: usize, depth: usize, timeout_seconds: u64) -> Self {
        self.config.breadth = breadth;
        self.config.depth = depth;
        self.config.timeout_seconds = timeout_seconds;
        self
    }

    /// Replace the whole config.
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn strategy(mut self, strategy: ExecutionStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    pub fn on_task_failure(mut self, policy: FailurePolicy) -> Self {
        self.config.on_task_failure = policy;
        self
    }

    pub fn enable_retry(mut self, enabled: bool) -> Self {
        self.config.enable_retry = enabled;
        self
    }

    pub fn workflow_timeout(mut self, seconds: u64) -> Self {
        self.config.workflow_timeout_seconds = Some(seconds);
        self
    }

    /// Validate everything and produce a pending workflow.
    ///
    /// # Errors
    /// - `Validation` for a bad config
    /// - `DuplicateTask` if two specs resolve to the same id
    /// - `UnknownDependency` / `GraphCycle` from DAG validation
    pub fn build(self) -> Result<Workflow> {
        self.config.validate()?;

        let mut workflow = Workflow::new(&self.name, self.config);
        workflow.description = self.description;
        let default_retries = workflow.config.default_max_retries;

        for spec in self.specs {
            let task = spec.into_task(default_retries);
            if workflow.tasks.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            workflow.tasks.insert(task.id.clone(), task);
        }

        TaskDAG::build(&workflow.tasks)?;
        Ok(workflow)
    }
}
