//! Control surface over stored workflows.
//!
//! [`WorkflowService`] creates workflows from definitions, starts runs in
//! the background, answers status queries while they execute, and persists
//! the final workflow once a run ends.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_EVENT_BUFFER;
use crate::core::{TaskError, TaskErrorKind, TaskId, TaskStatus};
use crate::orchestration::{
    EventType, Orchestrator, ProgressEvent, ProgressStream, ProgressSubscription, TaskExpander,
    TaskRunner,
};
use crate::store::WorkflowStore;
use crate::workflow::{
    Workflow, WorkflowConfig, WorkflowDefinition, WorkflowId, WorkflowResults, WorkflowStatus,
};
use crate::{clog, clog_error, Error, Result};

/// Answer to [`WorkflowService::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStart {
    Started,
    AlreadyRunning,
    AlreadyFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub error: Option<TaskError>,
}

/// Point-in-time view of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub workflow_id: WorkflowId,
    pub name: String,
    pub status: WorkflowStatus,
    pub progress_percent: f64,
    pub tasks: Vec<TaskStatusView>,
}

impl StatusReport {
    fn from_workflow(workflow: &Workflow) -> Self {
        Self {
            workflow_id: workflow.id,
            name: workflow.name.clone(),
            status: workflow.status,
            progress_percent: workflow.progress_percent(),
            tasks: workflow
                .tasks
                .values()
                .map(|t| TaskStatusView {
                    id: t.id.clone(),
                    name: t.name.clone(),
                    status: t.status,
                    attempts: if t.started_at.is_some() { t.attempts() } else { 0 },
                    error: t.error.clone(),
                })
                .collect(),
        }
    }
}

/// A run that is starting or in flight. Removed once the final state is
/// persisted.
struct ActiveRun {
    /// `None` until the stored workflow has been loaded.
    workflow: Option<Arc<RwLock<Workflow>>>,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

type Runs = Arc<RwLock<HashMap<WorkflowId, ActiveRun>>>;
type Feeds = Arc<RwLock<HashMap<WorkflowId, ProgressStream>>>;

pub struct WorkflowService {
    store: Arc<dyn WorkflowStore>,
    runner: Arc<dyn TaskRunner>,
    expander: Option<Arc<dyn TaskExpander>>,
    defaults: WorkflowConfig,
    event_buffer: usize,
    // Lock order: `runs` before `feeds`.
    runs: Runs,
    feeds: Feeds,
}

impl WorkflowService {
    pub fn new(store: Arc<dyn WorkflowStore>, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            store,
            runner,
            expander: None,
            defaults: WorkflowConfig::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            runs: Arc::new(RwLock::new(HashMap::new())),
            feeds: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_expander(mut self, expander: Arc<dyn TaskExpander>) -> Self {
        self.expander = Some(expander);
        self
    }

    /// Config applied to definitions that carry none.
    pub fn with_defaults(mut self, defaults: WorkflowConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn store(&self) -> &Arc<dyn WorkflowStore> {
        &self.store
    }

    /// Build a workflow from a definition and store it as PENDING.
    pub async fn create(&self, definition: WorkflowDefinition) -> Result<WorkflowId> {
        let workflow = definition.into_builder(self.defaults.clone()).build()?;
        self.insert(workflow).await
    }

    /// Store an already-built workflow.
    pub async fn insert(&self, workflow: Workflow) -> Result<WorkflowId> {
        if workflow.status != WorkflowStatus::Pending {
            return Err(Error::Validation(format!(
                "workflow {} is {}, expected pending",
                workflow.id, workflow.status
            )));
        }
        self.store.create(&workflow).await?;
        clog!(
            "Created workflow {} '{}' with {} tasks",
            workflow.id.short(),
            workflow.name,
            workflow.tasks.len()
        );
        Ok(workflow.id)
    }

    /// Start a run in the background. Calling it again for the same
    /// workflow never starts a second run.
    pub async fn execute(&self, id: WorkflowId) -> Result<ExecutionStart> {
        let cancel = CancellationToken::new();
        let (done_tx, finished) = watch::channel(false);
        {
            let mut runs = self.runs.write().await;
            if runs.contains_key(&id) {
                return Ok(ExecutionStart::AlreadyRunning);
            }
            runs.insert(
                id,
                ActiveRun {
                    workflow: None,
                    cancel: cancel.clone(),
                    finished,
                },
            );
        }

        // The reserved entry keeps other callers out while the store is read.
        let workflow = match self.store.get(id).await {
            Ok(workflow) if workflow.status == WorkflowStatus::Pending => workflow,
            other => {
                self.runs.write().await.remove(&id);
                let _ = done_tx.send(true);
                return match other {
                    Ok(workflow) if workflow.status == WorkflowStatus::Running => {
                        Ok(ExecutionStart::AlreadyRunning)
                    }
                    Ok(_) => Ok(ExecutionStart::AlreadyFinished),
                    Err(e) => Err(e),
                };
            }
        };

        let shared = Arc::new(RwLock::new(workflow));
        let feed = self.feed(id).await;
        let mut orchestrator = Orchestrator::new(Arc::clone(&self.runner))
            .with_progress(feed.clone())
            .with_cancellation(cancel);
        if let Some(expander) = &self.expander {
            orchestrator = orchestrator.with_expander(Arc::clone(expander));
        }
        if let Some(run) = self.runs.write().await.get_mut(&id) {
            run.workflow = Some(Arc::clone(&shared));
        }

        let supervisor = Supervisor {
            id,
            shared,
            feed,
            store: Arc::clone(&self.store),
            runs: Arc::clone(&self.runs),
            feeds: Arc::clone(&self.feeds),
        };
        tokio::spawn(supervisor.run(orchestrator, done_tx));

        clog!("Started workflow {}", id.short());
        Ok(ExecutionStart::Started)
    }

    /// Current status. Live runs are read under the workflow lock.
    pub async fn status(&self, id: WorkflowId) -> Result<StatusReport> {
        if let Some(shared) = self.live(id).await {
            let workflow = shared.read().await;
            return Ok(StatusReport::from_workflow(&workflow));
        }
        let workflow = self.store.get(id).await?;
        Ok(StatusReport::from_workflow(&workflow))
    }

    /// Request cancellation.
    ///
    /// A live run stops dispatching and settles on its own. A workflow that
    /// never started is cancelled in the store directly. Finished workflows
    /// are left alone.
    pub async fn cancel(&self, id: WorkflowId) -> Result<()> {
        if let Some(run) = self.runs.read().await.get(&id) {
            clog!("Cancelling workflow {}", id.short());
            run.cancel.cancel();
            return Ok(());
        }

        let mut workflow = self.store.get(id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }
        for task in workflow.tasks.values_mut().filter(|t| !t.status.is_terminal()) {
            task.cancel(TaskError::new(
                TaskErrorKind::Cancelled,
                "workflow cancelled before the task started",
            ))?;
        }
        workflow.transition(WorkflowStatus::Cancelled)?;
        self.store.update(&workflow).await?;
        clog!("Cancelled workflow {} before it started", id.short());

        if let Some(feed) = self.feeds.write().await.remove(&id) {
            feed.emit(terminal_event(&workflow));
        }
        Ok(())
    }

    /// Follow a workflow's progress. Subscribing before `execute` sees
    /// every event of the run. A workflow that already finished yields its
    /// terminal event and then ends.
    pub async fn subscribe(&self, id: WorkflowId) -> Result<ProgressSubscription> {
        {
            let runs = self.runs.read().await;
            if runs.contains_key(&id) {
                return Ok(self.feed(id).await.subscribe());
            }
        }

        let workflow = self.store.get(id).await?;
        if workflow.status.is_terminal() {
            let replay = ProgressStream::new(1);
            let subscription = replay.subscribe();
            replay.emit(terminal_event(&workflow));
            return Ok(subscription);
        }
        Ok(self.feed(id).await.subscribe())
    }

    /// Wait for a run started here to end and return the final workflow.
    /// Without a run in this process, the stored workflow is returned.
    pub async fn wait(&self, id: WorkflowId) -> Result<Workflow> {
        let run = {
            let runs = self.runs.read().await;
            runs.get(&id)
                .map(|r| (r.finished.clone(), r.workflow.clone()))
        };
        let Some((mut finished, shared)) = run else {
            return self.store.get(id).await;
        };
        finished
            .wait_for(|done| *done)
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        match shared {
            Some(shared) => Ok(shared.read().await.clone()),
            None => self.store.get(id).await,
        }
    }

    pub async fn list(&self) -> Result<Vec<Workflow>> {
        self.store.list().await
    }

    async fn live(&self, id: WorkflowId) -> Option<Arc<RwLock<Workflow>>> {
        self.runs
            .read()
            .await
            .get(&id)
            .and_then(|r| r.workflow.clone())
    }

    async fn feed(&self, id: WorkflowId) -> ProgressStream {
        let mut feeds = self.feeds.write().await;
        feeds
            .entry(id)
            .or_insert_with(|| ProgressStream::new(self.event_buffer))
            .clone()
    }
}

/// Owns a background run: settles it, persists it, then forgets it.
struct Supervisor {
    id: WorkflowId,
    shared: Arc<RwLock<Workflow>>,
    feed: ProgressStream,
    store: Arc<dyn WorkflowStore>,
    runs: Runs,
    feeds: Feeds,
}

impl Supervisor {
    async fn run(self, orchestrator: Orchestrator, done_tx: watch::Sender<bool>) {
        let run = {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move { orchestrator.execute_shared(&shared).await })
        };
        let outcome = match run.await {
            Ok(outcome) => outcome,
            Err(e) => Err(Error::TaskJoin(e.to_string())),
        };
        if let Err(e) = outcome {
            clog_error!("Workflow {} run failed: {}", self.id.short(), e);
            let mut workflow = self.shared.write().await;
            fail_run(&mut workflow, &e);
            self.feed.emit(
                terminal_event(&workflow).with_data(serde_json::json!({
                    "status": workflow.status,
                    "error": e.to_string(),
                })),
            );
        }

        let snapshot = self.shared.read().await.clone();
        if let Err(e) = self.store.update(&snapshot).await {
            clog_error!("Failed to persist workflow {}: {}", self.id.short(), e);
        }

        {
            let mut runs = self.runs.write().await;
            let mut feeds = self.feeds.write().await;
            runs.remove(&self.id);
            feeds.remove(&self.id);
        }
        let _ = done_tx.send(true);
    }
}

/// Settle a workflow whose run ended in an error instead of a status.
fn fail_run(workflow: &mut Workflow, error: &Error) {
    let message = format!("run aborted: {}", error);
    for task in workflow.tasks.values_mut().filter(|t| !t.status.is_terminal()) {
        let result = match task.status {
            TaskStatus::Ready | TaskStatus::Running => {
                task.fail(TaskError::new(TaskErrorKind::Execution, message.clone()))
            }
            _ => task.cancel(TaskError::new(TaskErrorKind::Cancelled, message.clone())),
        };
        if let Err(e) = result {
            clog_error!("Cannot settle task {}: {}", task.id, e);
        }
    }

    if workflow.status == WorkflowStatus::Pending {
        if let Err(e) = workflow.transition(WorkflowStatus::Running) {
            clog_error!("Cannot settle workflow {}: {}", workflow.id.short(), e);
        }
    }
    if !workflow.status.is_terminal() {
        if let Err(e) = workflow.transition(WorkflowStatus::Failed) {
            clog_error!("Cannot settle workflow {}: {}", workflow.id.short(), e);
        }
    }
    if workflow.results.is_none() {
        workflow.results = Some(WorkflowResults::collect(&workflow.tasks, 0, 0, None));
    }
}

/// The event that closes a feed for a workflow in its final status.
fn terminal_event(workflow: &Workflow) -> ProgressEvent {
    let event_type = if workflow.status == WorkflowStatus::Completed {
        EventType::WorkflowCompleted
    } else {
        EventType::WorkflowFailed
    };
    let summary = workflow
        .results
        .as_ref()
        .and_then(|r| serde_json::to_value(&r.summary).ok());
    ProgressEvent::new(event_type, workflow.id, format!("Workflow {}", workflow.status))
        .with_percent(workflow.progress_percent())
        .with_data(serde_json::json!({
            "status": workflow.status,
            "summary": summary,
        }))
}
