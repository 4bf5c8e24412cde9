//! The control surface over a file-backed store.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use conductor::core::{TaskErrorKind, TaskStatus};
use conductor::orchestration::EventType;
use conductor::service::ExecutionStart;
use conductor::store::{FileWorkflowStore, InMemoryWorkflowStore, WorkflowStore};
use conductor::workflow::{ExecutionStrategy, WorkflowDefinition, WorkflowStatus};
use conductor::WorkflowService;

use crate::fixtures::{drain, Behavior, ScriptedRunner};

const DEFINITION: &str = r#"{
    "name": "nightly",
    "description": "fetch, transform, publish",
    "config": { "breadth": 2, "depth": 5, "timeout_seconds": 30 },
    "tasks": [
        { "name": "fetch", "payload": { "source": "s3://bucket" } },
        { "name": "transform", "depends_on": ["fetch"] },
        { "name": "lint", "depends_on": ["fetch"] },
        { "name": "publish", "depends_on": ["transform", "lint"] }
    ]
}"#;

fn service(dir: &TempDir, runner: ScriptedRunner) -> WorkflowService {
    let store = FileWorkflowStore::new(dir.path().join("workflows"));
    WorkflowService::new(Arc::new(store), Arc::new(runner))
}

#[tokio::test(start_paused = true)]
async fn test_create_execute_and_persist() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, ScriptedRunner::new(Duration::from_millis(200)));
    let definition = WorkflowDefinition::from_json_str(DEFINITION).unwrap();

    let id = service.create(definition).await.unwrap();
    let events = service.subscribe(id).await.unwrap();
    assert_eq!(service.execute(id).await.unwrap(), ExecutionStart::Started);

    // Poll while the run is in flight.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = service.status(id).await.unwrap();
    assert_eq!(report.status, WorkflowStatus::Running);
    assert_eq!(report.progress_percent, 25.0);
    let fetch = report.tasks.iter().find(|t| t.id.as_str() == "fetch").unwrap();
    assert_eq!(fetch.status, TaskStatus::Completed);
    assert_eq!(service.execute(id).await.unwrap(), ExecutionStart::AlreadyRunning);

    let done = service.wait(id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Completed);
    assert_eq!(done.results.as_ref().unwrap().summary.completed_count, 4);

    let events = drain(events).await;
    assert_eq!(events.first().unwrap().event_type, EventType::WorkflowStarted);
    assert_eq!(events.last().unwrap().event_type, EventType::WorkflowCompleted);

    // A fresh store over the same directory sees the final state.
    let reopened = FileWorkflowStore::new(dir.path().join("workflows"));
    let stored = reopened.get(id).await.unwrap();
    assert_eq!(stored, done);
    assert_eq!(reopened.list().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_live_run() {
    let dir = TempDir::new().unwrap();
    let service = service(&dir, ScriptedRunner::new(Duration::from_secs(1)));
    let id = service
        .create(WorkflowDefinition::from_json_str(DEFINITION).unwrap())
        .await
        .unwrap();

    service.execute(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    service.cancel(id).await.unwrap();

    let done = service.wait(id).await.unwrap();
    assert_eq!(done.status, WorkflowStatus::Cancelled);
    let status = |name: &str| done.tasks.values().find(|t| t.name == name).unwrap().status;
    assert_eq!(status("fetch"), TaskStatus::Completed);
    assert_eq!(status("publish"), TaskStatus::Cancelled);
    assert_eq!(
        service.store().get(id).await.unwrap().status,
        WorkflowStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_run_is_persisted_with_failures() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(Duration::from_millis(10)).with("lint", Behavior::Fatal);
    let service = service(&dir, runner);
    let id = service
        .create(WorkflowDefinition::from_json_str(DEFINITION).unwrap())
        .await
        .unwrap();

    service.execute(id).await.unwrap();
    let done = service.wait(id).await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Failed);
    let stored = service.store().get(id).await.unwrap();
    let failures: Vec<&str> = stored
        .results
        .as_ref()
        .unwrap()
        .failures
        .iter()
        .map(|f| f.task_id.as_str())
        .collect();
    assert_eq!(failures, vec!["lint", "publish"]);
    assert_eq!(service.execute(id).await.unwrap(), ExecutionStart::AlreadyFinished);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_run_is_settled_as_failed() {
    let dir = TempDir::new().unwrap();
    let runner = ScriptedRunner::new(Duration::from_millis(10)).with("transform", Behavior::Panic);
    let service = service(&dir, runner);
    // Sequential runs tasks inline, so the panic unwinds the whole run.
    let mut definition = WorkflowDefinition::from_json_str(DEFINITION).unwrap();
    if let Some(config) = definition.config.as_mut() {
        config.strategy = ExecutionStrategy::Sequential;
    }
    let id = service.create(definition).await.unwrap();
    let events = service.subscribe(id).await.unwrap();

    service.execute(id).await.unwrap();
    let done = service.wait(id).await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Failed);
    let task = |name: &str| done.tasks.values().find(|t| t.name == name).unwrap().clone();
    assert_eq!(task("fetch").status, TaskStatus::Completed);
    assert_eq!(task("transform").status, TaskStatus::Failed);
    assert_eq!(task("transform").error.unwrap().kind, TaskErrorKind::Execution);
    assert_eq!(task("publish").status, TaskStatus::Cancelled);
    assert!(done.results.is_some());

    let last = drain(events).await.pop().unwrap();
    assert_eq!(last.event_type, EventType::WorkflowFailed);
    assert_eq!(last.data.unwrap()["status"], serde_json::json!("failed"));

    // A later process sees a finished run, not one stuck in RUNNING.
    let fresh = service_over(&dir);
    assert_eq!(fresh.store().get(id).await.unwrap().status, WorkflowStatus::Failed);
    assert_eq!(fresh.execute(id).await.unwrap(), ExecutionStart::AlreadyFinished);
}

#[tokio::test(start_paused = true)]
async fn test_subscribing_to_a_finished_workflow_ends() {
    let store = Arc::new(InMemoryWorkflowStore::new());
    let first = WorkflowService::new(
        store.clone(),
        Arc::new(ScriptedRunner::new(Duration::from_millis(10))),
    );
    let id = first
        .create(WorkflowDefinition::from_json_str(DEFINITION).unwrap())
        .await
        .unwrap();
    first.execute(id).await.unwrap();
    first.wait(id).await.unwrap();

    let second = WorkflowService::new(
        store,
        Arc::new(ScriptedRunner::new(Duration::from_millis(10))),
    );
    let events = second.subscribe(id).await.unwrap();
    let events = tokio::time::timeout(Duration::from_secs(2), drain(events))
        .await
        .expect("feed of a completed workflow closes");

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::WorkflowCompleted);
    assert_eq!(events[0].progress_percent, 100.0);
}

fn service_over(dir: &TempDir) -> WorkflowService {
    service(dir, ScriptedRunner::new(Duration::from_millis(10)))
}
