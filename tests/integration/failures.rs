//! Retries, failure propagation and the fail-fast policy.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{ContextMap, TaskErrorKind, TaskId, TaskKind, TaskStatus};
use conductor::orchestration::{EventType, Orchestrator};
use conductor::workflow::{FailurePolicy, HaltReason, TaskSpec, WorkflowBuilder, WorkflowStatus};

use crate::fixtures::{drain, Behavior, ScriptedRunner};

fn single(spec: TaskSpec) -> WorkflowBuilder {
    WorkflowBuilder::new("single").add_spec(spec)
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_task_gets_exactly_max_retries_plus_one_attempts() {
    for max_retries in [0, 1, 2, 4] {
        let runner = Arc::new(
            ScriptedRunner::new(Duration::from_millis(10)).with("flaky", Behavior::AlwaysFail),
        );
        let workflow = single(TaskSpec::new("flaky").with_max_retries(max_retries))
            .build()
            .unwrap();

        let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

        assert_eq!(runner.starts_for("flaky"), max_retries as usize + 1);
        let attempts: Vec<u32> = runner.calls().iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, (1..=max_retries + 1).collect::<Vec<_>>());

        let task = done.task(&TaskId::new("flaky")).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempt_count, max_retries);
        assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::RetryExhausted);
        assert_eq!(done.status, WorkflowStatus::Failed);
    }
}

#[tokio::test(start_paused = true)]
async fn test_backoff_doubles_between_attempts() {
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10)).with("flaky", Behavior::FailTimes(3)),
    );
    let workflow = single(TaskSpec::new("flaky")).build().unwrap();

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Completed);
    let calls = runner.calls();
    assert_eq!(calls.len(), 4);
    let gaps: Vec<Duration> = calls
        .windows(2)
        .map(|w| w[1].started - w[0].finished)
        .collect();
    for (gap, expected) in gaps.iter().zip([500u64, 1000, 2000]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(5),
            "gap {:?}, expected {:?}",
            gap,
            expected
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_recovered_task_reports_attempts() {
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10)).with("flaky", Behavior::FailTimes(2)),
    );
    let orchestrator = Orchestrator::new(runner.clone());
    let events = orchestrator.subscribe();
    let workflow = single(TaskSpec::new("flaky")).build().unwrap();

    let done = orchestrator.execute(workflow).await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Completed);
    let events = drain(events).await;
    let started = events
        .iter()
        .filter(|e| e.event_type == EventType::TaskStarted)
        .count();
    assert_eq!(started, 1, "retries are not re-announced");
    let completed = events
        .iter()
        .find(|e| e.event_type == EventType::TaskCompleted)
        .unwrap();
    assert_eq!(completed.data.as_ref().unwrap()["attempts"], serde_json::json!(3));
}

#[tokio::test(start_paused = true)]
async fn test_retry_disabled_fails_on_first_error() {
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10)).with("flaky", Behavior::AlwaysFail),
    );
    let workflow = single(TaskSpec::new("flaky"))
        .enable_retry(false)
        .build()
        .unwrap();

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    assert_eq!(runner.starts_for("flaky"), 1);
    let task = done.task(&TaskId::new("flaky")).unwrap();
    assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::Execution);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_not_retried() {
    let runner =
        Arc::new(ScriptedRunner::new(Duration::from_millis(10)).with("doomed", Behavior::Fatal));
    let workflow = single(TaskSpec::new("doomed")).build().unwrap();

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    assert_eq!(runner.starts_for("doomed"), 1);
    assert_eq!(
        done.task(&TaskId::new("doomed")).unwrap().status,
        TaskStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_task_timeout_counts_as_retryable_failure() {
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10))
            .with("stuck", Behavior::Sleep(Duration::from_secs(3600))),
    );
    let workflow = single(TaskSpec::new("stuck").with_max_retries(1))
        .with_config(3, 5, 2)
        .build()
        .unwrap();

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    assert_eq!(runner.starts_for("stuck"), 2);
    assert!(runner.calls().is_empty(), "timed-out attempts never finish");
    let task = done.task(&TaskId::new("stuck")).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::RetryExhausted);
}

#[tokio::test(start_paused = true)]
async fn test_partial_failure_propagates_only_downstream() {
    // a -> {b, c}; d <- {b, c}; e <- c
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10)).with("b", Behavior::AlwaysFail),
    );
    let workflow = WorkflowBuilder::new("partial")
        .add_task("a", ContextMap::new(), TaskKind::Sequential, &[])
        .add_spec(TaskSpec::new("b").depends_on(["a"]).with_max_retries(1))
        .add_task("c", ContextMap::new(), TaskKind::Parallel, &["a"])
        .add_task("d", ContextMap::new(), TaskKind::Sequential, &["b", "c"])
        .add_task("e", ContextMap::new(), TaskKind::Sequential, &["c"])
        .build()
        .unwrap();

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    let status = |id: &str| done.task(&TaskId::new(id)).unwrap().status;
    assert_eq!(status("a"), TaskStatus::Completed);
    assert_eq!(status("b"), TaskStatus::Failed);
    assert_eq!(status("c"), TaskStatus::Completed);
    assert_eq!(status("d"), TaskStatus::Skipped);
    assert_eq!(status("e"), TaskStatus::Completed);
    assert_eq!(runner.starts_for("d"), 0);
    assert_eq!(done.status, WorkflowStatus::Failed);

    let results = done.results.as_ref().unwrap();
    assert!(results.halt_reason.is_none(), "independent branches run to the end");
    assert_eq!(
        results.outputs.keys().cloned().collect::<Vec<_>>(),
        vec![TaskId::new("a"), TaskId::new("c"), TaskId::new("e")]
    );
    let failed: Vec<(&str, TaskErrorKind)> = results
        .failures
        .iter()
        .map(|f| (f.task_id.as_str(), f.error.as_ref().unwrap().kind))
        .collect();
    assert_eq!(
        failed,
        vec![
            ("b", TaskErrorKind::RetryExhausted),
            ("d", TaskErrorKind::DependencyFailed),
        ]
    );
    assert_eq!(results.summary.completed_count, 3);
    assert_eq!(results.summary.failed_count, 1);
    assert_eq!(results.summary.skipped_count, 1);
    assert_eq!(results.summary.success_rate, 0.6);
}

#[tokio::test(start_paused = true)]
async fn test_abort_policy_stops_new_dispatch() {
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10))
            .with("bad", Behavior::Fatal)
            .with("slow", Behavior::Sleep(Duration::from_secs(1))),
    );
    let workflow = WorkflowBuilder::new("fail-fast")
        .add_task("bad", ContextMap::new(), TaskKind::Parallel, &[])
        .add_task("slow", ContextMap::new(), TaskKind::Parallel, &[])
        .add_task("after_slow", ContextMap::new(), TaskKind::Sequential, &["slow"])
        .on_task_failure(FailurePolicy::AbortWorkflow)
        .build()
        .unwrap();

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    let task = |id: &str| done.task(&TaskId::new(id)).unwrap().clone();
    assert_eq!(task("bad").status, TaskStatus::Failed);
    assert_eq!(task("slow").status, TaskStatus::Completed, "in-flight work finishes");
    assert_eq!(task("after_slow").status, TaskStatus::Skipped);
    assert_eq!(
        task("after_slow").error.unwrap().kind,
        TaskErrorKind::Aborted
    );
    assert_eq!(runner.starts_for("after_slow"), 0);
    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(
        done.results.unwrap().halt_reason,
        Some(HaltReason::TaskFailure(TaskId::new("bad")))
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_backoff_ends_task_cancelled() {
    // Attempt 1 fails at 10ms, the retry is due at 510ms; cancel lands at 200ms.
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10)).with("flaky", Behavior::AlwaysFail),
    );
    let orchestrator = Orchestrator::new(runner.clone());
    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });
    let workflow = single(TaskSpec::new("flaky")).build().unwrap();

    let started = tokio::time::Instant::now();
    let done = orchestrator.execute(workflow).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(510), "backoff was cut short");
    assert_eq!(runner.starts_for("flaky"), 1);
    let task = done.task(&TaskId::new("flaky")).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::Cancelled);
    assert_eq!(done.status, WorkflowStatus::Cancelled);
    assert_eq!(
        done.results.unwrap().halt_reason,
        Some(HaltReason::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn test_workflow_timeout_during_backoff_fails_task() {
    // Attempts at 0ms and 510ms; the second backoff would end at 1520ms but
    // the one-second budget runs out first.
    let runner = Arc::new(
        ScriptedRunner::new(Duration::from_millis(10)).with("flaky", Behavior::AlwaysFail),
    );
    let workflow = single(TaskSpec::new("flaky"))
        .workflow_timeout(1)
        .build()
        .unwrap();

    let started = tokio::time::Instant::now();
    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    assert!(started.elapsed() < Duration::from_millis(1100));
    assert_eq!(runner.starts_for("flaky"), 2);
    let task = done.task(&TaskId::new("flaky")).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.error.as_ref().unwrap().kind, TaskErrorKind::WorkflowTimeout);
    assert_eq!(done.status, WorkflowStatus::Failed);
    assert_eq!(
        done.results.unwrap().halt_reason,
        Some(HaltReason::WorkflowTimeout)
    );
}
