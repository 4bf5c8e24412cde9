//! Plan, fan out research with breadth 2, then synthesize.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::TaskKind;
use conductor::orchestration::Orchestrator;
use conductor::workflow::WorkflowStatus;

use crate::fixtures::{research_workflow, ScriptedRunner};

#[tokio::test(start_paused = true)]
async fn test_plan_research_synthesize() {
    let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(100)));
    let workflow = research_workflow().build().unwrap();
    assert_eq!(workflow.config.breadth, 2);

    let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

    assert_eq!(done.status, WorkflowStatus::Completed);
    let results = done.results.as_ref().unwrap();
    assert_eq!(results.summary.completed_count, 5);
    assert_eq!(results.summary.success_rate, 1.0);
    assert!(results.failures.is_empty());

    let plan = runner.call("plan");
    let (a, b, c) = (
        runner.call("research_a"),
        runner.call("research_b"),
        runner.call("research_c"),
    );
    let synthesize = runner.call("synthesize");

    // Stage 1 before stage 2.
    for research in [&a, &b, &c] {
        assert!(research.started >= plan.finished);
        assert_eq!(research.input["goal"], serde_json::json!("survey"));
        assert_eq!(research.input["plan"], serde_json::json!("plan-done"));
    }
    // research_a and research_b share the two slots; research_c waits.
    assert_eq!(a.started, b.started);
    assert!(c.started >= a.finished.min(b.finished));
    assert_eq!(runner.peak(), 2);
    // Stage 3 after every research task.
    for research in [&a, &b, &c] {
        assert!(synthesize.started >= research.finished);
    }
    for key in ["research_a", "research_b", "research_c"] {
        assert!(synthesize.input.contains_key(key));
    }

    assert!(done
        .tasks
        .values()
        .filter(|t| t.id.as_str().starts_with("research_"))
        .all(|t| t.kind == TaskKind::Parallel));
    assert_eq!(results.outputs.len(), 5);
}
