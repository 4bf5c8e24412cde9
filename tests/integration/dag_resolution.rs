//! Dependency resolution through the public builder and orchestrator.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{ContextMap, TaskDAG, TaskId, TaskKind};
use conductor::orchestration::Orchestrator;
use conductor::workflow::{ExecutionStrategy, WorkflowBuilder};
use conductor::Error;

use crate::fixtures::{diamond, research_workflow, ScriptedRunner};

fn ids(names: &[&str]) -> Vec<TaskId> {
    names.iter().map(|n| TaskId::new(*n)).collect()
}

#[test]
fn test_cycle_rejected_with_offending_ids() {
    let result = WorkflowBuilder::new("loop")
        .add_task("entry", ContextMap::new(), TaskKind::Sequential, &[])
        .add_task("a", ContextMap::new(), TaskKind::Sequential, &["entry", "c"])
        .add_task("b", ContextMap::new(), TaskKind::Sequential, &["a"])
        .add_task("c", ContextMap::new(), TaskKind::Sequential, &["b"])
        .build();

    match result {
        Err(Error::GraphCycle { task_ids }) => assert_eq!(task_ids, ids(&["a", "b", "c"])),
        other => panic!("expected a cycle error, got {:?}", other.map(|w| w.name)),
    }
}

#[test]
fn test_self_dependency_is_a_cycle() {
    let result = WorkflowBuilder::new("self")
        .add_task("narcissus", ContextMap::new(), TaskKind::Sequential, &["narcissus"])
        .build();
    assert!(matches!(result, Err(Error::GraphCycle { .. })));
}

#[test]
fn test_unknown_dependency_rejected() {
    let result = WorkflowBuilder::new("dangling")
        .add_task("a", ContextMap::new(), TaskKind::Sequential, &["missing"])
        .build();
    match result {
        Err(Error::UnknownDependency { task_id, dependency }) => {
            assert_eq!(task_id, TaskId::new("a"));
            assert_eq!(dependency, TaskId::new("missing"));
        }
        other => panic!("expected an unknown dependency, got {:?}", other.map(|w| w.name)),
    }
}

#[test]
fn test_stage_plan() {
    let workflow = research_workflow().build().unwrap();
    let dag = TaskDAG::build(&workflow.tasks).unwrap();

    assert_eq!(
        dag.stages(&workflow.tasks),
        vec![
            ids(&["plan"]),
            ids(&["research_a", "research_b", "research_c"]),
            ids(&["synthesize"]),
        ]
    );
    assert_eq!(dag.ready_set(&workflow.tasks), ids(&["plan"]));
}

#[tokio::test(start_paused = true)]
async fn test_no_task_starts_before_its_dependencies_complete() {
    for strategy in [
        ExecutionStrategy::Sequential,
        ExecutionStrategy::Parallel,
        ExecutionStrategy::Hybrid,
    ] {
        let runner = Arc::new(ScriptedRunner::new(Duration::from_millis(50)));
        let workflow = diamond().strategy(strategy).build().unwrap();

        let done = Orchestrator::new(runner.clone()).execute(workflow).await.unwrap();

        for task in done.tasks.values() {
            let call = runner.call(task.id.as_str());
            for dep in &task.depends_on {
                assert!(
                    runner.call(dep.as_str()).finished <= call.started,
                    "{} started before {} finished under {}",
                    task.id,
                    dep,
                    strategy
                );
            }
        }
    }
}
