//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted task runner that records every attempt
//! - Predefined workflow shapes (diamond, plan/research/synthesize)
//! - Draining a progress subscription

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use conductor::core::{ContextMap, TaskError, TaskId, TaskKind};
use conductor::orchestration::{ProgressEvent, ProgressSubscription, TaskInvocation, TaskRunner};
use conductor::workflow::{TaskSpec, WorkflowBuilder};

/// How the scripted runner treats one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// Retryable failure on the first `n` attempts, success afterwards.
    FailTimes(u32),
    /// Retryable failure on every attempt.
    AlwaysFail,
    /// Non-retryable failure.
    Fatal,
    /// Succeed after the given delay instead of the default one.
    Sleep(Duration),
    /// The runner itself panics.
    Panic,
}

/// One finished attempt.
#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: TaskId,
    pub attempt: u32,
    pub input: ContextMap,
    pub started: Instant,
    pub finished: Instant,
}

/// Runner whose outcome per task is fixed up front.
///
/// Each success returns `{"<id>": "<id>-done", "last_writer": "<id>"}`.
pub struct ScriptedRunner {
    delay: Duration,
    behaviors: HashMap<TaskId, Behavior>,
    starts: Mutex<Vec<TaskId>>,
    calls: Mutex<Vec<Call>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            behaviors: HashMap::new(),
            starts: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, id: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(TaskId::new(id), behavior);
        self
    }

    /// Attempts that ran to the end, in finishing order.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// The last finished attempt of a task.
    pub fn call(&self, id: &str) -> Call {
        self.calls()
            .into_iter()
            .filter(|c| c.task_id.as_str() == id)
            .last()
            .unwrap_or_else(|| panic!("task {} never finished an attempt", id))
    }

    /// Attempts started for a task, including ones cut off by a timeout.
    pub fn starts_for(&self, id: &str) -> usize {
        self.starts
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == id)
            .count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for ScriptedRunner {
    async fn execute(&self, invocation: TaskInvocation) -> Result<ContextMap, TaskError> {
        let started = Instant::now();
        self.starts.lock().unwrap().push(invocation.task_id.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);

        let behavior = self
            .behaviors
            .get(&invocation.task_id)
            .copied()
            .unwrap_or(Behavior::Succeed);
        let delay = match behavior {
            Behavior::Sleep(d) => d,
            _ => self.delay,
        };
        let guard = ActiveGuard(&self.active);
        tokio::time::sleep(delay).await;
        drop(guard);

        let id = invocation.task_id.as_str().to_string();
        let outcome = match behavior {
            Behavior::Succeed | Behavior::Sleep(_) => Ok(output(&id)),
            Behavior::FailTimes(n) if invocation.attempt <= n => Err(TaskError::retryable(
                format!("transient failure on attempt {}", invocation.attempt),
            )),
            Behavior::FailTimes(_) => Ok(output(&id)),
            Behavior::AlwaysFail => Err(TaskError::retryable("always fails")),
            Behavior::Fatal => Err(TaskError::fatal("unrecoverable")),
            Behavior::Panic => panic!("scripted runner blew up in {}", id),
        };

        self.calls.lock().unwrap().push(Call {
            task_id: invocation.task_id,
            attempt: invocation.attempt,
            input: invocation.input,
            started,
            finished: Instant::now(),
        });
        outcome
    }
}

/// Keeps the active count right when a timeout drops the attempt.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn output(id: &str) -> ContextMap {
    ContextMap::from([
        (id.to_string(), serde_json::json!(format!("{}-done", id))),
        ("last_writer".to_string(), serde_json::json!(id)),
    ])
}

/// `a -> {b, c} -> d`
pub fn diamond() -> WorkflowBuilder {
    WorkflowBuilder::new("diamond")
        .add_task("a", ContextMap::new(), TaskKind::Sequential, &[])
        .add_task("b", ContextMap::new(), TaskKind::Parallel, &["a"])
        .add_task("c", ContextMap::new(), TaskKind::Parallel, &["a"])
        .add_task("d", ContextMap::new(), TaskKind::Sequential, &["b", "c"])
}

/// `plan -> {research_a, research_b, research_c} -> synthesize`, breadth 2.
pub fn research_workflow() -> WorkflowBuilder {
    WorkflowBuilder::new("research")
        .description("plan, fan out research, synthesize")
        .add_task(
            "plan",
            ContextMap::from([("goal".to_string(), serde_json::json!("survey"))]),
            TaskKind::Sequential,
            &[],
        )
        .add_parallel_tasks(
            vec![
                TaskSpec::new("research_a"),
                TaskSpec::new("research_b"),
                TaskSpec::new("research_c"),
            ],
            &["plan"],
        )
        .add_task(
            "synthesize",
            ContextMap::new(),
            TaskKind::Sequential,
            &["research_a", "research_b", "research_c"],
        )
        .with_config(2, 5, 300)
}

/// Receive until the feed closes.
pub async fn drain(mut events: ProgressSubscription) -> Vec<ProgressEvent> {
    let mut out = Vec::new();
    while let Some(event) = events.recv().await {
        out.push(event);
    }
    out
}
