//! Orchestration layer: drives workflows through their DAG.
//!
//! The [`Orchestrator`] owns the iteration loop. Each dispatch goes through
//! an [`Executor`] chosen by the workflow's strategy, every task attempt
//! goes through the [`RetryController`], and concurrency is bounded by a
//! [`WorkerPool`]. Progress is published on a [`ProgressStream`].

mod context;
mod executor;
mod expander;
mod orchestrator;
mod pool;
mod progress;
mod retry;
mod runner;

pub use context::{ExecutionContext, RunControl, TaskReport};
pub use executor::{executor_for, Executor, HybridExecutor, ParallelExecutor, SequentialExecutor};
pub use expander::{can_expand, merge_expansion, TaskExpander};
pub use orchestrator::Orchestrator;
pub use pool::{WorkerPool, WorkerSlot};
pub use progress::{EventType, ProgressEvent, ProgressStream, ProgressSubscription};
pub use retry::{run_attempt, Outcome, RetryController, RetryPolicy};
pub use runner::{FnRunner, TaskInvocation, TaskRunner};
