//! Core domain models for conductor.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestration system: tasks, their state machine, and the
//! dependency DAG that decides what may run next.

pub mod dag;
pub mod task;

pub use dag::{sort_for_dispatch, TaskDAG, TaskMap};
pub use task::{
    ContextMap, Task, TaskError, TaskErrorKind, TaskId, TaskKind, TaskPriority, TaskStatus,
};
