//! Conductor: DAG workflow orchestration.
//!
//! A [`Workflow`](workflow::Workflow) is a set of tasks with dependencies.
//! The [`Orchestrator`](orchestration::Orchestrator) resolves the dependency
//! graph, dispatches ready tasks to a [`TaskRunner`](orchestration::TaskRunner)
//! under a concurrency bound, retries transient failures, and publishes
//! progress events. [`WorkflowService`](service::WorkflowService) wraps that
//! with a store and a background control surface.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod orchestration;
pub mod service;
pub mod shell;
pub mod store;
pub mod workflow;

pub use error::{Error, Result};
pub use orchestration::{Orchestrator, TaskRunner};
pub use service::WorkflowService;
pub use workflow::{Workflow, WorkflowBuilder, WorkflowStatus};
