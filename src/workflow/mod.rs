//! Workflow management types for conductor.
//!
//! This module provides the workflow definition, its lifecycle state
//! machine, and the builder that validates a task graph before it can be
//! handed to the orchestrator.

mod builder;
mod definition;
mod state;
mod types;

pub use builder::{TaskSpec, WorkflowBuilder};
pub use definition::WorkflowDefinition;
pub use state::{StatusHistoryEntry, WorkflowStatus};
pub use types::{
    ExecutionStrategy, ExpansionLimits, FailurePolicy, HaltReason, TaskFailure, Workflow,
    WorkflowConfig, WorkflowId, WorkflowResults, WorkflowSummary,
};
