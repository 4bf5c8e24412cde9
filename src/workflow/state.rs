//! Workflow status management with transition validation.
//!
//! A workflow moves `Pending -> Running -> {Completed, Failed, Cancelled}`.
//! Every transition is recorded in the workflow's status history, and
//! terminal statuses never change again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::Workflow;

/// Status of a workflow in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow created but not yet started
    #[default]
    Pending,
    /// Workflow is actively executing
    Running,
    /// Every task completed
    Completed,
    /// At least one task failed or was skipped, or the run timed out
    Failed,
    /// Stopped by a cancel request
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Check if a transition to the target status is valid.
    ///
    /// Valid transitions:
    /// - Pending -> Running
    /// - Pending -> Cancelled (cancelled before it ever ran)
    /// - Running -> Completed | Failed | Cancelled
    pub fn can_transition(&self, target: WorkflowStatus) -> bool {
        matches!(
            (self, target),
            (WorkflowStatus::Pending, WorkflowStatus::Running)
                | (WorkflowStatus::Pending, WorkflowStatus::Cancelled)
                | (WorkflowStatus::Running, WorkflowStatus::Completed)
                | (WorkflowStatus::Running, WorkflowStatus::Failed)
                | (WorkflowStatus::Running, WorkflowStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Pending => write!(f, "pending"),
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    /// The status that was entered.
    pub status: WorkflowStatus,
    /// When this status was entered.
    pub entered_at: DateTime<Utc>,
}

impl Workflow {
    /// Attempt to move the workflow to a new status.
    ///
    /// Returns an error if the transition is not valid. Entering `Running`
    /// stamps `started_at`; entering a terminal status stamps `completed_at`.
    pub fn transition(&mut self, target: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        let now = Utc::now();
        self.status = target;
        if target == WorkflowStatus::Running {
            self.started_at = Some(now);
        }
        if target.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status_history.push(StatusHistoryEntry {
            status: target,
            entered_at: now,
        });

        Ok(())
    }

    /// Get the history of all statuses visited, in order.
    pub fn status_history(&self) -> &[StatusHistoryEntry] {
        &self.status_history
    }
}
