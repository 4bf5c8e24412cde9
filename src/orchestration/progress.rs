//! Per-workflow progress events.
//!
//! A [`ProgressStream`] fans events out over a `tokio::sync::broadcast`
//! channel. Late subscribers only see events from the moment they join.
//! A subscription ends after it delivers `workflow_completed` or
//! `workflow_failed`, or once every sender is gone.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::DEFAULT_EVENT_BUFFER;
use crate::core::TaskId;
use crate::workflow::WorkflowId;
use crate::{clog_trace, clog_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    IterationStarted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    IterationCompleted,
    WorkflowCompleted,
    WorkflowFailed,
}

impl EventType {
    /// Events after which nothing more is published.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::WorkflowCompleted | EventType::WorkflowFailed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::IterationStarted => "iteration_started",
            EventType::TaskStarted => "task_started",
            EventType::TaskCompleted => "task_completed",
            EventType::TaskFailed => "task_failed",
            EventType::IterationCompleted => "iteration_completed",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowFailed => "workflow_failed",
        };
        write!(f, "{}", s)
    }
}

/// One progress record, serialized flat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event_type: EventType,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    pub progress_percent: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(event_type: EventType, workflow_id: WorkflowId, message: impl Into<String>) -> Self {
        Self {
            event_type,
            workflow_id,
            task_id: None,
            task_name: None,
            progress_percent: 0.0,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_task(mut self, task_id: &TaskId, task_name: &str) -> Self {
        self.task_id = Some(task_id.clone());
        self.task_name = Some(task_name.to_string());
        self
    }

    pub fn with_percent(mut self, percent: f64) -> Self {
        self.progress_percent = percent;
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Sending half of a workflow's progress feed. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressStream {
    tx: broadcast::Sender<ProgressEvent>,
    /// Highest percent published so far, stored as `f64` bits. Bit patterns
    /// of non-negative floats sort like the floats themselves.
    high_water: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl ProgressStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            high_water: Arc::new(AtomicU64::new(0f64.to_bits())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Publish an event.
    ///
    /// The percent is raised to the highest value already published so it
    /// never goes backwards. Publishing with no subscribers is not an error.
    pub fn emit(&self, mut event: ProgressEvent) {
        let percent = event.progress_percent.clamp(0.0, 100.0);
        let previous = self.high_water.fetch_max(percent.to_bits(), Ordering::SeqCst);
        event.progress_percent = percent.max(f64::from_bits(previous));

        if event.event_type.is_terminal() {
            self.closed.store(true, Ordering::SeqCst);
        }

        clog_trace!(
            "progress {} {} {:.1}% {}",
            event.event_type,
            event.task_id.as_ref().map(|t| t.as_str()).unwrap_or("-"),
            event.progress_percent,
            event.message
        );
        let _ = self.tx.send(event);
    }

    /// Join the feed from this point forward.
    pub fn subscribe(&self) -> ProgressSubscription {
        let rx = self.tx.subscribe();
        ProgressSubscription {
            rx,
            done: self.closed.load(Ordering::SeqCst),
        }
    }

    /// Whether a terminal event has been published.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ProgressStream {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Receiving half of a progress feed.
#[derive(Debug)]
pub struct ProgressSubscription {
    rx: broadcast::Receiver<ProgressEvent>,
    done: bool,
}

impl ProgressSubscription {
    /// Next event, or `None` once the feed has closed.
    ///
    /// If this subscriber fell behind and the channel overwrote events, the
    /// gap is logged and skipped.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        if self.done {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if event.event_type.is_terminal() {
                        self.done = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    clog_warn!("progress subscriber lagged, {} events dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
