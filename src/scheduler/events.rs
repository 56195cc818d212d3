//! Task lifecycle events and status.
//!
//! Events for one task are emitted in stage order; a consumer watching the
//! stream never sees `persist` before `reconcile`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::CommitSummary;

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Rendering,
    Extracting,
    Reconciling,
    Persisting,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rendering => "rendering",
            Self::Extracting => "extracting",
            Self::Reconciling => "reconciling",
            Self::Persisting => "persisting",
        }
    }
}

impl std::fmt::Display for TaskStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current status of one task, queryable at any time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    /// Admitted, waiting for a permit.
    Pending,
    Running {
        stage: TaskStage,
    },
    Succeeded {
        summary: CommitSummary,
    },
    Failed {
        stage: TaskStage,
        error: String,
    },
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Queued { task_id: Uuid },
    StageStarted { task_id: Uuid, stage: TaskStage },
    StageCompleted { task_id: Uuid, stage: TaskStage },
    Completed { task_id: Uuid, summary: CommitSummary },
    Failed { task_id: Uuid, stage: TaskStage, error: String },
    Cancelled { task_id: Uuid },
}

/// Consumer seam for progress events.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Forwards events into an unbounded channel; a closed receiver drops them.
pub struct ChannelSink {
    sender: tokio::sync::mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(sender: tokio::sync::mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

/// Discards everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}
