//! Task lifecycle state machine and status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tasks::runner::RunnerId;

/// Lifecycle state of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for a runner.
    Queued,
    /// Bound to a runner and executing.
    Running,
    /// Finished normally.
    Completed,
    /// Finished after observing a cancellation request.
    Cancelled,
    /// Finished with an error.
    Failed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            // From Queued (shutdown or a missing runner ends it without running)
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) |
            // From Running
            (Running, Queued) | (Running, Completed) |
            (Running, Cancelled) | (Running, Failed)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Caption shown once the task has finished in this state.
    pub fn terminal_caption(&self) -> Option<&'static str> {
        match self {
            Self::Completed => Some("Complete"),
            Self::Cancelled => Some("Cancelled"),
            Self::Failed => Some("Failed"),
            Self::Queued | Self::Running => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time copy of everything a `TaskContext` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    /// Submission epoch; larger is newer.
    pub generation: u64,
    pub description: String,
    pub state: TaskState,
    pub busy: bool,
    pub progress: f64,
    pub cancellable: bool,
    pub action_caption: String,
    pub finished: bool,
    /// Display form of the error the task finished with.
    pub error: Option<String>,
    pub runner: Option<RunnerId>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    /// Time from first start to finish (or now, if still running).
    pub fn elapsed(&self) -> Option<std::time::Duration> {
        self.started_at.map(|start| {
            let end = self.finished_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or_default()
        })
    }
}
