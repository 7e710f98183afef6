// Task types, event schema and errors for the streaming task engine

use crate::cancellation::Cancelled;
use crate::storage::StorageError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Cannot {operation} task {task_id} while it is {status}")]
    InvalidState {
        task_id: String,
        operation: &'static str,
        status: TaskStatus,
    },

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    #[error("Concurrency limit exceeded: at most {0} active tasks")]
    ConcurrencyLimitExceeded(usize),

    #[error("No event sink attached")]
    NoEventSink,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Execution(#[from] anyhow::Error),
}

impl TaskError {
    /// Cancellation reason if this error represents a cooperative cancellation,
    /// including a [`Cancelled`] that was wrapped into an `anyhow::Error`.
    pub fn cancellation_reason(&self) -> Option<&str> {
        match self {
            TaskError::Cancelled { reason } => Some(reason),
            TaskError::Execution(e) => e.downcast_ref::<Cancelled>().map(|c| c.reason.as_str()),
            _ => None,
        }
    }

    /// Whether the operation was stopped rather than failing on its own.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_reason().is_some()
    }
}

impl From<Cancelled> for TaskError {
    fn from(c: Cancelled) -> Self {
        TaskError::Cancelled { reason: c.reason }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Kind of a [`ProgressEvent`]. The snake_case name is what gets persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Progress,
    Milestone,
    Result,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Milestone => "milestone",
            Self::Result => "result",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "started" => Ok(Self::Started),
            "progress" => Ok(Self::Progress),
            "milestone" => Ok(Self::Milestone),
            "result" => Ok(Self::Result),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown event type: {}", s)),
        }
    }
}

/// One state transition of a task. Also the persisted record shape:
/// `(task_id, event_type, timestamp, data)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl ProgressEvent {
    pub fn new(task_id: impl Into<String>, event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            task_id: task_id.into(),
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

/// Serializable point-in-time view of a task, for UI and IPC layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: String,
    pub status: TaskStatus,
    pub total_steps: u64,
    pub current_step: u64,
    pub progress: f64,
    pub result_count: usize,
    pub error: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
