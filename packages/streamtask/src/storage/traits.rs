use crate::tasks::ProgressEvent;
use async_trait::async_trait;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage worker failed: {0}")]
    Join(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Append-only store for task events.
///
/// Each record is `(task_id, event_type, timestamp, data)`. Implementations
/// must return events for a task in the order they were appended.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Persist one event
    async fn append(&self, event: &ProgressEvent) -> StorageResult<()>;

    /// All persisted events for a task, oldest first
    async fn query(&self, task_id: &str) -> StorageResult<Vec<ProgressEvent>>;
}
