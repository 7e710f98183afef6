// Run a unit of work as a registered streaming task
//
// with_streaming creates and starts the task, hands the work routine the task
// and its cancellation token, and records the outcome:
// - Ok(value): complete with the value as the final result
// - Err(e): fail, which is a no-op if the task was already cancelled
// Cancelling the token cancels the task, so a routine that stops because of
// its own token finds the task Cancelled already. The routine's own result or
// error is always returned to the caller.

use super::registry::StreamingTaskRegistry;
use super::task::StreamingTask;
use super::types::{TaskError, TaskResult};
use crate::cancellation::CancellationToken;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub async fn with_streaming<T, F, Fut>(
    task_id: &str,
    registry: &StreamingTaskRegistry,
    work: F,
    total_steps: u64,
) -> TaskResult<T>
where
    F: FnOnce(StreamingTask, CancellationToken) -> Fut,
    Fut: Future<Output = TaskResult<T>>,
    T: Serialize,
{
    let task = registry.create_task(task_id)?;
    let token = task.cancellation_token();

    if let Err(e) = task.start(total_steps) {
        // Someone cancelled the task between registration and start
        if let Some(reason) = token.reason() {
            return Err(TaskError::Cancelled { reason });
        }
        return Err(e);
    }

    match work(task.clone(), token.clone()).await {
        Ok(result) => {
            let final_result = match serde_json::to_value(&result) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("Task {} result is not serializable: {}", task_id, e);
                    None
                }
            };
            task.complete(final_result)?;
            Ok(result)
        }
        Err(e) => {
            // The token callback may still be running on the cancelling thread
            if let Some(reason) = token.reason() {
                task.cancel(reason);
            }
            if !task.fail(&e)? {
                debug!("Task {} stopped after it was {}: {}", task_id, task.status(), e);
            }
            Err(e)
        }
    }
}

/// Spawn [`with_streaming`] onto the tokio runtime.
pub fn spawn_streaming<T, F, Fut>(
    registry: Arc<StreamingTaskRegistry>,
    task_id: impl Into<String>,
    work: F,
    total_steps: u64,
) -> JoinHandle<TaskResult<T>>
where
    F: FnOnce(StreamingTask, CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = TaskResult<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let task_id = task_id.into();
    tokio::spawn(async move { with_streaming(&task_id, &registry, work, total_steps).await })
}
