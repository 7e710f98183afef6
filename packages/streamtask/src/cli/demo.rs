use crate::tasks::{spawn_streaming, StreamingTaskRegistry, TaskError, TaskStatus};
use clap::Args;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Simulated batch run: each task walks through `steps` items with a delay
/// per item, reporting progress and one result per item.
#[derive(Args, Debug, Clone)]
pub struct DemoArgs {
    /// Number of tasks to run concurrently
    #[arg(short, long, default_value = "3")]
    pub tasks: usize,

    /// Steps per task
    #[arg(short, long, default_value = "10")]
    pub steps: u64,

    /// Delay per step in milliseconds
    #[arg(long, default_value = "100")]
    pub step_delay_ms: u64,

    /// Cancel every task with reason "timeout" after this many milliseconds
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,

    /// Index of a task that fails halfway through
    #[arg(long)]
    pub fail_task: Option<usize>,

    /// Override the admission limit for this run
    #[arg(long)]
    pub max_concurrent: Option<usize>,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            tasks: 3,
            steps: 10,
            step_delay_ms: 100,
            cancel_after_ms: None,
            fail_task: None,
            max_concurrent: None,
        }
    }
}

/// How one demo task ended
#[derive(Debug, Clone)]
pub struct DemoOutcome {
    pub task_id: String,
    /// `None` when the task was never admitted
    pub status: Option<TaskStatus>,
    pub detail: String,
}

impl DemoArgs {
    /// Run the batch against `registry` and wait for every task.
    pub async fn execute(
        &self,
        registry: Arc<StreamingTaskRegistry>,
    ) -> anyhow::Result<Vec<DemoOutcome>> {
        run_demo(registry, self).await
    }
}

pub async fn run_demo(
    registry: Arc<StreamingTaskRegistry>,
    args: &DemoArgs,
) -> anyhow::Result<Vec<DemoOutcome>> {
    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let run_id = &run_id[..8];
    let delay = Duration::from_millis(args.step_delay_ms);
    let deadline = args.cancel_after_ms.map(Duration::from_millis);

    let mut handles = Vec::with_capacity(args.tasks);
    for index in 0..args.tasks {
        let task_id = format!("batch-{}-{}", run_id, index);
        let steps = args.steps;
        let fail_at = (args.fail_task == Some(index)).then(|| (steps / 2).max(1));

        let handle = spawn_streaming(
            registry.clone(),
            task_id.clone(),
            move |task, token| async move {
                let timer = deadline.map(|after| token.cancel_after(after, "timeout"));

                for step in 1..=steps {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                    token.throw_if_cancelled()?;

                    if fail_at == Some(step) {
                        return Err(TaskError::Execution(anyhow::anyhow!(
                            "item {} could not be processed",
                            step
                        )));
                    }

                    task.add_result(json!({ "item": step, "checksum": step * 31 % 97 }))?;
                    task.update_progress(step, Some(&format!("processed item {}", step)))?;
                    if step == steps / 2 {
                        task.milestone("halfway", Some(json!({ "step": step })))?;
                    }
                }

                if let Some(timer) = timer {
                    timer.abort();
                }
                Ok::<_, TaskError>(steps)
            },
            args.steps,
        );
        handles.push((task_id, handle));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (task_id, handle) in handles {
        let result = handle.await?;
        let task = registry.get_task(&task_id);
        let status = task.as_ref().map(|task| task.status());
        let cancel_reason = task.and_then(|task| task.snapshot().cancel_reason);
        let detail = match (result, cancel_reason) {
            (_, Some(reason)) if status == Some(TaskStatus::Cancelled) => {
                format!("cancelled: {}", reason)
            }
            (Ok(items), _) => format!("{} items", items),
            (Err(e), _) => {
                if status.is_none() {
                    warn!("Task {} was not admitted: {}", task_id, e);
                }
                e.to_string()
            }
        };
        outcomes.push(DemoOutcome {
            task_id,
            status,
            detail,
        });
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::RegistryConfig;

    fn args(tasks: usize, steps: u64) -> DemoArgs {
        DemoArgs {
            tasks,
            steps,
            step_delay_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_demo_runs_every_task_to_completion() {
        let registry = Arc::new(StreamingTaskRegistry::default());
        let outcomes = run_demo(registry.clone(), &args(3, 4)).await.unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| o.status == Some(TaskStatus::Completed)));
        let stats = registry.get_stats();
        assert_eq!(stats.completed_tasks, 3);

        let task = registry.get_task(&outcomes[0].task_id).unwrap();
        // One result per item plus the final result
        assert_eq!(task.results().len(), 5);
    }

    #[tokio::test]
    async fn test_demo_fail_task_and_timeout() {
        let registry = Arc::new(StreamingTaskRegistry::default());
        let run = DemoArgs {
            fail_task: Some(1),
            ..args(2, 4)
        };
        let outcomes = run_demo(registry.clone(), &run).await.unwrap();
        assert_eq!(outcomes[0].status, Some(TaskStatus::Completed));
        assert_eq!(outcomes[1].status, Some(TaskStatus::Failed));
        assert!(outcomes[1].detail.contains("item 2"));

        let slow = DemoArgs {
            step_delay_ms: 1_000,
            cancel_after_ms: Some(20),
            ..args(2, 5)
        };
        let outcomes = run_demo(registry.clone(), &slow).await.unwrap();
        assert!(outcomes
            .iter()
            .all(|o| o.status == Some(TaskStatus::Cancelled)));
        assert_eq!(outcomes[0].detail, "cancelled: timeout");
        let task = registry.get_task(&outcomes[0].task_id).unwrap();
        assert_eq!(task.cancellation_token().reason().as_deref(), Some("timeout"));
        assert!(task.update_progress(1, None).is_err());
        assert_eq!(registry.get_stats().cancelled_tasks, 2);
    }

    #[tokio::test]
    async fn test_demo_reports_rejected_tasks() {
        let registry = Arc::new(StreamingTaskRegistry::new(RegistryConfig {
            max_concurrent_tasks: Some(2),
            ..Default::default()
        }));
        let outcomes = run_demo(registry.clone(), &args(3, 1)).await.unwrap();

        let rejected: Vec<_> = outcomes.iter().filter(|o| o.status.is_none()).collect();
        assert_eq!(rejected.len(), 1);
        assert!(rejected[0].detail.contains("2"));
        assert_eq!(registry.get_stats().total_tasks, 2);
    }
}
