// Streaming task registry - admission-controlled set of active tasks
//
// Features:
// - Unique task ids and an optional bound on registered tasks
// - Lifetime statistics driven by each task's terminal event
// - Event fan-out to a broadcast feed and, once attached, an event sink
// - Pruning of finished tasks, on demand or on a background interval
//
// Registry state sits behind a single parking_lot::Mutex which is never held
// while calling into a task.

use super::task::StreamingTask;
use super::types::{EventType, ProgressEvent, TaskError, TaskResult};
use crate::storage::{EventSink, EventWriter, WriterCounters};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Configuration for the task registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of registered tasks (`None` = unbounded)
    pub max_concurrent_tasks: Option<usize>,
    /// Capacity of the persistence queue in front of the event sink
    pub event_queue_capacity: usize,
    /// Channel capacity for the broadcast event feed
    pub notification_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: None,
            event_queue_capacity: 1024,
            notification_capacity: 256,
        }
    }
}

/// Registry statistics
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub active_tasks: usize,
    pub max_concurrent_tasks: Option<usize>,
    pub persisted_events: u64,
    pub dropped_events: u64,
    pub persist_failures: u64,
}

#[derive(Default)]
struct LifetimeStats {
    total: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<String, StreamingTask>,
    stats: LifetimeStats,
}

struct Shared {
    state: Mutex<RegistryState>,
    writer: RwLock<Option<EventWriter>>,
    // Shared by every writer this registry starts
    counters: Arc<WriterCounters>,
    feed: broadcast::Sender<ProgressEvent>,
}

impl Shared {
    fn on_event(&self, event: &ProgressEvent) {
        match event.event_type {
            EventType::Completed => self.state.lock().stats.completed += 1,
            EventType::Failed => self.state.lock().stats.failed += 1,
            EventType::Cancelled => self.state.lock().stats.cancelled += 1,
            _ => {}
        }

        if let Some(writer) = self.writer.read().as_ref() {
            writer.submit(event.clone());
        }

        // No receivers is fine
        let _ = self.feed.send(event.clone());
    }
}

pub struct StreamingTaskRegistry {
    shared: Arc<Shared>,
    config: RegistryConfig,
    cleanup_running: AtomicBool,
}

impl StreamingTaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (feed, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::default()),
                writer: RwLock::new(None),
                counters: Arc::new(WriterCounters::default()),
                feed,
            }),
            config,
            cleanup_running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a new Pending task under `id`.
    pub fn create_task(&self, id: impl Into<String>) -> TaskResult<StreamingTask> {
        let id = id.into();
        let mut state = self.shared.state.lock();

        if state.tasks.contains_key(&id) {
            debug!("Rejecting duplicate task id {}", id);
            return Err(TaskError::DuplicateTask(id));
        }
        if let Some(max) = self.config.max_concurrent_tasks {
            if state.tasks.len() >= max {
                debug!("Rejecting task {}: {} tasks already registered", id, max);
                return Err(TaskError::ConcurrencyLimitExceeded(max));
            }
        }

        let task = StreamingTask::new(id.clone());
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        task.subscribe(move |event: &ProgressEvent| {
            if let Some(shared) = shared.upgrade() {
                shared.on_event(event);
            }
        });

        state.tasks.insert(id.clone(), task.clone());
        state.stats.total += 1;
        let active = state.tasks.len();
        drop(state);

        info!("📋 Task registered: {} ({} active)", id, active);
        Ok(task)
    }

    pub fn create_task_with_generated_id(&self) -> TaskResult<StreamingTask> {
        self.create_task(uuid::Uuid::new_v4().to_string())
    }

    pub fn get_task(&self, id: &str) -> Option<StreamingTask> {
        self.shared.state.lock().tasks.get(id).cloned()
    }

    /// Cancel a registered task. Unknown ids are ignored; returns whether the
    /// id was registered.
    pub fn cancel_task(&self, id: &str, reason: impl Into<String>) -> bool {
        match self.get_task(id) {
            Some(task) => {
                if task.cancel(reason) {
                    info!("🛑 Task {} cancelled", id);
                }
                true
            }
            None => {
                debug!("Cancel requested for unknown task {}", id);
                false
            }
        }
    }

    /// Cancel every registered task that has not finished yet. Returns the
    /// ids that were actually cancelled.
    pub fn cancel_all(&self, reason: &str) -> Vec<String> {
        let cancelled: Vec<String> = self
            .get_active_tasks()
            .into_iter()
            .filter(|task| !task.is_terminal())
            .filter(|task| task.cancel(reason))
            .map(|task| task.id().to_string())
            .collect();

        info!("🛑 Cancelled {} tasks: {}", cancelled.len(), reason);
        cancelled
    }

    /// Remove a task regardless of its status, freeing its admission slot.
    pub fn cleanup_task(&self, id: &str) -> Option<StreamingTask> {
        let task = self.shared.state.lock().tasks.remove(id);
        if task.is_some() {
            debug!("📋 Task {} removed", id);
        }
        task
    }

    /// All registered tasks, whatever their status
    pub fn get_active_tasks(&self) -> Vec<StreamingTask> {
        self.shared.state.lock().tasks.values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().tasks.len()
    }

    pub fn get_stats(&self) -> TaskStats {
        let writer_stats = self.shared.counters.stats();

        let state = self.shared.state.lock();
        TaskStats {
            total_tasks: state.stats.total,
            completed_tasks: state.stats.completed,
            failed_tasks: state.stats.failed,
            cancelled_tasks: state.stats.cancelled,
            active_tasks: state.tasks.len(),
            max_concurrent_tasks: self.config.max_concurrent_tasks,
            persisted_events: writer_stats.persisted_events,
            dropped_events: writer_stats.dropped_events,
            persist_failures: writer_stats.persist_failures,
        }
    }

    /// Remove the oldest finished tasks so that at most `retain` remain.
    /// Returns how many were removed.
    pub fn prune_finished(&self, retain: usize) -> usize {
        let mut finished: Vec<(StreamingTask, chrono::DateTime<chrono::Utc>)> = self
            .get_active_tasks()
            .into_iter()
            .filter_map(|task| task.completed_at().map(|t| (task, t)))
            .collect();

        if finished.len() <= retain {
            return 0;
        }

        // Oldest first
        finished.sort_by(|(_, a), (_, b)| a.cmp(b));

        let to_remove = finished.len() - retain;
        let victims: Vec<StreamingTask> = finished
            .into_iter()
            .take(to_remove)
            .map(|(task, _)| task)
            .collect();
        let removed = self.remove_exact(&victims);

        if removed > 0 {
            info!("🧹 Pruned {} finished tasks", removed);
        }
        removed
    }

    /// Remove each task whose id still maps to that same task. An id that was
    /// cleaned up and re-registered in the meantime is left alone.
    fn remove_exact(&self, tasks: &[StreamingTask]) -> usize {
        let mut state = self.shared.state.lock();
        let mut removed = 0;
        for task in tasks {
            let same = state
                .tasks
                .get(task.id())
                .is_some_and(|current| current.same_task(task));
            if same {
                state.tasks.remove(task.id());
                removed += 1;
            }
        }
        removed
    }

    /// Prune finished tasks every `interval`. Only one loop runs per
    /// registry; it stops when the registry is dropped. Returns `false` if a
    /// loop was already running or `interval` is zero.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_auto_cleanup(self: Arc<Self>, interval: Duration, retain: usize) -> bool {
        if interval.is_zero() {
            warn!("Refusing to start auto-cleanup with a zero interval");
            return false;
        }
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let registry = Arc::downgrade(&self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match registry.upgrade() {
                    Some(registry) => {
                        registry.prune_finished(retain);
                    }
                    None => break,
                }
            }
        });

        info!("🧹 Auto-cleanup started (interval: {:?})", interval);
        true
    }

    /// Attach a persistence sink. Events from every managed task, including
    /// tasks created earlier, are forwarded from now on. A previously attached
    /// sink keeps draining what it already queued.
    ///
    /// Must be called from within a tokio runtime.
    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        let writer = EventWriter::spawn_with_counters(
            sink,
            self.config.event_queue_capacity,
            self.shared.counters.clone(),
        );
        let previous = self.shared.writer.write().replace(writer);
        if previous.is_some() {
            info!("Event sink replaced");
        } else {
            info!("Event sink attached");
        }
    }

    pub fn has_event_sink(&self) -> bool {
        self.shared.writer.read().is_some()
    }

    /// Persisted events of a task, oldest first.
    pub async fn get_task_history(&self, task_id: &str) -> TaskResult<Vec<ProgressEvent>> {
        let sink = self
            .shared
            .writer
            .read()
            .as_ref()
            .map(|w| w.sink())
            .ok_or(TaskError::NoEventSink)?;
        Ok(sink.query(task_id).await?)
    }

    /// Wait until every event emitted before this call has reached the sink.
    pub async fn flush_events(&self) {
        let writer = self.shared.writer.read().clone();
        if let Some(writer) = writer {
            writer.flush().await;
        }
    }

    /// Feed of every event from every managed task. Slow receivers lose
    /// events rather than blocking tasks.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.feed.subscribe()
    }
}

impl Default for StreamingTaskRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryEventSink;
    use crate::tasks::TaskStatus;
    use serde_json::json;

    fn bounded(max: usize) -> StreamingTaskRegistry {
        StreamingTaskRegistry::new(RegistryConfig {
            max_concurrent_tasks: Some(max),
            ..Default::default()
        })
    }

    #[test]
    fn test_create_and_get() {
        let registry = StreamingTaskRegistry::default();
        let task = registry.create_task("t1").unwrap();

        assert_eq!(task.status(), TaskStatus::Pending);
        let fetched = registry.get_task("t1").expect("task should be registered");
        assert_eq!(fetched.id(), "t1");
        assert!(registry.get_task("missing").is_none());
        assert_eq!(registry.get_stats().total_tasks, 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = StreamingTaskRegistry::default();
        registry.create_task("t1").unwrap();

        let err = registry.create_task("t1").unwrap_err();
        assert!(matches!(err, TaskError::DuplicateTask(ref id) if id == "t1"));
        assert_eq!(registry.get_stats().total_tasks, 1);
    }

    #[test]
    fn test_admission_limit_and_cleanup() {
        let registry = bounded(3);
        for i in 0..3 {
            registry.create_task(format!("t{}", i)).unwrap();
        }

        let err = registry.create_task("t3").unwrap_err();
        assert!(matches!(err, TaskError::ConcurrencyLimitExceeded(3)));

        assert!(registry.cleanup_task("t1").is_some());
        registry.create_task("t3").unwrap();
        assert_eq!(registry.active_count(), 3);
    }

    #[test]
    fn test_finished_tasks_still_hold_slots() {
        let registry = bounded(1);
        let task = registry.create_task("t1").unwrap();
        task.start(1).unwrap();
        task.complete(None).unwrap();

        assert!(matches!(
            registry.create_task("t2"),
            Err(TaskError::ConcurrencyLimitExceeded(1))
        ));
    }

    #[test]
    fn test_stats_follow_terminal_events_and_survive_cleanup() {
        let registry = StreamingTaskRegistry::default();

        let done = registry.create_task("done").unwrap();
        let broken = registry.create_task("broken").unwrap();
        let stopped = registry.create_task("stopped").unwrap();
        let waiting = registry.create_task("waiting").unwrap();

        done.start(1).unwrap();
        done.complete(Some(json!("ok"))).unwrap();
        broken.start(1).unwrap();
        broken.fail("boom").unwrap();
        stopped.cancel("user");

        let stats = registry.get_stats();
        assert_eq!(stats.total_tasks, 4);
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.failed_tasks, 1);
        assert_eq!(stats.cancelled_tasks, 1);
        assert!(stats.completed_tasks + stats.failed_tasks + stats.cancelled_tasks < stats.total_tasks);

        for id in ["done", "broken", "stopped"] {
            registry.cleanup_task(id);
        }
        waiting.cancel("shutdown");

        let stats = registry.get_stats();
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.cancelled_tasks, 2);
        assert_eq!(
            stats.completed_tasks + stats.failed_tasks + stats.cancelled_tasks,
            stats.total_tasks
        );
    }

    #[test]
    fn test_redundant_terminal_calls_count_once() {
        let registry = StreamingTaskRegistry::default();
        let task = registry.create_task("t1").unwrap();
        task.start(1).unwrap();
        task.complete(None).unwrap();
        task.complete(None).unwrap();
        registry.cancel_task("t1", "late");

        let stats = registry.get_stats();
        assert_eq!(stats.completed_tasks, 1);
        assert_eq!(stats.cancelled_tasks, 0);
    }

    #[test]
    fn test_cancel_task_unknown_id_is_noop() {
        let registry = StreamingTaskRegistry::default();
        assert!(!registry.cancel_task("ghost", "user"));
        assert_eq!(registry.get_stats().cancelled_tasks, 0);
    }

    #[test]
    fn test_cancel_task_signals_token() {
        let registry = StreamingTaskRegistry::default();
        let task = registry.create_task("t1").unwrap();
        let token = task.cancellation_token();
        task.start(5).unwrap();

        assert!(registry.cancel_task("t1", "user"));
        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert_eq!(token.reason().as_deref(), Some("user"));
    }

    #[test]
    fn test_cancel_all_skips_finished_tasks() {
        let registry = StreamingTaskRegistry::default();
        let finished = registry.create_task("finished").unwrap();
        finished.start(1).unwrap();
        finished.complete(None).unwrap();
        registry.create_task("pending").unwrap();
        registry.create_task("running").unwrap().start(3).unwrap();

        let mut cancelled = registry.cancel_all("shutdown");
        cancelled.sort();
        assert_eq!(cancelled, vec!["pending", "running"]);
        assert_eq!(
            registry.get_task("finished").unwrap().status(),
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_prune_finished_keeps_newest() {
        let registry = StreamingTaskRegistry::default();
        for i in 0..5 {
            let task = registry.create_task(format!("t{}", i)).unwrap();
            task.start(1).unwrap();
            task.complete(None).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        registry.create_task("live").unwrap();

        assert_eq!(registry.prune_finished(2), 3);
        let mut remaining: Vec<_> = registry
            .get_active_tasks()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        remaining.sort();
        assert_eq!(remaining, vec!["live", "t3", "t4"]);
        assert_eq!(registry.prune_finished(2), 0);
        assert_eq!(registry.get_stats().completed_tasks, 5);
    }

    #[test]
    fn test_prune_keeps_task_recreated_under_same_id() {
        let registry = StreamingTaskRegistry::default();
        let old = registry.create_task("t1").unwrap();
        old.start(1).unwrap();
        old.complete(None).unwrap();

        // Cleaned up and re-registered between snapshot and removal
        registry.cleanup_task("t1");
        let fresh = registry.create_task("t1").unwrap();

        assert_eq!(registry.remove_exact(&[old]), 0);
        let current = registry.get_task("t1").unwrap();
        assert!(current.same_task(&fresh));
        assert_eq!(current.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_auto_cleanup_rejects_zero_interval() {
        let registry = Arc::new(StreamingTaskRegistry::default());
        assert!(!registry.clone().start_auto_cleanup(Duration::ZERO, 0));
        // A later valid start is still possible
        assert!(registry.clone().start_auto_cleanup(Duration::from_secs(60), 0));
    }

    #[tokio::test]
    async fn test_auto_cleanup_prunes_in_background() {
        let registry = Arc::new(StreamingTaskRegistry::default());
        for i in 0..3 {
            let task = registry.create_task(format!("t{}", i)).unwrap();
            task.cancel("done");
        }

        assert!(registry.clone().start_auto_cleanup(Duration::from_millis(10), 0));
        assert!(!registry.clone().start_auto_cleanup(Duration::from_millis(10), 0));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_feed_receives_events() {
        let registry = StreamingTaskRegistry::default();
        let mut feed = registry.subscribe();

        let task = registry.create_task("t1").unwrap();
        task.start(1).unwrap();
        task.complete(None).unwrap();

        assert_eq!(feed.recv().await.unwrap().event_type, EventType::Started);
        assert_eq!(feed.recv().await.unwrap().event_type, EventType::Completed);
    }

    #[tokio::test]
    async fn test_sink_attached_later_sees_existing_tasks() {
        let registry = StreamingTaskRegistry::default();
        let task = registry.create_task("t1").unwrap();
        task.start(2).unwrap();

        let sink = Arc::new(MemoryEventSink::new());
        registry.set_event_sink(sink.clone());
        task.update_progress(1, None).unwrap();
        task.complete(None).unwrap();
        registry.flush_events().await;

        // Started was emitted before the sink existed
        let history = registry.get_task_history("t1").await.unwrap();
        let types: Vec<_> = history.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::Progress, EventType::Completed]);
        assert_eq!(registry.get_stats().persisted_events, 2);
    }

    #[tokio::test]
    async fn test_replacing_sink_keeps_persistence_counters() {
        let registry = StreamingTaskRegistry::default();
        registry.set_event_sink(Arc::new(MemoryEventSink::new()));

        let task = registry.create_task("t1").unwrap();
        task.start(2).unwrap();
        task.update_progress(1, None).unwrap();
        registry.flush_events().await;
        assert_eq!(registry.get_stats().persisted_events, 2);

        registry.set_event_sink(Arc::new(MemoryEventSink::new()));
        task.complete(None).unwrap();
        registry.flush_events().await;

        assert_eq!(registry.get_stats().persisted_events, 3);
    }

    #[tokio::test]
    async fn test_timeout_on_token_is_counted_as_cancellation() {
        let registry = StreamingTaskRegistry::default();
        let task = registry.create_task("t1").unwrap();
        task.start(3).unwrap();

        task.cancellation_token()
            .cancel_after(Duration::from_millis(5), "timeout")
            .await
            .unwrap();

        assert_eq!(task.status(), TaskStatus::Cancelled);
        assert!(matches!(
            task.update_progress(1, None),
            Err(TaskError::InvalidState { .. })
        ));
        assert!(!task.complete(None).unwrap());
        let stats = registry.get_stats();
        assert_eq!(stats.cancelled_tasks, 1);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[tokio::test]
    async fn test_history_without_sink() {
        let registry = StreamingTaskRegistry::default();
        assert!(!registry.has_event_sink());
        assert!(matches!(
            registry.get_task_history("t1").await,
            Err(TaskError::NoEventSink)
        ));
    }
}
