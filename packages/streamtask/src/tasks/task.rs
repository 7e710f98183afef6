// Streaming task - per-operation state machine and event emitter
//
// Pending -> Running -> {Completed | Failed | Cancelled}, or Pending -> Cancelled.
// Progress calls are hard errors outside Running; terminal calls are no-ops once
// the task is terminal, so the first terminal transition wins any race.

use super::types::{EventType, ProgressEvent, TaskError, TaskInfo, TaskResult, TaskStatus};
use crate::cancellation::CancellationToken;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub type SubscriptionId = u64;

/// Synchronous observer of a task's events.
///
/// Called on the emitting thread before the mutating call returns. Listeners
/// that need to do I/O must hand the event off instead of blocking.
pub trait TaskListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> TaskListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

struct TaskState {
    status: TaskStatus,
    total_steps: u64,
    current_step: u64,
    progress: f64,
    results: Vec<Value>,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct EmitQueue {
    pending: VecDeque<ProgressEvent>,
    draining: bool,
}

struct TaskInner {
    id: String,
    created_at: DateTime<Utc>,
    token: CancellationToken,
    state: Mutex<TaskState>,
    // Held across check, mutation and dispatch so events leave in order.
    // Reentrant: a listener may call back into the same task. Events raised
    // from inside a listener are queued and delivered by the outermost
    // dispatch once the current event has reached every listener.
    emit_lock: ReentrantMutex<RefCell<EmitQueue>>,
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn TaskListener>)>>,
    next_subscription: AtomicU64,
}

/// Handle to a streaming task. Clones refer to the same task.
#[derive(Clone)]
pub struct StreamingTask {
    inner: Arc<TaskInner>,
}

fn percent(step: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (step as f64 / total as f64 * 100.0).round()
    }
}

impl StreamingTask {
    /// Create a Pending task. Cancelling its token from anywhere, including
    /// a `cancel_after` deadline, cancels the task.
    pub fn new(id: impl Into<String>) -> Self {
        let task = Self {
            inner: Arc::new(TaskInner {
                id: id.into(),
                created_at: Utc::now(),
                token: CancellationToken::new(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Pending,
                    total_steps: 0,
                    current_step: 0,
                    progress: 0.0,
                    results: Vec::new(),
                    error: None,
                    started_at: None,
                    completed_at: None,
                }),
                emit_lock: ReentrantMutex::new(RefCell::new(EmitQueue::default())),
                listeners: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
            }),
        };

        let weak: Weak<TaskInner> = Arc::downgrade(&task.inner);
        task.inner.token.on_cancelled(move |reason| {
            if let Some(inner) = weak.upgrade() {
                StreamingTask { inner }.cancel(reason);
            }
        });
        task
    }

    /// Whether both handles refer to the same task
    pub fn same_task(&self, other: &StreamingTask) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.state.lock().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn progress(&self) -> f64 {
        self.inner.state.lock().progress
    }

    pub fn current_step(&self) -> u64 {
        self.inner.state.lock().current_step
    }

    pub fn total_steps(&self) -> u64 {
        self.inner.state.lock().total_steps
    }

    pub fn results(&self) -> Vec<Value> {
        self.inner.state.lock().results.clone()
    }

    pub fn error(&self) -> Option<String> {
        self.inner.state.lock().error.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().completed_at
    }

    pub fn snapshot(&self) -> TaskInfo {
        let state = self.inner.state.lock();
        TaskInfo {
            id: self.inner.id.clone(),
            status: state.status,
            total_steps: state.total_steps,
            current_step: state.current_step,
            progress: state.progress,
            result_count: state.results.len(),
            error: state.error.clone(),
            cancel_reason: self.inner.token.reason(),
            created_at: self.inner.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }

    pub fn subscribe<L>(&self, listener: L) -> SubscriptionId
    where
        L: TaskListener + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        let listener: Arc<dyn TaskListener> = Arc::new(listener);
        self.inner.listeners.write().push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sub, _)| *sub != id);
        listeners.len() != before
    }

    pub fn start(&self, total_steps: u64) -> TaskResult<()> {
        self.transition(|id, state| {
            if state.status != TaskStatus::Pending {
                return Err(invalid(id, "start", state.status));
            }
            state.status = TaskStatus::Running;
            state.total_steps = total_steps;
            state.started_at = Some(Utc::now());
            debug!("Task {} started with {} steps", id, total_steps);
            Ok(Some(ProgressEvent::new(
                id,
                EventType::Started,
                json!({ "totalSteps": total_steps }),
            )))
        })
        .map(|_| ())
    }

    pub fn update_progress(&self, step: u64, message: Option<&str>) -> TaskResult<()> {
        self.transition(|id, state| {
            if state.status != TaskStatus::Running {
                return Err(invalid(id, "update progress of", state.status));
            }
            state.current_step = step;
            state.progress = percent(step, state.total_steps);
            Ok(Some(ProgressEvent::new(
                id,
                EventType::Progress,
                json!({
                    "step": step,
                    "totalSteps": state.total_steps,
                    "progress": state.progress,
                    "message": message,
                }),
            )))
        })
        .map(|_| ())
    }

    pub fn milestone(&self, name: &str, data: Option<Value>) -> TaskResult<()> {
        self.transition(|id, state| {
            if state.status != TaskStatus::Running {
                return Err(invalid(id, "record milestone for", state.status));
            }
            Ok(Some(ProgressEvent::new(
                id,
                EventType::Milestone,
                json!({ "name": name, "data": data }),
            )))
        })
        .map(|_| ())
    }

    pub fn add_result(&self, value: Value) -> TaskResult<()> {
        self.transition(|id, state| {
            if state.status != TaskStatus::Running {
                return Err(invalid(id, "add result to", state.status));
            }
            let index = state.results.len();
            state.results.push(value.clone());
            Ok(Some(ProgressEvent::new(
                id,
                EventType::Result,
                json!({ "index": index, "value": value }),
            )))
        })
        .map(|_| ())
    }

    /// Move Running -> Completed. Returns `Ok(false)` when the task had
    /// already reached a terminal state.
    pub fn complete(&self, final_result: Option<Value>) -> TaskResult<bool> {
        self.transition(|id, state| {
            if state.status.is_terminal() {
                debug!("Task {} already {}, ignoring complete", id, state.status);
                return Ok(None);
            }
            if state.status != TaskStatus::Running {
                return Err(invalid(id, "complete", state.status));
            }
            let has_final = final_result.is_some();
            if let Some(value) = final_result {
                state.results.push(value);
            }
            state.status = TaskStatus::Completed;
            state.progress = 100.0;
            state.completed_at = Some(Utc::now());
            Ok(Some(ProgressEvent::new(
                id,
                EventType::Completed,
                json!({
                    "progress": state.progress,
                    "resultCount": state.results.len(),
                    "hasFinalResult": has_final,
                }),
            )))
        })
    }

    /// Move Running -> Failed. Returns `Ok(false)` when the task had already
    /// reached a terminal state.
    pub fn fail(&self, error: impl std::fmt::Display) -> TaskResult<bool> {
        self.transition(|id, state| {
            if state.status.is_terminal() {
                debug!("Task {} already {}, ignoring fail", id, state.status);
                return Ok(None);
            }
            if state.status != TaskStatus::Running {
                return Err(invalid(id, "fail", state.status));
            }
            let message = error.to_string();
            state.status = TaskStatus::Failed;
            state.error = Some(message.clone());
            state.completed_at = Some(Utc::now());
            Ok(Some(ProgressEvent::new(
                id,
                EventType::Failed,
                json!({ "message": message }),
            )))
        })
    }

    /// Move Pending or Running -> Cancelled and fire the cancellation token.
    /// Returns `false` if the task was already terminal.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let emit = self.inner.emit_lock.lock();

        let event = {
            let mut state = self.inner.state.lock();
            if state.status.is_terminal() {
                debug!("Task {} already {}, ignoring cancel", self.inner.id, state.status);
                return false;
            }
            state.status = TaskStatus::Cancelled;
            state.completed_at = Some(Utc::now());
            ProgressEvent::new(
                self.inner.id.as_str(),
                EventType::Cancelled,
                json!({ "reason": reason }),
            )
        };

        // The token callback re-enters cancel and finds the task terminal
        self.inner.token.cancel(reason);
        self.dispatch(&emit, event);
        true
    }

    fn transition<F>(&self, apply: F) -> TaskResult<bool>
    where
        F: FnOnce(&str, &mut TaskState) -> TaskResult<Option<ProgressEvent>>,
    {
        let emit = self.inner.emit_lock.lock();
        let event = {
            let mut state = self.inner.state.lock();
            apply(&self.inner.id, &mut state)?
        };
        match event {
            Some(event) => {
                self.dispatch(&emit, event);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Must be called with the emit lock held.
    fn dispatch(&self, queue: &RefCell<EmitQueue>, event: ProgressEvent) {
        {
            let mut queue = queue.borrow_mut();
            queue.pending.push_back(event);
            if queue.draining {
                return;
            }
            queue.draining = true;
        }

        loop {
            let next = queue.borrow_mut().pending.pop_front();
            let Some(event) = next else { break };

            let listeners: Vec<Arc<dyn TaskListener>> = self
                .inner
                .listeners
                .read()
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect();

            for listener in listeners {
                listener.on_event(&event);
            }
        }

        queue.borrow_mut().draining = false;
    }
}

fn invalid(task_id: &str, operation: &'static str, status: TaskStatus) -> TaskError {
    TaskError::InvalidState {
        task_id: task_id.to_string(),
        operation,
        status,
    }
}

impl std::fmt::Debug for StreamingTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StreamingTask")
            .field("id", &self.inner.id)
            .field("status", &state.status)
            .field("current_step", &state.current_step)
            .field("total_steps", &state.total_steps)
            .finish()
    }
}
