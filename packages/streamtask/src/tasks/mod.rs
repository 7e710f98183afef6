// Streaming task engine
//
// Provides:
// - StreamingTask: per-operation state machine with progress, milestone and
//   result events
// - StreamingTaskRegistry: admission-controlled set of tasks with lifetime
//   statistics and event persistence
// - with_streaming: run a work routine as a registered task

mod registry;
mod streaming;
mod task;
mod types;

pub use registry::{RegistryConfig, StreamingTaskRegistry, TaskStats};
pub use streaming::{spawn_streaming, with_streaming};
pub use task::{StreamingTask, SubscriptionId, TaskListener};
pub use types::{EventType, ProgressEvent, TaskError, TaskInfo, TaskResult, TaskStatus};
