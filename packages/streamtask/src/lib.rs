pub mod cancellation;
pub mod cli;
pub mod config;
pub mod storage;
pub mod tasks;

pub use cancellation::{Cancelled, CancellationToken};
pub use config::EngineConfig;
pub use storage::{EventSink, MemoryEventSink, SqliteEventSink};
pub use tasks::{
    spawn_streaming, with_streaming, EventType, ProgressEvent, RegistryConfig, StreamingTask,
    StreamingTaskRegistry, TaskError, TaskStats, TaskStatus,
};
