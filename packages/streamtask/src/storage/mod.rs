mod memory;
mod sqlite;
mod traits;
mod writer;

pub use memory::MemoryEventSink;
pub use sqlite::{SqliteEventSink, TaskHistorySummary};
pub use traits::{EventSink, StorageError, StorageResult};
pub use writer::{EventWriter, WriterCounters, WriterStats};
