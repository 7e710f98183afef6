use super::traits::{EventSink, StorageResult};
use crate::tasks::ProgressEvent;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-process event store. Nothing survives the process.
#[derive(Default)]
pub struct MemoryEventSink {
    events: RwLock<HashMap<String, Vec<ProgressEvent>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored events across all tasks
    pub fn len(&self) -> usize {
        self.events.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.events.read().keys().cloned().collect()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn append(&self, event: &ProgressEvent) -> StorageResult<()> {
        self.events
            .write()
            .entry(event.task_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn query(&self, task_id: &str) -> StorageResult<Vec<ProgressEvent>> {
        Ok(self.events.read().get(task_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn test_events_are_grouped_by_task() {
        let sink = MemoryEventSink::new();
        sink.append(&ProgressEvent::new("a", EventType::Started, json!({})))
            .await
            .unwrap();
        sink.append(&ProgressEvent::new("b", EventType::Started, json!({})))
            .await
            .unwrap();
        sink.append(&ProgressEvent::new("a", EventType::Completed, json!({})))
            .await
            .unwrap();

        let history = sink.query("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].event_type, EventType::Started);
        assert_eq!(history[1].event_type, EventType::Completed);
        assert_eq!(sink.len(), 3);
        assert_eq!(sink.task_ids().len(), 2);
        assert!(sink.query("missing").await.unwrap().is_empty());
    }
}
