// Background event writer
//
// Hot-path callers hand events to a bounded queue with `try_send` and return
// immediately. A single worker drains the queue into the sink. When the queue
// is full the event is dropped and logged: task state must never wait on
// storage, so durability is traded for latency. Sink failures are logged and
// counted, never propagated. `flush` is the signal for callers that need the
// queued events to have reached the sink.

use super::traits::EventSink;
use crate::tasks::ProgressEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum WriterMessage {
    Event(ProgressEvent),
    Flush(oneshot::Sender<()>),
}

/// Persistence counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub persisted_events: u64,
    pub dropped_events: u64,
    pub persist_failures: u64,
}

/// Counters behind [`WriterStats`]. Several writers may share one set, so
/// totals survive replacing a writer.
#[derive(Debug, Default)]
pub struct WriterCounters {
    persisted: AtomicU64,
    dropped: AtomicU64,
    failures: AtomicU64,
}

impl WriterCounters {
    pub fn stats(&self) -> WriterStats {
        WriterStats {
            persisted_events: self.persisted.load(Ordering::Relaxed),
            dropped_events: self.dropped.load(Ordering::Relaxed),
            persist_failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone)]
pub struct EventWriter {
    tx: mpsc::Sender<WriterMessage>,
    sink: Arc<dyn EventSink>,
    counters: Arc<WriterCounters>,
}

impl EventWriter {
    /// Start the worker. It exits once every clone of the writer is dropped
    /// and the queue has drained.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>, capacity: usize) -> Self {
        Self::spawn_with_counters(sink, capacity, Arc::new(WriterCounters::default()))
    }

    /// Like [`EventWriter::spawn`], but adds to existing counters.
    pub fn spawn_with_counters(
        sink: Arc<dyn EventSink>,
        capacity: usize,
        counters: Arc<WriterCounters>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriterMessage>(capacity.max(1));

        let worker_sink = sink.clone();
        let worker_counters = counters.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Event(event) => match worker_sink.append(&event).await {
                        Ok(()) => {
                            worker_counters.persisted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            worker_counters.failures.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                "Failed to persist {} event for task {}: {}",
                                event.event_type, event.task_id, e
                            );
                        }
                    },
                    WriterMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Event writer stopped");
        });

        Self { tx, sink, counters }
    }

    /// Queue an event without waiting. Returns `false` if it was dropped.
    pub fn submit(&self, event: ProgressEvent) -> bool {
        match self.tx.try_send(WriterMessage::Event(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(WriterMessage::Event(event))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Event queue full, dropping {} event for task {}",
                    event.event_type, event.task_id
                );
                false
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Event writer closed, dropping event");
                false
            }
        }
    }

    /// Wait until everything queued before this call has been handed to the sink.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn sink(&self) -> Arc<dyn EventSink> {
        self.sink.clone()
    }

    pub fn stats(&self) -> WriterStats {
        self.counters.stats()
    }
}
