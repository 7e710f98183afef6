use super::traits::{EventSink, StorageError, StorageResult};
use crate::tasks::{EventType, ProgressEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Latest persisted state of one task, for listings
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistorySummary {
    pub task_id: String,
    pub event_count: u64,
    pub last_event: EventType,
    pub last_timestamp: DateTime<Utc>,
}

/// SQLite-backed event sink.
///
/// rusqlite is blocking, so the async trait methods move each statement onto
/// the blocking thread pool.
pub struct SqliteEventSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventSink {
    pub fn open(db_path: &Path) -> StorageResult<Self> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        let sink = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        sink.init_schema()?;
        Ok(sink)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS task_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_task_events_task
             ON task_events(task_id, id)",
            [],
        )?;

        Ok(())
    }

    /// Blocking insert, for callers that are not on an async runtime
    pub fn insert_event(&self, event: &ProgressEvent) -> StorageResult<()> {
        insert(&self.conn.lock(), event)
    }

    /// Blocking lookup, for callers that are not on an async runtime
    pub fn events_for_task(&self, task_id: &str) -> StorageResult<Vec<ProgressEvent>> {
        select_task(&self.conn.lock(), task_id)
    }

    /// Most recently active tasks, newest first
    pub fn task_summaries(&self, limit: usize) -> StorageResult<Vec<TaskHistorySummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT e.task_id, c.cnt, e.event_type, e.timestamp
             FROM task_events e
             JOIN (SELECT task_id, COUNT(*) AS cnt, MAX(id) AS last_id
                   FROM task_events GROUP BY task_id) c
               ON e.id = c.last_id
             ORDER BY e.id DESC
             LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(task_id, count, event_type, timestamp)| -> StorageResult<TaskHistorySummary> {
                Ok(TaskHistorySummary {
                    task_id,
                    event_count: count as u64,
                    last_event: parse_event_type(&event_type)?,
                    last_timestamp: parse_timestamp(&timestamp)?,
                })
            })
            .collect()
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StorageError::Join(e.to_string()))?
    }
}

#[async_trait]
impl EventSink for SqliteEventSink {
    async fn append(&self, event: &ProgressEvent) -> StorageResult<()> {
        let event = event.clone();
        self.blocking(move |conn| insert(conn, &event)).await
    }

    async fn query(&self, task_id: &str) -> StorageResult<Vec<ProgressEvent>> {
        let task_id = task_id.to_string();
        self.blocking(move |conn| select_task(conn, &task_id)).await
    }
}

fn insert(conn: &Connection, event: &ProgressEvent) -> StorageResult<()> {
    let payload = serde_json::to_string(&event.data)?;
    conn.execute(
        "INSERT INTO task_events (task_id, event_type, timestamp, payload)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            event.task_id,
            event.event_type.as_str(),
            event.timestamp.to_rfc3339(),
            payload,
        ],
    )?;
    Ok(())
}

fn select_task(conn: &Connection, task_id: &str) -> StorageResult<Vec<ProgressEvent>> {
    let mut stmt = conn.prepare(
        "SELECT task_id, event_type, timestamp, payload
         FROM task_events
         WHERE task_id = ?1
         ORDER BY id ASC",
    )?;

    let rows = stmt
        .query_map([task_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(task_id, event_type, timestamp, payload)| -> StorageResult<ProgressEvent> {
            Ok(ProgressEvent {
                task_id,
                event_type: parse_event_type(&event_type)?,
                timestamp: parse_timestamp(&timestamp)?,
                data: serde_json::from_str(&payload)?,
            })
        })
        .collect()
}

fn parse_event_type(s: &str) -> StorageResult<EventType> {
    s.parse().map_err(StorageError::Internal)
}

fn parse_timestamp(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Internal(format!("Invalid timestamp {}: {}", s, e)))
}
