//! Append-mostly audit log of events, rendered documents and agent runs.
//!
//! Backed by SQLite in WAL mode. Writes share one connection behind a mutex;
//! every read opens its own read-only connection, so listings never queue
//! behind a pipeline write. rusqlite is synchronous, so each call runs on
//! `spawn_blocking`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde_json::Value;

use crate::error::StoreError;
use crate::types::{
    DocumentQuery, DocumentView, Event, EventSummary, ExecutionRecord, ExecutionStatus,
    NewDocument, NewEvent, NewExecution, RenderedDocument,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    action TEXT,
    delivery_id TEXT,
    signature TEXT,
    payload TEXT NOT NULL,
    sender_login TEXT NOT NULL,
    sender_id INTEGER,
    repository TEXT NOT NULL,
    verified INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
CREATE INDEX IF NOT EXISTS idx_events_delivery ON events(delivery_id);

CREATE TABLE IF NOT EXISTS rendered_documents (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id INTEGER NOT NULL,
    repository TEXT NOT NULL,
    event_type TEXT NOT NULL,
    template TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_documents_event ON rendered_documents(event_id);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_id INTEGER NOT NULL,
    stdout TEXT NOT NULL,
    stderr TEXT,
    exit_code INTEGER,
    duration_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_document ON executions(document_id, created_at);
"#;

/// Persistence the pipeline and the HTTP surface depend on.
///
/// Deleting an event leaves its documents and executions in place.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_event(&self, event: NewEvent) -> Result<Event, StoreError>;
    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError>;
    /// The payload exactly as stored.
    async fn get_event_payload(&self, id: i64) -> Result<Option<String>, StoreError>;
    /// Newest first.
    async fn list_events(&self, limit: u32, offset: u32) -> Result<Vec<EventSummary>, StoreError>;
    async fn delete_event(&self, id: i64) -> Result<bool, StoreError>;
    async fn delivery_seen(&self, delivery_id: &str) -> Result<bool, StoreError>;

    async fn insert_document(&self, doc: NewDocument) -> Result<RenderedDocument, StoreError>;
    async fn get_document(&self, id: i64) -> Result<Option<DocumentView>, StoreError>;
    /// Newest first.
    async fn list_documents(&self, query: DocumentQuery) -> Result<Vec<DocumentView>, StoreError>;

    async fn insert_execution(&self, exec: NewExecution) -> Result<ExecutionRecord, StoreError>;
    /// The execution with the greatest creation time for a document.
    async fn latest_execution(&self, document_id: i64)
        -> Result<Option<ExecutionRecord>, StoreError>;

    /// Release the store. Every later call fails with [`StoreError::Closed`].
    async fn close(&self) -> Result<(), StoreError>;
}

pub struct SqliteStore {
    path: PathBuf,
    writer: Arc<Mutex<Option<Connection>>>,
    closed: Arc<AtomicBool>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            tracing::warn!(journal_mode = %journal_mode, "WAL unavailable; reads may wait on writes");
        }
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = %path.display(), "record store opened");
        Ok(Self {
            path,
            writer: Arc::new(Mutex::new(Some(conn))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn write<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let guard = writer
                .lock()
                .map_err(|_| StoreError::Task("writer lock poisoned".to_string()))?;
            let conn = guard.as_ref().ok_or(StoreError::Closed)?;
            f(conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }

    async fn read<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open_with_flags(
                &path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

/// Microsecond precision keeps the text fixed-width, so ordering by the
/// column is chronological.
fn now() -> (DateTime<Utc>, String) {
    let at = Utc::now().trunc_subsecs(6);
    (at, at.to_rfc3339_opts(SecondsFormat::Micros, true))
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn json(row: &Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

const EVENT_COLUMNS: &str = "id, timestamp, event_type, action, delivery_id, signature, payload, \
                             sender_login, sender_id, repository, verified";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    Ok(Event {
        id: row.get(0)?,
        timestamp: timestamp(row, 1)?,
        event_type: row.get(2)?,
        action: row.get(3)?,
        delivery_id: row.get(4)?,
        signature: row.get(5)?,
        payload: json(row, 6)?,
        sender_login: row.get(7)?,
        sender_id: row.get(8)?,
        repository: row.get(9)?,
        verified: row.get(10)?,
    })
}

const DOCUMENT_VIEW_SELECT: &str = "SELECT d.id, d.event_id, d.repository, d.event_type, \
     d.template, d.content, d.created_at, e.timestamp, e.delivery_id, e.sender_login, e.payload \
     FROM rendered_documents d LEFT JOIN events e ON e.id = d.event_id";

fn document_view_from_row(row: &Row<'_>, with_payload: bool) -> rusqlite::Result<DocumentView> {
    let payload = if with_payload {
        let raw: Option<String> = row.get(10)?;
        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e))
            })
        })
        .transpose()?
    } else {
        None
    };
    Ok(DocumentView {
        document: RenderedDocument {
            id: row.get(0)?,
            webhook_id: row.get(1)?,
            repository: row.get(2)?,
            event_type: row.get(3)?,
            prompt_template: row.get(4)?,
            parsed_content: row.get(5)?,
            created_at: timestamp(row, 6)?,
        },
        webhook_timestamp: optional_timestamp(row, 7)?,
        delivery_id: row.get(8)?,
        sender_login: row.get(9)?,
        payload,
    })
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let status: String = row.get(6)?;
    let status = ExecutionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            Type::Text,
            format!("unknown execution status {status:?}").into(),
        )
    })?;
    let duration: i64 = row.get(5)?;
    Ok(ExecutionRecord {
        id: row.get(0)?,
        prompt_id: row.get(1)?,
        response_content: row.get(2)?,
        error_message: row.get(3)?,
        exit_code: row.get(4)?,
        execution_time: u64::try_from(duration).unwrap_or_default(),
        status,
        created_at: timestamp(row, 7)?,
    })
}

// ─── RecordStore ─────────────────────────────────────────────────────────────

#[async_trait]
impl RecordStore for SqliteStore {
    async fn insert_event(&self, event: NewEvent) -> Result<Event, StoreError> {
        let payload_text = serde_json::to_string_pretty(&event.payload)?;
        self.write(move |conn| {
            let (at, at_text) = now();
            conn.execute(
                "INSERT INTO events (timestamp, event_type, action, delivery_id, signature, \
                 payload, sender_login, sender_id, repository, verified) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    at_text,
                    event.event_type,
                    event.action,
                    event.delivery_id,
                    event.signature,
                    payload_text,
                    event.sender_login,
                    event.sender_id,
                    event.repository,
                    event.verified,
                ],
            )?;
            Ok(Event {
                id: conn.last_insert_rowid(),
                timestamp: at,
                event_type: event.event_type,
                action: event.action,
                delivery_id: event.delivery_id,
                signature: event.signature,
                payload: event.payload,
                sender_login: event.sender_login,
                sender_id: event.sender_id,
                repository: event.repository,
                verified: event.verified,
            })
        })
        .await
    }

    async fn get_event(&self, id: i64) -> Result<Option<Event>, StoreError> {
        self.read(move |conn| {
            let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id], event_from_row)
                .optional()?)
        })
        .await
    }

    async fn get_event_payload(&self, id: i64) -> Result<Option<String>, StoreError> {
        self.read(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM events WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }

    async fn list_events(&self, limit: u32, offset: u32) -> Result<Vec<EventSummary>, StoreError> {
        self.read(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, event_type, action, delivery_id, sender_login, \
                 repository, verified FROM events \
                 ORDER BY timestamp DESC, id DESC LIMIT ?1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![limit, offset], |row| {
                Ok(EventSummary {
                    id: row.get(0)?,
                    timestamp: timestamp(row, 1)?,
                    event_type: row.get(2)?,
                    action: row.get(3)?,
                    delivery_id: row.get(4)?,
                    sender_login: row.get(5)?,
                    repository: row.get(6)?,
                    verified: row.get(7)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn delete_event(&self, id: i64) -> Result<bool, StoreError> {
        self.write(move |conn| {
            let changed = conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delivery_seen(&self, delivery_id: &str) -> Result<bool, StoreError> {
        let delivery_id = delivery_id.to_string();
        self.read(move |conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT id FROM events WHERE delivery_id = ?1 LIMIT 1",
                    params![delivery_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn insert_document(&self, doc: NewDocument) -> Result<RenderedDocument, StoreError> {
        self.write(move |conn| {
            let (at, at_text) = now();
            conn.execute(
                "INSERT INTO rendered_documents \
                 (event_id, repository, event_type, template, content, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    doc.webhook_id,
                    doc.repository,
                    doc.event_type,
                    doc.prompt_template,
                    doc.parsed_content,
                    at_text,
                ],
            )?;
            Ok(RenderedDocument {
                id: conn.last_insert_rowid(),
                webhook_id: doc.webhook_id,
                repository: doc.repository,
                event_type: doc.event_type,
                prompt_template: doc.prompt_template,
                parsed_content: doc.parsed_content,
                created_at: at,
            })
        })
        .await
    }

    async fn get_document(&self, id: i64) -> Result<Option<DocumentView>, StoreError> {
        self.read(move |conn| {
            let sql = format!("{DOCUMENT_VIEW_SELECT} WHERE d.id = ?1");
            Ok(conn
                .query_row(&sql, params![id], |row| document_view_from_row(row, true))
                .optional()?)
        })
        .await
    }

    async fn list_documents(&self, query: DocumentQuery) -> Result<Vec<DocumentView>, StoreError> {
        self.read(move |conn| {
            let sql = format!(
                "{DOCUMENT_VIEW_SELECT} WHERE (?1 IS NULL OR d.event_id = ?1) \
                 ORDER BY d.created_at DESC, d.id DESC LIMIT ?2 OFFSET ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![query.webhook_id, query.limit, query.offset],
                |row| document_view_from_row(row, false),
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn insert_execution(&self, exec: NewExecution) -> Result<ExecutionRecord, StoreError> {
        self.write(move |conn| {
            let (at, at_text) = now();
            let duration = i64::try_from(exec.execution_time).unwrap_or(i64::MAX);
            conn.execute(
                "INSERT INTO executions \
                 (document_id, stdout, stderr, exit_code, duration_ms, status, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    exec.prompt_id,
                    exec.response_content,
                    exec.error_message,
                    exec.exit_code,
                    duration,
                    exec.status.as_str(),
                    at_text,
                ],
            )?;
            Ok(ExecutionRecord {
                id: conn.last_insert_rowid(),
                prompt_id: exec.prompt_id,
                response_content: exec.response_content,
                error_message: exec.error_message,
                exit_code: exec.exit_code,
                execution_time: exec.execution_time,
                status: exec.status,
                created_at: at,
            })
        })
        .await
    }

    async fn latest_execution(
        &self,
        document_id: i64,
    ) -> Result<Option<ExecutionRecord>, StoreError> {
        self.read(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, document_id, stdout, stderr, exit_code, duration_ms, status, \
                     created_at FROM executions WHERE document_id = ?1 \
                     ORDER BY created_at DESC, id DESC LIMIT 1",
                    params![document_id],
                    execution_from_row,
                )
                .optional()?)
        })
        .await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let taken = writer
                .lock()
                .map_err(|_| StoreError::Task("writer lock poisoned".to_string()))?
                .take();
            if let Some(conn) = taken {
                conn.close().map_err(|(_, e)| StoreError::Sqlite(e))?;
            }
            Ok::<_, StoreError>(())
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))??;
        tracing::info!(path = %self.path.display(), "record store closed");
        Ok(())
    }
}
