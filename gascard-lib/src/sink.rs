//! Persistence of scheduler batches.
//!
//! The scheduler hands every tick's rows to a [`SampleSink`]. Sinks are
//! synchronous; in asynchronous write mode the scheduler moves the sink onto
//! a blocking worker for the duration of one `persist` call.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, params_from_iter};
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::record::{FieldRecord, FieldValue};

/// One device's sample within a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleRow {
    pub device: String,
    /// Midpoint of `request_sent` and `response_received`.
    pub timestamp: DateTime<Utc>,
    pub request_sent: DateTime<Utc>,
    pub response_received: DateTime<Utc>,
    pub record: FieldRecord,
}

/// Everything collected in one scheduler tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleBatch {
    pub tick: u64,
    pub rows: Vec<SampleRow>,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Batch rejected: {0}")]
    Rejected(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl SinkError {
    /// Whether the storage itself is gone, as opposed to one bad batch.
    pub fn is_fatal(&self) -> bool {
        match self {
            SinkError::Io(_) | SinkError::Unavailable(_) => true,
            SinkError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                ErrorCode::CannotOpen
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::NotADatabase
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::PermissionDenied
            ),
            SinkError::Csv(e) => matches!(e.kind(), csv::ErrorKind::Io(_)),
            SinkError::Sqlite(_) | SinkError::Rejected(_) => false,
        }
    }
}

/// Destination for sample batches.
pub trait SampleSink: Send {
    fn persist(&mut self, batch: &SampleBatch) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl SampleSink for Box<dyn SampleSink> {
    fn persist(&mut self, batch: &SampleBatch) -> Result<(), SinkError> {
        (**self).persist(batch)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const TABLE: &str = "samples";
const KEY_COLUMNS: [&str; 4] = ["timestamp", "device", "request_sent", "response_received"];

/// Appends rows to a `samples` table, adding a typed column per new field.
pub struct SqliteSink {
    conn: Connection,
    /// Existing column names, ASCII-lowercased: SQLite identifiers ignore case.
    columns: HashSet<String>,
}

impl SqliteSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let conn = Connection::open(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Opened SQLite sample store");
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, SinkError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, SinkError> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {TABLE} (
                timestamp TIMESTAMP NOT NULL,
                device TEXT NOT NULL,
                request_sent TIMESTAMP,
                response_received TIMESTAMP,
                PRIMARY KEY (timestamp, device)
            )"
        ))?;
        let mut sink = Self {
            conn,
            columns: HashSet::new(),
        };
        sink.columns = sink.table_columns()?.iter().map(|c| c.to_ascii_lowercase()).collect();
        Ok(sink)
    }

    /// Column names currently in the table.
    pub fn table_columns(&self) -> Result<HashSet<String>, SinkError> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({TABLE})"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
        Ok(names.collect::<Result<_, _>>()?)
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn ensure_columns(&mut self, record: &FieldRecord) -> Result<(), SinkError> {
        for (name, value) in record.iter() {
            let folded = name.to_ascii_lowercase();
            if self.columns.contains(&folded) {
                continue;
            }
            let kind = match value {
                FieldValue::Number(_) => "REAL",
                FieldValue::Text(_) => "TEXT",
            };
            debug!(column = name, kind, "Adding sample column");
            self.conn
                .execute_batch(&format!("ALTER TABLE {TABLE} ADD COLUMN {} {kind}", quote_ident(name)))?;
            self.columns.insert(folded);
        }
        Ok(())
    }
}

impl SampleSink for SqliteSink {
    fn persist(&mut self, batch: &SampleBatch) -> Result<(), SinkError> {
        for row in &batch.rows {
            if let Some(name) = row
                .record
                .names()
                .find(|n| KEY_COLUMNS.iter().any(|k| k.eq_ignore_ascii_case(n)))
            {
                return Err(SinkError::Rejected(format!("field {name:?} collides with a key column")));
            }
            let mut seen = HashSet::new();
            if let Some(name) = row.record.names().find(|n| !seen.insert(n.to_ascii_lowercase())) {
                return Err(SinkError::Rejected(format!("field {name:?} differs from another only by case")));
            }
            self.ensure_columns(&row.record)?;
        }

        let tx = self.conn.transaction()?;
        for row in &batch.rows {
            let mut columns: Vec<String> = KEY_COLUMNS.iter().map(|c| quote_ident(c)).collect();
            let mut values = vec![
                Value::Text(format_timestamp(&row.timestamp)),
                Value::Text(row.device.clone()),
                Value::Text(format_timestamp(&row.request_sent)),
                Value::Text(format_timestamp(&row.response_received)),
            ];
            for (name, value) in row.record.iter() {
                columns.push(quote_ident(name));
                values.push(match value {
                    FieldValue::Number(v) => Value::Real(*v),
                    FieldValue::Text(s) => Value::Text(s.clone()),
                });
            }
            let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {TABLE} ({}) VALUES ({})",
                columns.join(", "),
                placeholders.join(", ")
            );
            tx.execute(&sql, params_from_iter(values))?;
        }
        tx.commit()?;
        debug!(tick = batch.tick, rows = batch.rows.len(), "Batch stored");
        Ok(())
    }
}

/// Writes rows to a CSV file; the header is fixed by the first batch.
pub struct CsvSink {
    writer: csv::Writer<File>,
    header: Option<Vec<String>>,
    dropped: HashSet<String>,
}

impl CsvSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let writer = csv::Writer::from_path(path.as_ref())?;
        info!(path = %path.as_ref().display(), "Writing samples to CSV");
        Ok(Self {
            writer,
            header: None,
            dropped: HashSet::new(),
        })
    }

    fn header_for(batch: &SampleBatch) -> Vec<String> {
        let mut header: Vec<String> = KEY_COLUMNS.iter().map(|c| c.to_string()).collect();
        for row in &batch.rows {
            for name in row.record.names() {
                if !header.iter().any(|h| h == name) {
                    header.push(name.to_string());
                }
            }
        }
        header
    }
}

impl SampleSink for CsvSink {
    fn persist(&mut self, batch: &SampleBatch) -> Result<(), SinkError> {
        if batch.rows.is_empty() {
            return Ok(());
        }
        let header = match &self.header {
            Some(header) => header.clone(),
            None => {
                let header = Self::header_for(batch);
                self.writer.write_record(&header)?;
                self.header = Some(header.clone());
                header
            }
        };

        for row in &batch.rows {
            for name in row.record.names() {
                if !header.iter().any(|h| h == name) && self.dropped.insert(name.to_string()) {
                    warn!(field = name, "Field not in CSV header, dropping");
                }
            }
            let fields = header[KEY_COLUMNS.len()..]
                .iter()
                .map(|name| row.record.get(name).map(ToString::to_string).unwrap_or_default());
            let record: Vec<String> = [
                format_timestamp(&row.timestamp),
                row.device.clone(),
                format_timestamp(&row.request_sent),
                format_timestamp(&row.response_received),
            ]
            .into_iter()
            .chain(fields)
            .collect();
            self.writer.write_record(&record)?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps batches in memory; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    batches: Arc<Mutex<Vec<SampleBatch>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<SampleBatch> {
        match self.batches.lock() {
            Ok(batches) => batches.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl SampleSink for MemorySink {
    fn persist(&mut self, batch: &SampleBatch) -> Result<(), SinkError> {
        let mut batches = self
            .batches
            .lock()
            .map_err(|_| SinkError::Unavailable("memory sink poisoned".to_string()))?;
        batches.push(batch.clone());
        Ok(())
    }
}
