//! SQLite result store.
//!
//! One database file per experiment identifier (`{data_dir}/{id}.sqlite3`),
//! one table per file. The data directory is synced off-host by an external
//! tool, so nothing here ever rewrites or deletes a row.

use super::{
    decode_amplitudes, encode_amplitudes, ResultHandle, ResultStore, RowId, RowKeyClock,
    StoreError, WaveformRecord,
};
use crate::experiment::settings::validate_identifier;
use crate::instrument::PulseParameters;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Table name inside every experiment database.
pub const TABLE: &str = "acoustics";

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS acoustics (
    time REAL PRIMARY KEY,
    amps BLOB NOT NULL,
    delay REAL,
    voltage_range REAL,
    duration REAL,
    avg_num INTEGER,
    metadata TEXT
)";

const INSERT_ROW: &str = "INSERT INTO acoustics
    (time, amps, delay, voltage_range, duration, avg_num, metadata)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const SELECT_ROWS: &str = "SELECT time, amps, delay, voltage_range, duration, avg_num, metadata
    FROM acoustics ORDER BY time";

/// Directory of per-experiment SQLite files.
pub struct SqliteStore {
    data_dir: PathBuf,
    handles: Mutex<HashMap<String, Arc<SqliteHandle>>>,
}

impl SqliteStore {
    /// Store rooted at `data_dir`. Nothing touches the disk until `open`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Directory holding the database files.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the database file backing `identifier`.
    pub fn path_for(&self, identifier: &str) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite3", identifier))
    }

    /// Read every row back, oldest first.
    ///
    /// For verification and offline inspection; the experiment loop never
    /// reads. The file is opened read-only, and a missing one reads as empty
    /// without being created.
    pub fn read_records(&self, identifier: &str) -> Result<Vec<WaveformRecord>, StoreError> {
        validate(identifier)?;
        let path = self.path_for(identifier);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        read_all(&conn)
    }
}

fn validate(identifier: &str) -> Result<(), StoreError> {
    validate_identifier(identifier).map_err(|e| StoreError::InvalidIdentifier(e.to_string()))
}

#[async_trait]
impl ResultStore for SqliteStore {
    async fn open(&self, identifier: &str) -> Result<Arc<dyn ResultHandle>, StoreError> {
        validate(identifier)?;

        let existing = self.handles.lock().get(identifier).cloned();
        if let Some(handle) = existing {
            debug!(experiment = identifier, "Reusing open result store");
            return Ok(handle);
        }

        let data_dir = self.data_dir.clone();
        let path = self.path_for(identifier);
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            std::fs::create_dir_all(&data_dir)?;
            let conn = Connection::open(&open_path)?;
            conn.execute(CREATE_TABLE, [])?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))??;

        let handle = Arc::new(SqliteHandle {
            conn: Arc::new(Mutex::new(conn)),
            clock: RowKeyClock::new(),
            last_written: Mutex::new(None),
        });

        // Another task may have raced us here; keep whichever landed first.
        let handle = self
            .handles
            .lock()
            .entry(identifier.to_string())
            .or_insert(handle)
            .clone();

        info!(experiment = identifier, path = %path.display(), "Result store opened");
        Ok(handle)
    }
}

/// Open database for one experiment.
pub struct SqliteHandle {
    conn: Arc<Mutex<Connection>>,
    clock: RowKeyClock,
    last_written: Mutex<Option<f64>>,
}

#[async_trait]
impl ResultHandle for SqliteHandle {
    async fn write(&self, mut record: WaveformRecord) -> Result<RowId, StoreError> {
        let key = self.clock.next_key();
        record.timestamp = key;

        let blob = encode_amplitudes(&record.waveform)?;
        let metadata = if record.metadata.is_null() {
            None
        } else {
            Some(record.metadata.to_string())
        };
        let params = record.params.clone();
        let conn = self.conn.clone();

        let row_id = tokio::task::spawn_blocking(move || -> Result<RowId, StoreError> {
            let conn = conn.lock();
            conn.execute(
                INSERT_ROW,
                params![
                    key,
                    blob,
                    params.as_ref().map(|p| p.delay),
                    params.as_ref().map(|p| p.voltage_range),
                    params.as_ref().map(|p| p.duration),
                    params.as_ref().map(|p| p.avg_num),
                    metadata,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))??;

        *self.last_written.lock() = Some(key);
        Ok(row_id)
    }

    fn last_written(&self) -> Option<f64> {
        *self.last_written.lock()
    }
}

fn read_all(conn: &Connection) -> Result<Vec<WaveformRecord>, StoreError> {
    let table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [TABLE],
            |row| row.get(0),
        )
        .optional()?;
    if table.is_none() {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(SELECT_ROWS)?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, f64>(0)?,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Option<f64>>(2)?,
            row.get::<_, Option<f64>>(3)?,
            row.get::<_, Option<f64>>(4)?,
            row.get::<_, Option<u32>>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (timestamp, blob, delay, voltage_range, duration, avg_num, metadata) = row?;
        let params = match (delay, voltage_range, duration) {
            (Some(delay), Some(voltage_range), Some(duration)) => Some(PulseParameters {
                delay,
                voltage_range,
                duration,
                avg_num: avg_num.unwrap_or_default(),
            }),
            _ => None,
        };
        let metadata = match metadata {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Encoding(format!("metadata is not JSON: {}", e)))?,
            None => serde_json::Value::Null,
        };
        records.push(WaveformRecord {
            timestamp,
            waveform: decode_amplitudes(&blob)?,
            params,
            metadata,
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Waveform;

    fn waveform(samples: &[f32]) -> Waveform {
        let mut waveform = Waveform::new();
        waveform.insert("amps".to_string(), samples.to_vec());
        waveform
    }

    #[tokio::test]
    async fn test_open_creates_file_and_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("acoustics"));

        store.open("test").await.unwrap();

        let conn = Connection::open(store.path_for("test")).unwrap();
        let table: String = conn
            .query_row("SELECT name FROM sqlite_master WHERE type = 'table'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(table, TABLE);
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path());

        let first = store.open("cell").await.unwrap();
        first.write(WaveformRecord::new(waveform(&[1.0]), None)).await.unwrap();
        let second = store.open("cell").await.unwrap();
        second.write(WaveformRecord::new(waveform(&[2.0]), None)).await.unwrap();

        // A fresh store over the same directory must not trip over the schema
        let other = SqliteStore::new(dir.path());
        other.open("cell").await.unwrap();

        assert_eq!(other.read_records("cell").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_write_returns_increasing_row_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path());
        let handle = store.open("rows").await.unwrap();

        let a = handle.write(WaveformRecord::new(waveform(&[0.1]), None)).await.unwrap();
        let b = handle.write(WaveformRecord::new(waveform(&[0.2]), None)).await.unwrap();
        assert!(b > a);
        assert!(handle.last_written().is_some());
    }

    #[tokio::test]
    async fn test_rejects_unsafe_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path());
        let result = store.open("../escape").await;
        assert!(matches!(result, Err(StoreError::InvalidIdentifier(_))));
    }

    #[tokio::test]
    async fn test_hostile_metadata_is_stored_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path());
        let handle = store.open("inject").await.unwrap();

        let payload = serde_json::json!({ "note": "x'); DROP TABLE acoustics; --" });
        handle
            .write(WaveformRecord::new(waveform(&[1.0]), None).with_metadata(payload.clone()))
            .await
            .unwrap();

        let records = store.read_records("inject").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].metadata, payload);
    }

    #[test]
    fn test_read_missing_database_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path());
        assert!(store.read_records("never_opened").unwrap().is_empty());
        assert!(!store.path_for("never_opened").exists());
    }
}
