//! Result store: append-only persistence of one record per completed pulse.
//!
//! The core needs three things from a store:
//!
//! - `open(identifier)` that is idempotent (reopening never duplicates schema),
//! - `write(record) -> RowId`,
//! - a row key that stays unique for the lifetime of an experiment.
//!
//! [`SqliteStore`] is the deployed backend (one database file per
//! experiment identifier); [`MemoryStore`] backs tests.

pub mod memory;
pub mod record;
pub mod sqlite;

pub use memory::MemoryStore;
pub use record::{decode_amplitudes, encode_amplitudes, Waveform, WaveformRecord};
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Row id assigned by the store.
pub type RowId = i64;

/// Result store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database failure.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem failure, e.g. creating the data directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Identifier is not a safe file name.
    #[error("Invalid experiment identifier: {0}")]
    InvalidIdentifier(String),

    /// A waveform could not be framed into a blob.
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The blocking task running the write panicked or was cancelled.
    #[error("Store task failed: {0}")]
    TaskJoin(String),

    /// The store refused the write.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Opens per-experiment handles.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Open or create the store for `identifier`. Must be idempotent.
    async fn open(&self, identifier: &str) -> Result<Arc<dyn ResultHandle>, StoreError>;
}

/// Append-only sink for one experiment.
#[async_trait]
pub trait ResultHandle: Send + Sync {
    /// Persist `record`, assigning its row key, and return the row id.
    ///
    /// The record's `timestamp` is overwritten with the key actually used.
    async fn write(&self, record: WaveformRecord) -> Result<RowId, StoreError>;

    /// Row key of the most recent successful write through this handle.
    fn last_written(&self) -> Option<f64>;
}

/// Wall-clock UNIX seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Issues strictly increasing wall-clock row keys.
///
/// Two pulses in the same clock tick, or a clock step backwards, would
/// otherwise collide on the primary key.
#[derive(Debug, Default)]
pub struct RowKeyClock {
    last: Mutex<Option<f64>>,
}

impl RowKeyClock {
    /// Smallest step added when the clock has not advanced.
    pub const MIN_STEP: f64 = 1e-6;

    /// Clock that has issued no keys yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next row key: the current UNIX time, or just past the previous key.
    pub fn next_key(&self) -> f64 {
        self.next_key_from(unix_now())
    }

    fn next_key_from(&self, now: f64) -> f64 {
        let mut last = self.last.lock();
        let key = match *last {
            Some(previous) if now <= previous => previous + Self::MIN_STEP,
            _ => now,
        };
        *last = Some(key);
        key
    }
}

/// Newest modification time (UNIX seconds) of any file directly in `dir`.
///
/// Returns `None` if the directory is missing or holds no files.
pub fn last_folder_update(dir: &Path) -> Option<f64> {
    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            if !metadata.is_file() {
                return None;
            }
            let modified = metadata.modified().ok()?;
            modified
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs_f64())
        })
        .fold(None, |newest: Option<f64>, t| Some(newest.map_or(t, |n| n.max(t))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_keys_strictly_increase() {
        let clock = RowKeyClock::new();
        let a = clock.next_key_from(100.0);
        let b = clock.next_key_from(100.0);
        let c = clock.next_key_from(99.0);
        let d = clock.next_key_from(200.0);
        assert_eq!(a, 100.0);
        assert!(b > a);
        assert!(c > b);
        assert_eq!(d, 200.0);
    }

    #[test]
    fn test_last_folder_update_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(last_folder_update(dir.path()), None);
        assert_eq!(last_folder_update(&dir.path().join("missing")), None);
    }

    #[test]
    fn test_last_folder_update_sees_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.sqlite3"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let newest = last_folder_update(dir.path()).unwrap();
        assert!(newest > 0.0);
    }
}
