//! In-memory result store.
//!
//! Keeps every record in process memory, keyed by experiment identifier.
//! Writes complete without touching a thread pool, which keeps paused-clock
//! tests deterministic. Supports failure injection for recovery tests.

use super::{ResultHandle, ResultStore, RowId, RowKeyClock, StoreError, WaveformRecord};
use crate::experiment::settings::validate_identifier;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Shared {
    tables: Mutex<HashMap<String, Vec<WaveformRecord>>>,
    failing_writes: AtomicUsize,
    opens: AtomicUsize,
}

/// Cloneable handle onto a shared in-memory store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.shared.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Every record written for `identifier`, oldest first.
    pub fn records(&self, identifier: &str) -> Vec<WaveformRecord> {
        self.shared
            .tables
            .lock()
            .get(identifier)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of records written for `identifier`.
    pub fn record_count(&self, identifier: &str) -> usize {
        self.shared
            .tables
            .lock()
            .get(identifier)
            .map_or(0, Vec::len)
    }

    /// Number of `open` calls served so far.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn open(&self, identifier: &str) -> Result<Arc<dyn ResultHandle>, StoreError> {
        validate_identifier(identifier)
            .map_err(|e| StoreError::InvalidIdentifier(e.to_string()))?;

        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        self.shared
            .tables
            .lock()
            .entry(identifier.to_string())
            .or_default();

        Ok(Arc::new(MemoryHandle {
            identifier: identifier.to_string(),
            shared: self.shared.clone(),
            clock: RowKeyClock::new(),
            last_written: Mutex::new(None),
        }))
    }
}

struct MemoryHandle {
    identifier: String,
    shared: Arc<Shared>,
    clock: RowKeyClock,
    last_written: Mutex<Option<f64>>,
}

#[async_trait]
impl ResultHandle for MemoryHandle {
    async fn write(&self, mut record: WaveformRecord) -> Result<RowId, StoreError> {
        let injected = self
            .shared
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected write failure".to_string()));
        }

        record.timestamp = self.clock.next_key();
        let key = record.timestamp;

        let mut tables = self.shared.tables.lock();
        let rows = tables.entry(self.identifier.clone()).or_default();
        rows.push(record);
        let row_id = rows.len() as RowId;
        drop(tables);

        *self.last_written.lock() = Some(key);
        Ok(row_id)
    }

    fn last_written(&self) -> Option<f64> {
        *self.last_written.lock()
    }
}
