//! rollcall-ledger: Attendance ledger.
//!
//! Records the first sighting of each identity per session. The durable log
//! lives behind [`LogStore`] (a delimited text file or SQLite); the ledger
//! keeps an in-memory mirror of recorded labels, rebuilt from the log when
//! opened, so duplicate checks never rescan storage.

pub mod sqlite;
pub mod text;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub use sqlite::SqliteStore;
pub use text::TextLogStore;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance log I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("attendance database failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("attendance log is closed")]
    Closed,
    #[error("label {0:?} cannot be logged: it is empty or spans lines")]
    InvalidLabel(String),
}

/// Labels are stored one per line.
pub(crate) fn check_label(label: &str) -> Result<(), LedgerError> {
    if label.is_empty() || label.contains(['\n', '\r']) {
        return Err(LedgerError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

/// One attendance event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub label: String,
    pub timestamp: DateTime<Local>,
}

/// Result of [`Ledger::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// False when the label was already recorded this session.
    pub written: bool,
}

/// Durable, ordered attendance log.
pub trait LogStore: Send {
    /// Full scan of the log, oldest first.
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, LedgerError>;

    /// Append one record. Returns `false` if the store already held the
    /// label (another writer got there first) and nothing was written.
    fn append(&mut self, record: &AttendanceRecord) -> Result<bool, LedgerError>;

    /// Remove every record, starting a new session.
    fn clear(&mut self) -> Result<(), LedgerError>;

    /// Flush and release the storage handle. Later appends fail with
    /// [`LedgerError::Closed`].
    fn close(&mut self) -> Result<(), LedgerError>;

    fn describe(&self) -> String;
}

/// Open the store for `path`: SQLite for `.db`, `.sqlite` and `.sqlite3`
/// files, the delimited text log otherwise.
pub fn open_store(path: &Path) -> Result<Box<dyn LogStore>, LedgerError> {
    let is_sqlite = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "db" | "sqlite" | "sqlite3"));
    if is_sqlite {
        Ok(Box::new(SqliteStore::open(path)?))
    } else {
        Ok(Box::new(TextLogStore::open(path)?))
    }
}

struct Inner {
    store: Box<dyn LogStore>,
    recorded: HashSet<String>,
}

/// Deduplicating attendance ledger.
///
/// The membership check and the append happen under one lock, so concurrent
/// callers can never both record the same label.
pub struct Ledger {
    inner: Mutex<Inner>,
}

impl Ledger {
    /// Wrap a store, loading the labels it already holds.
    pub fn open(mut store: Box<dyn LogStore>) -> Result<Self, LedgerError> {
        let recorded: HashSet<String> = store.load()?.into_iter().map(|r| r.label).collect();
        tracing::info!(store = %store.describe(), recorded = recorded.len(), "attendance ledger opened");
        Ok(Self {
            inner: Mutex::new(Inner { store, recorded }),
        })
    }

    /// Record `label` at `now` unless it was already recorded this session.
    pub fn record(&self, label: &str, now: DateTime<Local>) -> Result<RecordOutcome, LedgerError> {
        check_label(label)?;
        let mut inner = self.lock();
        if inner.recorded.contains(label) {
            return Ok(RecordOutcome { written: false });
        }

        let record = AttendanceRecord {
            label: label.to_string(),
            timestamp: now,
        };
        let written = inner.store.append(&record)?;
        inner.recorded.insert(record.label);
        if written {
            tracing::info!(label, timestamp = %now.to_rfc3339(), "attendance recorded");
        } else {
            tracing::debug!(label, "label already present in store");
        }
        Ok(RecordOutcome { written })
    }

    pub fn contains(&self, label: &str) -> bool {
        self.lock().recorded.contains(label)
    }

    /// Number of distinct labels recorded this session.
    pub fn len(&self) -> usize {
        self.lock().recorded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records as currently stored, oldest first.
    pub fn records(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        self.lock().store.load()
    }

    /// Start a new session: drop every record.
    pub fn clear(&self) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        inner.store.clear()?;
        inner.recorded.clear();
        tracing::info!(store = %inner.store.describe(), "attendance ledger cleared");
        Ok(())
    }

    /// Release the storage handle.
    pub fn close(&self) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        inner.store.close()?;
        tracing::info!(store = %inner.store.describe(), "attendance ledger closed");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic mid-record leaves the mirror at worst one label behind the
        // store; the store itself stays consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Arc;

    /// In-memory store with switchable failures.
    #[derive(Default, Clone)]
    pub struct MemoryStore {
        pub records: Arc<Mutex<Vec<AttendanceRecord>>>,
        pub fail_appends: Arc<Mutex<bool>>,
    }

    impl LogStore for MemoryStore {
        fn load(&mut self) -> Result<Vec<AttendanceRecord>, LedgerError> {
            Ok(self.records.lock().unwrap().clone())
        }

        fn append(&mut self, record: &AttendanceRecord) -> Result<bool, LedgerError> {
            if *self.fail_appends.lock().unwrap() {
                return Err(LedgerError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(true)
        }

        fn clear(&mut self) -> Result<(), LedgerError> {
            self.records.lock().unwrap().clear();
            Ok(())
        }

        fn close(&mut self) -> Result<(), LedgerError> {
            Ok(())
        }

        fn describe(&self) -> String {
            "memory".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MemoryStore;
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn at(secs: i64) -> DateTime<Local> {
        Local.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ledger() -> (Ledger, MemoryStore) {
        let store = MemoryStore::default();
        (Ledger::open(Box::new(store.clone())).unwrap(), store)
    }

    #[test]
    fn test_record_is_idempotent_and_keeps_first_timestamp() {
        let (ledger, store) = ledger();
        assert!(ledger.record("bob", at(0)).unwrap().written);
        assert!(!ledger.record("bob", at(60)).unwrap().written);

        let records = store.records.lock().unwrap().clone();
        assert_eq!(records, vec![AttendanceRecord { label: "bob".into(), timestamp: at(0) }]);
    }

    #[test]
    fn test_distinct_labels_commute() {
        let (forward, fstore) = ledger();
        forward.record("alice", at(0)).unwrap();
        forward.record("carol", at(1)).unwrap();
        forward.record("alice", at(2)).unwrap();

        let (backward, bstore) = ledger();
        backward.record("carol", at(0)).unwrap();
        backward.record("alice", at(1)).unwrap();

        assert_eq!(fstore.records.lock().unwrap().len(), 2);
        assert_eq!(bstore.records.lock().unwrap().len(), 2);
        for l in [&forward, &backward] {
            assert!(l.contains("alice") && l.contains("carol"));
            assert_eq!(l.len(), 2);
        }
    }

    #[test]
    fn test_open_rebuilds_mirror_from_store() {
        let store = MemoryStore::default();
        store
            .records
            .lock()
            .unwrap()
            .push(AttendanceRecord { label: "dave".into(), timestamp: at(0) });

        let ledger = Ledger::open(Box::new(store.clone())).unwrap();
        assert!(ledger.contains("dave"));
        assert!(!ledger.record("dave", at(5)).unwrap().written);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_append_is_not_remembered() {
        let (ledger, store) = ledger();
        *store.fail_appends.lock().unwrap() = true;
        assert!(matches!(ledger.record("erin", at(0)), Err(LedgerError::Io(_))));
        assert!(!ledger.contains("erin"));

        // Once storage recovers the event can be written.
        *store.fail_appends.lock().unwrap() = false;
        assert!(ledger.record("erin", at(1)).unwrap().written);
        assert_eq!(store.records.lock().unwrap()[0].timestamp, at(1));
    }

    #[test]
    fn test_multiline_label_is_rejected() {
        let (ledger, store) = ledger();
        for bad in ["", "mallory\nalice", "eve\r"] {
            assert!(matches!(ledger.record(bad, at(0)), Err(LedgerError::InvalidLabel(_))));
        }
        assert!(ledger.is_empty());
        assert!(store.records.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_starts_new_session() {
        let (ledger, store) = ledger();
        ledger.record("frank", at(0)).unwrap();
        ledger.clear().unwrap();
        assert!(ledger.is_empty());
        assert!(ledger.record("frank", at(10)).unwrap().written);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_record_single_write() {
        let (ledger, store) = ledger();
        let ledger = Arc::new(ledger);

        let written: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let ledger = Arc::clone(&ledger);
                    s.spawn(move || ledger.record("grace", at(i)).unwrap().written as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(written, 1);
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_open_store_picks_backend_by_extension() {
        let dir = std::env::temp_dir().join(format!("rollcall-ledger-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();

        let sqlite = open_store(&dir.join("attendance.db")).unwrap();
        assert!(sqlite.describe().starts_with("sqlite"));
        let text = open_store(&dir.join("attendance.csv")).unwrap();
        assert!(text.describe().starts_with("text"));

        drop((sqlite, text));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
