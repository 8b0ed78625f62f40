//! SQLite attendance log. The label is the primary key, so the database
//! itself rejects a second record for the same label even across processes.

use crate::{AttendanceRecord, LedgerError, LogStore};
use chrono::{DateTime, Local, SecondsFormat};
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS attendance (
    label       TEXT PRIMARY KEY NOT NULL,
    recorded_at TEXT NOT NULL
)";

pub struct SqliteStore {
    conn: Option<Connection>,
    name: String,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Self::with_connection(Connection::open(path)?, path.display().to_string())
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::with_connection(Connection::open_in_memory()?, ":memory:".into())
    }

    fn with_connection(conn: Connection, name: String) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Some(conn),
            name,
        })
    }

    fn conn(&self) -> Result<&Connection, LedgerError> {
        self.conn.as_ref().ok_or(LedgerError::Closed)
    }
}

impl LogStore for SqliteStore {
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT label, recorded_at FROM attendance ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut records = Vec::new();
        for row in rows {
            let (label, recorded_at) = row?;
            match DateTime::parse_from_rfc3339(&recorded_at) {
                Ok(ts) => records.push(AttendanceRecord {
                    label,
                    timestamp: ts.with_timezone(&Local),
                }),
                Err(e) => tracing::warn!(label = %label, error = %e, "skipping attendance row with bad timestamp"),
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<bool, LedgerError> {
        let inserted = self.conn()?.execute(
            "INSERT OR IGNORE INTO attendance (label, recorded_at) VALUES (?1, ?2)",
            params![
                record.label,
                record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
            ],
        )?;
        Ok(inserted == 1)
    }

    fn clear(&mut self) -> Result<(), LedgerError> {
        self.conn()?.execute("DELETE FROM attendance", [])?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), LedgerError> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| LedgerError::Sqlite(e))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sqlite {}", self.name)
    }
}
