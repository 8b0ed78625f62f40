//! Delimited text attendance log.
//!
//! Format, one record per line:
//!
//! ```text
//! label,timestamp
//! alice,2024-03-04T09:15:02+01:00
//! ```
//!
//! The first line is a header. Timestamps are RFC 3339 local time with
//! offset, to the second. A line is split on its last comma, so labels may
//! contain commas but not line breaks.

use crate::{check_label, AttendanceRecord, LedgerError, LogStore};
use chrono::{DateTime, Local, SecondsFormat};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const HEADER: &str = "label,timestamp";

pub struct TextLogStore {
    path: PathBuf,
    file: Option<File>,
    /// The file may end in a partial line (hand edit, or an earlier failed
    /// write) and must be checked before the next append.
    check_tail: bool,
}

impl TextLogStore {
    /// Open (or create) the log at `path` for appending.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().read(true).create(true).append(true).open(path)?;
        let fresh = file.metadata()?.len() == 0;
        if fresh {
            writeln!(file, "{HEADER}")?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            check_tail: !fresh,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// True if the file is non-empty and its last byte is not a newline.
fn ends_mid_line(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Format one record as a log line, without the newline.
pub fn format_line(record: &AttendanceRecord) -> String {
    format!(
        "{},{}",
        record.label,
        record.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
    )
}

/// Parse one log line. `None` for blank lines, the header, and lines that
/// do not hold a valid timestamp.
pub fn parse_line(line: &str) -> Option<AttendanceRecord> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() || line == HEADER {
        return None;
    }
    let (label, ts) = line.rsplit_once(',')?;
    let timestamp = DateTime::parse_from_rfc3339(ts.trim()).ok()?.with_timezone(&Local);
    if label.is_empty() {
        return None;
    }
    Some(AttendanceRecord {
        label: label.to_string(),
        timestamp,
    })
}

impl LogStore for TextLogStore {
    fn load(&mut self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (n, line) in content.lines().enumerate() {
            match parse_line(line) {
                Some(r) => records.push(r),
                None if line.trim().is_empty() || line == HEADER => {}
                None => tracing::warn!(path = %self.path.display(), line = n + 1, "skipping malformed attendance line"),
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &AttendanceRecord) -> Result<bool, LedgerError> {
        check_label(&record.label)?;
        let file = self.file.as_mut().ok_or(LedgerError::Closed)?;
        let mut line = String::new();
        if self.check_tail && ends_mid_line(file)? {
            tracing::warn!(path = %self.path.display(), "attendance log ended mid-line; terminating it");
            line.push('\n');
        }
        line.push_str(&format_line(record));
        line.push('\n');

        // One write per line: O_APPEND keeps concurrent appenders from interleaving.
        let written = file.write_all(line.as_bytes()).and_then(|()| file.sync_data());
        self.check_tail = written.is_err();
        written?;
        Ok(true)
    }

    fn clear(&mut self) -> Result<(), LedgerError> {
        if self.file.is_none() {
            return Err(LedgerError::Closed);
        }
        let mut truncated = File::create(&self.path)?;
        writeln!(truncated, "{HEADER}")?;
        truncated.sync_data()?;
        self.file = Some(OpenOptions::new().read(true).append(true).open(&self.path)?);
        self.check_tail = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), LedgerError> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("text log {}", self.path.display())
    }
}
