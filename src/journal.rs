//! Journal: append-only log of successive committed roots.
//!
//! Each line is `"<record-id> root <unix-millis>"`. The most recent line
//! whose root segment actually resolves on disk is the repository's head;
//! earlier lines exist only as a fallback for the (rare) case where the
//! newest line's segment was never made durable before a crash.

use crate::error::Result;
use crate::file::JOURNAL_FILE;
use crate::id::RecordId;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// One parsed journal line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    pub record_id: RecordId,
    pub timestamp_millis: u64,
}

/// The append-only journal file handle.
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    #[must_use]
    pub fn at<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            path: dir.as_ref().join(JOURNAL_FILE),
        }
    }

    /// Opens a journal under `dir` using a file name other than the main
    /// root journal's — used by [`crate::checkpoints`] to keep the
    /// checkpoint map's root history in its own file.
    #[must_use]
    pub fn named<P: AsRef<Path>>(dir: P, file_name: &str) -> Self {
        Self {
            path: dir.as_ref().join(file_name),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line and fsyncs the file, making it durable.
    pub fn append(&self, record_id: RecordId, timestamp_millis: u64) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{record_id} root {timestamp_millis}")?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads every line, oldest first.
    pub fn read_all(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if let Some(entry) = parse_line(&line) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Iterates entries newest-first, the order `Store::initialize` walks
    /// to find the first resolvable head.
    pub fn read_newest_first(&self) -> Result<Vec<JournalEntry>> {
        let mut entries = self.read_all()?;
        entries.reverse();
        Ok(entries)
    }

    /// Truncates the journal to hold only `entry`, a legal maintenance
    /// operation after compaction (the older lines' roots are no longer
    /// needed once a newer root has been durably committed and GC has run).
    pub fn truncate_to_single(&self, entry: &JournalEntry) -> Result<()> {
        let content = format!("{} root {}\n", entry.record_id, entry.timestamp_millis);
        crate::file::rewrite_atomic(&self.path, content.as_bytes())?;
        Ok(())
    }
}

fn parse_line(line: &str) -> Option<JournalEntry> {
    let mut parts = line.split_whitespace();
    let record_id_str = parts.next()?;
    let marker = parts.next()?;
    let timestamp_str = parts.next()?;
    if marker != "root" {
        return None;
    }
    let record_id = RecordId::parse(record_id_str).ok()?;
    let timestamp_millis = timestamp_str.parse().ok()?;
    Some(JournalEntry {
        record_id,
        timestamp_millis,
    })
}
