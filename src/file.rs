//! Directory layout constants and small filesystem helpers.

use std::{fs::File, io::Write, path::Path};

/// Sentinel that marks a directory as a node-store repository.
#[doc(hidden)]
pub const REPO_MARKER: &str = ".node-store";

/// Cross-process exclusive lock file.
pub const LOCK_FILE: &str = "repo.lock";

/// Append-only journal of successive roots.
pub const JOURNAL_FILE: &str = "journal.log";

/// Append-only journal of successive checkpoint-map roots, separate from
/// the main root journal so that checkpoint bookkeeping never perturbs
/// [`resolve_head`](crate::store) recovery.
pub const CHECKPOINTS_JOURNAL_FILE: &str = "checkpoints.log";

/// Prefix for archive files: `data<NNNNN><gen>.tar`.
pub const ARCHIVE_PREFIX: &str = "data";

/// Suffix of every archive file.
pub const ARCHIVE_SUFFIX: &str = ".tar";

/// Legacy archive file prefix recognized (and upgraded) at open.
pub const LEGACY_ARCHIVE_PREFIX: &str = "bundle";

/// Reserved footer entry names within an archive.
pub const FOOTER_GRAPH: &str = ".gph";
pub const FOOTER_BLOB_REFS: &str = ".brf";
pub const FOOTER_INDEX: &str = ".idx";

/// Atomically rewrites a file's contents via a temp file + rename + fsync.
pub fn rewrite_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> std::io::Result<()> {
    let path = path.as_ref();
    let folder = path.parent().expect("path should have a parent");

    let mut temp_file = tempfile::NamedTempFile::new_in(folder)?;
    temp_file.write_all(content)?;
    temp_file.persist(path).map_err(|e| e.error)?;

    #[cfg(not(target_os = "windows"))]
    {
        let file = File::open(path)?;
        file.sync_all()?;
    }

    Ok(())
}

#[cfg(not(target_os = "windows"))]
pub fn fsync_directory<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let file = File::open(path)?;
    debug_assert!(file.metadata()?.is_dir());
    file.sync_all()
}

#[cfg(target_os = "windows")]
pub fn fsync_directory<P: AsRef<Path>>(_path: P) -> std::io::Result<()> {
    // Cannot fsync a directory handle on Windows.
    Ok(())
}

/// Formats an archive file name: `data<NNNNN><gen>.tar`.
///
/// `index` is zero-padded to 5 digits; `generation` is a lowercase letter
/// starting at `a` (the same index with a later letter means the file was
/// rewritten by cleanup).
#[must_use]
pub fn archive_file_name(index: u32, generation: u8) -> String {
    let gen_letter = (b'a' + generation) as char;
    format!("{ARCHIVE_PREFIX}{index:05}{gen_letter}{ARCHIVE_SUFFIX}")
}

/// Parses an archive file name back into `(index, generation)`.
///
/// Recognizes both the canonical prefix and the legacy `bundle` prefix so
/// that callers can detect and upgrade old repositories.
#[must_use]
pub fn parse_archive_file_name(name: &str) -> Option<(u32, u8)> {
    let stem = name
        .strip_prefix(ARCHIVE_PREFIX)
        .or_else(|| name.strip_prefix(LEGACY_ARCHIVE_PREFIX))?;
    let stem = stem.strip_suffix(ARCHIVE_SUFFIX)?;

    if stem.len() < 2 {
        return None;
    }

    let (index_part, gen_part) = stem.split_at(stem.len() - 1);
    let index: u32 = index_part.parse().ok()?;
    let gen_char = gen_part.chars().next()?;
    if !gen_char.is_ascii_lowercase() {
        return None;
    }
    let generation = gen_char as u8 - b'a';

    Some((index, generation))
}

/// `true` if `name` uses the legacy `bundle<NNNNN><gen>.tar` convention.
#[must_use]
pub fn is_legacy_archive_name(name: &str) -> bool {
    name.starts_with(LEGACY_ARCHIVE_PREFIX) && name.ends_with(ARCHIVE_SUFFIX)
}
