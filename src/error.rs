use crate::id::SegmentId;
use std::fmt;

/// Errors surfaced by the node store.
///
/// Mirrors the taxonomy of the storage layer: I/O failures, structural
/// corruption, lock contention and commit races are distinguished so that
/// callers above can decide what is retryable.
#[derive(Debug)]
pub enum Error {
    /// Underlying file I/O failed.
    Io(std::io::Error),

    /// A record referenced a segment id that is not present in any reader
    /// or the current writer.
    SegmentNotFound(SegmentId),

    /// An archive file or segment failed a structural check (bad magic,
    /// misaligned offset, inconsistent index).
    Corruption(String),

    /// A record could not be decoded (bad head byte, truncated buffer).
    Decode(String),

    /// A record could not be encoded (value too large for its size class).
    Encode(String),

    /// `repo.lock` is held by another process.
    LockConflict,

    /// `setHead` lost the compare-and-swap race.
    CommitConflict,

    /// A garbage collection cycle (or estimation pass) was cancelled.
    Cancelled,

    /// The disk-space probe observed free space below the configured ratio.
    DiskSpaceLow,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::SegmentNotFound(id) => write!(f, "segment not found: {id}"),
            Self::Corruption(msg) => write!(f, "corruption: {msg}"),
            Self::Decode(msg) => write!(f, "decode error: {msg}"),
            Self::Encode(msg) => write!(f, "encode error: {msg}"),
            Self::LockConflict => write!(f, "repository is locked by another process"),
            Self::CommitConflict => write!(f, "head changed concurrently, commit conflict"),
            Self::Cancelled => write!(f, "operation was cancelled"),
            Self::DiskSpaceLow => write!(f, "disk space is running low"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
