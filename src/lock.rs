//! Cross-process exclusive lock on the repository directory.

use crate::error::{Error, Result};
use crate::file::LOCK_FILE;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;

/// Holds `repo.lock` open with an exclusive OS advisory lock for the
/// lifetime of the store. Dropping it releases the lock.
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Acquires the lock, failing immediately (no blocking wait) if another
    /// process already holds it.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file }),
            Err(_) => Err(Error::LockConflict),
        }
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn second_acquisition_fails_while_first_is_held() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = RepoLock::acquire(dir.path())?;
        let second = RepoLock::acquire(dir.path());
        assert!(matches!(second, Err(Error::LockConflict)));
        drop(first);
        let third = RepoLock::acquire(dir.path());
        assert!(third.is_ok());
        Ok(())
    }
}
