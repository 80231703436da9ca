// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Per-stanza advisory locks.
//!
//! Mutating commands hold an exclusive file lock on
//! `<lock-path>/<stanza>-<archive|backup>.lock` with the holder's PID
//! written inside. Acquisition never blocks: a conflict reports the
//! holder's PID and fails. The lock is held by the open descriptor, so
//! every exit path, including signal-induced termination, releases it.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, trace};

use crate::{Error, Result};

/// Which operation family the lock serializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Archive,
    Backup,
}

impl LockType {
    fn name(&self) -> &'static str {
        match self {
            LockType::Archive => "archive",
            LockType::Backup => "backup",
        }
    }
}

/// A held advisory lock; dropping releases it.
#[derive(Debug)]
pub struct Lock {
    file: File,
    path: PathBuf,
}

impl Lock {
    /// Try to acquire without blocking.
    pub fn acquire(lock_path: &Path, stanza: &str, lock_type: LockType) -> Result<Lock> {
        std::fs::create_dir_all(lock_path).map_err(|source| Error::FileWrite {
            path: lock_path.to_owned(),
            source,
        })?;
        let path = lock_path.join(format!("{stanza}-{}.lock", lock_type.name()));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| Error::FileOpen {
                path: path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            let mut holder = String::new();
            let _ = file.read_to_string(&mut holder);
            let holder = holder.split_whitespace().next().unwrap_or("unknown").to_owned();
            return Err(Error::LockAcquire { path, holder });
        }

        file.set_len(0).and_then(|_| {
            file.seek(SeekFrom::Start(0))?;
            writeln!(file, "{}", std::process::id())?;
            file.flush()
        })
        .map_err(|source| Error::FileWrite {
            path: path.clone(),
            source,
        })?;

        debug!(?path, "acquired lock");
        Ok(Lock { file, path })
    }

    /// Explicit release, for callers that want the moment logged.
    pub fn release(self) {
        trace!(path = ?self.path, "releasing lock");
        // Drop does the work.
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod test {
    use assert_fs::TempDir;

    use super::*;

    #[test]
    fn acquire_and_release() {
        let temp = TempDir::new().unwrap();
        let lock = Lock::acquire(temp.path(), "main", LockType::Archive).unwrap();
        assert!(temp.path().join("main-archive.lock").exists());
        drop(lock);
        assert!(!temp.path().join("main-archive.lock").exists());
    }

    #[test]
    fn conflict_reports_holder_pid() {
        let temp = TempDir::new().unwrap();
        let _held = Lock::acquire(temp.path(), "main", LockType::Backup).unwrap();
        let err = Lock::acquire(temp.path(), "main", LockType::Backup).unwrap_err();
        assert_eq!(err.code(), 42);
        let message = err.to_string();
        assert!(message.contains(&std::process::id().to_string()), "{message}");
    }

    #[test]
    fn archive_and_backup_locks_are_independent() {
        let temp = TempDir::new().unwrap();
        let _archive = Lock::acquire(temp.path(), "main", LockType::Archive).unwrap();
        let _backup = Lock::acquire(temp.path(), "main", LockType::Backup).unwrap();
    }

    #[test]
    fn different_stanzas_do_not_conflict() {
        let temp = TempDir::new().unwrap();
        let _main = Lock::acquire(temp.path(), "main", LockType::Archive).unwrap();
        let _other = Lock::acquire(temp.path(), "other", LockType::Archive).unwrap();
    }

    #[test]
    fn sequential_reacquire_works() {
        let temp = TempDir::new().unwrap();
        let first = Lock::acquire(temp.path(), "main", LockType::Archive).unwrap();
        first.release();
        let _second = Lock::acquire(temp.path(), "main", LockType::Archive).unwrap();
    }
}
