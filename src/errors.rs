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

//! Crate-wide error type.
//!
//! Every error class carries a stable numeric code that becomes the process
//! exit code; the code ranges are a contract with wrapper scripts and
//! monitoring, so variants may be added but codes never renumbered.

use std::path::PathBuf;

use thiserror::Error;

use crate::transport;

/// Exit code for success.
pub const EXIT_SUCCESS: u8 = 0;

/// Exit code for a command-defined non-fatal result, such as `archive-get`
/// finding no segment to deliver.
pub const EXIT_NOT_FOUND: u8 = 1;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum Error {
    #[error("assertion failed: {0}")]
    Assert(String),

    #[error("invalid option: {0}")]
    OptionInvalid(String),

    #[error("unable to find {path}")]
    FileMissing { path: String },

    #[error("unable to open {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to write {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to acquire lock {path}: held by process {holder}")]
    LockAcquire { path: PathBuf, holder: String },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("WAL segment {segment} already exists in the archive with a different checksum")]
    ArchiveDuplicate { segment: String },

    #[error("path {path} is missing")]
    PathMissing { path: String },

    #[error("checksum mismatch in {path}: expected {expected}, actual {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("format error: {0}")]
    Format(String),

    #[error("stop file exists for {0}")]
    Stop(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Raised by the master when a worker reports an error; carries the
    /// worker's code so it propagates unchanged through the executor.
    #[error("[{code}] raised from worker: {message}")]
    Remote {
        code: u8,
        message: String,
        stack: String,
    },

    #[error("backup set {label} is not valid: {reason}")]
    BackupSetInvalid { label: String, reason: String },

    #[error(
        "repository is not valid: {0}\n\
         HINT: has a stanza-create been performed?"
    )]
    RepoInvalid(String),

    #[error("unable to connect to host {host}: {reason}")]
    HostConnect { host: String, reason: String },

    #[error("terminated on signal")]
    TermSignal,

    #[error(transparent)]
    Transport(#[from] transport::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The stable error class code, used as the process exit code.
    pub fn code(&self) -> u8 {
        match self {
            Error::Assert(_) => 25,
            Error::OptionInvalid(_) => 31,
            Error::FileMissing { .. } => 38,
            Error::FileOpen { .. } => 39,
            Error::FileRead { .. } => 40,
            Error::FileWrite { .. } => 41,
            Error::LockAcquire { .. } => 42,
            Error::Crypto(_) => 43,
            Error::ArchiveDuplicate { .. } => 45,
            Error::PathMissing { .. } => 46,
            Error::ChecksumMismatch { .. } => 53,
            Error::Format(_) => 55,
            Error::Json(_) => 55,
            Error::Stop(_) => 56,
            Error::Protocol(_) => 57,
            Error::Remote { code, .. } => *code,
            Error::BackupSetInvalid { .. } => 58,
            Error::RepoInvalid(_) => 59,
            Error::HostConnect { .. } => 60,
            Error::TermSignal => 63,
            Error::Transport(err) => match err.kind() {
                transport::ErrorKind::NotFound => 38,
                transport::ErrorKind::AlreadyExists => 45,
                transport::ErrorKind::PermissionDenied => 39,
                transport::ErrorKind::Other => 70,
            },
        }
    }

    /// True for errors reported to the user without a stack trace: bad
    /// options, missing stanzas, lock conflicts.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::OptionInvalid(_)
                | Error::LockAcquire { .. }
                | Error::RepoInvalid(_)
                | Error::Stop(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(Error::Assert("x".into()).code(), 25);
        assert_eq!(Error::FileMissing { path: "a/b".into() }.code(), 38);
        assert_eq!(Error::Crypto("bad key".into()).code(), 43);
        assert_eq!(Error::Format("trailing byte".into()).code(), 55);
        assert_eq!(Error::TermSignal.code(), 63);
    }

    #[test]
    fn remote_error_keeps_worker_code() {
        let err = Error::Remote {
            code: 53,
            message: "checksum mismatch".into(),
            stack: "worker stack".into(),
        };
        assert_eq!(err.code(), 53);
        assert!(err.to_string().contains("raised from worker"));
    }
}
