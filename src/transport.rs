// Bulwark backup system.
// Copyright 2022, 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! Filesystem abstraction to read and write local and remote repositories.
//!
//! A transport has a root location; below that point everything is accessed
//! with a relative path. Transports must be `Send + Sync` so they can be
//! shared across threads. Small repository files (info, manifests, status)
//! are read and written whole; segment-sized data streams through
//! [Transport::open_read] and [Transport::open_write].

use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::{error, fmt, io, result};

use bytes::Bytes;
use derive_more::Display;
use url::Url;

use crate::errors;

pub mod local;
pub mod remote;

#[cfg(feature = "azure")]
pub mod azure;
#[cfg(feature = "gcs")]
pub mod gcs;
#[cfg(feature = "s3")]
pub mod s3;

/// Open a [Transport] to access a repository location.
///
/// `location` may be a local path or a URL with scheme `file`, `s3`,
/// `azure`, `gcs`, or `ssh`.
pub fn open_transport(location: &str) -> crate::Result<Arc<dyn Transport>> {
    if let Ok(url) = Url::parse(location) {
        match url.scheme() {
            "file" => Ok(Arc::new(local::LocalTransport::new(
                &url.to_file_path()
                    .map_err(|_| errors::Error::OptionInvalid(format!("bad file URL {url}")))?,
            ))),
            #[cfg(feature = "s3")]
            "s3" => Ok(s3::S3Transport::new(&url)?),
            #[cfg(feature = "azure")]
            "azure" => Ok(azure::AzureTransport::new(&url)?),
            #[cfg(feature = "gcs")]
            "gcs" => Ok(gcs::GcsTransport::new(&url)?),
            "ssh" => Ok(remote::RemoteTransport::connect(&url)?),
            d if d.len() == 1 => {
                // Probably a Windows path with drive letter, not a URL.
                Ok(Arc::new(local::LocalTransport::new(Path::new(location))))
            }
            other => Err(errors::Error::OptionInvalid(format!(
                "unsupported repository scheme '{other}'"
            ))),
        }
    } else {
        Ok(Arc::new(local::LocalTransport::new(Path::new(location))))
    }
}

/// Per-backend capabilities; callers branch on these only where behavior
/// genuinely differs (e.g. hardlinked backups fall back to copies).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// Directories exist and must be created and removed.
    Path,
    /// The backend compresses at rest on its own.
    Compress,
    /// Hard links between stored files.
    Hardlink,
    /// Mode, user, and group are recorded.
    InfoDetail,
    /// Symbolic links.
    Symlink,
    /// The backend encrypts at rest on its own.
    EncryptedAtRest,
}

/// How a write should behave if the file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Write via a temporary sibling and rename, replacing any existing
    /// file; readers never observe a partial file.
    Atomic,
    /// Fail with [ErrorKind::AlreadyExists] if the file exists.
    CreateNew,
}

/// An open streaming write; nothing is visible at the final name until
/// [WriteSink::commit].
pub trait WriteSink: io::Write + Send {
    /// Make the written bytes durable and visible at the final name.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Abstracted I/O to access a repository.
pub trait Transport: Send + Sync + fmt::Debug {
    /// The features this backend supports.
    fn features(&self) -> &'static [Feature];

    /// A URL describing the root of this transport, for messages.
    fn url(&self) -> &Url;

    /// List one directory level: file and subdirectory names, in arbitrary
    /// order. Object stores synthesize directories from key prefixes and
    /// follow continuation tokens transparently.
    fn list_dir(&self, relpath: &str) -> Result<ListDir>;

    /// Get one complete file.
    fn read_file(&self, relpath: &str) -> Result<Bytes>;

    /// Open a streaming read, optionally of a byte range.
    fn open_read(
        &self,
        relpath: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Box<dyn Read + Send>>;

    /// Write a complete file.
    fn write_file(&self, relpath: &str, content: &[u8], mode: WriteMode) -> Result<()>;

    /// Open a streaming write. Object stores buffer and upload on commit,
    /// in blocks when the backend wants bounded request sizes.
    fn open_write(&self, relpath: &str) -> Result<Box<dyn WriteSink>>;

    /// Get metadata about a file.
    fn metadata(&self, relpath: &str) -> Result<Metadata>;

    /// Check if a regular file exists.
    fn is_file(&self, relpath: &str) -> Result<bool> {
        match self.metadata(relpath) {
            Ok(metadata) => Ok(metadata.kind == Kind::File),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Create a directory if it does not exist; parents are not created.
    /// A no-op where [Feature::Path] is absent.
    fn create_dir(&self, relpath: &str) -> Result<()>;

    /// Delete a file.
    fn remove_file(&self, relpath: &str) -> Result<()>;

    /// Delete a directory and all its contents.
    fn remove_dir_all(&self, relpath: &str) -> Result<()>;

    /// Rename a file within the transport; backends without rename copy and
    /// delete.
    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let content = self.read_file(from)?;
        self.write_file(to, &content, WriteMode::Atomic)?;
        self.remove_file(from)
    }

    /// Make a new transport addressing a subdirectory.
    fn chdir(&self, relpath: &str) -> Arc<dyn Transport>;
}

/// Kind of file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    File,
    Dir,
    Symlink,
    Unknown,
}

impl From<std::fs::FileType> for Kind {
    fn from(file_type: std::fs::FileType) -> Kind {
        if file_type.is_file() {
            Kind::File
        } else if file_type.is_dir() {
            Kind::Dir
        } else if file_type.is_symlink() {
            Kind::Symlink
        } else {
            Kind::Unknown
        }
    }
}

/// Stat metadata about a file in a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// File length.
    pub len: u64,
    /// Kind of file.
    pub kind: Kind,
    /// Modification time, where the backend records one.
    pub modified: Option<time::OffsetDateTime>,
    /// Unix mode bits, on backends with [Feature::InfoDetail].
    pub mode: Option<u32>,
    /// Owner and group names, on backends with [Feature::InfoDetail].
    pub user: Option<String>,
    pub group: Option<String>,
}

/// A list of all the files and directories in one directory.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct ListDir {
    pub files: Vec<String>,
    pub dirs: Vec<String>,
}

/// A transport error, as a generalization of IO and SDK errors.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    /// The underlying error: an IO or SDK error.
    source: Option<Box<dyn error::Error + Send + Sync>>,
    /// The affected path, relative to the transport.
    path: Option<String>,
}

/// General categories of transport errors.
#[derive(Debug, Display, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    #[display(fmt = "Not found")]
    NotFound,

    #[display(fmt = "Already exists")]
    AlreadyExists,

    #[display(fmt = "Permission denied")]
    PermissionDenied,

    #[display(fmt = "Other transport error")]
    Other,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// The transport-relative path where this error occurred, if known.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub(crate) fn new(kind: ErrorKind, path: &str) -> Error {
        Error {
            kind,
            source: None,
            path: Some(path.to_owned()),
        }
    }

    pub(crate) fn io_error(path: &Path, source: io::Error) -> Error {
        let kind = match source.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Other,
        };
        Error {
            source: Some(Box::new(source)),
            path: Some(path.to_string_lossy().to_string()),
            kind,
        }
    }

    pub(crate) fn other<E>(path: &str, source: E) -> Error
    where
        E: error::Error + Send + Sync + 'static,
    {
        Error {
            kind: ErrorKind::Other,
            source: Some(Box::new(source)),
            path: Some(path.to_owned()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(ref path) = self.path {
            write!(f, ": {path}")?;
        }
        if let Some(ref source) = self.source {
            write!(f, ": {source}")?;
        }
        Ok(())
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source.as_ref().map(|s| &**s as _)
    }
}

pub type Result<T> = result::Result<T, Error>;

/// Streaming write emulation for stores whose uploads are whole objects:
/// buffer, then upload on commit.
#[cfg(any(feature = "s3", feature = "azure", feature = "gcs"))]
pub(crate) struct BufferedSink {
    buffer: Vec<u8>,
    relpath: String,
    put: Box<dyn Fn(&str, Vec<u8>) -> Result<()> + Send>,
}

#[cfg(any(feature = "s3", feature = "azure", feature = "gcs"))]
impl BufferedSink {
    pub(crate) fn new(
        relpath: &str,
        put: Box<dyn Fn(&str, Vec<u8>) -> Result<()> + Send>,
    ) -> BufferedSink {
        BufferedSink {
            buffer: Vec::new(),
            relpath: relpath.to_owned(),
            put,
        }
    }
}

#[cfg(any(feature = "s3", feature = "azure", feature = "gcs"))]
impl io::Write for BufferedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(any(feature = "s3", feature = "azure", feature = "gcs"))]
impl WriteSink for BufferedSink {
    fn commit(self: Box<Self>) -> Result<()> {
        (self.put)(&self.relpath, self.buffer)
    }
}

/// Retry policy for backends that talk to a network: bounded attempts with
/// exponential backoff on retriable failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            initial_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Run `operation`, retrying transient failures. `retriable` decides
    /// which errors are worth another attempt.
    pub fn run<T, F, P>(&self, mut operation: F, retriable: P) -> Result<T>
    where
        F: FnMut() -> Result<T>,
        P: Fn(&Error) -> bool,
    {
        let mut delay = std::time::Duration::from_millis(self.initial_delay_ms);
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.attempts && retriable(&err) => {
                    tracing::warn!(?err, attempt, "retriable transport error");
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display_includes_kind_and_path() {
        let err = Error::new(ErrorKind::NotFound, "archive/main/archive.info");
        assert_eq!(err.to_string(), "Not found: archive/main/archive.info");
        assert!(err.is_not_found());
    }

    #[test]
    fn io_error_kind_mapping() {
        let err = Error::io_error(
            Path::new("x"),
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(!err.is_not_found());
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let mut calls = 0;
        let policy = RetryPolicy {
            attempts: 3,
            initial_delay_ms: 1,
        };
        let result: Result<()> = policy.run(
            || {
                calls += 1;
                Err(Error::new(ErrorKind::Other, "x"))
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retry_stops_on_permanent_error() {
        let mut calls = 0;
        let policy = RetryPolicy::default();
        let result: Result<()> = policy.run(
            || {
                calls += 1;
                Err(Error::new(ErrorKind::NotFound, "x"))
            },
            |err| !err.is_not_found(),
        );
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
