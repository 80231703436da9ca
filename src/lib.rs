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

//! Bulwark: a reliable backup and restore engine for PostgreSQL clusters.
//!
//! The repository stores full, differential, and incremental backups plus a
//! continuous archive of WAL segments, locally or on an object store. A WAL
//! segment declared archived has been durably stored; a backup declared
//! complete can always be restored given the WAL it references.

pub mod archive_get;
pub mod archive_push;
pub mod backup;
pub mod check;
pub mod compress;
pub mod config;
pub mod control;
pub mod crypto;
pub mod errors;
pub mod expire;
pub mod filter;
pub mod info;
pub mod label;
pub mod lock;
pub mod manifest;
pub mod pack;
pub mod pagecheck;
pub mod parallel;
pub mod protocol;
pub mod repo;
pub mod repocmd;
pub mod restore;
pub mod show;
pub mod spawn;
pub mod spool;
pub mod stanza;
pub mod storage;
pub mod test_fixtures;
pub mod transport;
pub mod verify;
pub mod wal;

pub use crate::archive_get::{archive_get, ArchiveGetOptions, ArchiveGetResult};
pub use crate::archive_push::{archive_push, ArchivePushOptions};
pub use crate::backup::{backup, BackupOptions};
pub use crate::config::Options;
pub use crate::errors::{Error, EXIT_NOT_FOUND, EXIT_SUCCESS};
pub use crate::expire::{expire, ExpireOptions};
pub use crate::filter::{Filter, FilterGroup, FilterResult};
pub use crate::info::archive::ArchiveInfo;
pub use crate::info::backup::BackupInfo;
pub use crate::label::{BackupLabel, BackupType};
pub use crate::lock::{Lock, LockType};
pub use crate::manifest::Manifest;
pub use crate::pack::{PackRead, PackType, PackWrite};
pub use crate::repo::Repo;
pub use crate::restore::{restore, RestoreOptions};
pub use crate::stanza::{stanza_create, stanza_delete, stanza_upgrade};
pub use crate::storage::Storage;
pub use crate::transport::Transport;
pub use crate::wal::WalSegment;

pub type Result<T> = std::result::Result<T, Error>;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

/// Repository format version, checked on every info-file load.
///
/// (This might be older than the program version.)
pub const REPO_FORMAT: u32 = 1;

/// Default WAL segment size; clusters may be built with 1 MiB..=64 MiB.
pub const WAL_SEGMENT_SIZE_DEFAULT: usize = 16 * 1024 * 1024;

/// PostgreSQL page size, fixed across supported versions.
pub const PG_PAGE_SIZE: usize = 8192;

/// Chunk size for streaming reads and writes through filter groups.
pub const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Temporary files in the repository have this suffix until renamed.
pub const TMP_SUFFIX: &str = ".tmp";

/// Top-level repository directories.
pub static REPO_ARCHIVE: &str = "archive";
pub static REPO_BACKUP: &str = "backup";

/// Registry file names, each stored with a sealed `.copy` sibling.
pub static ARCHIVE_INFO_FILE: &str = "archive.info";
pub static BACKUP_INFO_FILE: &str = "backup.info";
pub static MANIFEST_FILE: &str = "backup.manifest";
pub static COPY_SUFFIX: &str = ".copy";

/// Backup label timestamps, e.g. `20240314-092115F`.
pub const LABEL_TIMESTAMP_FORMAT: &[time::format_description::FormatItem<'static>] =
    time::macros::format_description!("[year][month][day]-[hour][minute][second]");
