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

//! The `archive-push` command.
//!
//! PostgreSQL's archive hook hands over one segment at a time and blocks
//! until it is durably stored. In direct mode the segment is pushed inline.
//! In async mode the synchronous invocation only consults (or seeds) the
//! spool: a detached daemon batches queued segments and uploads them in
//! parallel, so the hook's per-segment latency amortizes connection setup
//! across the batch.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::config::Options;
use crate::control;
use crate::lock::{Lock, LockType};
use crate::parallel::{self, Job, RetrySpec};
use crate::repo::Repo;
use crate::spawn;
use crate::spool::{Direction, SegmentStatus, Spool};
use crate::stanza::cluster_info;
use crate::storage::join_path;
use crate::wal::{archive_file_name, WalSegment};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ArchivePushOptions {
    /// Skip the fork and wait even when async mode is configured (used by
    /// the daemon itself).
    pub no_fork: bool,
}

/// The synchronous entry point invoked by the archive hook.
pub fn archive_push(options: &Options, wal_path: &Path, _push: ArchivePushOptions) -> Result<()> {
    control::check_stopped(options)?;
    let source = resolve_wal_path(options, wal_path);
    let segment = wal_file_name(&source)?;

    if !options.archive_async {
        let _lock = Lock::acquire(&options.lock_path, options.stanza()?, LockType::Archive)?;
        if let Some(warning) = push_one(options, &source, &segment)? {
            warn!("{warning}");
        }
        info!("pushed WAL segment {segment}");
        return Ok(());
    }

    let spool = Spool::open(options)?;

    // A status left by a previous batch resolves this invocation outright.
    if let Some(resolved) = consume_status(&spool, &segment)? {
        return resolved;
    }

    // Queue the segment and make sure a daemon is running to drain it.
    spool.clear_global_error(Direction::Out)?;
    spool.add(Direction::Out, &segment, &source)?;
    spawn::spawn_async_daemon("archive-push", options)?;
    debug!("queued {segment}, waiting for the daemon");

    let deadline = Instant::now() + Duration::from_millis(options.archive_timeout_ms);
    while Instant::now() < deadline {
        if let Some(resolved) = consume_status(&spool, &segment)? {
            return resolved;
        }
        if let Some((code, message)) = spool.global_error(Direction::Out)? {
            spool.clear_global_error(Direction::Out)?;
            return Err(Error::Remote {
                code,
                message,
                stack: String::new(),
            });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(Error::Protocol(format!(
        "timed out waiting for the async daemon to archive {segment} \
         (archive-timeout={}ms)",
        options.archive_timeout_ms
    )))
}

/// Resolve a per-segment status into this invocation's outcome, clearing
/// the status file.
fn consume_status(spool: &Spool, segment: &str) -> Result<Option<Result<()>>> {
    match spool.status(Direction::Out, segment)? {
        None => Ok(None),
        Some(SegmentStatus::Ok { warning }) => {
            spool.clear_status(Direction::Out, segment, true)?;
            if let Some(warning) = warning {
                warn!("{warning}");
            }
            info!("pushed WAL segment {segment} asynchronously");
            Ok(Some(Ok(())))
        }
        Some(SegmentStatus::Error { code, message }) => {
            spool.clear_status(Direction::Out, segment, true)?;
            Ok(Some(Err(Error::Remote {
                code,
                message,
                stack: String::new(),
            })))
        }
    }
}

/// The detached async daemon (`archive-push:async`).
///
/// Acquires the stanza archive lock and drains the spool; losing the lock
/// race to a concurrent daemon is a silent success since that daemon will
/// drain the same queue.
pub fn archive_push_async(options: &Options) -> Result<()> {
    let stanza = options.stanza()?;
    let _lock = match Lock::acquire(&options.lock_path, stanza, LockType::Archive) {
        Ok(lock) => lock,
        Err(Error::LockAcquire { .. }) => {
            debug!("another archive-push daemon holds the lock, exiting");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let spool = Spool::open(options)?;

    loop {
        let batch: Vec<String> = spool
            .list(Direction::Out)?
            .into_iter()
            .filter(|segment| {
                matches!(spool.status(Direction::Out, segment), Ok(None))
            })
            .collect();
        if batch.is_empty() {
            debug!("spool drained, daemon exiting");
            return Ok(());
        }
        info!("pushing batch of {} segments", batch.len());

        let clients = match spawn::spawn_local_pool("archive-push", options, options.process_max) {
            Ok(clients) => clients,
            Err(err) => {
                spool.write_global_error(Direction::Out, err.code(), &err.to_string())?;
                return Err(err);
            }
        };

        let mut jobs = batch.iter().cloned().map(|segment| Job {
            key: segment.clone(),
            cmd: "archive-push-file".into(),
            parameter: vec![json!(segment)],
        });
        let spool_done = spool.clone();
        parallel::execute(
            clients,
            RetrySpec {
                retries: options.job_retry,
                interval: Duration::from_millis(options.job_retry_interval_ms),
            },
            None,
            move || jobs.next(),
            |completion| {
                let segment = completion.key;
                match completion.result {
                    Ok(out) => {
                        let warning = out.as_str().filter(|s| !s.is_empty());
                        spool_done.write_ok(Direction::Out, &segment, warning)?;
                        spool_done.remove(Direction::Out, &segment)?;
                        debug!(
                            segment = %segment,
                            pid = completion.pid,
                            retries = completion.retries_used,
                            "segment pushed"
                        );
                    }
                    Err(err) => {
                        spool_done.write_error(
                            Direction::Out,
                            &segment,
                            err.code(),
                            &err.to_string(),
                        )?;
                    }
                }
                Ok(())
            },
        )?;
    }
}

/// Worker dispatch for `archive-push:local`.
pub fn worker_dispatch(cmd: &str, params: &[Value], options: &Options) -> Result<Value> {
    match cmd {
        "archive-push-file" => {
            let segment = crate::protocol::param_str(params, 0)?;
            let spool = Spool::open(options)?;
            let source = spool.segment_path(Direction::Out, segment);
            let warning = push_one(options, &source, segment)?;
            Ok(warning.map(Value::String).unwrap_or(Value::Null))
        }
        other => Err(Error::Protocol(format!("unknown command '{other}'"))),
    }
}

/// PostgreSQL passes `%p` relative to the data directory.
fn resolve_wal_path(options: &Options, wal_path: &Path) -> PathBuf {
    if wal_path.is_absolute() {
        wal_path.to_owned()
    } else {
        options.pg_path.join(wal_path)
    }
}

fn wal_file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::OptionInvalid(format!("bad WAL path {path:?}")))
}

/// Push one segment or history file; returns a warning for benign repeats.
///
/// Pushing a segment that already exists with identical content is a no-op
/// (the hook retries after crashes); differing content is an error since it
/// means two clusters are archiving into one stanza.
pub fn push_one(options: &Options, source: &Path, file_name: &str) -> Result<Option<String>> {
    let repo = Repo::open(options)?;
    let archive_info = repo.load_archive_info()?;
    let subkey = archive_info.cipher_pass.clone();
    let storage = repo.archive_storage()?;

    // The pushing cluster must match the archive history.
    let archive_id = match cluster_info(&options.pg_path) {
        Ok(db) => archive_info.archive_id_for(&db.version, db.system_id)?,
        Err(_) => archive_info.current().archive_id(),
    };

    let content = std::fs::read(source).map_err(|err| Error::FileOpen {
        path: source.to_owned(),
        source: err,
    })?;

    if WalSegment::is_history_name(file_name) {
        // Timeline history files are small and stored verbatim (encrypted
        // when the repository is).
        storage.path_create(&archive_id, true)?;
        let group = repo.store_filters(crate::compress::CompressType::None, subkey.as_deref());
        storage.write_filtered(&join_path(&archive_id, file_name), &content, group)?;
        return Ok(None);
    }

    let segment: WalSegment = file_name.parse()?;
    if content.len() != options.wal_segment_size {
        warn!(
            "segment {file_name} is {} bytes, expected {}",
            content.len(),
            options.wal_segment_size
        );
    }

    let sha1 = hex::encode(Sha1::digest(&content));
    let dir = join_path(&archive_id, &segment.directory());
    let stored_name = archive_file_name(&segment, &sha1, repo.compress_type.extension());

    // Dedup from one cached listing per directory.
    let listing = storage.list_cached(&dir)?;
    let prefix = format!("{segment}-");
    if let Some(existing) = listing.files.iter().find(|name| name.starts_with(&prefix)) {
        let existing_hash = existing
            .split('-')
            .nth(1)
            .map(|rest| rest.split('.').next().unwrap_or(rest))
            .unwrap_or("");
        if existing_hash == sha1 {
            return Ok(Some(format!(
                "WAL segment {file_name} already exists in the archive with the same \
                 checksum, skipped"
            )));
        }
        return Err(Error::ArchiveDuplicate {
            segment: file_name.to_owned(),
        });
    }

    storage.path_create(&dir, true)?;
    let group = repo.store_filters(repo.compress_type, subkey.as_deref());
    let group = storage.write_filtered(&join_path(&dir, &stored_name), &content, group)?;
    debug!(
        "stored {stored_name} ({} -> {} bytes)",
        content.len(),
        group
            .result("repo-size")
            .and_then(|result| result.as_u64())
            .unwrap_or(0)
    );
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::{make_segment_content, ScratchRepo};

    fn direct_options(fixture: &ScratchRepo) -> Options {
        let mut options = fixture.options().clone();
        options.archive_async = false;
        options
    }

    #[test]
    fn direct_push_stores_segment_with_hash_name() {
        let fixture = ScratchRepo::new();
        let options = direct_options(&fixture);
        let wal = fixture.make_wal_segment("000000010000000000000001", 3);

        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();

        let repo = fixture.repo().unwrap();
        let storage = repo.archive_storage().unwrap();
        let files = storage.list("15-1/0000000100000000").unwrap().files;
        assert_eq!(files.len(), 1);
        assert!(files[0].starts_with("000000010000000000000001-"));
        assert!(files[0].ends_with(".gz"));
    }

    #[test]
    fn duplicate_identical_push_is_a_noop() {
        let fixture = ScratchRepo::new();
        let options = direct_options(&fixture);
        let wal = fixture.make_wal_segment("000000010000000000000001", 3);

        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();
        // Same content again: succeeds without a second copy.
        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();

        let repo = fixture.repo().unwrap();
        let storage = repo.archive_storage().unwrap();
        assert_eq!(storage.list("15-1/0000000100000000").unwrap().files.len(), 1);
    }

    #[test]
    fn duplicate_differing_push_fails() {
        let fixture = ScratchRepo::new();
        let options = direct_options(&fixture);
        let wal = fixture.make_wal_segment("000000010000000000000001", 3);
        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();

        std::fs::write(&wal, make_segment_content(9)).unwrap();
        let err = archive_push(&options, &wal, ArchivePushOptions::default()).unwrap_err();
        assert_eq!(err.code(), 45);
    }

    #[test]
    fn history_file_is_stored_verbatim() {
        let fixture = ScratchRepo::new();
        let options = direct_options(&fixture);
        let history = fixture.pg_path().join("pg_wal").join("00000002.history");
        std::fs::write(&history, "1\t0/1000000\tsplit\n").unwrap();

        archive_push(&options, &history, ArchivePushOptions::default()).unwrap();

        let repo = fixture.repo().unwrap();
        let storage = repo.archive_storage().unwrap();
        assert_eq!(
            storage.read("15-1/00000002.history").unwrap(),
            "1\t0/1000000\tsplit\n".as_bytes()
        );
    }

    #[test]
    fn sync_invocation_consumes_existing_ok_status() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.archive_async = true;
        let wal = fixture.make_wal_segment("000000010000000000000007", 1);

        // Seed the status a daemon would have written.
        let spool = Spool::open(&options).unwrap();
        spool
            .write_ok(Direction::Out, "000000010000000000000007", None)
            .unwrap();

        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();
        // The status was consumed.
        assert_eq!(
            spool
                .status(Direction::Out, "000000010000000000000007")
                .unwrap(),
            None
        );
    }

    #[test]
    fn sync_invocation_propagates_error_status() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.archive_async = true;
        let wal = fixture.make_wal_segment("000000010000000000000008", 1);

        let spool = Spool::open(&options).unwrap();
        spool
            .write_error(Direction::Out, "000000010000000000000008", 45, "already there")
            .unwrap();

        let err = archive_push(&options, &wal, ArchivePushOptions::default()).unwrap_err();
        assert_eq!(err.code(), 45);
        assert!(err.to_string().contains("already there"));
    }
}
