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

//! The `archive-get` command.
//!
//! Recovery asks for one segment at a time; a missing segment is a normal
//! end-of-recovery signal, not an error. In async mode a daemon keeps an
//! ideal queue (the next N segments in order) prefetched in the spool and
//! prunes anything queued that recovery no longer needs, so the horizon
//! follows the active recovery range.

use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::compress::CompressType;
use crate::config::Options;
use crate::control;
use crate::filter::FilterResult;
use crate::lock::{Lock, LockType};
use crate::parallel::{self, Job, RetrySpec};
use crate::repo::Repo;
use crate::spawn;
use crate::spool::{Direction, SegmentStatus, Spool};
use crate::storage::join_path;
use crate::wal::WalSegment;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ArchiveGetOptions {}

/// Outcome of a get: found (exit 0) or not present (exit 1, recovery ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveGetResult {
    Found,
    NotFound,
}

/// The synchronous entry point invoked by restore_command.
pub fn archive_get(
    options: &Options,
    wal_name: &str,
    destination: &Path,
    _get: ArchiveGetOptions,
) -> Result<ArchiveGetResult> {
    control::check_stopped(options)?;

    if !options.archive_async || WalSegment::is_history_name(wal_name) {
        return match fetch_one(options, wal_name)? {
            None => {
                info!("unable to find {wal_name} in the archive");
                Ok(ArchiveGetResult::NotFound)
            }
            Some(content) => {
                deliver(destination, &content)?;
                info!("got WAL segment {wal_name} from the archive");
                Ok(ArchiveGetResult::Found)
            }
        };
    }

    let spool = Spool::open(options)?;
    if let Some(resolved) = consume_status(&spool, wal_name, destination)? {
        return resolved;
    }

    spool.clear_global_error(Direction::In)?;
    spawn::spawn_async_daemon_with_arg("archive-get", wal_name, options)?;
    debug!("requested prefetch from {wal_name}, waiting");

    let deadline = Instant::now() + Duration::from_millis(options.archive_timeout_ms);
    while Instant::now() < deadline {
        if let Some(resolved) = consume_status(&spool, wal_name, destination)? {
            return resolved;
        }
        if let Some((code, message)) = spool.global_error(Direction::In)? {
            spool.clear_global_error(Direction::In)?;
            return Err(Error::Remote {
                code,
                message,
                stack: String::new(),
            });
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(Error::Protocol(format!(
        "timed out waiting for the async daemon to fetch {wal_name} \
         (archive-timeout={}ms)",
        options.archive_timeout_ms
    )))
}

fn consume_status(
    spool: &Spool,
    segment: &str,
    destination: &Path,
) -> Result<Option<Result<ArchiveGetResult>>> {
    match spool.status(Direction::In, segment)? {
        None => Ok(None),
        Some(SegmentStatus::Ok { warning }) => {
            if let Some(warning) = warning {
                warn!("{warning}");
            }
            let data = spool.segment_path(Direction::In, segment);
            let result = if data.exists() {
                let content = std::fs::read(&data).map_err(|err| Error::FileRead {
                    path: data.clone(),
                    source: err,
                })?;
                deliver(destination, &content)?;
                spool.remove(Direction::In, segment)?;
                info!("got WAL segment {segment} from the prefetch queue");
                ArchiveGetResult::Found
            } else {
                info!("unable to find {segment} in the archive (prefetched miss)");
                ArchiveGetResult::NotFound
            };
            spool.clear_status(Direction::In, segment, true)?;
            Ok(Some(Ok(result)))
        }
        Some(SegmentStatus::Error { code, message }) => {
            spool.clear_status(Direction::In, segment, true)?;
            Ok(Some(Err(Error::Remote {
                code,
                message,
                stack: String::new(),
            })))
        }
    }
}

/// Write the segment at PostgreSQL's requested path via a temporary
/// sibling so recovery never reads a partial file.
fn deliver(destination: &Path, content: &[u8]) -> Result<()> {
    let tmp = destination.with_extension("bulwark.tmp");
    std::fs::write(&tmp, content).map_err(|err| Error::FileWrite {
        path: tmp.clone(),
        source: err,
    })?;
    std::fs::rename(&tmp, destination).map_err(|err| Error::FileWrite {
        path: destination.to_owned(),
        source: err,
    })
}

/// The detached prefetch daemon (`archive-get:async <segment>`).
pub fn archive_get_async(options: &Options, base_segment: &str) -> Result<()> {
    let stanza = options.stanza()?;
    let _lock = match Lock::acquire(&options.lock_path, stanza, LockType::Archive) {
        Ok(lock) => lock,
        Err(Error::LockAcquire { .. }) => {
            debug!("another archive-get daemon holds the lock, exiting");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let spool = Spool::open(options)?;
    let base: WalSegment = base_segment.parse()?;
    let ideal: Vec<String> = base
        .ideal_queue(options.wal_segment_size, options.archive_get_queue_max)
        .iter()
        .map(WalSegment::to_string)
        .collect();

    // Drop anything queued that recovery has moved past or will not ask
    // for: the actual queue converges on the ideal queue.
    for queued in spool.list(Direction::In)? {
        if !ideal.contains(&queued) {
            debug!("pruning {queued} from the prefetch queue");
            spool.remove(Direction::In, &queued)?;
            spool.clear_status(Direction::In, &queued, false)?;
        }
    }

    let pending: Vec<String> = ideal
        .iter()
        .filter(|segment| matches!(spool.status(Direction::In, segment), Ok(None)))
        .cloned()
        .collect();
    if pending.is_empty() {
        return Ok(());
    }
    info!("prefetching {} segments from {base_segment}", pending.len());

    let clients = match spawn::spawn_local_pool("archive-get", options, options.process_max) {
        Ok(clients) => clients,
        Err(err) => {
            spool.write_global_error(Direction::In, err.code(), &err.to_string())?;
            return Err(err);
        }
    };

    let mut jobs = pending.into_iter().map(|segment| Job {
        key: segment.clone(),
        cmd: "archive-get-file".into(),
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
                Ok(Value::Bool(found)) => {
                    let warning = (!found).then(|| format!("{segment} not yet archived"));
                    spool_done.write_ok(Direction::In, &segment, warning.as_deref())?;
                }
                Ok(other) => {
                    spool_done.write_error(
                        Direction::In,
                        &segment,
                        57,
                        &format!("unexpected worker response {other}"),
                    )?;
                }
                Err(err) => {
                    spool_done.write_error(
                        Direction::In,
                        &segment,
                        err.code(),
                        &err.to_string(),
                    )?;
                }
            }
            Ok(())
        },
    )?;
    Ok(())
}

/// Worker dispatch for `archive-get:local`: fetch one segment into the
/// spool, answering whether it was found.
pub fn worker_dispatch(cmd: &str, params: &[Value], options: &Options) -> Result<Value> {
    match cmd {
        "archive-get-file" => {
            let segment = crate::protocol::param_str(params, 0)?;
            match fetch_one(options, segment)? {
                None => Ok(Value::Bool(false)),
                Some(content) => {
                    let spool = Spool::open(options)?;
                    spool.put(Direction::In, segment, &content)?;
                    Ok(Value::Bool(true))
                }
            }
        }
        other => Err(Error::Protocol(format!("unknown command '{other}'"))),
    }
}

/// Look a segment (or history file) up across the archive history, newest
/// generation first, returning its decoded content.
pub fn fetch_one(options: &Options, wal_name: &str) -> Result<Option<Vec<u8>>> {
    let repo = Repo::open(options)?;
    let archive_info = repo.load_archive_info()?;
    let subkey = archive_info.cipher_pass.clone();
    let storage = repo.archive_storage()?;

    if WalSegment::is_history_name(wal_name) {
        for record in archive_info.history.iter().rev() {
            let path = join_path(&record.archive_id(), wal_name);
            if storage.exists(&path)? {
                let group = repo.fetch_filters(CompressType::None, subkey.as_deref(), false);
                let (content, _) = storage.read_filtered(&path, group)?;
                return Ok(Some(content));
            }
        }
        return Ok(None);
    }

    let segment: WalSegment = wal_name.parse()?;
    for record in archive_info.history.iter().rev() {
        let dir = join_path(&record.archive_id(), &segment.directory());
        let listing = storage.list(&dir)?;
        let prefix = format!("{segment}-");
        let Some(stored) = listing.files.iter().find(|name| name.starts_with(&prefix))
        else {
            continue;
        };

        let expected_sha1 = stored
            .split('-')
            .nth(1)
            .map(|rest| rest.split('.').next().unwrap_or(rest))
            .unwrap_or("")
            .to_owned();
        let compress = CompressType::from_name(stored);
        let group = repo.fetch_filters(compress, subkey.as_deref(), true);
        let (content, group) = storage.read_filtered(&join_path(&dir, stored), group)?;

        let actual_sha1 = match group.result("sha1") {
            Some(FilterResult::Str(digest)) => digest,
            _ => String::new(),
        };
        if actual_sha1 != expected_sha1 {
            return Err(Error::ChecksumMismatch {
                path: join_path(&dir, stored),
                expected: expected_sha1,
                actual: actual_sha1,
            });
        }
        return Ok(Some(content));
    }
    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive_push::{archive_push, ArchivePushOptions};
    use crate::test_fixtures::{make_segment_content, ScratchRepo};

    fn push_segment(fixture: &ScratchRepo, name: &str, fill: u8) {
        let mut options = fixture.options().clone();
        options.archive_async = false;
        let wal = fixture.make_wal_segment(name, fill);
        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();
    }

    #[test]
    fn get_round_trips_pushed_segment() {
        let fixture = ScratchRepo::new();
        push_segment(&fixture, "000000010000000000000001", 5);

        let destination = fixture.path().join("restored");
        let result = archive_get(
            fixture.options(),
            "000000010000000000000001",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ArchiveGetResult::Found);
        assert_eq!(std::fs::read(&destination).unwrap(), make_segment_content(5));
    }

    #[test]
    fn missing_segment_is_not_found_not_an_error() {
        let fixture = ScratchRepo::new();
        let destination = fixture.path().join("restored");
        let result = archive_get(
            fixture.options(),
            "0000000100000000000000AA",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ArchiveGetResult::NotFound);
        assert!(!destination.exists());
    }

    #[test]
    fn corrupt_stored_segment_fails_checksum() {
        let fixture = ScratchRepo::new();
        push_segment(&fixture, "000000010000000000000002", 6);

        // Flip bytes inside the stored object.
        let repo = fixture.repo().unwrap();
        let storage = repo.archive_storage().unwrap();
        let dir = "15-1/0000000100000000";
        let name = storage.list(dir).unwrap().files[0].clone();
        let path = format!("{dir}/{name}");
        let mut content = storage.read(&path).unwrap().to_vec();
        let mid = content.len() / 2;
        content[mid] ^= 0xff;
        storage.write(&path, &content).unwrap();

        let destination = fixture.path().join("restored");
        let err = archive_get(
            fixture.options(),
            "000000010000000000000002",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap_err();
        // Either the decompressor or the hash check rejects it first.
        assert!(matches!(err.code(), 53 | 55));
    }

    #[test]
    fn encrypted_archive_round_trips() {
        use crate::crypto::CipherType;

        let fixture = ScratchRepo::with_cipher(CipherType::Aes256Cbc, Some("operator pass"));
        let mut options = fixture.options().clone();
        options.archive_async = false;
        let wal = fixture.make_wal_segment("000000010000000000000006", 8);
        archive_push(&options, &wal, ArchivePushOptions::default()).unwrap();

        let destination = fixture.path().join("restored");
        let result = archive_get(
            &options,
            "000000010000000000000006",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ArchiveGetResult::Found);
        assert_eq!(std::fs::read(&destination).unwrap(), make_segment_content(8));
    }

    #[test]
    fn history_files_round_trip() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.archive_async = false;
        let history = fixture.pg_path().join("pg_wal").join("00000002.history");
        std::fs::write(&history, "1\t0/5000000\tfork\n").unwrap();
        archive_push(&options, &history, ArchivePushOptions::default()).unwrap();

        let destination = fixture.path().join("00000002.history");
        let result = archive_get(
            fixture.options(),
            "00000002.history",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ArchiveGetResult::Found);
        assert_eq!(
            std::fs::read_to_string(&destination).unwrap(),
            "1\t0/5000000\tfork\n"
        );
    }

    #[test]
    fn async_get_consumes_prefetched_segment() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.archive_async = true;

        let spool = Spool::open(&options).unwrap();
        spool
            .put(Direction::In, "000000010000000000000003", b"prefetched bytes")
            .unwrap();
        spool
            .write_ok(Direction::In, "000000010000000000000003", None)
            .unwrap();

        let destination = fixture.path().join("restored");
        let result = archive_get(
            &options,
            "000000010000000000000003",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ArchiveGetResult::Found);
        assert_eq!(std::fs::read(&destination).unwrap(), b"prefetched bytes");
        // Queue entry and status are consumed.
        assert!(spool.list(Direction::In).unwrap().is_empty());
        assert_eq!(
            spool
                .status(Direction::In, "000000010000000000000003")
                .unwrap(),
            None
        );
    }

    #[test]
    fn async_get_not_found_status() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.archive_async = true;

        let spool = Spool::open(&options).unwrap();
        spool
            .write_ok(
                Direction::In,
                "000000010000000000000004",
                Some("000000010000000000000004 not yet archived"),
            )
            .unwrap();

        let destination = fixture.path().join("restored");
        let result = archive_get(
            &options,
            "000000010000000000000004",
            &destination,
            ArchiveGetOptions::default(),
        )
        .unwrap();
        assert_eq!(result, ArchiveGetResult::NotFound);
    }

    #[test]
    fn prefetch_daemon_prunes_stale_queue() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.archive_async = true;
        options.process_max = 1;
        options.archive_get_queue_max = 2;
        push_segment(&fixture, "000000010000000000000005", 1);

        let spool = Spool::open(&options).unwrap();
        // A segment recovery has moved past.
        spool
            .put(Direction::In, "000000010000000000000001", b"stale")
            .unwrap();
        spool
            .write_ok(Direction::In, "000000010000000000000001", None)
            .unwrap();

        // The daemon run uses worker subprocesses; here only the pruning
        // phase is exercised, by a queue-max of zero pending fetches.
        let ideal: Vec<String> = "000000010000000000000005"
            .parse::<WalSegment>()
            .unwrap()
            .ideal_queue(options.wal_segment_size, options.archive_get_queue_max)
            .iter()
            .map(WalSegment::to_string)
            .collect();
        assert_eq!(
            ideal,
            ["000000010000000000000005", "000000010000000000000006"]
        );
        assert!(!ideal.contains(&"000000010000000000000001".to_owned()));
    }
}
