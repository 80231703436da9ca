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

//! The `expire` command.
//!
//! Applies the retention policy: keep the newest N full backups (and
//! dependents), optionally the newest M differentials among them, then
//! prune archive segments below the oldest surviving backup's archive
//! start. A backup is removed from the registry before its directory is
//! deleted, so a crash mid-expire leaves unreferenced files, never a
//! registered-but-missing backup. Timeline history files are always kept.

use tracing::{debug, info};

use crate::config::Options;
use crate::control;
use crate::label::{BackupLabel, BackupType};
use crate::lock::{Lock, LockType};
use crate::repo::Repo;
use crate::storage::join_path;
use crate::wal::WalSegment;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct ExpireOptions {}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ExpireStats {
    pub backups_removed: Vec<String>,
    pub segments_removed: u64,
}

pub fn expire(options: &Options, _expire: ExpireOptions) -> Result<ExpireStats> {
    control::check_stopped(options)?;
    let stanza = options.stanza()?;
    let _lock = Lock::acquire(&options.lock_path, stanza, LockType::Backup)?;

    let repo = Repo::open(options)?;
    let mut backup_info = repo.load_backup_info()?;
    let mut stats = ExpireStats::default();

    // Which backups fall to the full-backup retention count.
    let mut to_remove: Vec<String> = Vec::new();
    if let Some(retention_full) = options.retention_full {
        let fulls: Vec<String> = backup_info
            .current
            .keys()
            .filter(|label| {
                BackupLabel::is_valid(label)
                    && label.parse::<BackupLabel>().expect("validated").backup_type()
                        == BackupType::Full
            })
            .cloned()
            .collect();
        if fulls.len() > retention_full as usize {
            for expired_full in &fulls[..fulls.len() - retention_full as usize] {
                to_remove.push(expired_full.clone());
                to_remove.extend(backup_info.dependents(expired_full));
            }
        }
    }

    // Differential retention among what survives.
    if let Some(retention_diff) = options.retention_diff {
        let diffs: Vec<String> = backup_info
            .current
            .keys()
            .filter(|label| !to_remove.contains(label))
            .filter(|label| {
                BackupLabel::is_valid(label)
                    && label.parse::<BackupLabel>().expect("validated").backup_type()
                        == BackupType::Diff
            })
            .cloned()
            .collect();
        if diffs.len() > retention_diff as usize {
            for expired_diff in &diffs[..diffs.len() - retention_diff as usize] {
                to_remove.push(expired_diff.clone());
                to_remove.extend(backup_info.dependents(expired_diff));
            }
        }
    }

    to_remove.sort_unstable();
    to_remove.dedup();

    let backup_storage = repo.backup_storage()?;
    for label in &to_remove {
        info!("expiring backup {label}");
        backup_info.remove(label);
    }
    if !to_remove.is_empty() {
        // Registry first, then the directories.
        repo.save_backup_info(&backup_info)?;
        for label in &to_remove {
            backup_storage.path_remove(label)?;
        }
        stats.backups_removed = to_remove;
    }

    stats.segments_removed = expire_archive(&repo, &backup_info)?;
    info!(
        "expire complete: {} backups and {} segments removed",
        stats.backups_removed.len(),
        stats.segments_removed
    );
    Ok(stats)
}

/// Remove archive segments no surviving backup can need: everything
/// strictly before the oldest archive-start, compared by (log, seg) so
/// timeline switches keep their history.
fn expire_archive(
    repo: &Repo,
    backup_info: &crate::info::backup::BackupInfo,
) -> Result<u64> {
    let boundary: Option<WalSegment> = backup_info
        .current
        .values()
        .filter_map(|entry| entry.archive_start.as_deref())
        .filter_map(|name| name.parse().ok())
        .min_by_key(|segment: &WalSegment| (segment.log, segment.seg));
    let Some(boundary) = boundary else {
        debug!("no surviving backup declares an archive start, keeping all WAL");
        return Ok(0);
    };

    let storage = repo.archive_storage()?;
    let mut removed = 0u64;
    for archive_id in &storage.list("")?.dirs {
        for segment_dir in &storage.list(archive_id)?.dirs {
            let dir = join_path(archive_id, segment_dir);
            for file in &storage.list(&dir)?.files {
                let Some(segment) = WalSegment::from_archive_file(file) else {
                    continue;
                };
                if (segment.log, segment.seg) < (boundary.log, boundary.seg) {
                    debug!("expiring WAL segment file {file}");
                    storage.remove(&join_path(&dir, file), false)?;
                    removed += 1;
                }
            }
            if storage.list(&dir)?.files.is_empty() {
                storage.path_remove(&dir)?;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::info::backup::BackupEntry;
    use crate::test_fixtures::ScratchRepo;

    /// Register a synthetic backup with a directory and a manifest-free
    /// shell; expire only needs the registry entry and the directory.
    fn add_backup(
        fixture: &ScratchRepo,
        label: &str,
        backup_type: &str,
        prior: Option<&str>,
        reference: Vec<String>,
        archive_start: Option<&str>,
    ) {
        let repo = fixture.repo().unwrap();
        let mut info = repo.load_backup_info().unwrap();
        info.add(
            label,
            BackupEntry {
                backup_type: backup_type.into(),
                timestamp_start: 0,
                timestamp_stop: 1,
                archive_start: archive_start.map(str::to_owned),
                archive_stop: None,
                prior: prior.map(str::to_owned),
                reference,
                size: 1,
                repo_size: 1,
                db_id: 1,
                error: false,
            },
        );
        repo.save_backup_info(&info).unwrap();
        let storage = repo.backup_storage().unwrap();
        storage.path_create(label, true).unwrap();
        storage
            .write(&format!("{label}/marker"), b"backup dir")
            .unwrap();
    }

    fn expire_with(fixture: &ScratchRepo, full: Option<u32>, diff: Option<u32>) -> ExpireStats {
        let mut options = fixture.options().clone();
        options.retention_full = full;
        options.retention_diff = diff;
        expire(&options, ExpireOptions::default()).unwrap()
    }

    #[test]
    fn full_retention_removes_oldest_chains() {
        let fixture = ScratchRepo::new();
        add_backup(&fixture, "20240101-000000F", "full", None, vec![], None);
        add_backup(
            &fixture,
            "20240101-000000F_20240102-000000I",
            "incr",
            Some("20240101-000000F"),
            vec!["20240101-000000F".into()],
            None,
        );
        add_backup(&fixture, "20240201-000000F", "full", None, vec![], None);
        add_backup(&fixture, "20240301-000000F", "full", None, vec![], None);

        let stats = expire_with(&fixture, Some(2), None);
        assert_eq!(
            stats.backups_removed,
            [
                "20240101-000000F",
                "20240101-000000F_20240102-000000I",
            ]
        );

        let repo = fixture.repo().unwrap();
        let info = repo.load_backup_info().unwrap();
        assert_eq!(
            info.current.keys().collect::<Vec<_>>(),
            ["20240201-000000F", "20240301-000000F"]
        );
        // The directories are gone too.
        let storage = repo.backup_storage().unwrap();
        assert!(!storage.exists("20240101-000000F/marker").unwrap());
        assert!(storage.exists("20240301-000000F/marker").unwrap());
    }

    #[test]
    fn diff_retention_keeps_newest_diffs() {
        let fixture = ScratchRepo::new();
        add_backup(&fixture, "20240101-000000F", "full", None, vec![], None);
        for day in ["02", "03", "04"] {
            add_backup(
                &fixture,
                &format!("20240101-000000F_202401{day}-000000D"),
                "diff",
                Some("20240101-000000F"),
                vec!["20240101-000000F".into()],
                None,
            );
        }

        let stats = expire_with(&fixture, Some(5), Some(1));
        assert_eq!(
            stats.backups_removed,
            [
                "20240101-000000F_20240102-000000D",
                "20240101-000000F_20240103-000000D",
            ]
        );
    }

    #[test]
    fn no_retention_configured_is_a_noop() {
        let fixture = ScratchRepo::new();
        add_backup(&fixture, "20240101-000000F", "full", None, vec![], None);
        let stats = expire_with(&fixture, None, None);
        assert!(stats.backups_removed.is_empty());
        assert_eq!(stats.segments_removed, 0);
    }

    #[test]
    fn archive_prunes_below_oldest_surviving_start() {
        let fixture = ScratchRepo::new();
        let repo = fixture.repo().unwrap();
        let storage = repo.archive_storage().unwrap();
        // Three segments; the surviving backup starts at ...02.
        for (dir, name) in [
            ("15-1/0000000100000000", "000000010000000000000001-aa"),
            ("15-1/0000000100000000", "000000010000000000000002-bb"),
            ("15-1/0000000100000000", "000000010000000000000003-cc"),
        ] {
            storage.path_create(dir, true).unwrap();
            storage.write(&format!("{dir}/{name}"), b"seg").unwrap();
        }
        storage.write("15-1/00000001.history", b"tl").unwrap();

        add_backup(
            &fixture,
            "20240101-000000F",
            "full",
            None,
            vec![],
            Some("000000010000000000000002"),
        );

        let stats = expire_with(&fixture, Some(1), None);
        assert_eq!(stats.segments_removed, 1);
        let files = storage.list("15-1/0000000100000000").unwrap().files;
        assert_eq!(
            files,
            [
                "000000010000000000000002-bb",
                "000000010000000000000003-cc",
            ]
        );
        // History files survive.
        assert!(storage.exists("15-1/00000001.history").unwrap());
    }
}
