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

//! The `verify` command: is the repository internally consistent?
//!
//! Re-reads every archive segment against the hash embedded in its name,
//! re-hashes stored backup files against their manifests, and checks that
//! every per-file reference points at a registered backup whose manifest
//! still lists the file with the same checksum and size. Problems are
//! collected, not fatal: the report names everything found wrong.

use rayon::prelude::*;
use tracing::{debug, info};

use crate::compress::CompressType;
use crate::config::Options;
use crate::control;
use crate::filter::FilterResult;
use crate::manifest::Manifest;
use crate::repo::Repo;
use crate::storage::join_path;
use crate::wal::WalSegment;
use crate::Result;

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {}

#[derive(Debug, Default)]
pub struct VerifyReport {
    pub segments_checked: u64,
    pub files_checked: u64,
    pub errors: Vec<String>,
}

impl VerifyReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn verify(options: &Options, _verify: VerifyOptions) -> Result<VerifyReport> {
    control::check_stopped(options)?;
    let repo = Repo::open(options)?;
    let mut report = VerifyReport::default();

    verify_archive(&repo, &mut report)?;
    verify_backups(&repo, &mut report)?;

    if report.is_ok() {
        info!(
            "verify complete: {} segments and {} backup files ok",
            report.segments_checked, report.files_checked
        );
    } else {
        for error in &report.errors {
            tracing::error!("{error}");
        }
    }
    Ok(report)
}

fn verify_archive(repo: &Repo, report: &mut VerifyReport) -> Result<()> {
    let archive_info = repo.load_archive_info()?;
    let subkey = archive_info.cipher_pass.clone();
    let storage = repo.archive_storage()?;

    let mut stored: Vec<String> = Vec::new();
    for archive_id in &storage.list("")?.dirs {
        for segment_dir in &storage.list(archive_id)?.dirs {
            let dir = join_path(archive_id, segment_dir);
            for file in &storage.list(&dir)?.files {
                if WalSegment::from_archive_file(file).is_some() {
                    stored.push(join_path(&dir, file));
                }
            }
        }
    }
    debug!("verifying {} archive segments", stored.len());

    let errors: Vec<String> = stored
        .par_iter()
        .filter_map(|path| {
            let name = path.rsplit('/').next().expect("path has a file name");
            let expected = name
                .split('-')
                .nth(1)
                .map(|rest| rest.split('.').next().unwrap_or(rest))
                .unwrap_or("");
            let group =
                repo.fetch_filters(CompressType::from_name(name), subkey.as_deref(), true);
            match storage.read_filtered(path, group) {
                Err(err) => Some(format!("{path}: unreadable: {err}")),
                Ok((_, group)) => match group.result("sha1") {
                    Some(FilterResult::Str(actual)) if actual == expected => None,
                    Some(FilterResult::Str(actual)) => Some(format!(
                        "{path}: checksum mismatch (expected {expected}, actual {actual})"
                    )),
                    _ => Some(format!("{path}: no checksum computed")),
                },
            }
        })
        .collect();

    report.segments_checked += stored.len() as u64;
    report.errors.extend(errors);
    Ok(())
}

fn verify_backups(repo: &Repo, report: &mut VerifyReport) -> Result<()> {
    let backup_info = repo.load_backup_info()?;
    let subkey = backup_info.cipher_pass.clone();
    let backup_storage = repo.backup_storage()?;

    for (label, _) in backup_info.current.iter() {
        let label_storage = backup_storage.subdir(label)?;
        let manifest = match Manifest::load(
            &label_storage,
            repo.cipher_type,
            subkey.as_deref().or(repo.operator_passphrase()),
        ) {
            Ok(manifest) => manifest,
            Err(err) => {
                report
                    .errors
                    .push(format!("backup {label}: manifest unreadable: {err}"));
                continue;
            }
        };
        let compress = CompressType::from_option(&manifest.options.compress_type)
            .unwrap_or(CompressType::Gzip);

        // Reference invariant: the ancestor is registered and still lists
        // the file with the same checksum and size.
        for (manifest_path, entry) in &manifest.files {
            if let Some(reference) = &entry.reference {
                if !backup_info.current.contains_key(reference) {
                    report.errors.push(format!(
                        "backup {label}: {manifest_path} references {reference}, \
                         which is not registered"
                    ));
                    continue;
                }
                let ancestor_storage = backup_storage.subdir(reference)?;
                match Manifest::load(
                    &ancestor_storage,
                    repo.cipher_type,
                    subkey.as_deref().or(repo.operator_passphrase()),
                ) {
                    Err(err) => report.errors.push(format!(
                        "backup {label}: reference {reference} has no manifest: {err}"
                    )),
                    Ok(ancestor) => match ancestor.files.get(manifest_path) {
                        None => report.errors.push(format!(
                            "backup {label}: {manifest_path} is not in {reference}"
                        )),
                        Some(ancestor_entry) => {
                            if ancestor_entry.checksum != entry.checksum
                                || ancestor_entry.size != entry.size
                            {
                                report.errors.push(format!(
                                    "backup {label}: {manifest_path} differs from its \
                                     copy in {reference}"
                                ));
                            }
                        }
                    },
                }
            }
        }

        // Re-hash the files this backup stored itself.
        let own_files: Vec<(&String, &crate::manifest::FileEntry)> = manifest
            .files
            .iter()
            .filter(|(_, entry)| entry.reference.is_none())
            .collect();
        let chain = std::collections::BTreeMap::from([(label.clone(), compress)]);
        let errors: Vec<String> = own_files
            .par_iter()
            .filter_map(|(manifest_path, entry)| {
                match crate::restore::fetch_backup_file(
                    repo,
                    subkey.as_deref(),
                    label,
                    &chain,
                    manifest_path,
                    entry,
                ) {
                    Ok(_) => None,
                    Err(err) => Some(format!("backup {label}: {manifest_path}: {err}")),
                }
            })
            .collect();
        report.files_checked += own_files.len() as u64;
        report.errors.extend(errors);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive_push::{archive_push, ArchivePushOptions};
    use crate::backup::{backup, BackupOptions};
    use crate::test_fixtures::ScratchRepo;

    fn verified(fixture: &ScratchRepo) -> VerifyReport {
        verify(fixture.options(), VerifyOptions::default()).unwrap()
    }

    #[test]
    fn clean_repository_verifies() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let wal = fixture.make_wal_segment("000000010000000000000001", 4);
        archive_push(fixture.options(), &wal, ArchivePushOptions::default()).unwrap();
        backup(fixture.options(), &BackupOptions::default()).unwrap();

        let report = verified(&fixture);
        assert!(report.is_ok(), "{:?}", report.errors);
        assert_eq!(report.segments_checked, 1);
        assert!(report.files_checked > 0);
    }

    #[test]
    fn corrupt_segment_is_reported() {
        let fixture = ScratchRepo::new();
        let wal = fixture.make_wal_segment("000000010000000000000001", 4);
        archive_push(fixture.options(), &wal, ArchivePushOptions::default()).unwrap();

        let repo = fixture.repo().unwrap();
        let storage = repo.archive_storage().unwrap();
        let dir = "15-1/0000000100000000";
        let name = storage.list(dir).unwrap().files[0].clone();
        let path = format!("{dir}/{name}");
        let mut content = storage.read(&path).unwrap().to_vec();
        let mid = content.len() / 2;
        content[mid] ^= 0x55;
        storage.write(&path, &content).unwrap();

        let report = verified(&fixture);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("0000000100000000"));
    }

    #[test]
    fn dangling_reference_is_reported() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        backup(fixture.options(), &BackupOptions::default()).unwrap();
        backup(
            fixture.options(),
            &BackupOptions {
                backup_type: crate::label::BackupType::Incr,
            },
        )
        .unwrap();

        // Drop the full from the registry but keep the incremental.
        let repo = fixture.repo().unwrap();
        let mut info = repo.load_backup_info().unwrap();
        let full = info
            .current
            .keys()
            .find(|label| !label.contains('_'))
            .unwrap()
            .clone();
        info.remove(&full);
        repo.save_backup_info(&info).unwrap();

        let report = verified(&fixture);
        assert!(report
            .errors
            .iter()
            .any(|error| error.contains("is not registered")));
    }

    #[test]
    fn corrupt_backup_file_is_reported() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let label = backup(fixture.options(), &BackupOptions::default()).unwrap();

        let repo = fixture.repo().unwrap();
        let storage = repo
            .backup_storage()
            .unwrap()
            .subdir(label.as_str())
            .unwrap();
        let mut content = storage.read("pg_data/PG_VERSION.gz").unwrap().to_vec();
        let last = content.len() - 1;
        content[last] ^= 0xff;
        storage.write("pg_data/PG_VERSION.gz", &content).unwrap();

        let report = verified(&fixture);
        assert!(report
            .errors
            .iter()
            .any(|error| error.contains("pg_data/PG_VERSION")));
    }
}
