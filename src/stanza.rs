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

//! Stanza lifecycle: `stanza-create`, `stanza-upgrade`, `stanza-delete`.
//!
//! A stanza is one source cluster's grouping in the repository; creating it
//! lays down both registries (with fresh cipher subkeys when the
//! repository is encrypted); upgrading appends a new cluster generation to
//! both histories; deleting removes the stanza's trees and requires the
//! stanza to be stopped first.

use std::path::Path;

use tracing::{info, warn};

use crate::config::Options;
use crate::control;
use crate::crypto::{random_passphrase, CipherType};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::{BackupInfo, DbRecord};
use crate::lock::{Lock, LockType};
use crate::repo::Repo;
use crate::{Error, Result, REPO_ARCHIVE, REPO_BACKUP};

/// Read the cluster description a stanza records.
///
/// Only the control reader's outputs are consumed here: the version string
/// from PG_VERSION and the identifiers at the head of pg_control.
pub fn cluster_info(pg_path: &Path) -> Result<DbRecord> {
    let version_path = pg_path.join("PG_VERSION");
    let version = std::fs::read_to_string(&version_path)
        .map_err(|source| Error::FileOpen {
            path: version_path,
            source,
        })?
        .trim()
        .to_owned();

    let control_path = pg_path.join("global").join("pg_control");
    match std::fs::read(&control_path) {
        Ok(control) if control.len() >= 16 => Ok(DbRecord {
            db_id: 1,
            version,
            system_id: u64::from_le_bytes(control[0..8].try_into().expect("8 bytes")),
            control_version: Some(
                u32::from_le_bytes(control[8..12].try_into().expect("4 bytes")) as u64,
            ),
            catalog_version: Some(
                u32::from_le_bytes(control[12..16].try_into().expect("4 bytes")) as u64,
            ),
        }),
        Ok(_) => Err(Error::Format("pg_control is truncated".into())),
        Err(_) => {
            // A cluster directory without pg_control (not yet initialized)
            // still gets a stanza; identifiers are zero until upgrade.
            warn!("pg_control not found under {pg_path:?}, using empty identifiers");
            Ok(DbRecord {
                db_id: 1,
                version,
                system_id: 0,
                control_version: None,
                catalog_version: None,
            })
        }
    }
}

/// The `stanza-create` command.
pub fn stanza_create(options: &Options, db: &DbRecord) -> Result<()> {
    control::check_stopped(options)?;
    let stanza = options.stanza()?;
    let repo = Repo::open(options)?;
    let _archive_lock = Lock::acquire(&options.lock_path, stanza, LockType::Archive)?;
    let _backup_lock = Lock::acquire(&options.lock_path, stanza, LockType::Backup)?;

    let storage = repo.storage();
    storage.path_create(&format!("{REPO_ARCHIVE}/{stanza}"), true)?;
    storage.path_create(&format!("{REPO_BACKUP}/{stanza}"), true)?;

    match (repo.load_archive_info(), repo.load_backup_info()) {
        (Ok(archive_info), Ok(backup_info)) => {
            let current = archive_info.current();
            if current.version == db.version
                && current.system_id == db.system_id
                && backup_info.db().system_id == db.system_id
            {
                info!("stanza {stanza} already exists and matches the cluster");
                return Ok(());
            }
            Err(Error::RepoInvalid(format!(
                "stanza {stanza} already exists for a different cluster \
                 (use stanza-upgrade after a cluster upgrade)"
            )))
        }
        _ => {
            let encrypted = repo.cipher_type != CipherType::None;
            let archive_cipher_pass = encrypted.then(random_passphrase);
            let backup_cipher_pass = encrypted.then(random_passphrase);

            let archive_info =
                ArchiveInfo::new(&db.version, db.system_id, archive_cipher_pass);
            repo.save_archive_info(&archive_info)?;

            let mut db = db.clone();
            db.db_id = 1;
            let backup_info = BackupInfo::new(db, backup_cipher_pass);
            repo.save_backup_info(&backup_info)?;

            info!("stanza {stanza} created");
            Ok(())
        }
    }
}

/// The `stanza-upgrade` command.
pub fn stanza_upgrade(options: &Options, db: &DbRecord) -> Result<()> {
    control::check_stopped(options)?;
    let stanza = options.stanza()?;
    let repo = Repo::open(options)?;
    let _archive_lock = Lock::acquire(&options.lock_path, stanza, LockType::Archive)?;
    let _backup_lock = Lock::acquire(&options.lock_path, stanza, LockType::Backup)?;

    let mut archive_info = repo.load_archive_info()?;
    let mut backup_info = repo.load_backup_info()?;

    let current = archive_info.current();
    if current.version == db.version && current.system_id == db.system_id {
        info!("stanza {stanza} is already on this cluster, nothing to upgrade");
        return Ok(());
    }

    archive_info.upgrade(&db.version, db.system_id);
    backup_info.upgrade(db.clone());
    repo.save_archive_info(&archive_info)?;
    repo.save_backup_info(&backup_info)?;
    info!(
        "stanza {stanza} upgraded to {} (db id {})",
        db.version,
        archive_info.current().db_id
    );
    Ok(())
}

/// The `stanza-delete` command.
///
/// Refuses unless the stanza is stopped, then removes both trees and the
/// stanza's stop file.
pub fn stanza_delete(options: &Options) -> Result<()> {
    let stanza = options.stanza()?;
    if !control::is_stopped(options, stanza) {
        return Err(Error::OptionInvalid(format!(
            "stanza {stanza} must be stopped before stanza-delete (run: bulwark stop)"
        )));
    }
    let repo = Repo::open(options)?;
    let _archive_lock = Lock::acquire(&options.lock_path, stanza, LockType::Archive)?;
    let _backup_lock = Lock::acquire(&options.lock_path, stanza, LockType::Backup)?;

    let storage = repo.storage();
    storage.path_remove(&format!("{REPO_ARCHIVE}/{stanza}"))?;
    storage.path_remove(&format!("{REPO_BACKUP}/{stanza}"))?;

    let mut start_options = options.clone();
    start_options.stanza = Some(stanza.to_owned());
    control::start(&start_options)?;
    info!("stanza {stanza} deleted");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::{test_db_record, ScratchRepo};

    #[test]
    fn create_is_idempotent_for_the_same_cluster() {
        let fixture = ScratchRepo::new();
        // The fixture already ran stanza_create once.
        stanza_create(fixture.options(), &test_db_record()).unwrap();
    }

    #[test]
    fn create_refuses_a_different_cluster() {
        let fixture = ScratchRepo::new();
        let mut other = test_db_record();
        other.system_id += 1;
        let err = stanza_create(fixture.options(), &other).unwrap_err();
        assert_eq!(err.code(), 59);
    }

    #[test]
    fn upgrade_appends_generation() {
        let fixture = ScratchRepo::new();
        let mut upgraded = test_db_record();
        upgraded.version = "16".to_owned();
        upgraded.system_id += 7;
        stanza_upgrade(fixture.options(), &upgraded).unwrap();

        let repo = fixture.repo().unwrap();
        let archive_info = repo.load_archive_info().unwrap();
        assert_eq!(archive_info.current().archive_id(), "16-2");
        let backup_info = repo.load_backup_info().unwrap();
        assert_eq!(backup_info.db().db_id, 2);
        assert_eq!(backup_info.db().version, "16");
    }

    #[test]
    fn delete_requires_stop() {
        let fixture = ScratchRepo::new();
        let err = stanza_delete(fixture.options()).unwrap_err();
        assert_eq!(err.code(), 31);

        crate::control::stop(fixture.options()).unwrap();
        stanza_delete(fixture.options()).unwrap();

        // Both trees are gone and the stanza is started again.
        let repo = fixture.repo().unwrap();
        assert!(repo.load_archive_info().is_err());
        assert!(!crate::control::is_stopped(fixture.options(), "main"));
    }

    #[test]
    fn cluster_info_reads_identifiers() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let db = cluster_info(&fixture.pg_path()).unwrap();
        assert_eq!(db.version, "15");
        assert_eq!(db.system_id, test_db_record().system_id);
        assert_eq!(db.control_version, test_db_record().control_version);
        assert_eq!(db.catalog_version, test_db_record().catalog_version);
    }
}
