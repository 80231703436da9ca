// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! The `check` command: would archiving and backups work right now?
//!
//! Validates that both registries load, agree with each other and with the
//! cluster, that the current archive generation has its directory, and
//! that the spool is writable when async archiving is configured. Cheap
//! enough to run from monitoring.

use tracing::info;

use crate::config::Options;
use crate::control;
use crate::repo::Repo;
use crate::spool::Spool;
use crate::stanza::cluster_info;
use crate::{Error, Result};

pub fn check(options: &Options) -> Result<()> {
    control::check_stopped(options)?;
    let repo = Repo::open(options)?;

    let archive_info = repo.load_archive_info()?;
    let backup_info = repo.load_backup_info()?;

    // The two registries must describe the same cluster.
    let archive_db = archive_info.current();
    let backup_db = backup_info.db();
    if archive_db.system_id != backup_db.system_id
        || archive_db.version != backup_db.version
    {
        return Err(Error::RepoInvalid(format!(
            "archive.info ({} {}) and backup.info ({} {}) disagree",
            archive_db.version, archive_db.system_id, backup_db.version, backup_db.system_id
        )));
    }

    // And match the cluster, when one is reachable.
    match cluster_info(&options.pg_path) {
        Ok(db) => {
            if db.system_id != archive_db.system_id || db.version != archive_db.version {
                return Err(Error::RepoInvalid(format!(
                    "cluster {} (system id {}) does not match the stanza \
                     (run stanza-upgrade after a cluster upgrade)",
                    db.version, db.system_id
                )));
            }
        }
        Err(_) => info!("cluster not reachable at {:?}, skipping match check", options.pg_path),
    }

    // The current generation's archive directory must be usable.
    let archive_storage = repo.archive_storage()?;
    archive_storage.path_create(&archive_db.archive_id(), true)?;

    if options.archive_async {
        Spool::open(options)?;
    }

    info!("check ok for stanza {}", options.stanza()?);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::ScratchRepo;

    #[test]
    fn fresh_stanza_checks_ok() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        check(fixture.options()).unwrap();
    }

    #[test]
    fn async_mode_requires_writable_spool() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let mut options = fixture.options().clone();
        options.archive_async = true;
        check(&options).unwrap();
    }

    #[test]
    fn mismatched_cluster_fails() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        // Rewrite pg_control with a different system id.
        let control_path = fixture.pg_path().join("global").join("pg_control");
        let mut control = std::fs::read(&control_path).unwrap();
        control[0] ^= 0xff;
        std::fs::write(&control_path, &control).unwrap();

        let err = check(fixture.options()).unwrap_err();
        assert_eq!(err.code(), 59);
    }

    #[test]
    fn missing_stanza_fails() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.stanza = Some("ghost".to_owned());
        let err = check(&options).unwrap_err();
        assert_eq!(err.code(), 38);
    }
}
