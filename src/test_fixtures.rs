// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! Shared fixtures for tests: scratch repositories and fake clusters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::Options;
use crate::crypto::CipherType;
use crate::info::backup::DbRecord;
use crate::repo::Repo;
use crate::stanza::stanza_create;
use crate::storage::Storage;
use crate::transport::local::LocalTransport;
use crate::{Result, PG_PAGE_SIZE, WAL_SEGMENT_SIZE_DEFAULT};

/// A storage over a temporary directory.
pub fn scratch_storage() -> (TempDir, Storage) {
    let temp = TempDir::new().unwrap();
    let storage = Storage::open(Arc::new(LocalTransport::new(temp.path())));
    (temp, storage)
}

/// The database record used by scratch stanzas.
pub fn test_db_record() -> DbRecord {
    DbRecord {
        db_id: 1,
        version: "15".to_owned(),
        system_id: 6569239123849665679,
        catalog_version: Some(202209061),
        control_version: Some(1300),
    }
}

/// A temporary repository with one created stanza, plus scratch directories
/// for spool, locks, and a fake cluster.
pub struct ScratchRepo {
    temp: TempDir,
    pub options: Options,
}

impl ScratchRepo {
    pub fn new() -> ScratchRepo {
        ScratchRepo::with_cipher(CipherType::None, None)
    }

    pub fn with_cipher(cipher: CipherType, passphrase: Option<&str>) -> ScratchRepo {
        let temp = TempDir::new().unwrap();
        for dir in ["repo", "spool", "lock", "pg", "pg/pg_wal", "pg/global", "pg/base"] {
            std::fs::create_dir(temp.path().join(dir)).unwrap();
        }
        let mut options = Options::default();
        options.stanza = Some("main".to_owned());
        options.repo_path = temp.path().join("repo").to_string_lossy().into_owned();
        options.spool_path = temp.path().join("spool");
        options.lock_path = temp.path().join("lock");
        options.pg_path = temp.path().join("pg");
        options.cipher_type = cipher;
        options.cipher_pass = passphrase.map(|p| p.to_owned());
        let fixture = ScratchRepo { temp, options };
        stanza_create(&fixture.options, &test_db_record()).unwrap();
        fixture
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn repo(&self) -> Result<Repo> {
        Repo::open(&self.options)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn pg_path(&self) -> PathBuf {
        self.temp.path().join("pg")
    }

    /// Write a fake WAL segment of the cluster's segment size into pg_wal.
    pub fn make_wal_segment(&self, name: &str, fill: u8) -> PathBuf {
        let path = self.pg_path().join("pg_wal").join(name);
        std::fs::write(&path, make_segment_content(fill)).unwrap();
        path
    }

    /// Populate the fake cluster with a few data files. The control file
    /// identifiers match [test_db_record].
    pub fn make_cluster_files(&self) {
        let pg = self.pg_path();
        std::fs::write(pg.join("PG_VERSION"), "15\n").unwrap();
        std::fs::write(pg.join("global").join("pg_control"), make_control_file()).unwrap();
        std::fs::create_dir_all(pg.join("base").join("1")).unwrap();
        std::fs::write(pg.join("base").join("1").join("1259"), make_page_file(4)).unwrap();
        std::fs::write(pg.join("base").join("1").join("1249"), b"small file").unwrap();
    }
}

impl Default for ScratchRepo {
    fn default() -> Self {
        ScratchRepo::new()
    }
}

/// A pg_control image whose identifiers match [test_db_record].
pub fn make_control_file() -> Vec<u8> {
    let record = test_db_record();
    let mut control = vec![0u8; 8192];
    control[0..8].copy_from_slice(&record.system_id.to_le_bytes());
    control[8..12]
        .copy_from_slice(&(record.control_version.unwrap() as u32).to_le_bytes());
    control[12..16]
        .copy_from_slice(&(record.catalog_version.unwrap() as u32).to_le_bytes());
    control
}

/// Segment-sized content that compresses but is not all zeroes.
pub fn make_segment_content(fill: u8) -> Vec<u8> {
    let mut content = vec![fill; WAL_SEGMENT_SIZE_DEFAULT];
    for (index, byte) in content.iter_mut().enumerate().take(4096) {
        *byte = (index % 251) as u8;
    }
    content
}

/// A file of valid zero pages, page-aligned.
pub fn make_page_file(pages: usize) -> Vec<u8> {
    vec![0u8; pages * PG_PAGE_SIZE]
}
