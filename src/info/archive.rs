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

//! The per-stanza WAL archive registry.
//!
//! `archive.info` records the cluster history: one record per database id,
//! dense and strictly increasing, each naming the PostgreSQL version and
//! system identifier it described. Segments are stored under
//! `<version>-<dbId>/`, so the registry decides where a pushed segment
//! belongs and where a fetched segment is looked up.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::crypto::CipherType;
use crate::info::{self, InfoDoc};
use crate::storage::Storage;
use crate::{Error, Result, ARCHIVE_INFO_FILE};

/// One cluster generation in the archive history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveDbRecord {
    #[serde(skip)]
    pub db_id: u32,
    #[serde(rename = "db-version")]
    pub version: String,
    #[serde(rename = "db-id")]
    pub system_id: u64,
}

impl ArchiveDbRecord {
    /// The directory name segments of this generation live under.
    pub fn archive_id(&self) -> String {
        format!("{}-{}", self.version, self.db_id)
    }
}

/// The parsed `archive.info` registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// History ordered by db id; the last record is current.
    pub history: Vec<ArchiveDbRecord>,
    /// Subkey for everything under `archive/<stanza>/` when the repository
    /// is encrypted.
    pub cipher_pass: Option<String>,
}

impl ArchiveInfo {
    pub fn new(version: &str, system_id: u64, cipher_pass: Option<String>) -> ArchiveInfo {
        ArchiveInfo {
            history: vec![ArchiveDbRecord {
                db_id: 1,
                version: version.to_owned(),
                system_id,
            }],
            cipher_pass,
        }
    }

    pub fn current(&self) -> &ArchiveDbRecord {
        self.history.last().expect("history is never empty")
    }

    /// Record a stanza upgrade to a new cluster generation.
    pub fn upgrade(&mut self, version: &str, system_id: u64) {
        let db_id = self.current().db_id + 1;
        self.history.push(ArchiveDbRecord {
            db_id,
            version: version.to_owned(),
            system_id,
        });
    }

    /// The archive id for a given cluster, which must appear in history.
    pub fn archive_id_for(&self, version: &str, system_id: u64) -> Result<String> {
        self.history
            .iter()
            .rev()
            .find(|record| record.version == version && record.system_id == system_id)
            .map(ArchiveDbRecord::archive_id)
            .ok_or_else(|| {
                Error::RepoInvalid(format!(
                    "cluster {version} (system id {system_id}) does not match the archive history"
                ))
            })
    }

    fn to_doc(&self) -> InfoDoc {
        let mut doc = InfoDoc::new();
        let current = self.current();
        doc.set("db", "db-id", json!(current.db_id));
        doc.set("db", "db-system-id", json!(current.system_id));
        doc.set("db", "db-version", json!(current.version));
        for record in &self.history {
            doc.set_serialized("db:history", &record.db_id.to_string(), record);
        }
        if let Some(cipher_pass) = &self.cipher_pass {
            doc.set("cipher", "cipher-pass", json!(cipher_pass));
        }
        doc
    }

    fn from_doc(doc: &InfoDoc) -> Result<ArchiveInfo> {
        let mut history = Vec::new();
        for (id, value) in doc.section("db:history") {
            let db_id: u32 = id
                .parse()
                .map_err(|_| Error::Format(format!("bad history id '{id}'")))?;
            let mut record: ArchiveDbRecord = serde_json::from_value(value.clone())?;
            record.db_id = db_id;
            history.push(record);
        }
        history.sort_by_key(|record| record.db_id);
        if history.is_empty() {
            return Err(Error::Format("archive history is empty".into()));
        }
        let cipher_pass = match doc.get("cipher", "cipher-pass") {
            Some(value) => Some(
                value
                    .as_str()
                    .ok_or_else(|| Error::Format("cipher-pass is not a string".into()))?
                    .to_owned(),
            ),
            None => None,
        };
        Ok(ArchiveInfo {
            history,
            cipher_pass,
        })
    }

    /// Load from `archive/<stanza>/archive.info` (or its copy).
    pub fn load(
        storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<ArchiveInfo> {
        let doc = info::load(storage, ARCHIVE_INFO_FILE, cipher, passphrase)?;
        ArchiveInfo::from_doc(&doc)
    }

    /// Save to both the primary and copy, atomically.
    pub fn save(
        &self,
        storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<()> {
        info::save(
            storage,
            ARCHIVE_INFO_FILE,
            &self.to_doc(),
            cipher,
            passphrase,
        )
    }
}
