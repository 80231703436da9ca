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

//! The per-stanza backup registry.
//!
//! `backup.info` records the cluster history and the set of valid backups
//! with their attributes. A backup appears here only after its manifest was
//! committed; if the registry is lost it can be reconstructed from the
//! backup directories themselves.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::crypto::CipherType;
use crate::info::{self, InfoDoc};
use crate::label::BackupLabel;
use crate::manifest::Manifest;
use crate::storage::Storage;
use crate::{Error, Result, BACKUP_INFO_FILE};

/// One cluster generation: version, identifiers, and catalog numbers as
/// consumed from the control file reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbRecord {
    pub db_id: u32,
    pub version: String,
    pub system_id: u64,
    pub catalog_version: Option<u64>,
    pub control_version: Option<u64>,
}

/// Attributes of one registered backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupEntry {
    #[serde(rename = "backup-type")]
    pub backup_type: String,
    #[serde(rename = "backup-timestamp-start")]
    pub timestamp_start: i64,
    #[serde(rename = "backup-timestamp-stop")]
    pub timestamp_stop: i64,
    #[serde(
        rename = "backup-archive-start",
        skip_serializing_if = "Option::is_none"
    )]
    pub archive_start: Option<String>,
    #[serde(rename = "backup-archive-stop", skip_serializing_if = "Option::is_none")]
    pub archive_stop: Option<String>,
    #[serde(rename = "backup-prior", skip_serializing_if = "Option::is_none")]
    pub prior: Option<String>,
    #[serde(rename = "backup-reference", default, skip_serializing_if = "Vec::is_empty")]
    pub reference: Vec<String>,
    #[serde(rename = "backup-info-size")]
    pub size: u64,
    #[serde(rename = "backup-info-repo-size")]
    pub repo_size: u64,
    #[serde(rename = "db-id")]
    pub db_id: u32,
    /// True when page checksum errors were found during the backup.
    #[serde(rename = "backup-error", default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl BackupEntry {
    pub fn from_manifest(manifest: &Manifest) -> BackupEntry {
        BackupEntry {
            backup_type: manifest.backup_type.to_string(),
            timestamp_start: manifest.timestamp_start,
            timestamp_stop: manifest.timestamp_stop,
            archive_start: manifest.archive_start.clone(),
            archive_stop: manifest.archive_stop.clone(),
            prior: manifest.prior.as_ref().map(|label| label.as_str().to_owned()),
            reference: manifest.reference.clone(),
            size: manifest.total_size(),
            repo_size: manifest.total_repo_size(),
            db_id: manifest.db.db_id,
            error: manifest
                .files
                .values()
                .any(|entry| !entry.page_errors.is_empty()),
        }
    }
}

/// The parsed `backup.info` registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// History ordered by db id; the last record is current.
    pub history: Vec<DbRecord>,
    /// Valid backups by label; labels sort in creation order.
    pub current: BTreeMap<String, BackupEntry>,
    pub cipher_pass: Option<String>,
}

impl BackupInfo {
    pub fn new(db: DbRecord, cipher_pass: Option<String>) -> BackupInfo {
        BackupInfo {
            history: vec![db],
            current: BTreeMap::new(),
            cipher_pass,
        }
    }

    pub fn db(&self) -> &DbRecord {
        self.history.last().expect("history is never empty")
    }

    pub fn upgrade(&mut self, mut db: DbRecord) {
        db.db_id = self.db().db_id + 1;
        self.history.push(db);
    }

    /// The most recent backup, if any.
    pub fn latest(&self) -> Option<(&String, &BackupEntry)> {
        self.current.iter().next_back()
    }

    /// The most recent backup a new dependent backup can chain from.
    pub fn latest_for_type(&self, full_only: bool) -> Option<&String> {
        self.current
            .iter()
            .rev()
            .find(|(label, _)| {
                !full_only
                    || BackupLabel::is_valid(label)
                        && label.parse::<BackupLabel>().expect("validated label").backup_type()
                            == crate::label::BackupType::Full
            })
            .map(|(label, _)| label)
    }

    /// Labels that reference `label` (directly or transitively) and so
    /// cannot outlive it.
    pub fn dependents(&self, label: &str) -> Vec<String> {
        self.current
            .iter()
            .filter(|(_, entry)| entry.reference.iter().any(|r| r == label))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }

    pub fn add(&mut self, label: &str, entry: BackupEntry) {
        self.current.insert(label.to_owned(), entry);
    }

    pub fn remove(&mut self, label: &str) -> Option<BackupEntry> {
        self.current.remove(label)
    }

    fn to_doc(&self) -> InfoDoc {
        let mut doc = InfoDoc::new();
        let db = self.db();
        doc.set("db", "db-id", json!(db.db_id));
        doc.set("db", "db-system-id", json!(db.system_id));
        doc.set("db", "db-version", json!(db.version));
        if let Some(catalog_version) = db.catalog_version {
            doc.set("db", "db-catalog-version", json!(catalog_version));
        }
        if let Some(control_version) = db.control_version {
            doc.set("db", "db-control-version", json!(control_version));
        }
        for record in &self.history {
            let mut value = serde_json::Map::new();
            value.insert("db-version".into(), json!(record.version));
            value.insert("db-system-id".into(), json!(record.system_id));
            if let Some(catalog_version) = record.catalog_version {
                value.insert("db-catalog-version".into(), json!(catalog_version));
            }
            if let Some(control_version) = record.control_version {
                value.insert("db-control-version".into(), json!(control_version));
            }
            doc.set(
                "db:history",
                &record.db_id.to_string(),
                serde_json::Value::Object(value),
            );
        }
        for (label, entry) in &self.current {
            doc.set_serialized("backup:current", label, entry);
        }
        if let Some(cipher_pass) = &self.cipher_pass {
            doc.set("cipher", "cipher-pass", json!(cipher_pass));
        }
        doc
    }

    fn from_doc(doc: &InfoDoc) -> Result<BackupInfo> {
        let mut history = Vec::new();
        for (id, value) in doc.section("db:history") {
            let db_id: u32 = id
                .parse()
                .map_err(|_| Error::Format(format!("bad history id '{id}'")))?;
            history.push(DbRecord {
                db_id,
                version: value
                    .get("db-version")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| Error::Format("history entry has no version".into()))?
                    .to_owned(),
                system_id: value
                    .get("db-system-id")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| Error::Format("history entry has no system id".into()))?,
                catalog_version: value
                    .get("db-catalog-version")
                    .and_then(serde_json::Value::as_u64),
                control_version: value
                    .get("db-control-version")
                    .and_then(serde_json::Value::as_u64),
            });
        }
        history.sort_by_key(|record| record.db_id);
        if history.is_empty() {
            return Err(Error::Format("backup history is empty".into()));
        }

        let mut current = BTreeMap::new();
        for (label, value) in doc.section("backup:current") {
            let entry: BackupEntry = serde_json::from_value(value.clone())?;
            current.insert(label.clone(), entry);
        }

        let cipher_pass = doc
            .get("cipher", "cipher-pass")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned);

        Ok(BackupInfo {
            history,
            current,
            cipher_pass,
        })
    }

    /// Load from `backup/<stanza>/backup.info` (or its copy).
    pub fn load(
        storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<BackupInfo> {
        let doc = info::load(storage, BACKUP_INFO_FILE, cipher, passphrase)?;
        BackupInfo::from_doc(&doc)
    }

    pub fn save(
        &self,
        storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<()> {
        info::save(storage, BACKUP_INFO_FILE, &self.to_doc(), cipher, passphrase)
    }

    /// Load and then rebuild `[backup:current]` from the backup directories
    /// actually present: entries without a loadable manifest are dropped,
    /// directories with a valid manifest but no entry are added. Differences
    /// are warned about and saved back.
    pub fn load_reconstruct(
        storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<BackupInfo> {
        let mut loaded = BackupInfo::load(storage, cipher, passphrase)?;
        let subkey = loaded.cipher_pass.clone();
        let file_passphrase = subkey.as_deref().or(passphrase);

        let mut rebuilt: BTreeMap<String, BackupEntry> = BTreeMap::new();
        for dir in &storage.list("")?.dirs {
            if !BackupLabel::is_valid(dir) {
                continue;
            }
            let backup_storage = storage.subdir(dir)?;
            match Manifest::load(&backup_storage, cipher, file_passphrase) {
                Ok(manifest) => {
                    rebuilt.insert(dir.clone(), BackupEntry::from_manifest(&manifest));
                }
                Err(err) => {
                    warn!("backup {dir} has no valid manifest, skipping: {err}");
                }
            }
        }

        if rebuilt != loaded.current {
            for label in loaded.current.keys() {
                if !rebuilt.contains_key(label) {
                    warn!("backup {label} is registered but missing from the repository");
                }
            }
            for label in rebuilt.keys() {
                if !loaded.current.contains_key(label) {
                    warn!("backup {label} found in the repository but not registered");
                }
            }
            loaded.current = rebuilt;
            loaded.save(storage, cipher, passphrase)?;
        }
        Ok(loaded)
    }
}
