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

//! The per-backup manifest: every file of the cluster with checksum, size,
//! ownership, and mtime, plus paths, links, the database list, and the
//! option snapshot under which the backup ran.
//!
//! A file may carry a `reference` to an ancestor backup, meaning "reuse the
//! copy stored by that backup"; the invariant is that the referenced label
//! is still registered and its manifest still lists the file. Writing the
//! manifest is the commit point of a backup: until both manifest copies
//! exist the backup directory is garbage.
//!
//! Page checksum error vectors are stored packed (see [crate::pack]) and
//! hex encoded, so a file with thousands of bad pages stays one line.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use time::OffsetDateTime;

use crate::crypto::CipherType;
use crate::info::backup::DbRecord;
use crate::info::{self, InfoDoc};
use crate::label::{BackupLabel, BackupType};
use crate::pack::{PackRead, PackWrite};
use crate::storage::Storage;
use crate::{Error, Result, MANIFEST_FILE};

/// Root of the mirrored cluster tree inside a backup directory.
pub static MANIFEST_TARGET_PGDATA: &str = "pg_data";

/// One regular file in the backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntry {
    pub size: u64,
    /// SHA-1 of the file content; absent only for zero-length files.
    pub checksum: Option<String>,
    /// Stored (compressed, encrypted) size in the repository.
    pub repo_size: u64,
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Modification time, seconds since the epoch.
    pub timestamp: i64,
    /// Reuse the copy stored by this ancestor backup.
    pub reference: Option<String>,
    /// Bundle object and offset, for files packed into bundles.
    pub bundle_id: Option<u64>,
    pub bundle_offset: Option<u64>,
    /// Block numbers that failed page checksum verification.
    pub page_errors: Vec<u32>,
}

/// One directory in the backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathEntry {
    pub mode: Option<u32>,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// One symlink in the backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    pub destination: String,
    pub user: Option<String>,
    pub group: Option<String>,
}

/// Option snapshot recorded with each backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestOptions {
    pub compress_type: String,
    pub compress_level: u32,
    pub checksum_page: bool,
    pub bundle_limit: u64,
    pub cipher_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub label: BackupLabel,
    pub backup_type: BackupType,
    pub prior: Option<BackupLabel>,
    /// The transitive ancestor chain, oldest first.
    pub reference: Vec<String>,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub archive_start: Option<String>,
    pub archive_stop: Option<String>,
    pub db: DbRecord,
    pub options: ManifestOptions,
    pub files: BTreeMap<String, FileEntry>,
    pub paths: BTreeMap<String, PathEntry>,
    pub links: BTreeMap<String, LinkEntry>,
    /// Database oids found under base/.
    pub databases: Vec<u32>,
}

fn octal_mode(mode: u32) -> String {
    format!("{mode:04o}")
}

fn parse_mode(value: &Value) -> Option<u32> {
    value
        .as_str()
        .and_then(|text| u32::from_str_radix(text, 8).ok())
}

/// Encode a page error vector as a hex pack: one array of u32 block
/// numbers.
fn encode_page_errors(errors: &[u32]) -> String {
    let mut pack = PackWrite::new();
    pack.array_begin(None);
    for block in errors {
        pack.write_u32(None, *block);
    }
    pack.array_end();
    hex::encode(pack.finish())
}

fn decode_page_errors(text: &str) -> Result<Vec<u32>> {
    let bytes =
        hex::decode(text).map_err(|_| Error::Format("page error vector is not hex".into()))?;
    let mut pack = PackRead::new(&bytes);
    pack.array_begin(None)?;
    let mut errors = Vec::new();
    while let Some(block) = pack.read_u32(None)? {
        errors.push(block);
    }
    pack.array_end()?;
    Ok(errors)
}

impl FileEntry {
    fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("size".into(), json!(self.size));
        if let Some(checksum) = &self.checksum {
            map.insert("checksum".into(), json!(checksum));
        }
        map.insert("repo-size".into(), json!(self.repo_size));
        if let Some(mode) = self.mode {
            map.insert("mode".into(), json!(octal_mode(mode)));
        }
        if let Some(user) = &self.user {
            map.insert("user".into(), json!(user));
        }
        if let Some(group) = &self.group {
            map.insert("group".into(), json!(group));
        }
        map.insert("timestamp".into(), json!(self.timestamp));
        if let Some(reference) = &self.reference {
            map.insert("reference".into(), json!(reference));
        }
        if let Some(bundle_id) = self.bundle_id {
            map.insert("bno".into(), json!(bundle_id));
            map.insert("boff".into(), json!(self.bundle_offset.unwrap_or(0)));
        }
        if !self.page_errors.is_empty() {
            map.insert(
                "checksum-page-error".into(),
                json!(encode_page_errors(&self.page_errors)),
            );
        }
        Value::Object(map)
    }

    fn from_value(value: &Value) -> Result<FileEntry> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Format("file entry is not an object".into()))?;
        let get_u64 = |key: &str| object.get(key).and_then(Value::as_u64);
        let get_str =
            |key: &str| object.get(key).and_then(Value::as_str).map(str::to_owned);
        Ok(FileEntry {
            size: get_u64("size")
                .ok_or_else(|| Error::Format("file entry has no size".into()))?,
            checksum: get_str("checksum"),
            repo_size: get_u64("repo-size").unwrap_or(0),
            mode: object.get("mode").and_then(parse_mode),
            user: get_str("user"),
            group: get_str("group"),
            timestamp: object.get("timestamp").and_then(Value::as_i64).unwrap_or(0),
            reference: get_str("reference"),
            bundle_id: get_u64("bno"),
            bundle_offset: get_u64("boff"),
            page_errors: match get_str("checksum-page-error") {
                Some(text) => decode_page_errors(&text)?,
                None => Vec::new(),
            },
        })
    }
}

impl Manifest {
    /// Start an empty manifest for a backup beginning now.
    pub fn start(
        label: BackupLabel,
        prior: Option<&Manifest>,
        db: DbRecord,
        options: ManifestOptions,
        start: OffsetDateTime,
    ) -> Manifest {
        let backup_type = label.backup_type();
        let (prior_label, reference) = match prior {
            None => (None, Vec::new()),
            Some(prior_manifest) => {
                let mut reference = prior_manifest.reference.clone();
                reference.push(prior_manifest.label.as_str().to_owned());
                (Some(prior_manifest.label.clone()), reference)
            }
        };
        Manifest {
            label,
            backup_type,
            prior: prior_label,
            reference,
            timestamp_start: start.unix_timestamp(),
            timestamp_stop: 0,
            archive_start: None,
            archive_stop: None,
            db,
            options,
            files: BTreeMap::new(),
            paths: BTreeMap::new(),
            links: BTreeMap::new(),
            databases: Vec::new(),
        }
    }

    /// Labels this backup depends on, oldest first, ending with itself.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = self.reference.clone();
        chain.push(self.label.as_str().to_owned());
        chain
    }

    fn to_doc(&self) -> InfoDoc {
        let mut doc = InfoDoc::new();
        doc.set("backup", "backup-label", json!(self.label.as_str()));
        doc.set("backup", "backup-type", json!(self.backup_type.to_string()));
        if let Some(prior) = &self.prior {
            doc.set("backup", "backup-prior", json!(prior.as_str()));
        }
        if !self.reference.is_empty() {
            doc.set("backup", "backup-reference", json!(self.reference));
        }
        doc.set(
            "backup",
            "backup-timestamp-start",
            json!(self.timestamp_start),
        );
        doc.set(
            "backup",
            "backup-timestamp-stop",
            json!(self.timestamp_stop),
        );
        if let Some(archive_start) = &self.archive_start {
            doc.set("backup", "backup-archive-start", json!(archive_start));
        }
        if let Some(archive_stop) = &self.archive_stop {
            doc.set("backup", "backup-archive-stop", json!(archive_stop));
        }

        doc.set("backup:db", "db-id", json!(self.db.db_id));
        doc.set("backup:db", "db-version", json!(self.db.version));
        doc.set("backup:db", "db-system-id", json!(self.db.system_id));
        if let Some(catalog_version) = self.db.catalog_version {
            doc.set("backup:db", "db-catalog-version", json!(catalog_version));
        }
        if let Some(control_version) = self.db.control_version {
            doc.set("backup:db", "db-control-version", json!(control_version));
        }

        doc.set(
            "backup:option",
            "compress-type",
            json!(self.options.compress_type),
        );
        doc.set(
            "backup:option",
            "compress-level",
            json!(self.options.compress_level),
        );
        doc.set(
            "backup:option",
            "checksum-page",
            json!(self.options.checksum_page),
        );
        doc.set(
            "backup:option",
            "bundle-limit",
            json!(self.options.bundle_limit),
        );
        doc.set(
            "backup:option",
            "cipher-type",
            json!(self.options.cipher_type),
        );

        for oid in &self.databases {
            doc.set("db", &oid.to_string(), json!({ "db-id": oid }));
        }

        for (name, entry) in &self.files {
            doc.set("target:file", name, entry.to_value());
        }
        for (name, entry) in &self.paths {
            let mut map = serde_json::Map::new();
            if let Some(mode) = entry.mode {
                map.insert("mode".into(), json!(octal_mode(mode)));
            }
            if let Some(user) = &entry.user {
                map.insert("user".into(), json!(user));
            }
            if let Some(group) = &entry.group {
                map.insert("group".into(), json!(group));
            }
            doc.set("target:path", name, Value::Object(map));
        }
        for (name, entry) in &self.links {
            let mut map = serde_json::Map::new();
            map.insert("destination".into(), json!(entry.destination));
            if let Some(user) = &entry.user {
                map.insert("user".into(), json!(user));
            }
            if let Some(group) = &entry.group {
                map.insert("group".into(), json!(group));
            }
            doc.set("target:link", name, Value::Object(map));
        }
        doc
    }

    fn from_doc(doc: &InfoDoc) -> Result<Manifest> {
        let label: String = doc.get_deserialized("backup", "backup-label")?;
        let label: BackupLabel = label.parse()?;
        let backup_type = label.backup_type();
        let prior = match doc.get("backup", "backup-prior") {
            Some(value) => Some(
                value
                    .as_str()
                    .ok_or_else(|| Error::Format("backup-prior is not a string".into()))?
                    .parse::<BackupLabel>()?,
            ),
            None => None,
        };
        let reference: Vec<String> = match doc.get("backup", "backup-reference") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };

        let db = DbRecord {
            db_id: doc.get_deserialized("backup:db", "db-id")?,
            version: doc.get_deserialized("backup:db", "db-version")?,
            system_id: doc.get_deserialized("backup:db", "db-system-id")?,
            catalog_version: doc
                .get("backup:db", "db-catalog-version")
                .and_then(Value::as_u64),
            control_version: doc
                .get("backup:db", "db-control-version")
                .and_then(Value::as_u64),
        };

        let options = ManifestOptions {
            compress_type: doc.get_deserialized("backup:option", "compress-type")?,
            compress_level: doc.get_deserialized("backup:option", "compress-level")?,
            checksum_page: doc.get_deserialized("backup:option", "checksum-page")?,
            bundle_limit: doc.get_deserialized("backup:option", "bundle-limit")?,
            cipher_type: doc.get_deserialized("backup:option", "cipher-type")?,
        };

        let mut files = BTreeMap::new();
        for (name, value) in doc.section("target:file") {
            files.insert(name.clone(), FileEntry::from_value(value)?);
        }
        let mut paths = BTreeMap::new();
        for (name, value) in doc.section("target:path") {
            paths.insert(
                name.clone(),
                PathEntry {
                    mode: value.get("mode").and_then(parse_mode),
                    user: value
                        .get("user")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    group: value
                        .get("group")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                },
            );
        }
        let mut links = BTreeMap::new();
        for (name, value) in doc.section("target:link") {
            links.insert(
                name.clone(),
                LinkEntry {
                    destination: value
                        .get("destination")
                        .and_then(Value::as_str)
                        .ok_or_else(|| Error::Format("link entry has no destination".into()))?
                        .to_owned(),
                    user: value
                        .get("user")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    group: value
                        .get("group")
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                },
            );
        }
        let mut databases = Vec::new();
        for (oid, _) in doc.section("db") {
            if let Ok(oid) = oid.parse() {
                databases.push(oid);
            }
        }

        Ok(Manifest {
            label,
            backup_type,
            prior,
            reference,
            timestamp_start: doc.get_deserialized("backup", "backup-timestamp-start")?,
            timestamp_stop: doc.get_deserialized("backup", "backup-timestamp-stop")?,
            archive_start: doc
                .get("backup", "backup-archive-start")
                .and_then(Value::as_str)
                .map(str::to_owned),
            archive_stop: doc
                .get("backup", "backup-archive-stop")
                .and_then(Value::as_str)
                .map(str::to_owned),
            db,
            options,
            files,
            paths,
            links,
            databases,
        })
    }

    /// Logical size of the cluster: the sum of all file sizes.
    pub fn total_size(&self) -> u64 {
        self.files.values().map(|entry| entry.size).sum()
    }

    /// Size actually stored by this backup (excluding referenced files).
    pub fn total_repo_size(&self) -> u64 {
        self.files
            .values()
            .filter(|entry| entry.reference.is_none())
            .map(|entry| entry.repo_size)
            .sum()
    }

    /// Save both manifest copies into a backup directory; this is the
    /// commit point of the backup.
    pub fn save(
        &self,
        backup_storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<()> {
        info::save(
            backup_storage,
            MANIFEST_FILE,
            &self.to_doc(),
            cipher,
            passphrase,
        )
    }

    /// Load from a backup directory (primary or copy).
    pub fn load(
        backup_storage: &Storage,
        cipher: CipherType,
        passphrase: Option<&str>,
    ) -> Result<Manifest> {
        let doc = info::load(backup_storage, MANIFEST_FILE, cipher, passphrase)?;
        Manifest::from_doc(&doc)
    }
}

#[cfg(test)]
mod test {
    use time::macros::datetime;

    use super::*;
    use crate::test_fixtures::{scratch_storage, test_db_record};

    fn sample_options() -> ManifestOptions {
        ManifestOptions {
            compress_type: "gz".into(),
            compress_level: 6,
            checksum_page: true,
            bundle_limit: 0,
            cipher_type: "none".into(),
        }
    }

    fn sample_manifest() -> Manifest {
        let label: BackupLabel = "20240314-092115F".parse().unwrap();
        let mut manifest = Manifest::start(
            label,
            None,
            test_db_record(),
            sample_options(),
            datetime!(2024-03-14 9:21:15 UTC),
        );
        manifest.archive_start = Some("000000010000000000000002".into());
        manifest.archive_stop = Some("000000010000000000000003".into());
        manifest.timestamp_stop = manifest.timestamp_start + 30;
        manifest.files.insert(
            "pg_data/global/pg_control".into(),
            FileEntry {
                size: 8192,
                checksum: Some("35bee5464c1678318912dd919b31be7e94217302".into()),
                repo_size: 117,
                mode: Some(0o600),
                user: Some("postgres".into()),
                group: Some("postgres".into()),
                timestamp: 1710404475,
                ..Default::default()
            },
        );
        manifest.files.insert(
            "pg_data/base/1/1259".into(),
            FileEntry {
                size: 32768,
                checksum: Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".into()),
                repo_size: 200,
                timestamp: 1710404475,
                page_errors: vec![2, 7, 4095],
                ..Default::default()
            },
        );
        manifest.paths.insert(
            "pg_data".into(),
            PathEntry {
                mode: Some(0o700),
                ..Default::default()
            },
        );
        manifest.links.insert(
            "pg_data/pg_tblspc/16384".into(),
            LinkEntry {
                destination: "/mnt/space".into(),
                user: None,
                group: None,
            },
        );
        manifest.databases = vec![1, 16384];
        manifest
    }

    #[test]
    fn round_trip() {
        let manifest = sample_manifest();
        let (_temp, storage) = scratch_storage();
        manifest.save(&storage, CipherType::None, None).unwrap();
        assert!(storage.exists("backup.manifest").unwrap());
        assert!(storage.exists("backup.manifest.copy").unwrap());

        let loaded = Manifest::load(&storage, CipherType::None, None).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn page_errors_survive_packing() {
        let manifest = sample_manifest();
        let doc = manifest.to_doc();
        let packed = doc
            .get("target:file", "pg_data/base/1/1259")
            .unwrap()
            .get("checksum-page-error")
            .unwrap()
            .as_str()
            .unwrap()
            .to_owned();
        assert_eq!(decode_page_errors(&packed).unwrap(), vec![2, 7, 4095]);
        // Three small u32s pack far smaller than their JSON rendering.
        assert!(packed.len() < 24);
    }

    #[test]
    fn sizes() {
        let mut manifest = sample_manifest();
        assert_eq!(manifest.total_size(), 8192 + 32768);
        assert_eq!(manifest.total_repo_size(), 117 + 200);
        manifest
            .files
            .get_mut("pg_data/base/1/1259")
            .unwrap()
            .reference = Some("20240301-000000F".into());
        assert_eq!(manifest.total_repo_size(), 117);
    }

    #[test]
    fn dependent_manifest_chains_references() {
        let full = sample_manifest();
        let diff_label: BackupLabel = "20240314-092115F_20240315-010000D".parse().unwrap();
        let diff = Manifest::start(
            diff_label,
            Some(&full),
            test_db_record(),
            sample_options(),
            datetime!(2024-03-15 1:00:00 UTC),
        );
        assert_eq!(diff.prior, Some(full.label.clone()));
        assert_eq!(diff.reference, vec!["20240314-092115F".to_owned()]);
        assert_eq!(
            diff.chain(),
            vec![
                "20240314-092115F".to_owned(),
                "20240314-092115F_20240315-010000D".to_owned(),
            ]
        );
    }

    #[test]
    fn corrupt_manifest_falls_back_to_copy() {
        let manifest = sample_manifest();
        let (_temp, storage) = scratch_storage();
        manifest.save(&storage, CipherType::None, None).unwrap();
        let mut content = storage.read("backup.manifest").unwrap().to_vec();
        let len = content.len();
        content[len / 2] ^= 0xff;
        storage.write("backup.manifest", &content).unwrap();

        let loaded = Manifest::load(&storage, CipherType::None, None).unwrap();
        assert_eq!(loaded, manifest);
    }
}
