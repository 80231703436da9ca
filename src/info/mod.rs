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

//! Checksum-sealed registry documents.
//!
//! Info files are INI-like: `[section]` headers with `key=JSON-value` lines,
//! sorted by section then key so the rendering is deterministic. A trailing
//! seal section carries a SHA-1 checksum over everything before it; load
//! verifies the seal and rejects the file on any mismatch.
//!
//! Each registry is persisted as two identical copies (`file` and
//! `file.copy`), both written atomically. Load tries the primary and falls
//! back to the copy with a warning; if both fail the registry is reported
//! missing or corrupt.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::warn;

use crate::crypto::{CipherType, CryptoDecrypt, CryptoEncrypt};
use crate::filter::FilterGroup;
use crate::storage::Storage;
use crate::{Error, Result, COPY_SUFFIX, REPO_FORMAT};

pub mod archive;
pub mod backup;

/// Name of the seal section, which sorts after the data sections.
const SEAL_SECTION: &str = "bulwark";

/// An in-memory info document: sections of key/JSON-value pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoDoc {
    sections: BTreeMap<String, BTreeMap<String, Value>>,
}

impl InfoDoc {
    pub fn new() -> InfoDoc {
        InfoDoc::default()
    }

    pub fn set(&mut self, section: &str, key: &str, value: Value) {
        assert_ne!(section, SEAL_SECTION, "the seal section is reserved");
        self.sections
            .entry(section.to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    pub fn set_serialized<T: Serialize>(&mut self, section: &str, key: &str, value: &T) {
        self.set(
            section,
            key,
            serde_json::to_value(value).expect("serialize info value"),
        );
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&Value> {
        self.sections.get(section)?.get(key)
    }

    pub fn get_deserialized<T: DeserializeOwned>(&self, section: &str, key: &str) -> Result<T> {
        let value = self.get(section, key).ok_or_else(|| {
            Error::Format(format!("missing key '{key}' in section '{section}'"))
        })?;
        serde_json::from_value(value.clone())
            .map_err(|err| Error::Format(format!("key '{key}' in section '{section}': {err}")))
    }

    pub fn section(&self, section: &str) -> impl Iterator<Item = (&String, &Value)> {
        self.sections
            .get(section)
            .into_iter()
            .flat_map(|keys| keys.iter())
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn remove(&mut self, section: &str, key: &str) -> Option<Value> {
        self.sections.get_mut(section)?.remove(key)
    }

    /// Render the sealed document.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = String::new();
        for (section, keys) in &self.sections {
            if keys.is_empty() {
                continue;
            }
            body.push_str(&format!("[{section}]\n"));
            for (key, value) in keys {
                body.push_str(&format!("{key}={value}\n"));
            }
            body.push('\n');
        }

        let checksum = hex::encode(Sha1::digest(body.as_bytes()));
        let mut out = body;
        out.push_str(&format!("[{SEAL_SECTION}]\n"));
        out.push_str(&format!("checksum=\"{checksum}\"\n"));
        out.push_str(&format!("format={REPO_FORMAT}\n"));
        out.push_str(&format!("version=\"{}\"\n", crate::version()));
        out.into_bytes()
    }

    /// Parse and verify a sealed document.
    pub fn from_bytes(content: &[u8]) -> Result<InfoDoc> {
        let text = std::str::from_utf8(content)
            .map_err(|_| Error::Format("info file is not UTF-8".into()))?;

        let seal_header = format!("[{SEAL_SECTION}]\n");
        let seal_start = text
            .rfind(&seal_header)
            .ok_or_else(|| Error::Format("info file has no seal section".into()))?;
        let (body, seal) = text.split_at(seal_start);

        let mut doc = InfoDoc::new();
        let mut current: Option<String> = None;
        for line in body.lines() {
            if line.is_empty() {
                continue;
            }
            if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(section.to_owned());
            } else {
                let section = current
                    .as_ref()
                    .ok_or_else(|| Error::Format("key before any section".into()))?;
                let (key, value) = line
                    .split_once('=')
                    .ok_or_else(|| Error::Format(format!("malformed info line '{line}'")))?;
                let value: Value = serde_json::from_str(value)
                    .map_err(|err| Error::Format(format!("bad value for '{key}': {err}")))?;
                doc.set(section, key, value);
            }
        }

        let mut sealed_checksum = None;
        let mut sealed_format = None;
        for line in seal.lines().skip(1) {
            match line.split_once('=') {
                Some(("checksum", value)) => {
                    sealed_checksum = serde_json::from_str::<String>(value).ok()
                }
                Some(("format", value)) => sealed_format = value.parse::<u32>().ok(),
                _ => (),
            }
        }

        let expected = sealed_checksum
            .ok_or_else(|| Error::Format("info seal is missing its checksum".into()))?;
        let actual = hex::encode(Sha1::digest(body.as_bytes()));
        if expected != actual {
            return Err(Error::ChecksumMismatch {
                path: "info".into(),
                expected,
                actual,
            });
        }
        match sealed_format {
            Some(format) if format == REPO_FORMAT => Ok(doc),
            Some(format) => Err(Error::Format(format!(
                "info format {format} is not supported (expected {REPO_FORMAT})"
            ))),
            None => Err(Error::Format("info seal is missing its format".into())),
        }
    }
}

/// Filters for reading an encrypted info file.
fn read_filters(cipher: CipherType, passphrase: Option<&str>) -> Result<FilterGroup> {
    let mut group = FilterGroup::new();
    if cipher != CipherType::None {
        let passphrase = passphrase.ok_or_else(|| {
            Error::Crypto("repository is encrypted but no passphrase is set".into())
        })?;
        group.push(Box::new(CryptoDecrypt::new(passphrase)));
    }
    Ok(group)
}

fn write_filters(cipher: CipherType, passphrase: Option<&str>) -> Result<FilterGroup> {
    let mut group = FilterGroup::new();
    if cipher != CipherType::None {
        let passphrase = passphrase.ok_or_else(|| {
            Error::Crypto("repository is encrypted but no passphrase is set".into())
        })?;
        group.push(Box::new(CryptoEncrypt::new(passphrase)));
    }
    Ok(group)
}

/// Save a document to `path` and `path.copy`, both atomically.
pub fn save(
    storage: &Storage,
    path: &str,
    doc: &InfoDoc,
    cipher: CipherType,
    passphrase: Option<&str>,
) -> Result<()> {
    let content = doc.to_bytes();
    storage.write_filtered(path, &content, write_filters(cipher, passphrase)?)?;
    storage.write_filtered(
        &format!("{path}{COPY_SUFFIX}"),
        &content,
        write_filters(cipher, passphrase)?,
    )?;
    Ok(())
}

/// Load a document from `path`, falling back to `path.copy`.
pub fn load(
    storage: &Storage,
    path: &str,
    cipher: CipherType,
    passphrase: Option<&str>,
) -> Result<InfoDoc> {
    let primary_err = match try_load(storage, path, cipher, passphrase) {
        Ok(doc) => return Ok(doc),
        Err(err) => err,
    };

    let copy_path = format!("{path}{COPY_SUFFIX}");
    match try_load(storage, &copy_path, cipher, passphrase) {
        Ok(doc) => {
            warn!("{path} is missing or corrupt ({primary_err}); loaded from {copy_path}");
            Ok(doc)
        }
        Err(copy_err) => Err(Error::FileMissing {
            path: format!(
                "{path} or {copy_path} \
                 (primary: {primary_err}; copy: {copy_err})"
            ),
        }),
    }
}

fn try_load(
    storage: &Storage,
    path: &str,
    cipher: CipherType,
    passphrase: Option<&str>,
) -> Result<InfoDoc> {
    let (content, _) = storage.read_filtered(path, read_filters(cipher, passphrase)?)?;
    InfoDoc::from_bytes(&content)
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::test_fixtures::scratch_storage;

    fn sample_doc() -> InfoDoc {
        let mut doc = InfoDoc::new();
        doc.set("db", "db-id", json!(1));
        doc.set("db", "db-version", json!("9.4"));
        doc.set("db", "db-system-id", json!(6569239123849665679u64));
        doc.set(
            "db:history",
            "1",
            json!({"db-version": "9.4", "db-id": 6569239123849665679u64}),
        );
        doc
    }

    #[test]
    fn render_is_sorted_and_sealed() {
        let text = String::from_utf8(sample_doc().to_bytes()).unwrap();
        let db_at = text.find("[db]").unwrap();
        let history_at = text.find("[db:history]").unwrap();
        let seal_at = text.find("[bulwark]").unwrap();
        assert!(db_at < history_at && history_at < seal_at);
        assert!(text.contains("db-version=\"9.4\""));
        assert!(text.contains("checksum=\""));
    }

    #[test]
    fn save_load_round_trip() {
        let doc = sample_doc();
        let reloaded = InfoDoc::from_bytes(&doc.to_bytes()).unwrap();
        assert_eq!(doc, reloaded);
        let id: u64 = reloaded.get_deserialized("db", "db-id").unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn any_flipped_byte_fails_the_checksum() {
        let content = sample_doc().to_bytes();
        // Flip a byte inside the body (not the seal itself).
        let target = content
            .windows(4)
            .position(|w| w == b"9.4\"")
            .expect("find body byte");
        let mut corrupt = content.clone();
        corrupt[target] ^= 0x20;
        match InfoDoc::from_bytes(&corrupt) {
            Err(Error::ChecksumMismatch { .. }) | Err(Error::Format(_)) => (),
            other => panic!("expected checksum failure, got {other:?}"),
        }
    }

    #[test]
    fn primary_corruption_falls_back_to_copy() {
        let (_temp, storage) = scratch_storage();
        let doc = sample_doc();
        save(&storage, "archive.info", &doc, CipherType::None, None).unwrap();

        // Corrupt the primary.
        let mut content = storage.read("archive.info").unwrap().to_vec();
        content[10] ^= 0xff;
        storage.write("archive.info", &content).unwrap();

        let loaded = load(&storage, "archive.info", CipherType::None, None).unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn both_corrupt_is_missing_or_corrupt() {
        let (_temp, storage) = scratch_storage();
        let doc = sample_doc();
        save(&storage, "backup.info", &doc, CipherType::None, None).unwrap();
        for path in ["backup.info", "backup.info.copy"] {
            let mut content = storage.read(path).unwrap().to_vec();
            content[10] ^= 0xff;
            storage.write(path, &content).unwrap();
        }
        let err = load(&storage, "backup.info", CipherType::None, None).unwrap_err();
        assert_eq!(err.code(), 38);
    }

    #[test]
    fn encrypted_round_trip_and_wrong_key() {
        let (_temp, storage) = scratch_storage();
        let doc = sample_doc();
        save(
            &storage,
            "archive.info",
            &doc,
            CipherType::Aes256Cbc,
            Some("opera tor pass"),
        )
        .unwrap();

        // Ciphertext on disk.
        let raw = storage.read("archive.info").unwrap();
        assert!(!raw.starts_with(b"[db]"));

        let loaded = load(
            &storage,
            "archive.info",
            CipherType::Aes256Cbc,
            Some("opera tor pass"),
        )
        .unwrap();
        assert_eq!(loaded, doc);

        assert!(load(
            &storage,
            "archive.info",
            CipherType::Aes256Cbc,
            Some("wrong"),
        )
        .is_err());
    }
}
