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

//! The repository: storage plus the stanza layout.
//!
//! ```text
//! <repo-path>/
//!   archive/<stanza>/
//!     archive.info[.copy]
//!     <pg-version>-<dbId>/
//!       <timeline>.history
//!       <first-16-hex-of-seg>/<seg>-<sha1>[.gz|.lz4]
//!   backup/<stanza>/
//!     backup.info[.copy]
//!     <label>/
//!       backup.manifest[.copy]
//!       bundle/<bundle-id>
//!       pg_data/...
//! ```

use crate::compress::CompressType;
use crate::config::Options;
use crate::crypto::{CipherType, CryptoDecrypt, CryptoEncrypt};
use crate::filter::{FilterGroup, HashFilter, SizeFilter};
use crate::info::archive::ArchiveInfo;
use crate::info::backup::BackupInfo;
use crate::storage::Storage;
use crate::transport::open_transport;
use crate::{Result, REPO_ARCHIVE, REPO_BACKUP};

/// An open repository scoped to one stanza.
#[derive(Debug, Clone)]
pub struct Repo {
    storage: Storage,
    stanza: String,
    pub cipher_type: CipherType,
    /// The operator passphrase; unlocks the info files.
    cipher_pass: Option<String>,
    pub compress_type: CompressType,
    pub compress_level: u32,
}

impl Repo {
    pub fn open(options: &Options) -> Result<Repo> {
        let stanza = options.stanza()?.to_owned();
        let transport = open_transport(&options.repo_path)?;
        Ok(Repo {
            storage: Storage::open(transport),
            stanza,
            cipher_type: options.cipher_type,
            cipher_pass: options.cipher_pass.clone(),
            compress_type: options.compress_type,
            compress_level: options.compress_level,
        })
    }

    pub fn stanza(&self) -> &str {
        &self.stanza
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn operator_passphrase(&self) -> Option<&str> {
        self.cipher_pass.as_deref()
    }

    /// Storage rooted at `archive/<stanza>/`.
    pub fn archive_storage(&self) -> Result<Storage> {
        self.storage
            .subdir(&format!("{REPO_ARCHIVE}/{}", self.stanza))
    }

    /// Storage rooted at `backup/<stanza>/`.
    pub fn backup_storage(&self) -> Result<Storage> {
        self.storage
            .subdir(&format!("{REPO_BACKUP}/{}", self.stanza))
    }

    pub fn load_archive_info(&self) -> Result<ArchiveInfo> {
        ArchiveInfo::load(
            &self.archive_storage()?,
            self.cipher_type,
            self.cipher_pass.as_deref(),
        )
    }

    pub fn save_archive_info(&self, info: &ArchiveInfo) -> Result<()> {
        info.save(
            &self.archive_storage()?,
            self.cipher_type,
            self.cipher_pass.as_deref(),
        )
    }

    pub fn load_backup_info(&self) -> Result<BackupInfo> {
        BackupInfo::load(
            &self.backup_storage()?,
            self.cipher_type,
            self.cipher_pass.as_deref(),
        )
    }

    pub fn load_backup_info_reconstruct(&self) -> Result<BackupInfo> {
        BackupInfo::load_reconstruct(
            &self.backup_storage()?,
            self.cipher_type,
            self.cipher_pass.as_deref(),
        )
    }

    pub fn save_backup_info(&self, info: &BackupInfo) -> Result<()> {
        info.save(
            &self.backup_storage()?,
            self.cipher_type,
            self.cipher_pass.as_deref(),
        )
    }

    /// Filters for storing a data file: measure the stored size, compress,
    /// then encrypt with the branch subkey.
    pub fn store_filters(
        &self,
        compress: CompressType,
        subkey: Option<&str>,
    ) -> FilterGroup {
        let mut group = FilterGroup::new();
        if let Some(filter) = compress.compress_filter(self.compress_level) {
            group.push(filter);
        }
        if let Some(subkey) = subkey {
            group.push(Box::new(CryptoEncrypt::new(subkey)));
        }
        group.push(Box::new(SizeFilter::named("repo-size")));
        group
    }

    /// Filters for fetching a stored file: decrypt, decompress, then hash
    /// the plaintext for verification.
    pub fn fetch_filters(
        &self,
        compress: CompressType,
        subkey: Option<&str>,
        hash: bool,
    ) -> FilterGroup {
        let mut group = FilterGroup::new();
        if let Some(subkey) = subkey {
            group.push(Box::new(CryptoDecrypt::new(subkey)));
        }
        if let Some(filter) = compress.decompress_filter() {
            group.push(filter);
        }
        if hash {
            group.push(Box::new(HashFilter::sha1()));
        }
        group
    }
}
