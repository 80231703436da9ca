// Bulwark backup system.
// Copyright 2022, 2023, 2024 Martin Pool.

// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

//! The `restore` command.
//!
//! Rebuilds the cluster directory from a backup set. Files carrying a
//! reference are fetched from the ancestor backup that stored them, so a
//! restore of an incremental transparently spans its whole chain. Every
//! file is checksum-verified as it is decoded; a mismatch aborts rather
//! than leaving a silently corrupt cluster.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::compress::CompressType;
use crate::config::Options;
use crate::control;
use crate::filter::FilterResult;
use crate::manifest::{FileEntry, Manifest};
use crate::parallel::{self, Job, RetrySpec};
use crate::repo::Repo;
use crate::spawn;
use crate::storage::join_path;
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Backup label to restore; the most recent when unset.
    pub set: Option<String>,
    /// Restore into a non-empty directory.
    pub force: bool,
}

pub fn restore(options: &Options, restore_options: &RestoreOptions) -> Result<()> {
    control::check_stopped(options)?;
    let destination = &options.pg_path;
    check_destination(destination, restore_options.force)?;

    let repo = Repo::open(options)?;
    let backup_info = repo.load_backup_info()?;
    let subkey = backup_info.cipher_pass.clone();

    let label = match &restore_options.set {
        Some(set) => {
            if !backup_info.current.contains_key(set) {
                return Err(Error::BackupSetInvalid {
                    label: set.clone(),
                    reason: "not present in backup.info".into(),
                });
            }
            set.clone()
        }
        None => backup_info
            .latest()
            .map(|(label, _)| label.clone())
            .ok_or_else(|| Error::RepoInvalid("no backups exist to restore".into()))?,
    };
    info!("restoring backup {label} to {destination:?}");

    let backup_storage = repo.backup_storage()?;
    let manifest = Manifest::load(
        &backup_storage.subdir(&label)?,
        repo.cipher_type,
        subkey.as_deref().or(repo.operator_passphrase()),
    )?;

    // The compression type of each backup in the chain, for decoding
    // referenced files stored under older settings.
    let mut chain_compress: BTreeMap<String, CompressType> = BTreeMap::new();
    chain_compress.insert(
        label.clone(),
        CompressType::from_option(&manifest.options.compress_type)?,
    );
    for ancestor in &manifest.reference {
        let ancestor_manifest = Manifest::load(
            &backup_storage.subdir(ancestor)?,
            repo.cipher_type,
            subkey.as_deref().or(repo.operator_passphrase()),
        )?;
        chain_compress.insert(
            ancestor.clone(),
            CompressType::from_option(&ancestor_manifest.options.compress_type)?,
        );
    }

    // Directories first, then links, then file contents.
    for (manifest_path, entry) in &manifest.paths {
        let target = destination.join(strip_pgdata(manifest_path));
        std::fs::create_dir_all(&target).map_err(|source| Error::FileWrite {
            path: target.clone(),
            source,
        })?;
        apply_mode(&target, entry.mode)?;
    }
    #[cfg(unix)]
    for (manifest_path, entry) in &manifest.links {
        let target = destination.join(strip_pgdata(manifest_path));
        let _ = std::fs::remove_file(&target);
        std::os::unix::fs::symlink(&entry.destination, &target).map_err(|source| {
            Error::FileWrite {
                path: target.clone(),
                source,
            }
        })?;
    }

    let files: Vec<(String, FileEntry)> = manifest
        .files
        .iter()
        .map(|(path, entry)| (path.clone(), entry.clone()))
        .collect();

    if options.process_max > 1 && files.len() > 1 {
        restore_files_parallel(options, &label, &chain_compress, files)?;
    } else {
        for (manifest_path, entry) in files {
            restore_one_file(
                options,
                &repo,
                subkey.as_deref(),
                &label,
                &chain_compress,
                &manifest_path,
                &entry,
            )?;
        }
    }

    info!(
        "restore of {label} complete: {} files, {} bytes",
        manifest.files.len(),
        manifest.total_size()
    );
    Ok(())
}

fn check_destination(destination: &Path, force: bool) -> Result<()> {
    if destination.join("postmaster.pid").exists() {
        return Err(Error::OptionInvalid(format!(
            "{destination:?} looks like a running cluster (postmaster.pid exists)"
        )));
    }
    let empty = match std::fs::read_dir(destination) {
        Ok(mut entries) => entries.next().is_none(),
        Err(source) => {
            return Err(Error::FileOpen {
                path: destination.to_owned(),
                source,
            })
        }
    };
    if !empty && !force {
        return Err(Error::OptionInvalid(format!(
            "{destination:?} is not empty (use --force to overwrite)"
        )));
    }
    Ok(())
}

fn strip_pgdata(manifest_path: &str) -> &str {
    manifest_path
        .strip_prefix("pg_data/")
        .unwrap_or(manifest_path.strip_prefix("pg_data").unwrap_or(manifest_path))
}

fn apply_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(
            |source| Error::FileWrite {
                path: path.to_owned(),
                source,
            },
        )?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Fetch one file's content from whichever backup in the chain stored it,
/// verifying the recorded checksum.
pub fn fetch_backup_file(
    repo: &Repo,
    subkey: Option<&str>,
    own_label: &str,
    chain_compress: &BTreeMap<String, CompressType>,
    manifest_path: &str,
    entry: &FileEntry,
) -> Result<Vec<u8>> {
    let source_label = entry.reference.as_deref().unwrap_or(own_label);
    let compress = chain_compress
        .get(source_label)
        .copied()
        .unwrap_or(repo.compress_type);
    let source_storage = repo.backup_storage()?.subdir(source_label)?;

    let (content, group) = if let Some(bundle_id) = entry.bundle_id {
        let group = repo.fetch_filters(compress, subkey, true);
        let mut reader = source_storage.open_read_range(
            &format!("bundle/{bundle_id}"),
            entry.bundle_offset.unwrap_or(0),
            Some(entry.repo_size),
            group,
        )?;
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut reader, &mut content)
            .map_err(crate::filter::lift_io_error)?;
        (content, reader.finish()?)
    } else {
        let stored = format!("{manifest_path}{}", compress.extension());
        let group = repo.fetch_filters(compress, subkey, true);
        source_storage.read_filtered(&stored, group)?
    };

    if let Some(expected) = &entry.checksum {
        let actual = match group.result("sha1") {
            Some(FilterResult::Str(digest)) => digest,
            _ => String::new(),
        };
        if &actual != expected {
            return Err(Error::ChecksumMismatch {
                path: manifest_path.to_owned(),
                expected: expected.clone(),
                actual,
            });
        }
    }
    if content.len() as u64 != entry.size {
        return Err(Error::Format(format!(
            "{manifest_path}: restored {} bytes but the manifest records {}",
            content.len(),
            entry.size
        )));
    }
    Ok(content)
}

fn restore_one_file(
    options: &Options,
    repo: &Repo,
    subkey: Option<&str>,
    own_label: &str,
    chain_compress: &BTreeMap<String, CompressType>,
    manifest_path: &str,
    entry: &FileEntry,
) -> Result<()> {
    let content = fetch_backup_file(
        repo,
        subkey,
        own_label,
        chain_compress,
        manifest_path,
        entry,
    )?;
    let target = options.pg_path.join(strip_pgdata(manifest_path));
    std::fs::write(&target, &content).map_err(|source| Error::FileWrite {
        path: target.clone(),
        source,
    })?;
    apply_mode(&target, entry.mode)?;
    debug!("restored {manifest_path} ({} bytes)", content.len());
    Ok(())
}

fn restore_files_parallel(
    options: &Options,
    label: &str,
    chain_compress: &BTreeMap<String, CompressType>,
    files: Vec<(String, FileEntry)>,
) -> Result<()> {
    let clients = spawn::spawn_local_pool("restore", options, options.process_max)?;
    let compress_by_label: BTreeMap<String, String> = chain_compress
        .iter()
        .map(|(label, compress)| {
            (
                label.clone(),
                match compress {
                    CompressType::None => "none".to_owned(),
                    CompressType::Gzip => "gz".to_owned(),
                    CompressType::Lz4 => "lz4".to_owned(),
                },
            )
        })
        .collect();
    let label = label.to_owned();
    let mut jobs = files.into_iter().map(move |(manifest_path, entry)| {
        let source_label = entry
            .reference
            .clone()
            .unwrap_or_else(|| label.clone());
        let compress = compress_by_label
            .get(&source_label)
            .cloned()
            .unwrap_or_else(|| "gz".to_owned());
        Job {
            key: manifest_path.clone(),
            cmd: "restore-file".into(),
            parameter: vec![
                json!(manifest_path),
                json!(source_label),
                json!(compress),
                json!(entry.bundle_id),
                json!(entry.bundle_offset),
                json!(entry.repo_size),
                json!(entry.size),
                json!(entry.checksum),
                json!(entry.mode),
            ],
        }
    });
    parallel::execute(
        clients,
        RetrySpec {
            retries: options.job_retry,
            interval: Duration::from_millis(options.job_retry_interval_ms),
        },
        None,
        move || jobs.next(),
        |completion| completion.result.map(|_| ()),
    )?;
    Ok(())
}

/// Worker dispatch for `restore:local`.
pub fn worker_dispatch(cmd: &str, params: &[Value], options: &Options) -> Result<Value> {
    match cmd {
        "restore-file" => {
            let manifest_path = crate::protocol::param_str(params, 0)?;
            let source_label = crate::protocol::param_str(params, 1)?;
            let compress = CompressType::from_option(crate::protocol::param_str(params, 2)?)?;
            let entry = FileEntry {
                bundle_id: params.get(3).and_then(Value::as_u64),
                bundle_offset: params.get(4).and_then(Value::as_u64),
                repo_size: params.get(5).and_then(Value::as_u64).unwrap_or(0),
                size: params.get(6).and_then(Value::as_u64).unwrap_or(0),
                checksum: params
                    .get(7)
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                mode: params.get(8).and_then(Value::as_u64).map(|mode| mode as u32),
                reference: Some(source_label.to_owned()),
                ..Default::default()
            };
            let repo = Repo::open(options)?;
            let backup_info = repo.load_backup_info()?;
            let subkey = backup_info.cipher_pass.clone();
            let mut chain_compress = BTreeMap::new();
            chain_compress.insert(source_label.to_owned(), compress);
            restore_one_file(
                options,
                &repo,
                subkey.as_deref(),
                source_label,
                &chain_compress,
                manifest_path,
                &entry,
            )?;
            Ok(Value::Bool(true))
        }
        other => Err(Error::Protocol(format!("unknown command '{other}'"))),
    }
}
