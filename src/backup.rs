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

//! The `backup` command.
//!
//! Copies the cluster into a new backup directory, mirroring its tree under
//! `pg_data/`. Differential and incremental backups reuse unchanged files
//! from their ancestors by reference instead of copying. Small files can be
//! packed into shared bundle objects. The manifest is written last: its
//! presence is what makes the backup real.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::compress::CompressType;
use crate::config::Options;
use crate::control;
use crate::filter::{FilterGroup, FilterResult, GroupReader, HashFilter, SizeFilter};
use crate::info::backup::BackupEntry;
use crate::label::{BackupLabel, BackupType};
use crate::lock::{Lock, LockType};
use crate::manifest::{FileEntry, LinkEntry, Manifest, ManifestOptions, PathEntry};
use crate::pagecheck::PageChecksumFilter;
use crate::parallel::{self, Job, RetrySpec};
use crate::repo::Repo;
use crate::spawn;
use crate::stanza::cluster_info;
use crate::storage::{join_path, Storage};
use crate::wal::WalSegment;
use crate::{Error, Result, PG_PAGE_SIZE};

/// Bundle objects are cut at roughly this size.
const BUNDLE_TARGET_SIZE: usize = 16 * 1024 * 1024;

/// Blocks per 1 GiB relation segment, for page checksum numbering.
const BLOCKS_PER_SEGMENT: u32 = (1 << 30) / PG_PAGE_SIZE as u32;

/// Cluster files never copied into a backup.
fn excluded(relpath: &str) -> bool {
    relpath == "postmaster.pid"
        || relpath == "postmaster.opts"
        || relpath.starts_with("pg_wal/")
        || relpath.starts_with("pg_replslot/")
        || relpath.starts_with("pg_stat_tmp/")
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub backup_type: BackupType,
}

/// One cluster file as found by the live-tree walk.
#[derive(Debug)]
struct LiveFile {
    /// Path relative to the data directory.
    relpath: String,
    size: u64,
    mtime: i64,
    mode: Option<u32>,
    user: Option<String>,
    group: Option<String>,
}

pub fn backup(options: &Options, backup_options: &BackupOptions) -> Result<BackupLabel> {
    control::check_stopped(options)?;
    let stanza = options.stanza()?;
    let _lock = Lock::acquire(&options.lock_path, stanza, LockType::Backup)?;

    let repo = Repo::open(options)?;
    let mut backup_info = repo.load_backup_info()?;
    let db = match cluster_info(&options.pg_path) {
        Ok(db) => {
            if db.system_id != backup_info.db().system_id {
                return Err(Error::RepoInvalid(format!(
                    "cluster system id {} does not match the stanza ({})",
                    db.system_id,
                    backup_info.db().system_id
                )));
            }
            let mut db = db;
            db.db_id = backup_info.db().db_id;
            db
        }
        Err(_) => backup_info.db().clone(),
    };

    // Resolve the backup type and the prior backup it chains from.
    let mut backup_type = backup_options.backup_type;
    let prior_label = match backup_type {
        BackupType::Full => None,
        BackupType::Diff => backup_info.latest_for_type(true).cloned(),
        BackupType::Incr => backup_info.latest_for_type(false).cloned(),
    };
    if backup_type != BackupType::Full && prior_label.is_none() {
        warn!("no prior backup exists, performing a full backup instead");
        backup_type = BackupType::Full;
    }
    let backup_storage = repo.backup_storage()?;
    let subkey = backup_info.cipher_pass.clone();
    let prior_manifest = match &prior_label {
        None => None,
        Some(prior) => Some(Manifest::load(
            &backup_storage.subdir(prior)?,
            repo.cipher_type,
            subkey.as_deref().or(repo.operator_passphrase()),
        )?),
    };

    let start = OffsetDateTime::now_utc();
    let prior_parsed = prior_label
        .as_deref()
        .map(|label| label.parse::<BackupLabel>())
        .transpose()?;
    let label = BackupLabel::new(backup_type, prior_parsed.as_ref(), start)?;
    info!("new backup label {label} ({backup_type})");

    let manifest_options = ManifestOptions {
        compress_type: match repo.compress_type {
            CompressType::None => "none".into(),
            CompressType::Gzip => "gz".into(),
            CompressType::Lz4 => "lz4".into(),
        },
        compress_level: repo.compress_level,
        checksum_page: options.checksum_page,
        bundle_limit: options.bundle_limit,
        cipher_type: repo.cipher_type.option_name().into(),
    };
    let mut manifest = Manifest::start(
        label.clone(),
        prior_manifest.as_ref(),
        db,
        manifest_options,
        start,
    );
    manifest.archive_start = current_wal_extent(&options.pg_path).map(|(first, _)| first);

    // Walk the live tree.
    let (files, paths, links) = walk_live_tree(&options.pg_path)?;
    for (relpath, entry) in paths {
        manifest
            .paths
            .insert(join_path("pg_data", &relpath), entry);
    }
    manifest.paths.insert("pg_data".into(), PathEntry::default());
    for (relpath, entry) in links {
        manifest
            .links
            .insert(join_path("pg_data", &relpath), entry);
    }
    manifest.databases = databases_of(&options.pg_path);

    backup_storage.path_create(label.as_str(), true)?;
    let label_storage = backup_storage.subdir(label.as_str())?;
    create_backup_dirs(&label_storage, &manifest)?;

    // Partition the work: unchanged files become references, small files
    // go into bundles, the rest are copied (in parallel when configured).
    let mut to_copy: Vec<LiveFile> = Vec::new();
    let mut to_bundle: Vec<LiveFile> = Vec::new();
    for file in files {
        let manifest_path = join_path("pg_data", &file.relpath);
        if let Some(prior_manifest) = &prior_manifest {
            if let Some(prior_entry) = prior_manifest.files.get(&manifest_path) {
                if prior_entry.size == file.size && prior_entry.timestamp == file.mtime {
                    let mut entry = prior_entry.clone();
                    entry.reference = Some(
                        prior_entry
                            .reference
                            .clone()
                            .unwrap_or_else(|| prior_manifest.label.as_str().to_owned()),
                    );
                    entry.mode = file.mode;
                    entry.user = file.user.clone();
                    entry.group = file.group.clone();
                    manifest.files.insert(manifest_path, entry);
                    continue;
                }
            }
        }
        if options.bundle_limit > 0 && file.size < options.bundle_limit {
            to_bundle.push(file);
        } else {
            to_copy.push(file);
        }
    }

    copy_bundled_files(options, &repo, &label_storage, subkey.as_deref(), to_bundle, &mut manifest)?;

    if options.process_max > 1 && to_copy.len() > 1 {
        copy_files_parallel(options, label.as_str(), to_copy, &mut manifest)?;
    } else {
        for file in to_copy {
            let entry = copy_one_file(
                options,
                &repo,
                &label_storage,
                subkey.as_deref(),
                &file.relpath,
                file_entry_seed(&file),
            )?;
            manifest
                .files
                .insert(join_path("pg_data", &file.relpath), entry);
        }
    }

    manifest.archive_stop = current_wal_extent(&options.pg_path).map(|(_, last)| last);
    manifest.timestamp_stop = OffsetDateTime::now_utc().unix_timestamp();

    // Writing the manifest commits the backup.
    manifest.save(
        &label_storage,
        repo.cipher_type,
        subkey.as_deref().or(repo.operator_passphrase()),
    )?;
    backup_info.add(label.as_str(), BackupEntry::from_manifest(&manifest));
    repo.save_backup_info(&backup_info)?;

    let errors: usize = manifest
        .files
        .values()
        .map(|entry| entry.page_errors.len())
        .sum();
    if errors > 0 {
        warn!("{errors} page checksum errors were recorded in the manifest");
    }
    info!(
        "backup {label} complete: {} files, {} bytes",
        manifest.files.len(),
        manifest.total_size()
    );
    Ok(label)
}

fn file_entry_seed(file: &LiveFile) -> FileEntry {
    FileEntry {
        size: file.size,
        mode: file.mode,
        user: file.user.clone(),
        group: file.group.clone(),
        timestamp: file.mtime,
        ..Default::default()
    }
}

/// Recursive walk of the data directory, sorted, with exclusions applied.
fn walk_live_tree(
    pg_path: &Path,
) -> Result<(
    Vec<LiveFile>,
    BTreeMap<String, PathEntry>,
    BTreeMap<String, LinkEntry>,
)> {
    let mut files = Vec::new();
    let mut paths = BTreeMap::new();
    let mut links = BTreeMap::new();
    walk_dir(pg_path, "", &mut files, &mut paths, &mut links)?;
    files.sort_by(|a, b| a.relpath.cmp(&b.relpath));
    Ok((files, paths, links))
}

fn walk_dir(
    pg_path: &Path,
    prefix: &str,
    files: &mut Vec<LiveFile>,
    paths: &mut BTreeMap<String, PathEntry>,
    links: &mut BTreeMap<String, LinkEntry>,
) -> Result<()> {
    let dir = pg_path.join(prefix);
    let entries = std::fs::read_dir(&dir).map_err(|source| Error::FileOpen {
        path: dir.clone(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| Error::FileRead {
            path: dir.clone(),
            source,
        })?;
        let Ok(name) = entry.file_name().into_string() else {
            warn!("skipping non-UTF-8 name {:?}", entry.file_name());
            continue;
        };
        let relpath = join_path(prefix, &name);
        if excluded(&relpath) {
            continue;
        }
        let metadata = entry
            .path()
            .symlink_metadata()
            .map_err(|source| Error::FileRead {
                path: entry.path(),
                source,
            })?;
        #[cfg(unix)]
        let (mode, user, group) = {
            use std::os::unix::fs::MetadataExt;
            (
                Some(metadata.mode() & 0o7777),
                Some(metadata.uid().to_string()),
                Some(metadata.gid().to_string()),
            )
        };
        #[cfg(not(unix))]
        let (mode, user, group) = (None, None, None);

        if metadata.file_type().is_symlink() {
            let destination = std::fs::read_link(entry.path())
                .map_err(|source| Error::FileRead {
                    path: entry.path(),
                    source,
                })?
                .to_string_lossy()
                .into_owned();
            links.insert(relpath, LinkEntry {
                destination,
                user,
                group,
            });
        } else if metadata.is_dir() {
            paths.insert(relpath.clone(), PathEntry { mode, user, group });
            walk_dir(pg_path, &relpath, files, paths, links)?;
        } else {
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            files.push(LiveFile {
                relpath,
                size: metadata.len(),
                mtime,
                mode,
                user,
                group,
            });
        }
    }
    Ok(())
}

/// Create the mirrored directory tree ahead of the file copies.
fn create_backup_dirs(label_storage: &Storage, manifest: &Manifest) -> Result<()> {
    label_storage.path_create("pg_data", true)?;
    for path in manifest.paths.keys() {
        label_storage.path_create(path, true)?;
    }
    Ok(())
}

/// Database oids are the directories under base/.
fn databases_of(pg_path: &Path) -> Vec<u32> {
    let mut oids: Vec<u32> = std::fs::read_dir(pg_path.join("base"))
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().into_string().ok())
                .filter_map(|name| name.parse().ok())
                .collect()
        })
        .unwrap_or_default();
    oids.sort_unstable();
    oids
}

/// The smallest and largest segment names currently in pg_wal, consumed as
/// the archive extent the backup spans.
fn current_wal_extent(pg_path: &Path) -> Option<(String, String)> {
    let mut segments: Vec<String> = std::fs::read_dir(pg_path.join("pg_wal"))
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| WalSegment::is_segment_name(name))
        .collect();
    segments.sort_unstable();
    match (segments.first(), segments.last()) {
        (Some(first), Some(last)) => Some((first.clone(), last.clone())),
        _ => None,
    }
}

/// Whether page checksums apply to this cluster file, and the starting
/// block number if so.
fn page_check_start(relpath: &str) -> Option<u32> {
    let (dir_ok, file) = match relpath.rsplit_once('/') {
        Some((dir, file)) => (dir.starts_with("base/") || dir == "global", file),
        None => return None,
    };
    if !dir_ok {
        return None;
    }
    let (oid, segment) = match file.split_once('.') {
        Some((oid, segment)) => (oid, segment.parse::<u32>().ok()?),
        None => (file, 0),
    };
    if oid.chars().all(|c| c.is_ascii_digit()) && !oid.is_empty() {
        Some(segment * BLOCKS_PER_SEGMENT)
    } else {
        None
    }
}

/// Copy one cluster file into the backup, returning its manifest entry.
///
/// Shared by the in-process path and the `backup:local` worker.
pub fn copy_one_file(
    options: &Options,
    repo: &Repo,
    label_storage: &Storage,
    subkey: Option<&str>,
    relpath: &str,
    mut entry: FileEntry,
) -> Result<FileEntry> {
    let source_path = options.pg_path.join(relpath);
    let source = std::fs::File::open(&source_path).map_err(|source| Error::FileOpen {
        path: source_path.clone(),
        source,
    })?;

    let mut read_group = FilterGroup::new()
        .with(Box::new(HashFilter::sha1()))
        .with(Box::new(SizeFilter::new()));
    if options.checksum_page && entry.size % PG_PAGE_SIZE as u64 == 0 {
        if let Some(first_block) = page_check_start(relpath) {
            read_group.push(Box::new(PageChecksumFilter::new(first_block)));
        }
    }
    let mut reader = GroupReader::new(source, read_group);

    let target = format!(
        "pg_data/{relpath}{}",
        repo.compress_type.extension()
    );
    let mut write = label_storage.open_write(&target, repo.store_filters(repo.compress_type, subkey))?;
    std::io::copy(&mut reader, &mut write).map_err(crate::filter::lift_io_error)?;
    let read_group = reader.finish()?;
    let write_group = write.commit()?;

    entry.checksum = read_group.result("sha1").and_then(|result| match result {
        FilterResult::Str(digest) => Some(digest),
        _ => None,
    });
    // The file may have grown or shrunk since the walk; record what was
    // actually copied.
    entry.size = read_group
        .result("size")
        .and_then(|result| result.as_u64())
        .unwrap_or(entry.size);
    entry.repo_size = write_group
        .result("repo-size")
        .and_then(|result| result.as_u64())
        .unwrap_or(0);
    if let Some(FilterResult::PageErrors(errors)) = read_group.result("page-checksum") {
        if !errors.is_empty() {
            warn!("{relpath}: page checksum errors at blocks {errors:?}");
        }
        entry.page_errors = errors;
    }
    debug!(
        "copied {relpath} ({} -> {} bytes)",
        entry.size, entry.repo_size
    );
    Ok(entry)
}

/// Pack small files into shared bundle objects.
fn copy_bundled_files(
    options: &Options,
    repo: &Repo,
    label_storage: &Storage,
    subkey: Option<&str>,
    files: Vec<LiveFile>,
    manifest: &mut Manifest,
) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    label_storage.path_create("bundle", true)?;
    let mut bundle_id: u64 = 1;
    let mut bundle: Vec<u8> = Vec::new();

    for file in files {
        let source_path = options.pg_path.join(&file.relpath);
        let content = std::fs::read(&source_path).map_err(|source| Error::FileOpen {
            path: source_path,
            source,
        })?;
        let mut entry = file_entry_seed(&file);
        entry.size = content.len() as u64;
        entry.checksum = Some(hex::encode(Sha1::digest(&content)));

        // Each member is its own filtered stream, so restore can read it
        // back by range without touching its neighbors.
        let mut stored = Vec::new();
        let mut group = repo.store_filters(repo.compress_type, subkey);
        group.process(&content, &mut stored)?;
        group.finish(&mut stored)?;

        entry.bundle_id = Some(bundle_id);
        entry.bundle_offset = Some(bundle.len() as u64);
        entry.repo_size = stored.len() as u64;
        bundle.extend_from_slice(&stored);
        manifest
            .files
            .insert(join_path("pg_data", &file.relpath), entry);

        if bundle.len() >= BUNDLE_TARGET_SIZE {
            label_storage.write(&format!("bundle/{bundle_id}"), &bundle)?;
            bundle.clear();
            bundle_id += 1;
        }
    }
    if !bundle.is_empty() {
        label_storage.write(&format!("bundle/{bundle_id}"), &bundle)?;
    }
    Ok(())
}

/// Copy the large files through the worker pool.
fn copy_files_parallel(
    options: &Options,
    label: &str,
    files: Vec<LiveFile>,
    manifest: &mut Manifest,
) -> Result<()> {
    let clients = spawn::spawn_local_pool("backup", options, options.process_max)?;
    let mut seeds: BTreeMap<String, FileEntry> = files
        .iter()
        .map(|file| (file.relpath.clone(), file_entry_seed(file)))
        .collect();
    let mut jobs = files.into_iter().map(|file| Job {
        key: file.relpath.clone(),
        cmd: "backup-file".into(),
        parameter: vec![json!(file.relpath), json!(label)],
    });
    let mut completed: Vec<(String, FileEntry)> = Vec::new();
    parallel::execute(
        clients,
        RetrySpec {
            retries: options.job_retry,
            interval: Duration::from_millis(options.job_retry_interval_ms),
        },
        None,
        move || jobs.next(),
        |completion| {
            let relpath = completion.key;
            let out = completion.result?;
            let mut entry = seeds.remove(&relpath).unwrap_or_default();
            apply_worker_entry(&mut entry, &out);
            completed.push((relpath, entry));
            Ok(())
        },
    )?;
    // `execute` returns only after every completion was surfaced.
    for (relpath, entry) in completed {
        manifest.files.insert(join_path("pg_data", &relpath), entry);
    }
    Ok(())
}

fn apply_worker_entry(entry: &mut FileEntry, out: &Value) {
    if let Some(checksum) = out["checksum"].as_str() {
        entry.checksum = Some(checksum.to_owned());
    }
    if let Some(size) = out["size"].as_u64() {
        entry.size = size;
    }
    if let Some(repo_size) = out["repo-size"].as_u64() {
        entry.repo_size = repo_size;
    }
    if let Some(errors) = out["page-errors"].as_array() {
        entry.page_errors = errors
            .iter()
            .filter_map(Value::as_u64)
            .map(|block| block as u32)
            .collect();
    }
}

/// Worker dispatch for `backup:local`.
pub fn worker_dispatch(cmd: &str, params: &[Value], options: &Options) -> Result<Value> {
    match cmd {
        "backup-file" => {
            let relpath = crate::protocol::param_str(params, 0)?;
            let label = crate::protocol::param_str(params, 1)?;
            let repo = Repo::open(options)?;
            let backup_info = repo.load_backup_info()?;
            let subkey = backup_info.cipher_pass.clone();
            let label_storage = repo.backup_storage()?.subdir(label)?;
            let source_path = options.pg_path.join(relpath);
            let metadata = source_path.metadata().map_err(|source| Error::FileOpen {
                path: source_path,
                source,
            })?;
            let seed = FileEntry {
                size: metadata.len(),
                ..Default::default()
            };
            let entry = copy_one_file(
                options,
                &repo,
                &label_storage,
                subkey.as_deref(),
                relpath,
                seed,
            )?;
            Ok(json!({
                "checksum": entry.checksum,
                "size": entry.size,
                "repo-size": entry.repo_size,
                "page-errors": entry.page_errors,
            }))
        }
        other => Err(Error::Protocol(format!("unknown command '{other}'"))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::ScratchRepo;

    fn run_backup(fixture: &ScratchRepo, backup_type: BackupType) -> BackupLabel {
        backup(
            fixture.options(),
            &BackupOptions { backup_type },
        )
        .unwrap()
    }

    fn load_manifest(fixture: &ScratchRepo, label: &BackupLabel) -> Manifest {
        let repo = fixture.repo().unwrap();
        Manifest::load(
            &repo.backup_storage().unwrap().subdir(label.as_str()).unwrap(),
            repo.cipher_type,
            None,
        )
        .unwrap()
    }

    #[test]
    fn full_backup_copies_the_cluster() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let label = run_backup(&fixture, BackupType::Full);

        let manifest = load_manifest(&fixture, &label);
        assert!(manifest.files.contains_key("pg_data/PG_VERSION"));
        assert!(manifest.files.contains_key("pg_data/global/pg_control"));
        assert!(manifest.files.contains_key("pg_data/base/1/1259"));
        assert!(manifest
            .files
            .values()
            .all(|entry| entry.reference.is_none()));

        // The registry gained the entry.
        let info = fixture.repo().unwrap().load_backup_info().unwrap();
        assert_eq!(info.latest().unwrap().0, label.as_str());

        // Stored files exist with the compression extension.
        let storage = fixture
            .repo()
            .unwrap()
            .backup_storage()
            .unwrap()
            .subdir(label.as_str())
            .unwrap();
        assert!(storage.exists("pg_data/PG_VERSION.gz").unwrap());
        assert!(storage.exists("backup.manifest").unwrap());
        assert!(storage.exists("backup.manifest.copy").unwrap());
    }

    #[test]
    fn incremental_reuses_unchanged_files_by_reference() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let full = run_backup(&fixture, BackupType::Full);

        // Change one file; leave the rest untouched.
        let control = fixture.pg_path().join("global").join("pg_control");
        std::fs::write(&control, vec![9u8; 8192]).unwrap();
        let incr = run_backup(&fixture, BackupType::Incr);
        assert_eq!(incr.backup_type(), BackupType::Incr);

        let manifest = load_manifest(&fixture, &incr);
        let changed = &manifest.files["pg_data/global/pg_control"];
        assert_eq!(changed.reference, None);
        let unchanged = &manifest.files["pg_data/PG_VERSION"];
        assert_eq!(unchanged.reference.as_deref(), Some(full.as_str()));
        assert_eq!(manifest.reference, vec![full.as_str().to_owned()]);
    }

    #[test]
    fn requested_incremental_without_prior_falls_back_to_full() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let label = run_backup(&fixture, BackupType::Incr);
        assert_eq!(label.backup_type(), BackupType::Full);
    }

    #[test]
    fn bundling_packs_small_files() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let mut options = fixture.options().clone();
        options.bundle_limit = 1024;
        let label = backup(&options, &BackupOptions::default()).unwrap();

        let repo = fixture.repo().unwrap();
        let storage = repo
            .backup_storage()
            .unwrap()
            .subdir(label.as_str())
            .unwrap();
        assert!(storage.exists("bundle/1").unwrap());

        let manifest = Manifest::load(&storage, repo.cipher_type, None).unwrap();
        // PG_VERSION is tiny, so it was bundled.
        let entry = &manifest.files["pg_data/PG_VERSION"];
        assert_eq!(entry.bundle_id, Some(1));
        assert!(entry.bundle_offset.is_some());
        // pg_control is 8 KiB, above the limit, so it was stored alone.
        assert_eq!(manifest.files["pg_data/global/pg_control"].bundle_id, None);
    }

    #[test]
    fn page_checksum_errors_are_recorded() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        // A relation file with a deliberately corrupt page: nonzero bytes
        // and a bad stored checksum.
        let rel = fixture.pg_path().join("base").join("1").join("2619");
        let mut page = vec![0u8; PG_PAGE_SIZE];
        page[100] = 0xAB;
        page[8] = 0x01;
        std::fs::write(&rel, &page).unwrap();

        let mut options = fixture.options().clone();
        options.checksum_page = true;
        let label = backup(&options, &BackupOptions::default()).unwrap();

        let manifest = load_manifest(&fixture, &label);
        assert_eq!(manifest.files["pg_data/base/1/2619"].page_errors, vec![0]);
        let info = fixture.repo().unwrap().load_backup_info().unwrap();
        assert!(info.current[label.as_str()].error);
    }

    #[test]
    fn page_check_block_numbering() {
        assert_eq!(page_check_start("base/1/1259"), Some(0));
        assert_eq!(page_check_start("base/1/1259.2"), Some(2 * BLOCKS_PER_SEGMENT));
        assert_eq!(page_check_start("global/1233"), Some(0));
        assert_eq!(page_check_start("PG_VERSION"), None);
        assert_eq!(page_check_start("base/1/pg_filenode.map"), None);
        assert_eq!(page_check_start("pg_xact/0000"), None);
    }

    #[test]
    fn excluded_paths() {
        assert!(excluded("postmaster.pid"));
        assert!(excluded("pg_wal/000000010000000000000001"));
        assert!(!excluded("pg_wal"));
        assert!(!excluded("base/1/1259"));
    }
}
