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

//! Option resolution.
//!
//! Options are resolved from, lowest to highest precedence: built-in
//! defaults, environment variables (`BULWARK_<OPTION>` with `-` mapped to
//! `_`), the config file (`[global]`, `[global:<command>]`, `[<stanza>]`,
//! `[<stanza>:<command>]` sections), then the command line. The resolved
//! set is immutable once a command begins.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compress::CompressType;
use crate::crypto::CipherType;
use crate::{Error, Result, WAL_SEGMENT_SIZE_DEFAULT};

/// The resolved option set for one command invocation.
#[derive(Debug, Clone)]
pub struct Options {
    pub stanza: Option<String>,
    /// Repository root: a local path or a `s3://`, `azure://`, `gcs://`,
    /// or `ssh://` URL.
    pub repo_path: String,
    /// The PostgreSQL data directory.
    pub pg_path: PathBuf,
    pub spool_path: PathBuf,
    pub lock_path: PathBuf,
    pub cipher_type: CipherType,
    pub cipher_pass: Option<String>,
    pub compress_type: CompressType,
    pub compress_level: u32,
    /// Worker processes for parallel commands.
    pub process_max: usize,
    pub archive_async: bool,
    /// How long a synchronous archive-push waits for the async daemon.
    pub archive_timeout_ms: u64,
    /// Prefetch horizon of archive-get in segments.
    pub archive_get_queue_max: usize,
    pub retention_full: Option<u32>,
    pub retention_diff: Option<u32>,
    pub wal_segment_size: usize,
    /// Bundle files smaller than this into shared bundle objects; zero
    /// disables bundling.
    pub bundle_limit: u64,
    /// Verify data page checksums during backup.
    pub checksum_page: bool,
    /// Per-job retries in the parallel executor.
    pub job_retry: u32,
    pub job_retry_interval_ms: u64,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            stanza: None,
            repo_path: "/var/lib/bulwark".to_owned(),
            pg_path: PathBuf::new(),
            spool_path: PathBuf::from("/var/spool/bulwark"),
            lock_path: PathBuf::from("/tmp/bulwark"),
            cipher_type: CipherType::None,
            cipher_pass: None,
            compress_type: CompressType::Gzip,
            compress_level: 6,
            process_max: 1,
            archive_async: false,
            archive_timeout_ms: 60_000,
            archive_get_queue_max: 4,
            retention_full: None,
            retention_diff: None,
            wal_segment_size: WAL_SEGMENT_SIZE_DEFAULT,
            bundle_limit: 0,
            checksum_page: false,
            job_retry: 1,
            job_retry_interval_ms: 1_000,
        }
    }
}

impl Options {
    pub fn stanza(&self) -> Result<&str> {
        self.stanza
            .as_deref()
            .ok_or_else(|| Error::OptionInvalid("--stanza is required".into()))
    }

    /// Resolve options for `command` by merging all sources below the
    /// command line, then the `cli` pairs on top.
    pub fn resolve(
        command: &str,
        config_file: Option<&Path>,
        cli: &[(String, String)],
    ) -> Result<Options> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();

        // Environment.
        for (key, value) in std::env::vars() {
            if let Some(option) = key.strip_prefix("BULWARK_") {
                merged.insert(option.to_lowercase().replace('_', "-"), value);
            }
        }

        // The stanza can come from the command line even though it also
        // selects config sections; find it early.
        let stanza = cli
            .iter()
            .find(|(name, _)| name == "stanza")
            .map(|(_, value)| value.clone())
            .or_else(|| merged.get("stanza").cloned());

        // Config file sections, most generic first.
        if let Some(config_file) = config_file {
            let sections = parse_config_file(config_file)?;
            let mut order = vec!["global".to_owned(), format!("global:{command}")];
            if let Some(stanza) = &stanza {
                order.push(stanza.clone());
                order.push(format!("{stanza}:{command}"));
            }
            for section in order {
                if let Some(keys) = sections.get(&section) {
                    merged.extend(keys.clone());
                }
            }
        }

        // Command line wins.
        for (name, value) in cli {
            merged.insert(name.clone(), value.clone());
        }

        Options::from_map(&merged)
    }

    fn from_map(map: &BTreeMap<String, String>) -> Result<Options> {
        let mut options = Options::default();
        for (name, value) in map {
            match name.as_str() {
                "stanza" => options.stanza = Some(value.clone()),
                "repo-path" => options.repo_path = value.clone(),
                "pg-path" => options.pg_path = PathBuf::from(value),
                "spool-path" => options.spool_path = PathBuf::from(value),
                "lock-path" => options.lock_path = PathBuf::from(value),
                "cipher-type" => options.cipher_type = CipherType::from_option(value)?,
                "cipher-pass" => options.cipher_pass = Some(value.clone()),
                "compress-type" => options.compress_type = CompressType::from_option(value)?,
                "compress-level" => options.compress_level = parse_integer(name, value)? as u32,
                "process-max" => options.process_max = parse_integer(name, value)? as usize,
                "archive-async" => options.archive_async = parse_bool(name, value)?,
                "archive-timeout" => options.archive_timeout_ms = parse_time_ms(name, value)?,
                "archive-get-queue-max" => {
                    options.archive_get_queue_max = parse_integer(name, value)? as usize
                }
                "repo-retention-full" => {
                    options.retention_full = Some(parse_integer(name, value)? as u32)
                }
                "repo-retention-diff" => {
                    options.retention_diff = Some(parse_integer(name, value)? as u32)
                }
                "wal-segment-size" => {
                    options.wal_segment_size = parse_size(name, value)? as usize
                }
                "bundle-limit" => options.bundle_limit = parse_size(name, value)?,
                "checksum-page" => options.checksum_page = parse_bool(name, value)?,
                "job-retry" => options.job_retry = parse_integer(name, value)? as u32,
                "job-retry-interval" => {
                    options.job_retry_interval_ms = parse_time_ms(name, value)?
                }
                // Unknown keys in the environment or config file are left
                // for future versions rather than rejected.
                _ => tracing::debug!(name = %name, "ignoring unknown option"),
            }
        }
        if options.process_max == 0 {
            return Err(Error::OptionInvalid("process-max must be at least 1".into()));
        }
        if options.cipher_type != CipherType::None && options.cipher_pass.is_none() {
            return Err(Error::OptionInvalid(
                "cipher-pass is required when cipher-type is set".into(),
            ));
        }
        Ok(options)
    }

    /// Environment variable pairs that reproduce this option set in a
    /// detached child (the async daemon has no pipe for the prelude).
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let mut push = |name: &str, value: String| {
            env.push((
                format!("BULWARK_{}", name.to_uppercase().replace('-', "_")),
                value,
            ));
        };
        if let Some(stanza) = &self.stanza {
            push("stanza", stanza.clone());
        }
        push("repo-path", self.repo_path.clone());
        push("pg-path", self.pg_path.to_string_lossy().into_owned());
        push("spool-path", self.spool_path.to_string_lossy().into_owned());
        push("lock-path", self.lock_path.to_string_lossy().into_owned());
        push("cipher-type", self.cipher_type.option_name().to_owned());
        if let Some(cipher_pass) = &self.cipher_pass {
            push("cipher-pass", cipher_pass.clone());
        }
        push(
            "compress-type",
            match self.compress_type {
                CompressType::None => "none".to_owned(),
                CompressType::Gzip => "gz".to_owned(),
                CompressType::Lz4 => "lz4".to_owned(),
            },
        );
        push("compress-level", self.compress_level.to_string());
        push("process-max", self.process_max.to_string());
        push("archive-timeout", format!("{}ms", self.archive_timeout_ms));
        push(
            "archive-get-queue-max",
            self.archive_get_queue_max.to_string(),
        );
        push("wal-segment-size", self.wal_segment_size.to_string());
        push("bundle-limit", self.bundle_limit.to_string());
        push("checksum-page", if self.checksum_page { "y" } else { "n" }.to_owned());
        push("job-retry", self.job_retry.to_string());
        push(
            "job-retry-interval",
            format!("{}ms", self.job_retry_interval_ms),
        );
        env
    }

    /// Serializable snapshot sent to workers as the configuration prelude
    /// and recorded in manifests.
    pub fn snapshot(&self) -> OptionSnapshot {
        OptionSnapshot {
            stanza: self.stanza.clone(),
            repo_path: self.repo_path.clone(),
            pg_path: self.pg_path.to_string_lossy().into_owned(),
            spool_path: self.spool_path.to_string_lossy().into_owned(),
            lock_path: self.lock_path.to_string_lossy().into_owned(),
            cipher_type: self.cipher_type.option_name().to_owned(),
            cipher_pass: self.cipher_pass.clone(),
            compress_type: match self.compress_type {
                CompressType::None => "none".to_owned(),
                CompressType::Gzip => "gz".to_owned(),
                CompressType::Lz4 => "lz4".to_owned(),
            },
            compress_level: self.compress_level,
            process_max: self.process_max,
            archive_async: self.archive_async,
            archive_timeout_ms: self.archive_timeout_ms,
            archive_get_queue_max: self.archive_get_queue_max,
            retention_full: self.retention_full,
            retention_diff: self.retention_diff,
            wal_segment_size: self.wal_segment_size,
            bundle_limit: self.bundle_limit,
            checksum_page: self.checksum_page,
            job_retry: self.job_retry,
            job_retry_interval_ms: self.job_retry_interval_ms,
        }
    }
}

/// The wire and manifest form of [Options].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionSnapshot {
    pub stanza: Option<String>,
    pub repo_path: String,
    pub pg_path: String,
    pub spool_path: String,
    pub lock_path: String,
    pub cipher_type: String,
    pub cipher_pass: Option<String>,
    pub compress_type: String,
    pub compress_level: u32,
    pub process_max: usize,
    pub archive_async: bool,
    pub archive_timeout_ms: u64,
    pub archive_get_queue_max: usize,
    pub retention_full: Option<u32>,
    pub retention_diff: Option<u32>,
    pub wal_segment_size: usize,
    pub bundle_limit: u64,
    pub checksum_page: bool,
    pub job_retry: u32,
    pub job_retry_interval_ms: u64,
}

impl OptionSnapshot {
    pub fn into_options(self) -> Result<Options> {
        Ok(Options {
            stanza: self.stanza,
            repo_path: self.repo_path,
            pg_path: PathBuf::from(self.pg_path),
            spool_path: PathBuf::from(self.spool_path),
            lock_path: PathBuf::from(self.lock_path),
            cipher_type: CipherType::from_option(&self.cipher_type)?,
            cipher_pass: self.cipher_pass,
            compress_type: CompressType::from_option(&self.compress_type)?,
            compress_level: self.compress_level,
            process_max: self.process_max,
            archive_async: self.archive_async,
            archive_timeout_ms: self.archive_timeout_ms,
            archive_get_queue_max: self.archive_get_queue_max,
            retention_full: self.retention_full,
            retention_diff: self.retention_diff,
            wal_segment_size: self.wal_segment_size,
            bundle_limit: self.bundle_limit,
            checksum_page: self.checksum_page,
            job_retry: self.job_retry,
            job_retry_interval_ms: self.job_retry_interval_ms,
        })
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "y" | "yes" | "true" | "1" | "on" => Ok(true),
        "n" | "no" | "false" | "0" | "off" => Ok(false),
        _ => Err(Error::OptionInvalid(format!(
            "'{value}' is not a boolean for {name}"
        ))),
    }
}

fn parse_integer(name: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::OptionInvalid(format!("'{value}' is not an integer for {name}")))
}

/// Sizes take an optional K/M/G/T suffix (binary multiples).
fn parse_size(name: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('K') | Some('k') => (&value[..value.len() - 1], 1u64 << 10),
        Some('M') | Some('m') => (&value[..value.len() - 1], 1 << 20),
        Some('G') | Some('g') => (&value[..value.len() - 1], 1 << 30),
        Some('T') | Some('t') => (&value[..value.len() - 1], 1 << 40),
        _ => (value, 1),
    };
    Ok(parse_integer(name, digits)? * multiplier)
}

/// Times are milliseconds, with optional `ms`, `s`, or `m` suffix.
fn parse_time_ms(name: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    if let Some(digits) = value.strip_suffix("ms") {
        parse_integer(name, digits)
    } else if let Some(digits) = value.strip_suffix('s') {
        Ok(parse_integer(name, digits)? * 1_000)
    } else if let Some(digits) = value.strip_suffix('m') {
        Ok(parse_integer(name, digits)? * 60_000)
    } else {
        parse_integer(name, value)
    }
}

/// Parse the INI-style config file into sections of key/value pairs.
fn parse_config_file(path: &Path) -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let text = std::fs::read_to_string(path).map_err(|source| Error::FileOpen {
        path: path.to_owned(),
        source,
    })?;
    let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut current = String::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            current = section.to_owned();
        } else if let Some((key, value)) = line.split_once('=') {
            if current.is_empty() {
                return Err(Error::OptionInvalid(format!(
                    "config line before any section: '{line}'"
                )));
            }
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_owned(), value.trim().to_owned());
        } else {
            return Err(Error::OptionInvalid(format!("malformed config line '{line}'")));
        }
    }
    Ok(sections)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::*;

    #[test]
    fn size_and_time_suffixes() {
        assert_eq!(parse_size("x", "64").unwrap(), 64);
        assert_eq!(parse_size("x", "16M").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_size("x", "2G").unwrap(), 2 << 30);
        assert!(parse_size("x", "1.5G").is_err());
        assert_eq!(parse_time_ms("x", "500ms").unwrap(), 500);
        assert_eq!(parse_time_ms("x", "60s").unwrap(), 60_000);
        assert_eq!(parse_time_ms("x", "2m").unwrap(), 120_000);
        assert_eq!(parse_time_ms("x", "750").unwrap(), 750);
    }

    #[test]
    fn config_file_sections_override_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[global]\n\
             compress-type=gz\n\
             process-max=2\n\
             \n\
             # stanza overrides global\n\
             [main]\n\
             compress-type=lz4\n\
             \n\
             [main:backup]\n\
             process-max=8\n"
        )
        .unwrap();

        let cli = vec![("stanza".to_owned(), "main".to_owned())];
        let options = Options::resolve("backup", Some(file.path()), &cli).unwrap();
        assert_eq!(options.compress_type, CompressType::Lz4);
        assert_eq!(options.process_max, 8);

        // A different command does not see the command section.
        let options = Options::resolve("restore", Some(file.path()), &cli).unwrap();
        assert_eq!(options.process_max, 2);
    }

    #[test]
    fn command_line_wins() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[global]\nprocess-max=2\n").unwrap();
        let cli = vec![("process-max".to_owned(), "5".to_owned())];
        let options = Options::resolve("backup", Some(file.path()), &cli).unwrap();
        assert_eq!(options.process_max, 5);
    }

    #[test]
    fn cipher_requires_pass() {
        let cli = vec![("cipher-type".to_owned(), "aes-256-cbc".to_owned())];
        let err = Options::resolve("backup", None, &cli).unwrap_err();
        assert_eq!(err.code(), 31);
    }

    #[test]
    fn snapshot_round_trip() {
        let mut options = Options::default();
        options.stanza = Some("main".to_owned());
        options.compress_type = CompressType::Lz4;
        options.bundle_limit = 2 << 20;
        let snapshot = options.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: OptionSnapshot = serde_json::from_str(&json).unwrap();
        let restored = back.into_options().unwrap();
        assert_eq!(restored.stanza.as_deref(), Some("main"));
        assert_eq!(restored.compress_type, CompressType::Lz4);
        assert_eq!(restored.bundle_limit, 2 << 20);
    }
}
