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

//! Backup set labels.
//!
//! A full backup is labelled `YYYYMMDD-HHMMSSF`; differential and
//! incremental backups append their own timestamp to the label of the full
//! they chain from: `YYYYMMDD-HHMMSSF_YYYYMMDD-HHMMSS{D|I}`. Lexicographic
//! order of labels is creation order within a stanza.

use std::fmt;
use std::str::FromStr;

use time::OffsetDateTime;

use crate::{Error, Result, LABEL_TIMESTAMP_FORMAT};

/// Backup set type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupType {
    #[default]
    Full,
    Diff,
    Incr,
}

impl BackupType {
    fn suffix(&self) -> char {
        match self {
            BackupType::Full => 'F',
            BackupType::Diff => 'D',
            BackupType::Incr => 'I',
        }
    }

    pub fn from_option(name: &str) -> Result<BackupType> {
        match name {
            "full" => Ok(BackupType::Full),
            "diff" => Ok(BackupType::Diff),
            "incr" => Ok(BackupType::Incr),
            other => Err(Error::OptionInvalid(format!(
                "'{other}' is not a valid backup type"
            ))),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupType::Full => "full",
            BackupType::Diff => "diff",
            BackupType::Incr => "incr",
        };
        f.write_str(name)
    }
}

/// A backup set label.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackupLabel(String);

impl BackupLabel {
    /// Build the label for a new backup started at `timestamp`.
    ///
    /// Dependent backups name the full backup at the root of their chain,
    /// found by truncating the prior label to its full part.
    pub fn new(
        backup_type: BackupType,
        prior: Option<&BackupLabel>,
        timestamp: OffsetDateTime,
    ) -> Result<BackupLabel> {
        let stamp = timestamp
            .format(LABEL_TIMESTAMP_FORMAT)
            .map_err(|err| Error::Format(format!("format label timestamp: {err}")))?;
        match backup_type {
            BackupType::Full => Ok(BackupLabel(format!("{stamp}F"))),
            BackupType::Diff | BackupType::Incr => {
                let prior = prior.ok_or_else(|| {
                    Error::Assert("dependent backup requires a prior label".into())
                })?;
                Ok(BackupLabel(format!(
                    "{}_{stamp}{}",
                    prior.full_part(),
                    backup_type.suffix()
                )))
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn backup_type(&self) -> BackupType {
        match self.0.chars().last() {
            Some('D') => BackupType::Diff,
            Some('I') => BackupType::Incr,
            _ => BackupType::Full,
        }
    }

    /// The full-backup part of the label: the whole label for a full, the
    /// prefix before `_` otherwise.
    pub fn full_part(&self) -> &str {
        match self.0.split_once('_') {
            Some((full, _)) => full,
            None => &self.0,
        }
    }

    pub fn is_valid(label: &str) -> bool {
        fn stamp_ok(stamp: &[u8]) -> bool {
            stamp.len() == 15
                && stamp[8] == b'-'
                && stamp[..8].iter().all(u8::is_ascii_digit)
                && stamp[9..].iter().all(u8::is_ascii_digit)
        }
        if !label.is_ascii() {
            return false;
        }
        match label.split_once('_') {
            None => {
                label.len() == 16 && label.ends_with('F') && stamp_ok(&label.as_bytes()[..15])
            }
            Some((full, dep)) => {
                full.len() == 16
                    && full.ends_with('F')
                    && stamp_ok(&full.as_bytes()[..15])
                    && dep.len() == 16
                    && (dep.ends_with('D') || dep.ends_with('I'))
                    && stamp_ok(&dep.as_bytes()[..15])
            }
        }
    }
}

impl fmt::Display for BackupLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BackupLabel {
    type Err = Error;

    fn from_str(label: &str) -> Result<BackupLabel> {
        if !BackupLabel::is_valid(label) {
            return Err(Error::Format(format!("'{label}' is not a backup label")));
        }
        Ok(BackupLabel(label.to_owned()))
    }
}
