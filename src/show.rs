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

//! The `info` command: render per-stanza repository state.

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::Options;
use crate::repo::Repo;
use crate::repocmd::OutputFormat;
use crate::storage::Storage;
use crate::transport::open_transport;
use crate::{Result, REPO_BACKUP};

/// Status codes shown per stanza.
const STATUS_OK: (u8, &str) = (0, "ok");
const STATUS_MISSING_DATA: (u8, &str) = (1, "missing stanza data");
const STATUS_NO_BACKUP: (u8, &str) = (2, "no valid backups");

#[derive(Debug, Serialize)]
pub struct StanzaInfo {
    pub name: String,
    pub status_code: u8,
    pub status: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub archive_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub backups: Vec<BackupSummary>,
}

#[derive(Debug, Serialize)]
pub struct BackupSummary {
    pub label: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub timestamp_start: i64,
    pub timestamp_stop: i64,
    pub size: u64,
    pub repo_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_stop: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

/// Gather the report data for one or all stanzas.
pub fn gather(options: &Options) -> Result<Vec<StanzaInfo>> {
    let stanzas: Vec<String> = match &options.stanza {
        Some(stanza) => vec![stanza.clone()],
        None => {
            let storage = Storage::open(open_transport(&options.repo_path)?);
            storage.list(REPO_BACKUP)?.dirs
        }
    };

    let mut report = Vec::new();
    for stanza in stanzas {
        let mut stanza_options = options.clone();
        stanza_options.stanza = Some(stanza.clone());
        report.push(gather_stanza(&stanza_options, &stanza)?);
    }
    Ok(report)
}

fn gather_stanza(options: &Options, stanza: &str) -> Result<StanzaInfo> {
    let repo = Repo::open(options)?;
    let (archive_info, backup_info) = match (repo.load_archive_info(), repo.load_backup_info()) {
        (Ok(archive_info), Ok(backup_info)) => (archive_info, backup_info),
        _ => {
            return Ok(StanzaInfo {
                name: stanza.to_owned(),
                status_code: STATUS_MISSING_DATA.0,
                status: STATUS_MISSING_DATA.1.to_owned(),
                archive_ids: Vec::new(),
                backups: Vec::new(),
            })
        }
    };

    let backups: Vec<BackupSummary> = backup_info
        .current
        .iter()
        .map(|(label, entry)| BackupSummary {
            label: label.clone(),
            backup_type: entry.backup_type.clone(),
            timestamp_start: entry.timestamp_start,
            timestamp_stop: entry.timestamp_stop,
            size: entry.size,
            repo_size: entry.repo_size,
            archive_start: entry.archive_start.clone(),
            archive_stop: entry.archive_stop.clone(),
            error: entry.error,
        })
        .collect();

    let (status_code, status) = if backups.is_empty() {
        STATUS_NO_BACKUP
    } else {
        STATUS_OK
    };

    Ok(StanzaInfo {
        name: stanza.to_owned(),
        status_code,
        status: status.to_owned(),
        archive_ids: archive_info
            .history
            .iter()
            .map(|record| record.archive_id())
            .collect(),
        backups,
    })
}

/// Render the report for the terminal or for scripts.
pub fn render(report: &[StanzaInfo], output: OutputFormat) -> Result<String> {
    match output {
        OutputFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        OutputFormat::Text => {
            let mut out = String::new();
            for stanza in report {
                out.push_str(&format!(
                    "stanza: {}\n    status: {} ({})\n",
                    stanza.name, stanza.status_code, stanza.status
                ));
                if !stanza.archive_ids.is_empty() {
                    out.push_str(&format!(
                        "    archive: {}\n",
                        stanza.archive_ids.join(", ")
                    ));
                }
                for backup in &stanza.backups {
                    out.push_str(&format!(
                        "\n    {} backup: {}\n        started: {}, stopped: {}\n        \
                         size: {}, repo size: {}\n",
                        backup.backup_type,
                        backup.label,
                        format_timestamp(backup.timestamp_start),
                        format_timestamp(backup.timestamp_stop),
                        backup.size,
                        backup.repo_size,
                    ));
                    if let (Some(start), Some(stop)) =
                        (&backup.archive_start, &backup.archive_stop)
                    {
                        out.push_str(&format!("        wal: {start} / {stop}\n"));
                    }
                    if backup.error {
                        out.push_str("        error: page checksum errors recorded\n");
                    }
                }
                out.push('\n');
            }
            Ok(out)
        }
    }
}

fn format_timestamp(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_else(|| timestamp.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backup::{backup, BackupOptions};
    use crate::test_fixtures::ScratchRepo;

    #[test]
    fn fresh_stanza_has_no_backups() {
        let fixture = ScratchRepo::new();
        let report = gather(fixture.options()).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].name, "main");
        assert_eq!(report[0].status_code, 2);
        assert_eq!(report[0].archive_ids, ["15-1"]);
    }

    #[test]
    fn backed_up_stanza_reports_ok() {
        let fixture = ScratchRepo::new();
        fixture.make_cluster_files();
        let label = backup(fixture.options(), &BackupOptions::default()).unwrap();

        let report = gather(fixture.options()).unwrap();
        assert_eq!(report[0].status_code, 0);
        assert_eq!(report[0].backups.len(), 1);
        assert_eq!(report[0].backups[0].label, label.as_str());

        let text = render(&report, OutputFormat::Text).unwrap();
        assert!(text.contains("stanza: main"));
        assert!(text.contains("full backup"));

        let json = render(&report, OutputFormat::Json).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed[0]["name"], "main");
        assert_eq!(parsed[0]["status_code"], 0);
    }

    #[test]
    fn all_stanzas_listed_without_stanza_option() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.stanza = None;
        let report = gather(&options).unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].name, "main");
    }

    #[test]
    fn unknown_stanza_reports_missing_data() {
        let fixture = ScratchRepo::new();
        let mut options = fixture.options().clone();
        options.stanza = Some("ghost".to_owned());
        let report = gather(&options).unwrap();
        assert_eq!(report[0].status_code, 1);
    }
}
