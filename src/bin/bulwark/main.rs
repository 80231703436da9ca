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

//! Command-line entry point.
//!
//! Dispatches the command, establishes logging, resolves options, runs,
//! and turns the outcome into the documented exit code. Role-suffixed
//! commands (`:local`, `:async`, `remote`) are the internal faces of the
//! same binary: local workers and remote servers read their configuration
//! from the protocol prelude, async daemons from the environment.

use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use bulwark::config::Options;
use bulwark::label::BackupType;
use bulwark::repocmd::OutputFormat;
use bulwark::{
    archive_get, archive_push, backup, check, control, expire, protocol, repocmd, restore, show,
    stanza, transport, verify, Error,
};

mod log;

#[derive(Debug, Parser)]
#[command(
    name = "bulwark",
    about = "Reliable backup and restore for PostgreSQL clusters",
    author,
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Config file path.
    #[arg(long, global = true, env = "BULWARK_CONFIG")]
    config: Option<PathBuf>,

    /// Stanza (one per source cluster).
    #[arg(long, global = true)]
    stanza: Option<String>,

    /// Repository path or URL (s3://, azure://, gcs://, ssh://).
    #[arg(long, global = true)]
    repo_path: Option<String>,

    /// PostgreSQL data directory.
    #[arg(long, global = true)]
    pg_path: Option<PathBuf>,

    #[arg(long, global = true)]
    spool_path: Option<PathBuf>,

    #[arg(long, global = true)]
    lock_path: Option<PathBuf>,

    /// Worker processes for parallel commands.
    #[arg(long, global = true)]
    process_max: Option<usize>,

    /// none, gz, or lz4.
    #[arg(long, global = true)]
    compress_type: Option<String>,

    #[arg(long, global = true)]
    compress_level: Option<u32>,

    /// none or aes-256-cbc.
    #[arg(long, global = true)]
    cipher_type: Option<String>,

    #[arg(long, global = true, env = "BULWARK_CIPHER_PASS", hide_env_values = true)]
    cipher_pass: Option<String>,

    /// Queue WAL in the spool and archive in batches.
    #[arg(long, global = true)]
    archive_async: bool,

    /// How long the archive hook waits on the async daemon (e.g. 60s).
    #[arg(long, global = true)]
    archive_timeout: Option<String>,

    #[arg(long, global = true)]
    archive_get_queue_max: Option<usize>,

    /// Full backups to retain.
    #[arg(long, global = true)]
    repo_retention_full: Option<u32>,

    /// Differential backups to retain.
    #[arg(long, global = true)]
    repo_retention_diff: Option<u32>,

    /// Cluster WAL segment size (e.g. 16M).
    #[arg(long, global = true)]
    wal_segment_size: Option<String>,

    /// Bundle files smaller than this into shared objects (e.g. 2M).
    #[arg(long, global = true)]
    bundle_limit: Option<String>,

    /// Verify data page checksums during backup.
    #[arg(long, global = true)]
    checksum_page: bool,

    /// Set the log level to trace.
    #[arg(long, short = 'D', global = true)]
    debug: bool,

    /// Path to the output log file.
    #[arg(long, short = 'L', global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Archive one WAL segment (PostgreSQL archive_command).
    ArchivePush {
        /// Segment path as passed by the server (%p).
        wal_path: PathBuf,
    },
    #[command(name = "archive-push:async", hide = true)]
    ArchivePushAsync,
    #[command(name = "archive-push:local", hide = true)]
    ArchivePushLocal,

    /// Fetch one WAL segment (PostgreSQL restore_command).
    ArchiveGet {
        /// Segment name as passed by the server (%f).
        wal_name: String,
        /// Destination path as passed by the server (%p).
        destination: PathBuf,
    },
    #[command(name = "archive-get:async", hide = true)]
    ArchiveGetAsync { wal_name: String },
    #[command(name = "archive-get:local", hide = true)]
    ArchiveGetLocal,

    /// Back up the cluster.
    Backup {
        /// full, diff, or incr.
        #[arg(long = "type", default_value = "incr")]
        backup_type: String,
    },
    #[command(name = "backup:local", hide = true)]
    BackupLocal,

    /// Restore the cluster from a backup.
    Restore {
        /// Backup set label; the most recent when omitted.
        #[arg(long)]
        set: Option<String>,
        /// Restore into a non-empty data directory.
        #[arg(long)]
        force: bool,
    },
    #[command(name = "restore:local", hide = true)]
    RestoreLocal,

    /// Remove backups and archive per the retention policy.
    Expire,

    /// Show repository and backup state.
    Info {
        /// text or json.
        #[arg(long, default_value = "text")]
        output: String,
    },

    /// Validate that archiving and backups can work.
    Check,

    /// Re-verify checksums of everything stored.
    Verify,

    /// Create the stanza registries.
    StanzaCreate,
    /// Record a cluster upgrade in the registries.
    StanzaUpgrade,
    /// Remove the stanza (requires stop).
    StanzaDelete,

    /// List raw repository files.
    RepoLs {
        path: Option<String>,
        #[arg(long, default_value = "text")]
        output: String,
        #[arg(long)]
        recurse: bool,
    },
    /// Write a raw repository file to stdout.
    RepoGet { path: String },
    /// Store stdin as a raw repository file.
    RepoPut { path: String },
    /// Remove a raw repository file.
    RepoRm {
        path: String,
        #[arg(long)]
        recurse: bool,
    },

    /// Allow bulwark to run again.
    Start,
    /// Stop bulwark from running (fences mutating commands).
    Stop,

    /// Serve repository storage over stdio (the ssh remote end).
    Server,
    #[command(name = "remote", hide = true)]
    Remote,
}

impl Command {
    /// The base command name used for config sections and log lines.
    fn name(&self) -> &'static str {
        match self {
            Command::ArchivePush { .. }
            | Command::ArchivePushAsync
            | Command::ArchivePushLocal => "archive-push",
            Command::ArchiveGet { .. }
            | Command::ArchiveGetAsync { .. }
            | Command::ArchiveGetLocal => "archive-get",
            Command::Backup { .. } | Command::BackupLocal => "backup",
            Command::Restore { .. } | Command::RestoreLocal => "restore",
            Command::Expire => "expire",
            Command::Info { .. } => "info",
            Command::Check => "check",
            Command::Verify => "verify",
            Command::StanzaCreate => "stanza-create",
            Command::StanzaUpgrade => "stanza-upgrade",
            Command::StanzaDelete => "stanza-delete",
            Command::RepoLs { .. } => "repo-ls",
            Command::RepoGet { .. } => "repo-get",
            Command::RepoPut { .. } => "repo-put",
            Command::RepoRm { .. } => "repo-rm",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Server | Command::Remote => "server",
        }
    }

    /// Worker and server roles talk the protocol on stdio; logging must
    /// stay off stdout and the configuration comes from the prelude.
    fn is_protocol_role(&self) -> bool {
        matches!(
            self,
            Command::ArchivePushLocal
                | Command::ArchiveGetLocal
                | Command::BackupLocal
                | Command::RestoreLocal
                | Command::Server
                | Command::Remote
        )
    }
}

impl Args {
    /// Explicitly set command-line options, as (option, value) pairs for
    /// the resolver.
    fn cli_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                pairs.push((name.to_owned(), value));
            }
        };
        push("stanza", self.stanza.clone());
        push("repo-path", self.repo_path.clone());
        push(
            "pg-path",
            self.pg_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        push(
            "spool-path",
            self.spool_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        push(
            "lock-path",
            self.lock_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
        );
        push("process-max", self.process_max.map(|v| v.to_string()));
        push("compress-type", self.compress_type.clone());
        push("compress-level", self.compress_level.map(|v| v.to_string()));
        push("cipher-type", self.cipher_type.clone());
        push("cipher-pass", self.cipher_pass.clone());
        if self.archive_async {
            push("archive-async", Some("y".to_owned()));
        }
        push("archive-timeout", self.archive_timeout.clone());
        push(
            "archive-get-queue-max",
            self.archive_get_queue_max.map(|v| v.to_string()),
        );
        push(
            "repo-retention-full",
            self.repo_retention_full.map(|v| v.to_string()),
        );
        push(
            "repo-retention-diff",
            self.repo_retention_diff.map(|v| v.to_string()),
        );
        push("wal-segment-size", self.wal_segment_size.clone());
        push("bundle-limit", self.bundle_limit.clone());
        if self.checksum_page {
            push("checksum-page", Some("y".to_owned()));
        }
        pairs
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let command_name = args.command.name();

    let level = if args.debug {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    let _log_guard = match log::init(log::LoggingOptions {
        file: args.log_file.clone(),
        level,
    }) {
        Ok(guard) => guard,
        Err(message) => {
            eprintln!("bulwark: {message}");
            return ExitCode::from(70);
        }
    };

    // Protocol roles never resolve options themselves; everything arrives
    // in the configuration prelude.
    if args.command.is_protocol_role() {
        return match run_protocol_role(&args.command) {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                error!("{err}");
                ExitCode::from(err.code())
            }
        };
    }

    let options = match Options::resolve(command_name, args.config.as_deref(), &args.cli_pairs())
    {
        Ok(options) => options,
        Err(err) => {
            error!("{err}");
            return ExitCode::from(err.code());
        }
    };

    info!("{command_name} command begin");
    let started = Instant::now();
    let result = run(&args.command, &options);
    let elapsed_ms = started.elapsed().as_millis();

    match result {
        Ok(code) => {
            info!("{command_name} command end: completed successfully ({elapsed_ms}ms)");
            ExitCode::from(code)
        }
        Err(err) => {
            if err.is_user_error() {
                error!("{err}");
            } else {
                error!("[{}] {err}", err.code());
                tracing::debug!("{err:?}");
            }
            info!(
                "{command_name} command end: aborted with exception [{}]",
                err.code()
            );
            ExitCode::from(err.code())
        }
    }
}

/// Run one user-facing command; the returned code is the process exit code.
fn run(command: &Command, options: &Options) -> Result<u8, Error> {
    match command {
        Command::ArchivePush { wal_path } => {
            archive_push::archive_push(
                options,
                wal_path,
                archive_push::ArchivePushOptions::default(),
            )?;
            Ok(0)
        }
        Command::ArchivePushAsync => {
            archive_push::archive_push_async(options)?;
            Ok(0)
        }
        Command::ArchiveGet {
            wal_name,
            destination,
        } => {
            match archive_get::archive_get(
                options,
                wal_name,
                destination,
                archive_get::ArchiveGetOptions::default(),
            )? {
                archive_get::ArchiveGetResult::Found => Ok(bulwark::EXIT_SUCCESS),
                archive_get::ArchiveGetResult::NotFound => Ok(bulwark::EXIT_NOT_FOUND),
            }
        }
        Command::ArchiveGetAsync { wal_name } => {
            archive_get::archive_get_async(options, wal_name)?;
            Ok(0)
        }
        Command::Backup { backup_type } => {
            let backup_type = BackupType::from_option(backup_type)?;
            backup::backup(options, &backup::BackupOptions { backup_type })?;
            Ok(0)
        }
        Command::Restore { set, force } => {
            restore::restore(
                options,
                &restore::RestoreOptions {
                    set: set.clone(),
                    force: *force,
                },
            )?;
            Ok(0)
        }
        Command::Expire => {
            expire::expire(options, expire::ExpireOptions::default())?;
            Ok(0)
        }
        Command::Info { output } => {
            let report = show::gather(options)?;
            let rendered = show::render(&report, OutputFormat::from_option(output)?)?;
            println!("{rendered}");
            Ok(0)
        }
        Command::Check => {
            check::check(options)?;
            Ok(0)
        }
        Command::Verify => {
            let report = verify::verify(options, verify::VerifyOptions::default())?;
            if report.is_ok() {
                Ok(0)
            } else {
                Err(Error::ChecksumMismatch {
                    path: format!("{} problems found", report.errors.len()),
                    expected: "clean verify".into(),
                    actual: "see log".into(),
                })
            }
        }
        Command::StanzaCreate => {
            let db = stanza::cluster_info(&options.pg_path)?;
            stanza::stanza_create(options, &db)?;
            Ok(0)
        }
        Command::StanzaUpgrade => {
            let db = stanza::cluster_info(&options.pg_path)?;
            stanza::stanza_upgrade(options, &db)?;
            Ok(0)
        }
        Command::StanzaDelete => {
            stanza::stanza_delete(options)?;
            Ok(0)
        }
        Command::RepoLs {
            path,
            output,
            recurse,
        } => {
            let listing = repocmd::repo_ls(
                options,
                path.as_deref().unwrap_or(""),
                OutputFormat::from_option(output)?,
                *recurse,
            )?;
            println!("{listing}");
            Ok(0)
        }
        Command::RepoGet { path } => {
            repocmd::repo_get(options, path, std::io::stdout().lock())?;
            Ok(0)
        }
        Command::RepoPut { path } => {
            let mut content = Vec::new();
            std::io::stdin()
                .lock()
                .read_to_end(&mut content)
                .map_err(|source| Error::FileRead {
                    path: "stdin".into(),
                    source,
                })?;
            repocmd::repo_put(options, path, &content)?;
            Ok(0)
        }
        Command::RepoRm { path, recurse } => {
            repocmd::repo_rm(options, path, *recurse)?;
            Ok(0)
        }
        Command::Start => {
            control::start(options)?;
            Ok(0)
        }
        Command::Stop => {
            control::stop(options)?;
            Ok(0)
        }
        // Handled in run_protocol_role.
        Command::ArchivePushLocal
        | Command::ArchiveGetLocal
        | Command::BackupLocal
        | Command::RestoreLocal
        | Command::Server
        | Command::Remote => unreachable!("protocol roles are dispatched earlier"),
    }
}

/// Serve one protocol role over stdio until EOF or exit.
fn run_protocol_role(command: &Command) -> Result<(), Error> {
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    let mut dispatch = |cmd: &str,
                        params: &[serde_json::Value],
                        options: &Options|
     -> Result<serde_json::Value, Error> {
        match command {
            Command::ArchivePushLocal => archive_push::worker_dispatch(cmd, params, options),
            Command::ArchiveGetLocal => archive_get::worker_dispatch(cmd, params, options),
            Command::BackupLocal => backup::worker_dispatch(cmd, params, options),
            Command::RestoreLocal => restore::worker_dispatch(cmd, params, options),
            Command::Server | Command::Remote => transport::remote::dispatch(cmd, params, options),
            _ => unreachable!("not a protocol role"),
        }
    };
    protocol::serve(stdin, stdout, &mut dispatch)
}
