// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! Logging setup for the command-line entry point.
//!
//! Messages go to stderr (stdout belongs to repo-get and the protocol
//! roles), with an optional file layer. The guard must stay alive for the
//! process lifetime so the appender flushes on exit.

use std::path::PathBuf;

use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

pub struct LoggingOptions {
    pub file: Option<PathBuf>,
    pub level: tracing::Level,
}

pub struct LogGuard {
    _worker_guard: Option<WorkerGuard>,
}

pub fn init(options: LoggingOptions) -> Result<LogGuard, String> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(options.level).into())
        .from_env_lossy();

    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let (file_layer, worker_guard) = match &options.file {
        None => (None, None),
        Some(path) => {
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let name = path.file_name().ok_or("log file has no name")?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(LevelFilter::from(options.level));
            (Some(layer), Some(guard))
        }
    };

    Registry::default()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|err| format!("install tracing subscriber: {err}"))?;

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}
