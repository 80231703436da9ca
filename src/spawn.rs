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

//! Worker process fan-out.
//!
//! Workers run the same binary with a role-suffixed command
//! (`archive-push:local`, `remote`, ...). Local workers and remote servers
//! get their configuration over the protocol prelude; the detached async
//! daemon gets it through the environment since it owns no pipe back to
//! its parent.

use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::config::Options;
use crate::protocol::ProtocolClient;
use crate::{Error, Result};

/// The binary to run for workers: normally this executable, overridable
/// with `BULWARK_EXEC` (needed when the parent is not the CLI, e.g. a test
/// harness).
fn current_exe() -> Result<std::path::PathBuf> {
    if let Ok(exec) = std::env::var("BULWARK_EXEC") {
        return Ok(std::path::PathBuf::from(exec));
    }
    std::env::current_exe().map_err(|source| Error::FileOpen {
        path: "current executable".into(),
        source,
    })
}

/// Spawn one local worker running `<command>:local` with piped stdio and
/// send it the configuration prelude.
pub fn spawn_local_worker(command: &str, options: &Options) -> Result<ProtocolClient> {
    let exe = current_exe()?;
    let child = Command::new(&exe)
        .arg(format!("{command}:local"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| Error::FileOpen {
            path: exe.clone(),
            source,
        })?;
    debug!(pid = child.id(), command, "spawned local worker");
    ProtocolClient::start(child, options)
}

/// Spawn a pool of identical local workers.
pub fn spawn_local_pool(
    command: &str,
    options: &Options,
    count: usize,
) -> Result<Vec<ProtocolClient>> {
    (0..count.max(1))
        .map(|_| spawn_local_worker(command, options))
        .collect()
}

/// Spawn a protocol server on a remote host over ssh, running the same
/// binary there with the `remote` role.
pub fn spawn_remote(host: &str, user: Option<&str>, options: &Options) -> Result<ProtocolClient> {
    let target = match user {
        Some(user) => format!("{user}@{host}"),
        None => host.to_owned(),
    };
    let child = Command::new("ssh")
        .args(["-o", "BatchMode=yes", "-o", "Compression=no"])
        .arg(&target)
        .args(["bulwark", "remote"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| Error::HostConnect {
            host: target.clone(),
            reason: source.to_string(),
        })?;
    debug!(pid = child.id(), host = %target, "spawned remote server");
    ProtocolClient::start(child, options)
}

/// Spawn the detached async daemon for `<command>:async`.
///
/// The child is not waited on; it acquires the stanza lock itself and the
/// parent only watches the spool for status files.
pub fn spawn_async_daemon(command: &str, options: &Options) -> Result<u32> {
    spawn_async(command, None, options)
}

/// Async daemon variant carrying one positional argument (the archive-get
/// prefetch base segment).
pub fn spawn_async_daemon_with_arg(command: &str, arg: &str, options: &Options) -> Result<u32> {
    spawn_async(command, Some(arg), options)
}

fn spawn_async(command: &str, arg: Option<&str>, options: &Options) -> Result<u32> {
    let exe = current_exe()?;
    let mut builder = Command::new(&exe);
    builder.arg(format!("{command}:async"));
    if let Some(arg) = arg {
        builder.arg(arg);
    }
    let child: Child = builder
        .envs(options.to_env())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| Error::FileOpen {
            path: exe.clone(),
            source,
        })?;
    let pid = child.id();
    debug!(pid, command, "spawned async daemon");
    // Not waited on; the parent only watches the spool for status files.
    std::mem::forget(child);
    Ok(pid)
}
