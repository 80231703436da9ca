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

//! Repository access tunnelled to another host.
//!
//! The client spawns `bulwark remote` on the far side over ssh and speaks
//! the line protocol across the pipes; every transport operation maps to
//! one request. The far side roots a local transport at the repo path sent
//! in the configuration prelude, so the same binary serves both roles.

use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde_json::{json, Value};
use url::Url;

use super::local::LocalTransport;
use super::{
    Error, ErrorKind, Feature, Kind, ListDir, Metadata, Result, Transport, WriteMode, WriteSink,
};
use crate::config::Options;
use crate::protocol::{decode_bin, encode_bin, param_str, param_u64, ProtocolClient};
use crate::spawn::spawn_remote;

pub struct RemoteTransport {
    client: Arc<Mutex<ProtocolClient>>,
    /// Path prefix below the remote repo root; empty at the root.
    prefix: String,
    url: Url,
}

impl std::fmt::Debug for RemoteTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTransport")
            .field("url", &self.url.as_str())
            .finish()
    }
}

fn remote_error(path: &str, err: crate::Error) -> Error {
    // Worker errors carrying a not-found code map back onto the transport
    // error model so callers keep their missing-optional handling.
    match &err {
        crate::Error::Remote { code: 38, .. } => Error::new(ErrorKind::NotFound, path),
        crate::Error::Remote { code: 45, .. } => Error::new(ErrorKind::AlreadyExists, path),
        _ => Error::other(path, err),
    }
}

impl RemoteTransport {
    /// Connect to `ssh://[user@]host/path`.
    pub fn connect(url: &Url) -> Result<Arc<RemoteTransport>> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::Other, "ssh URL has no host"))?;
        let user = if url.username().is_empty() {
            None
        } else {
            Some(url.username())
        };
        let options = Options {
            repo_path: url.path().to_owned(),
            ..Options::default()
        };
        let client = spawn_remote(host, user, &options)
            .map_err(|err| Error::other(url.as_str(), err))?;
        Ok(Arc::new(RemoteTransport {
            client: Arc::new(Mutex::new(client)),
            prefix: String::new(),
            url: url.clone(),
        }))
    }

    fn remote_path(&self, relpath: &str) -> String {
        let relpath = relpath.trim_matches('/');
        match (self.prefix.is_empty(), relpath.is_empty()) {
            (true, _) => relpath.to_owned(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{relpath}", self.prefix),
        }
    }

    fn call(&self, cmd: &str, parameter: Vec<Value>, path: &str) -> Result<Value> {
        self.client
            .lock()
            .expect("remote client lock")
            .call(cmd, parameter)
            .map_err(|err| remote_error(path, err))
    }
}

impl Transport for RemoteTransport {
    fn features(&self) -> &'static [Feature] {
        // The far side is a POSIX filesystem.
        &[
            Feature::Path,
            Feature::Hardlink,
            Feature::InfoDetail,
            Feature::Symlink,
        ]
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn list_dir(&self, relpath: &str) -> Result<ListDir> {
        let path = self.remote_path(relpath);
        let out = self.call("storage-list", vec![json!(path)], &path)?;
        Ok(ListDir {
            files: serde_json::from_value(out["files"].clone())
                .map_err(|err| Error::other(&path, err))?,
            dirs: serde_json::from_value(out["dirs"].clone())
                .map_err(|err| Error::other(&path, err))?,
        })
    }

    fn read_file(&self, relpath: &str) -> Result<Bytes> {
        let path = self.remote_path(relpath);
        let out = self.call("storage-read", vec![json!(path)], &path)?;
        decode_bin(&out)
            .map(Bytes::from)
            .map_err(|err| Error::other(&path, err))
    }

    fn open_read(
        &self,
        relpath: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Box<dyn Read + Send>> {
        let path = self.remote_path(relpath);
        let out = self.call(
            "storage-read-range",
            vec![json!(path), json!(offset), json!(limit)],
            &path,
        )?;
        let content = decode_bin(&out).map_err(|err| Error::other(&path, err))?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn write_file(&self, relpath: &str, content: &[u8], mode: WriteMode) -> Result<()> {
        let path = self.remote_path(relpath);
        let cmd = match mode {
            WriteMode::Atomic => "storage-write",
            WriteMode::CreateNew => "storage-write-new",
        };
        self.call(cmd, vec![json!(path), encode_bin(content)], &path)?;
        Ok(())
    }

    fn open_write(&self, relpath: &str) -> Result<Box<dyn WriteSink>> {
        let transport = RemoteTransport {
            client: self.client.clone(),
            prefix: self.prefix.clone(),
            url: self.url.clone(),
        };
        let relpath_owned = relpath.to_owned();
        Ok(Box::new(RemoteSink {
            buffer: Vec::new(),
            transport,
            relpath: relpath_owned,
        }))
    }

    fn metadata(&self, relpath: &str) -> Result<Metadata> {
        let path = self.remote_path(relpath);
        let out = self.call("storage-metadata", vec![json!(path)], &path)?;
        Ok(Metadata {
            len: out["len"].as_u64().unwrap_or(0),
            kind: match out["kind"].as_str() {
                Some("dir") => Kind::Dir,
                Some("symlink") => Kind::Symlink,
                Some("file") => Kind::File,
                _ => Kind::Unknown,
            },
            modified: out["modified"]
                .as_i64()
                .and_then(|secs| time::OffsetDateTime::from_unix_timestamp(secs).ok()),
            mode: out["mode"].as_u64().map(|mode| mode as u32),
            user: out["user"].as_str().map(str::to_owned),
            group: out["group"].as_str().map(str::to_owned),
        })
    }

    fn create_dir(&self, relpath: &str) -> Result<()> {
        let path = self.remote_path(relpath);
        self.call("storage-create-dir", vec![json!(path)], &path)?;
        Ok(())
    }

    fn remove_file(&self, relpath: &str) -> Result<()> {
        let path = self.remote_path(relpath);
        self.call("storage-remove", vec![json!(path)], &path)?;
        Ok(())
    }

    fn remove_dir_all(&self, relpath: &str) -> Result<()> {
        let path = self.remote_path(relpath);
        self.call("storage-remove-all", vec![json!(path)], &path)?;
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.remote_path(from);
        let to_path = self.remote_path(to);
        self.call(
            "storage-rename",
            vec![json!(from_path), json!(to_path)],
            &from_path,
        )?;
        Ok(())
    }

    fn chdir(&self, relpath: &str) -> Arc<dyn Transport> {
        let mut url = self.url.clone();
        let joined = format!("{}/{relpath}", url.path().trim_end_matches('/'));
        url.set_path(&joined);
        Arc::new(RemoteTransport {
            client: self.client.clone(),
            prefix: self.remote_path(relpath),
            url,
        })
    }
}

/// Buffers locally and ships on commit; the far side's atomic write keeps
/// partial files invisible.
struct RemoteSink {
    buffer: Vec<u8>,
    transport: RemoteTransport,
    relpath: String,
}

impl std::io::Write for RemoteSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl WriteSink for RemoteSink {
    fn commit(self: Box<Self>) -> Result<()> {
        self.transport
            .write_file(&self.relpath, &self.buffer, WriteMode::Atomic)
    }
}

/// Server-side dispatch for the `remote` role: storage operations rooted at
/// the repo path from the configuration prelude.
pub fn dispatch(cmd: &str, params: &[Value], options: &Options) -> crate::Result<Value> {
    let root = LocalTransport::new(std::path::Path::new(&options.repo_path));
    match cmd {
        "storage-list" => {
            let list = root.list_dir(param_str(params, 0)?)?;
            Ok(json!({"files": list.files, "dirs": list.dirs}))
        }
        "storage-read" => {
            let content = root.read_file(param_str(params, 0)?)?;
            Ok(encode_bin(&content))
        }
        "storage-read-range" => {
            let path = param_str(params, 0)?;
            let offset = param_u64(params, 1)?;
            let limit = params.get(2).and_then(Value::as_u64);
            let mut reader = root.open_read(path, offset, limit)?;
            let mut content = Vec::new();
            reader
                .read_to_end(&mut content)
                .map_err(|err| crate::Error::FileRead {
                    path: path.into(),
                    source: err,
                })?;
            Ok(encode_bin(&content))
        }
        "storage-write" => {
            let content = decode_bin(params.get(1).unwrap_or(&Value::Null))?;
            root.write_file(param_str(params, 0)?, &content, WriteMode::Atomic)?;
            Ok(Value::Bool(true))
        }
        "storage-write-new" => {
            let content = decode_bin(params.get(1).unwrap_or(&Value::Null))?;
            root.write_file(param_str(params, 0)?, &content, WriteMode::CreateNew)?;
            Ok(Value::Bool(true))
        }
        "storage-metadata" => {
            let metadata = root.metadata(param_str(params, 0)?)?;
            Ok(json!({
                "len": metadata.len,
                "kind": match metadata.kind {
                    Kind::File => "file",
                    Kind::Dir => "dir",
                    Kind::Symlink => "symlink",
                    Kind::Unknown => "unknown",
                },
                "modified": metadata.modified.map(|dt| dt.unix_timestamp()),
                "mode": metadata.mode,
                "user": metadata.user,
                "group": metadata.group,
            }))
        }
        "storage-create-dir" => {
            root.create_dir(param_str(params, 0)?)?;
            Ok(Value::Bool(true))
        }
        "storage-remove" => {
            root.remove_file(param_str(params, 0)?)?;
            Ok(Value::Bool(true))
        }
        "storage-remove-all" => {
            root.remove_dir_all(param_str(params, 0)?)?;
            Ok(Value::Bool(true))
        }
        "storage-rename" => {
            root.rename(param_str(params, 0)?, param_str(params, 1)?)?;
            Ok(Value::Bool(true))
        }
        other => Err(crate::Error::Protocol(format!(
            "unknown storage command '{other}'"
        ))),
    }
}
