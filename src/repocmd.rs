// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! Operator-level repository file commands: `repo-ls`, `repo-get`,
//! `repo-put`, `repo-rm`.
//!
//! These act on raw stored bytes (no decompression or decryption); they
//! exist for inspection and surgery, not for restores.

use std::io::Write;

use serde_json::json;

use crate::config::Options;
use crate::storage::Storage;
use crate::transport::open_transport;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_option(name: &str) -> Result<OutputFormat> {
        match name {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(Error::OptionInvalid(format!(
                "'{other}' is not a valid output format"
            ))),
        }
    }
}

fn repo_storage(options: &Options) -> Result<Storage> {
    Ok(Storage::open(open_transport(&options.repo_path)?))
}

/// List a repository path, one name per line (directories suffixed `/`),
/// or as a JSON array.
pub fn repo_ls(
    options: &Options,
    path: &str,
    output: OutputFormat,
    recurse: bool,
) -> Result<String> {
    let storage = repo_storage(options)?;
    let names: Vec<String> = if recurse {
        storage.walk(path)?
    } else {
        let list = storage.list(path)?;
        list.dirs
            .iter()
            .map(|dir| format!("{dir}/"))
            .chain(list.files.iter().cloned())
            .collect()
    };
    match output {
        OutputFormat::Text => Ok(names.join("\n")),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&json!(names))?),
    }
}

/// Copy a stored file's raw bytes to the given writer.
pub fn repo_get(options: &Options, path: &str, mut to: impl Write) -> Result<()> {
    let storage = repo_storage(options)?;
    let content = storage.read(path)?;
    to.write_all(&content).map_err(|source| Error::FileWrite {
        path: "stdout".into(),
        source,
    })
}

/// Store raw bytes at a repository path, atomically.
pub fn repo_put(options: &Options, path: &str, content: &[u8]) -> Result<()> {
    let storage = repo_storage(options)?;
    if let Some((dir, _)) = path.rsplit_once('/') {
        storage.path_create(dir, true)?;
    }
    storage.write(path, content)
}

/// Remove a stored file, or a whole tree with `recurse`.
pub fn repo_rm(options: &Options, path: &str, recurse: bool) -> Result<()> {
    let storage = repo_storage(options)?;
    if recurse {
        storage.path_remove(path)
    } else {
        storage.remove(path, true)
    }
}
