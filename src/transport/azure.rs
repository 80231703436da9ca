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

//! Access to a repository in Azure Blob Storage.
//!
//! The account comes from `AZURE_STORAGE_ACCOUNT` with either
//! `AZURE_STORAGE_KEY` (shared key) or `AZURE_STORAGE_SAS_TOKEN` (SAS)
//! auth. Uploads above the block threshold go as a staged block list, so
//! one request never carries the whole object.

use std::io::{Cursor, Read};
use std::sync::Arc;

use azure_storage::StorageCredentials;
use azure_storage_blobs::blob::{BlobBlockType, BlockList};
use azure_storage_blobs::prelude::*;
use bytes::Bytes;
use futures::StreamExt;
use tokio::runtime::Runtime;
use tracing::{debug, trace};
use url::Url;

use super::{
    BufferedSink, Error, ErrorKind, Feature, Kind, ListDir, Metadata, Result, RetryPolicy,
    Transport, WriteMode, WriteSink,
};

/// Upload in staged blocks above this size.
const BLOCK_SIZE: usize = 4 * 1024 * 1024;

pub struct AzureTransport {
    runtime: Arc<Runtime>,
    container: ContainerClient,
    /// Blob name prefix, without leading or trailing slash; possibly empty.
    prefix: String,
    url: Url,
    retry: RetryPolicy,
}

impl std::fmt::Debug for AzureTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTransport")
            .field("url", &self.url.as_str())
            .finish()
    }
}

fn azure_error(path: &str, err: azure_core::Error) -> Error {
    use azure_core::StatusCode;
    match err.as_http_error().map(|http| http.status()) {
        Some(StatusCode::NotFound) => Error::new(ErrorKind::NotFound, path),
        Some(StatusCode::Conflict) => Error::new(ErrorKind::AlreadyExists, path),
        Some(StatusCode::Forbidden) | Some(StatusCode::Unauthorized) => {
            Error::new(ErrorKind::PermissionDenied, path)
        }
        _ => Error::other(path, err),
    }
}

impl AzureTransport {
    pub fn new(url: &Url) -> Result<Arc<AzureTransport>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::io_error(std::path::Path::new(""), err))?;
        let account = std::env::var("AZURE_STORAGE_ACCOUNT")
            .map_err(|_| Error::new(ErrorKind::Other, "AZURE_STORAGE_ACCOUNT is not set"))?;
        let credentials = if let Ok(key) = std::env::var("AZURE_STORAGE_KEY") {
            StorageCredentials::access_key(account.clone(), key)
        } else if let Ok(sas) = std::env::var("AZURE_STORAGE_SAS_TOKEN") {
            StorageCredentials::sas_token(sas)
                .map_err(|err| Error::other("AZURE_STORAGE_SAS_TOKEN", err))?
        } else {
            return Err(Error::new(
                ErrorKind::Other,
                "neither AZURE_STORAGE_KEY nor AZURE_STORAGE_SAS_TOKEN is set",
            ));
        };
        let container_name = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::Other, "Azure URL has no container"))?;
        let container =
            BlobServiceClient::new(account, credentials).container_client(container_name);
        let prefix = url.path().trim_matches('/').to_owned();
        debug!(container = container_name, %prefix, "opened Azure transport");
        Ok(Arc::new(AzureTransport {
            runtime: Arc::new(runtime),
            container,
            prefix,
            url: url.clone(),
            retry: RetryPolicy::default(),
        }))
    }

    fn blob_name(&self, relpath: &str) -> String {
        let relpath = relpath.trim_matches('/');
        match (self.prefix.is_empty(), relpath.is_empty()) {
            (true, _) => relpath.to_owned(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{relpath}", self.prefix),
        }
    }

    fn dir_prefix(&self, relpath: &str) -> String {
        let name = self.blob_name(relpath);
        if name.is_empty() {
            name
        } else {
            format!("{name}/")
        }
    }

    fn retriable(err: &Error) -> bool {
        err.kind() == ErrorKind::Other
    }

    fn put_bytes(&self, relpath: &str, content: Vec<u8>) -> Result<()> {
        let name = self.blob_name(relpath);
        let blob = self.container.blob_client(&name);
        trace!(name = %name, len = content.len(), "Azure put");
        self.retry.run(
            || {
                self.runtime.block_on(async {
                    if content.len() <= BLOCK_SIZE {
                        blob.put_block_blob(content.clone())
                            .await
                            .map_err(|err| azure_error(&name, err))?;
                        return Ok(());
                    }
                    // Multi-block upload: stage then commit the block list.
                    let mut blocks = Vec::new();
                    for (index, chunk) in content.chunks(BLOCK_SIZE).enumerate() {
                        let block_id = BlockId::new(format!("{index:032}"));
                        blob.put_block(block_id.clone(), chunk.to_vec())
                            .await
                            .map_err(|err| azure_error(&name, err))?;
                        blocks.push(BlobBlockType::new_uncommitted(block_id));
                    }
                    blob.put_block_list(BlockList { blocks })
                        .await
                        .map_err(|err| azure_error(&name, err))?;
                    Ok(())
                })
            },
            Self::retriable,
        )
    }

    fn clone_for_sink(&self) -> AzureTransport {
        AzureTransport {
            runtime: self.runtime.clone(),
            container: self.container.clone(),
            prefix: self.prefix.clone(),
            url: self.url.clone(),
            retry: self.retry,
        }
    }
}

impl Transport for AzureTransport {
    fn features(&self) -> &'static [Feature] {
        &[Feature::EncryptedAtRest]
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn list_dir(&self, relpath: &str) -> Result<ListDir> {
        let prefix = self.dir_prefix(relpath);
        let mut list = ListDir::default();
        self.runtime.block_on(async {
            let mut pages = self
                .container
                .list_blobs()
                .prefix(prefix.clone())
                .delimiter("/")
                .into_stream();
            while let Some(page) = pages.next().await {
                let page = page.map_err(|err| azure_error(&prefix, err))?;
                for blob in page.blobs.blobs() {
                    if let Some(name) = blob.name.strip_prefix(&prefix) {
                        if !name.is_empty() {
                            list.files.push(name.to_owned());
                        }
                    }
                }
                for dir in page.blobs.prefixes() {
                    if let Some(name) = dir
                        .name
                        .strip_prefix(&prefix)
                        .map(|n| n.trim_end_matches('/'))
                    {
                        if !name.is_empty() {
                            list.dirs.push(name.to_owned());
                        }
                    }
                }
            }
            Ok::<_, Error>(())
        })?;
        Ok(list)
    }

    fn read_file(&self, relpath: &str) -> Result<Bytes> {
        let name = self.blob_name(relpath);
        let blob = self.container.blob_client(&name);
        self.retry.run(
            || {
                self.runtime.block_on(async {
                    blob.get_content()
                        .await
                        .map(Bytes::from)
                        .map_err(|err| azure_error(&name, err))
                })
            },
            Self::retriable,
        )
    }

    fn open_read(
        &self,
        relpath: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Box<dyn Read + Send>> {
        // One fetch, then the range is served from memory; repository
        // objects are bounded by the segment size.
        let content = self.read_file(relpath)?;
        let start = (offset as usize).min(content.len());
        let end = match limit {
            Some(limit) => (start + limit as usize).min(content.len()),
            None => content.len(),
        };
        Ok(Box::new(Cursor::new(content.slice(start..end))))
    }

    fn write_file(&self, relpath: &str, content: &[u8], mode: WriteMode) -> Result<()> {
        if mode == WriteMode::CreateNew && self.is_file(relpath)? {
            return Err(Error::new(ErrorKind::AlreadyExists, relpath));
        }
        self.put_bytes(relpath, content.to_vec())
    }

    fn open_write(&self, relpath: &str) -> Result<Box<dyn WriteSink>> {
        let transport = self.clone_for_sink();
        Ok(Box::new(BufferedSink::new(
            relpath,
            Box::new(move |relpath, content| transport.put_bytes(relpath, content)),
        )))
    }

    fn metadata(&self, relpath: &str) -> Result<Metadata> {
        let name = self.blob_name(relpath);
        let blob = self.container.blob_client(&name);
        self.retry.run(
            || {
                self.runtime.block_on(async {
                    let response = blob
                        .get_properties()
                        .await
                        .map_err(|err| azure_error(&name, err))?;
                    Ok(Metadata {
                        len: response.blob.properties.content_length,
                        kind: Kind::File,
                        modified: Some(response.blob.properties.last_modified),
                        mode: None,
                        user: None,
                        group: None,
                    })
                })
            },
            Self::retriable,
        )
    }

    fn create_dir(&self, _relpath: &str) -> Result<()> {
        Ok(())
    }

    fn remove_file(&self, relpath: &str) -> Result<()> {
        let name = self.blob_name(relpath);
        let blob = self.container.blob_client(&name);
        self.retry.run(
            || {
                self.runtime.block_on(async {
                    blob.delete()
                        .await
                        .map(|_| ())
                        .map_err(|err| azure_error(&name, err))
                })
            },
            Self::retriable,
        )
    }

    fn remove_dir_all(&self, relpath: &str) -> Result<()> {
        let list = self.list_dir(relpath)?;
        for file in &list.files {
            let path = format!("{}/{file}", relpath.trim_end_matches('/'));
            self.remove_file(&path)?;
        }
        for dir in &list.dirs {
            let path = format!("{}/{dir}", relpath.trim_end_matches('/'));
            self.remove_dir_all(&path)?;
        }
        Ok(())
    }

    fn chdir(&self, relpath: &str) -> Arc<dyn Transport> {
        let mut url = self.url.clone();
        let joined = format!("{}/{relpath}", url.path().trim_end_matches('/'));
        url.set_path(&joined);
        Arc::new(AzureTransport {
            runtime: self.runtime.clone(),
            container: self.container.clone(),
            prefix: self.blob_name(relpath),
            url,
            retry: self.retry,
        })
    }
}
