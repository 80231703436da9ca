// Bulwark backup system.
// Copyright 2024 Martin Pool.

//! Access to a repository in Google Cloud Storage.
//!
//! Auth uses a service account credential file
//! (`GOOGLE_CLOUD_STORAGE_CREDENTIAL_PATH`, falling back to the SDK's
//! well-known locations) to sign request JWTs; the opendal operator carries
//! its own retry and timeout layers on top of the transport-level policy
//! shared by all object stores.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use opendal::layers::{RetryLayer, TimeoutLayer};
use opendal::Operator;
use tokio::runtime::Runtime;
use tracing::debug;
use url::Url;

use super::{
    BufferedSink, Error, ErrorKind, Feature, Kind, ListDir, Metadata, Result, Transport,
    WriteMode, WriteSink,
};

pub struct GcsTransport {
    runtime: Arc<Runtime>,
    client: Operator,
    /// Object name prefix, without leading or trailing slash; may be empty.
    prefix: String,
    url: Url,
}

impl std::fmt::Debug for GcsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsTransport")
            .field("url", &self.url.as_str())
            .finish()
    }
}

fn gcs_error(path: &str, err: opendal::Error) -> Error {
    match err.kind() {
        opendal::ErrorKind::NotFound => Error::new(ErrorKind::NotFound, path),
        opendal::ErrorKind::AlreadyExists => Error::new(ErrorKind::AlreadyExists, path),
        opendal::ErrorKind::PermissionDenied => Error::new(ErrorKind::PermissionDenied, path),
        _ => Error::other(path, err),
    }
}

impl GcsTransport {
    pub fn new(url: &Url) -> Result<Arc<GcsTransport>> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::io_error(std::path::Path::new(""), err))?;

        let mut cfg = opendal::services::GcsConfig::default();
        cfg.bucket = url
            .host_str()
            .ok_or_else(|| Error::new(ErrorKind::Other, "GCS URL has no bucket"))?
            .to_owned();
        if let Ok(credential_path) = std::env::var("GOOGLE_CLOUD_STORAGE_CREDENTIAL_PATH") {
            cfg.credential_path = Some(credential_path);
        }
        let client = Operator::from_config(cfg)
            .map_err(|err| gcs_error(url.as_str(), err))?
            .layer(TimeoutLayer::new().with_timeout(Duration::from_secs(60)))
            .layer(RetryLayer::default().with_jitter())
            .finish();

        let prefix = url.path().trim_matches('/').to_owned();
        debug!(url = %url, "opened GCS transport");
        Ok(Arc::new(GcsTransport {
            runtime: Arc::new(runtime),
            client,
            prefix,
            url: url.clone(),
        }))
    }

    fn object(&self, relpath: &str) -> String {
        let relpath = relpath.trim_matches('/');
        match (self.prefix.is_empty(), relpath.is_empty()) {
            (true, _) => relpath.to_owned(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{relpath}", self.prefix),
        }
    }

    fn dir_object(&self, relpath: &str) -> String {
        let object = self.object(relpath);
        if object.is_empty() {
            object
        } else {
            format!("{object}/")
        }
    }

    fn put_bytes(&self, relpath: &str, content: Vec<u8>) -> Result<()> {
        let object = self.object(relpath);
        self.runtime.block_on(async {
            self.client
                .write(&object, content)
                .await
                .map(|_| ())
                .map_err(|err| gcs_error(&object, err))
        })
    }
}

impl Transport for GcsTransport {
    fn features(&self) -> &'static [Feature] {
        &[Feature::EncryptedAtRest]
    }

    fn url(&self) -> &Url {
        &self.url
    }

    fn list_dir(&self, relpath: &str) -> Result<ListDir> {
        let dir = self.dir_object(relpath);
        let entries = self
            .runtime
            .block_on(async { self.client.list(&dir).await })
            .map_err(|err| gcs_error(&dir, err))?;
        let mut list = ListDir::default();
        for entry in entries {
            let name = entry.name().trim_end_matches('/');
            if name.is_empty() {
                continue;
            }
            if entry.metadata().mode().is_dir() {
                list.dirs.push(name.to_owned());
            } else {
                list.files.push(name.to_owned());
            }
        }
        Ok(list)
    }

    fn read_file(&self, relpath: &str) -> Result<Bytes> {
        let object = self.object(relpath);
        self.runtime.block_on(async {
            self.client
                .read(&object)
                .await
                .map(|buffer| buffer.to_bytes())
                .map_err(|err| gcs_error(&object, err))
        })
    }

    fn open_read(
        &self,
        relpath: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Box<dyn Read + Send>> {
        let object = self.object(relpath);
        let content = self.runtime.block_on(async {
            let request = self.client.read_with(&object);
            let request = match limit {
                Some(limit) => request.range(offset..offset + limit),
                None => request.range(offset..),
            };
            request
                .await
                .map(|buffer| buffer.to_bytes())
                .map_err(|err| gcs_error(&object, err))
        })?;
        Ok(Box::new(Cursor::new(content)))
    }

    fn write_file(&self, relpath: &str, content: &[u8], mode: WriteMode) -> Result<()> {
        if mode == WriteMode::CreateNew && self.is_file(relpath)? {
            return Err(Error::new(ErrorKind::AlreadyExists, relpath));
        }
        self.put_bytes(relpath, content.to_vec())
    }

    fn open_write(&self, relpath: &str) -> Result<Box<dyn WriteSink>> {
        let transport = GcsTransport {
            runtime: self.runtime.clone(),
            client: self.client.clone(),
            prefix: self.prefix.clone(),
            url: self.url.clone(),
        };
        Ok(Box::new(BufferedSink::new(
            relpath,
            Box::new(move |relpath, content| transport.put_bytes(relpath, content)),
        )))
    }

    fn metadata(&self, relpath: &str) -> Result<Metadata> {
        let object = self.object(relpath);
        let meta = self
            .runtime
            .block_on(async { self.client.stat(&object).await })
            .map_err(|err| gcs_error(&object, err))?;
        Ok(Metadata {
            len: meta.content_length(),
            kind: if meta.mode().is_dir() {
                Kind::Dir
            } else {
                Kind::File
            },
            modified: meta
                .last_modified()
                .and_then(|dt| time::OffsetDateTime::from_unix_timestamp(dt.timestamp()).ok()),
            mode: None,
            user: None,
            group: None,
        })
    }

    fn create_dir(&self, _relpath: &str) -> Result<()> {
        Ok(())
    }

    fn remove_file(&self, relpath: &str) -> Result<()> {
        let object = self.object(relpath);
        self.runtime.block_on(async {
            self.client
                .delete(&object)
                .await
                .map_err(|err| gcs_error(&object, err))
        })
    }

    fn remove_dir_all(&self, relpath: &str) -> Result<()> {
        let dir = self.dir_object(relpath);
        self.runtime.block_on(async {
            self.client
                .remove_all(&dir)
                .await
                .map_err(|err| gcs_error(&dir, err))
        })
    }

    fn chdir(&self, relpath: &str) -> Arc<dyn Transport> {
        let mut url = self.url.clone();
        let joined = format!("{}/{relpath}", url.path().trim_end_matches('/'));
        url.set_path(&joined);
        Arc::new(GcsTransport {
            runtime: self.runtime.clone(),
            client: self.client.clone(),
            prefix: self.object(relpath),
            url,
        })
    }
}
