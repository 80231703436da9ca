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

//! Access to a repository on the local filesystem.

use std::fs::{create_dir, remove_dir_all, remove_file, File, OpenOptions};
use std::io::prelude::*;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{io, path};

use bytes::Bytes;
use tracing::{error, trace, warn};
use url::Url;

use super::{
    Error, Feature, Kind, ListDir, Metadata, Result, Transport, WriteMode, WriteSink,
};
use crate::TMP_SUFFIX;

#[derive(Debug)]
pub struct LocalTransport {
    /// Root directory for this transport.
    path: PathBuf,
    url: Url,
}

impl LocalTransport {
    pub fn new(path: &Path) -> LocalTransport {
        LocalTransport {
            path: path.to_owned(),
            url: Url::from_directory_path(path::absolute(path).expect("make path absolute"))
                .expect("convert path to URL"),
        }
    }

    fn full_path(&self, relpath: &str) -> PathBuf {
        debug_assert!(!relpath.contains("/../"), "path must not contain /../");
        self.path.join(relpath)
    }
}

impl Transport for LocalTransport {
    fn features(&self) -> &'static [Feature] {
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
        // Repositories should never normally contain non-UTF-8 filenames,
        // but pass over them with a warning rather than failing the listing.
        let path = self.full_path(relpath);
        let fail = |err| Error::io_error(&path, err);
        let mut names = ListDir::default();
        for dir_entry in path.read_dir().map_err(fail)? {
            let dir_entry = dir_entry.map_err(fail)?;
            if let Ok(name) = dir_entry.file_name().into_string() {
                match dir_entry.file_type().map_err(fail)? {
                    t if t.is_dir() => names.dirs.push(name),
                    t if t.is_file() => names.files.push(name),
                    _ => (),
                }
            } else {
                warn!("Non-UTF-8 filename in repository {:?}", dir_entry.file_name());
            }
        }
        Ok(names)
    }

    fn read_file(&self, relpath: &str) -> Result<Bytes> {
        fn try_block(path: &Path) -> io::Result<Bytes> {
            let mut file = File::open(path)?;
            let estimated_len: usize = file
                .metadata()?
                .len()
                .try_into()
                .expect("file size fits in usize");
            let mut out_buf = Vec::with_capacity(estimated_len);
            let actual_len = file.read_to_end(&mut out_buf)?;
            trace!("Read {actual_len} bytes");
            out_buf.truncate(actual_len);
            Ok(out_buf.into())
        }
        let path = &self.full_path(relpath);
        try_block(path).map_err(|err| Error::io_error(path, err))
    }

    fn open_read(
        &self,
        relpath: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> Result<Box<dyn Read + Send>> {
        let path = self.full_path(relpath);
        let oops = |err| Error::io_error(&path, err);
        let mut file = File::open(&path).map_err(oops)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).map_err(oops)?;
        }
        match limit {
            Some(limit) => Ok(Box::new(file.take(limit))),
            None => Ok(Box::new(file)),
        }
    }

    fn write_file(&self, relpath: &str, content: &[u8], mode: WriteMode) -> Result<()> {
        match mode {
            WriteMode::Atomic => {
                let mut sink = self.open_write(relpath)?;
                sink.write_all(content).map_err(|err| {
                    Error::io_error(&self.full_path(relpath), err)
                })?;
                sink.commit()
            }
            WriteMode::CreateNew => {
                let full_path = self.full_path(relpath);
                let oops = |err| Error::io_error(&full_path, err);
                let mut file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&full_path)
                    .map_err(oops)?;
                if let Err(err) = file.write_all(content).and_then(|_| file.sync_all()) {
                    error!("Failed to write {full_path:?}: {err:?}");
                    drop(file);
                    if let Err(err2) = remove_file(&full_path) {
                        error!("Failed to remove {full_path:?}: {err2:?}");
                    }
                    return Err(oops(err));
                }
                trace!("Wrote {} bytes", content.len());
                Ok(())
            }
        }
    }

    fn open_write(&self, relpath: &str) -> Result<Box<dyn WriteSink>> {
        let final_path = self.full_path(relpath);
        let tmp_path = {
            let mut name = final_path.as_os_str().to_owned();
            name.push(TMP_SUFFIX);
            PathBuf::from(name)
        };
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|err| Error::io_error(&tmp_path, err))?;
        Ok(Box::new(LocalWriteSink {
            file: Some(file),
            tmp_path,
            final_path,
        }))
    }

    fn metadata(&self, relpath: &str) -> Result<Metadata> {
        let path = self.full_path(relpath);
        let oops = |err| Error::io_error(&path, err);
        let fsmeta = path.metadata().map_err(oops)?;
        let modified = fsmeta
            .modified()
            .ok()
            .map(time::OffsetDateTime::from);
        #[cfg(unix)]
        let (mode, user, group) = {
            use std::os::unix::fs::MetadataExt;
            (
                Some(fsmeta.mode() & 0o7777),
                Some(fsmeta.uid().to_string()),
                Some(fsmeta.gid().to_string()),
            )
        };
        #[cfg(not(unix))]
        let (mode, user, group) = (None, None, None);
        Ok(Metadata {
            len: fsmeta.len(),
            kind: fsmeta.file_type().into(),
            modified,
            mode,
            user,
            group,
        })
    }

    fn create_dir(&self, relpath: &str) -> Result<()> {
        let path = self.full_path(relpath);
        create_dir(&path).or_else(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(Error::io_error(&path, err))
            }
        })
    }

    fn remove_file(&self, relpath: &str) -> Result<()> {
        let path = self.full_path(relpath);
        remove_file(&path).map_err(|err| Error::io_error(&path, err))
    }

    fn remove_dir_all(&self, relpath: &str) -> Result<()> {
        let path = self.full_path(relpath);
        remove_dir_all(&path).map_err(|err| Error::io_error(&path, err))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.full_path(from);
        let to_path = self.full_path(to);
        std::fs::rename(&from_path, &to_path).map_err(|err| Error::io_error(&from_path, err))
    }

    fn chdir(&self, relpath: &str) -> Arc<dyn Transport> {
        Arc::new(LocalTransport {
            path: self.path.join(relpath),
            url: self.url.join(relpath).expect("join URL"),
        })
    }
}

struct LocalWriteSink {
    file: Option<File>,
    tmp_path: PathBuf,
    final_path: PathBuf,
}

impl Write for LocalWriteSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.as_mut().expect("sink open").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.as_mut().expect("sink open").flush()
    }
}

impl WriteSink for LocalWriteSink {
    fn commit(mut self: Box<Self>) -> Result<()> {
        let oops = |err| Error::io_error(&self.tmp_path, err);
        let file = self.file.take().expect("sink open");
        file.sync_all().map_err(oops)?;
        drop(file);
        std::fs::rename(&self.tmp_path, &self.final_path).map_err(oops)?;
        // Sync the directory so the rename itself is durable.
        if let Some(dir) = self.final_path.parent() {
            if let Ok(dir_file) = File::open(dir) {
                let _ = dir_file.sync_all();
            }
        }
        trace!("Committed {:?}", self.final_path);
        Ok(())
    }
}

impl Drop for LocalWriteSink {
    fn drop(&mut self) {
        // An uncommitted sink leaves no trace.
        if self.file.take().is_some() {
            if let Err(err) = remove_file(&self.tmp_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    error!("Failed to remove {:?}: {err:?}", self.tmp_path);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    use super::*;

    #[test]
    fn read_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        let content: &str = "the ribs of the disaster";
        let filename = "poem.txt";
        temp.child(filename).write_str(content).unwrap();

        let transport = LocalTransport::new(temp.path());
        let buf = transport.read_file(filename).unwrap();
        assert_eq!(buf, content.as_bytes());

        temp.close().unwrap();
    }

    #[test]
    fn read_file_not_found() {
        let temp = assert_fs::TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path());

        let err = transport
            .read_file("nonexistent.json")
            .expect_err("read_file should fail on nonexistent file");

        let message = err.to_string();
        assert!(message.contains("Not found"));
        assert!(message.contains("nonexistent.json"));
        assert!(err.is_not_found());
    }

    #[test]
    fn read_with_offset_and_limit() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("data").write_str("0123456789").unwrap();
        let transport = LocalTransport::new(temp.path());

        let mut ranged = String::new();
        transport
            .open_read("data", 2, Some(5))
            .unwrap()
            .read_to_string(&mut ranged)
            .unwrap();
        assert_eq!(ranged, "23456");
    }

    #[test]
    fn list_directory() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("root file").touch().unwrap();
        temp.child("subdir").create_dir_all().unwrap();
        temp.child("subdir")
            .child("subfile")
            .write_str("Morning coffee")
            .unwrap();

        let transport = LocalTransport::new(temp.path());
        let root_list = transport.list_dir(".").unwrap();
        assert_eq!(root_list.files, ["root file"]);
        assert_eq!(root_list.dirs, ["subdir"]);

        assert!(transport.is_file("root file").unwrap());
        assert!(!transport.is_file("nuh-uh").unwrap());

        temp.close().unwrap();
    }

    #[test]
    fn atomic_write_is_invisible_until_commit() {
        let temp = assert_fs::TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path());

        let mut sink = transport.open_write("backup.info").unwrap();
        sink.write_all(b"0123456789").unwrap();
        sink.flush().unwrap();

        // Not yet committed: only the temporary sibling is visible.
        let list = transport.list_dir(".").unwrap();
        assert!(!list.files.iter().any(|f| f == "backup.info"));
        assert!(list.files.iter().any(|f| f == "backup.info.tmp"));

        sink.commit().unwrap();
        let list = transport.list_dir(".").unwrap();
        assert!(list.files.iter().any(|f| f == "backup.info"));
        assert!(!list.files.iter().any(|f| f == "backup.info.tmp"));
        assert_eq!(transport.metadata("backup.info").unwrap().len, 10);
    }

    #[test]
    fn dropped_sink_removes_temporary() {
        let temp = assert_fs::TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path());

        {
            let mut sink = transport.open_write("partial").unwrap();
            sink.write_all(b"doomed").unwrap();
        }
        temp.child("partial").assert(predicate::path::missing());
        temp.child("partial.tmp").assert(predicate::path::missing());
    }

    #[test]
    fn write_file_create_new_refuses_overwrite() {
        let temp = assert_fs::TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path());

        transport
            .write_file("once", b"first", WriteMode::CreateNew)
            .unwrap();
        let err = transport
            .write_file("once", b"second", WriteMode::CreateNew)
            .unwrap_err();
        assert_eq!(err.kind(), super::super::ErrorKind::AlreadyExists);

        // Atomic mode overwrites.
        transport
            .write_file("once", b"replaced", WriteMode::Atomic)
            .unwrap();
        assert_eq!(transport.read_file("once").unwrap(), "replaced".as_bytes());
    }

    #[test]
    fn rename_within_transport() {
        let temp = assert_fs::TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path());
        transport
            .write_file("a", b"content", WriteMode::Atomic)
            .unwrap();
        transport.rename("a", "b").unwrap();
        assert!(!transport.is_file("a").unwrap());
        assert_eq!(transport.read_file("b").unwrap(), "content".as_bytes());
    }

    #[test]
    fn chdir_scopes_paths() {
        let temp = assert_fs::TempDir::new().unwrap();
        let transport = LocalTransport::new(temp.path());
        transport.create_dir("aaa").unwrap();
        transport.create_dir("aaa/bbb").unwrap();

        let sub = transport.chdir("aaa");
        let sub_list = sub.list_dir("").unwrap();
        assert_eq!(sub_list.dirs, ["bbb"]);
        assert_eq!(sub_list.files, [""; 0]);
    }

    #[test]
    fn metadata_detail() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("f").write_str("1234").unwrap();
        let transport = LocalTransport::new(temp.path());
        let metadata = transport.metadata("f").unwrap();
        assert_eq!(metadata.len, 4);
        assert_eq!(metadata.kind, Kind::File);
        assert!(metadata.modified.is_some());
        #[cfg(unix)]
        assert!(metadata.mode.is_some());
    }
}
