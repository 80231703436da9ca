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

//! Unified repository storage over any transport.
//!
//! The facade enforces path discipline (relative, normalized paths only),
//! composes filter groups onto reads and writes, makes repository writes
//! atomic by default, and caches directory listings so repeated existence
//! probes of one directory (archive dedup checks) cost one list call.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::trace;

use crate::filter::{lift_io_error, FilterGroup, GroupReader, GroupWriter};
use crate::transport::{self, ErrorKind, ListDir, Metadata, Transport, WriteMode, WriteSink};
use crate::{Error, Result};

/// Repository storage with path discipline and filtered streams.
#[derive(Clone)]
pub struct Storage {
    transport: Arc<dyn Transport>,
    list_cache: Arc<Mutex<HashMap<String, Arc<ListDir>>>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("url", &self.transport.url().as_str())
            .finish()
    }
}

/// Reject absolute paths and traversal: every repository path is relative
/// and already normalized.
fn check_path(relpath: &str) -> Result<()> {
    let ok = !relpath.starts_with('/')
        && relpath
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..");
    if ok || relpath.is_empty() {
        Ok(())
    } else {
        Err(Error::Assert(format!("invalid repository path '{relpath}'")))
    }
}

fn parent_dir(relpath: &str) -> &str {
    match relpath.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

impl Storage {
    pub fn open(transport: Arc<dyn Transport>) -> Storage {
        Storage {
            transport,
            list_cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn features(&self) -> &'static [transport::Feature] {
        self.transport.features()
    }

    /// A storage rooted at a subdirectory of this one.
    pub fn subdir(&self, relpath: &str) -> Result<Storage> {
        check_path(relpath)?;
        Ok(Storage::open(self.transport.chdir(relpath)))
    }

    /// List a directory with sorted names. A missing directory lists as
    /// empty, which suits object stores where prefixes spring into being.
    pub fn list(&self, relpath: &str) -> Result<ListDir> {
        check_path(relpath)?;
        match self.transport.list_dir(relpath) {
            Ok(mut list) => {
                list.files.sort_unstable();
                list.dirs.sort_unstable();
                Ok(list)
            }
            Err(err) if err.is_not_found() => Ok(ListDir::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// True when `name` exists in directory `dir`, answered from a cached
    /// listing. Use [Storage::flush_cache] after writing into the directory.
    pub fn exists_cached(&self, dir: &str, name: &str) -> Result<bool> {
        check_path(dir)?;
        let mut cache = self.list_cache.lock().expect("list cache lock");
        if !cache.contains_key(dir) {
            let list = self.list(dir)?;
            cache.insert(dir.to_owned(), Arc::new(list));
        }
        let list = cache.get(dir).expect("just inserted");
        Ok(list.files.iter().any(|f| f == name) || list.dirs.iter().any(|d| d == name))
    }

    /// Cached file names of a directory, for prefix probes.
    pub fn list_cached(&self, dir: &str) -> Result<Arc<ListDir>> {
        check_path(dir)?;
        let mut cache = self.list_cache.lock().expect("list cache lock");
        if let Some(list) = cache.get(dir) {
            return Ok(list.clone());
        }
        let list = Arc::new(self.list(dir)?);
        cache.insert(dir.to_owned(), list.clone());
        Ok(list)
    }

    pub fn flush_cache(&self) {
        self.list_cache.lock().expect("list cache lock").clear();
    }

    pub fn metadata(&self, relpath: &str) -> Result<Metadata> {
        check_path(relpath)?;
        Ok(self.transport.metadata(relpath)?)
    }

    pub fn exists(&self, relpath: &str) -> Result<bool> {
        check_path(relpath)?;
        Ok(self.transport.is_file(relpath)?)
    }

    /// Read a whole file.
    pub fn read(&self, relpath: &str) -> Result<Bytes> {
        check_path(relpath)?;
        Ok(self.transport.read_file(relpath)?)
    }

    /// Read a whole file, or None when it does not exist.
    pub fn read_optional(&self, relpath: &str) -> Result<Option<Bytes>> {
        check_path(relpath)?;
        match self.transport.read_file(relpath) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Read a whole file through a filter group, returning the filtered
    /// bytes and the finished group for results.
    pub fn read_filtered(&self, relpath: &str, group: FilterGroup) -> Result<(Vec<u8>, FilterGroup)> {
        let mut reader = self.open_read(relpath, group)?;
        let mut content = Vec::new();
        reader
            .read_to_end(&mut content)
            .map_err(lift_io_error)?;
        let group = reader.finish()?;
        Ok((content, group))
    }

    /// Open a streaming filtered read of a whole file.
    pub fn open_read(
        &self,
        relpath: &str,
        group: FilterGroup,
    ) -> Result<GroupReader<Box<dyn Read + Send>>> {
        self.open_read_range(relpath, 0, None, group)
    }

    /// Open a streaming filtered read of a byte range, for bundled files.
    pub fn open_read_range(
        &self,
        relpath: &str,
        offset: u64,
        limit: Option<u64>,
        group: FilterGroup,
    ) -> Result<GroupReader<Box<dyn Read + Send>>> {
        check_path(relpath)?;
        trace!(relpath, offset, ?limit, "open storage read");
        let raw = self.transport.open_read(relpath, offset, limit)?;
        Ok(GroupReader::new(raw, group))
    }

    /// Write a whole file atomically through a filter group.
    pub fn write_filtered(
        &self,
        relpath: &str,
        content: &[u8],
        group: FilterGroup,
    ) -> Result<FilterGroup> {
        let mut write = self.open_write(relpath, group)?;
        std::io::Write::write_all(&mut write, content).map_err(lift_io_error)?;
        write.commit()
    }

    /// Write a whole file atomically.
    pub fn write(&self, relpath: &str, content: &[u8]) -> Result<()> {
        check_path(relpath)?;
        Ok(self
            .transport
            .write_file(relpath, content, WriteMode::Atomic)?)
    }

    /// Write a whole file, failing if it already exists.
    pub fn write_new(&self, relpath: &str, content: &[u8]) -> Result<()> {
        check_path(relpath)?;
        Ok(self
            .transport
            .write_file(relpath, content, WriteMode::CreateNew)?)
    }

    /// Open a streaming filtered atomic write.
    pub fn open_write(&self, relpath: &str, group: FilterGroup) -> Result<StorageWrite> {
        check_path(relpath)?;
        trace!(relpath, "open storage write");
        let sink = self.transport.open_write(relpath)?;
        Ok(StorageWrite {
            inner: GroupWriter::new(sink, group),
        })
    }

    /// Rename within the repository; readers observe old or new, never a
    /// partial file.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        check_path(from)?;
        check_path(to)?;
        Ok(self.transport.rename(from, to)?)
    }

    /// Remove a file; with `error_on_missing` false, removal races are
    /// tolerated.
    pub fn remove(&self, relpath: &str, error_on_missing: bool) -> Result<()> {
        check_path(relpath)?;
        match self.transport.remove_file(relpath) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() && !error_on_missing => Ok(()),
            Err(err) if err.is_not_found() => Err(Error::FileMissing {
                path: relpath.to_owned(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Create one directory level; parents must exist unless `recurse`.
    pub fn path_create(&self, relpath: &str, recurse: bool) -> Result<()> {
        check_path(relpath)?;
        if !self.features().contains(&transport::Feature::Path) {
            return Ok(());
        }
        if recurse && !relpath.is_empty() {
            let parent = parent_dir(relpath);
            if !parent.is_empty() {
                self.path_create(parent, true)?;
            }
        }
        Ok(self.transport.create_dir(relpath)?)
    }

    /// Remove a directory tree. A missing path is not an error.
    pub fn path_remove(&self, relpath: &str) -> Result<()> {
        check_path(relpath)?;
        if !self.features().contains(&transport::Feature::Path) {
            // Object stores: remove everything under the prefix.
            return self.remove_prefix(relpath);
        }
        match self.transport.remove_dir_all(relpath) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_prefix(&self, relpath: &str) -> Result<()> {
        let list = self.list(relpath)?;
        for file in &list.files {
            self.remove(&format!("{relpath}/{file}"), false)?;
        }
        for dir in &list.dirs {
            self.remove_prefix(&format!("{relpath}/{dir}"))?;
        }
        Ok(())
    }

    /// Recursive walk of every file under `relpath`, depth first, in sorted
    /// order, yielding paths relative to the storage root.
    pub fn walk(&self, relpath: &str) -> Result<Vec<String>> {
        check_path(relpath)?;
        let mut found = Vec::new();
        let list = self.list(relpath)?;
        for file in &list.files {
            found.push(join_path(relpath, file));
        }
        for dir in &list.dirs {
            found.extend(self.walk(&join_path(relpath, dir))?);
        }
        Ok(found)
    }
}

pub fn join_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_owned()
    } else {
        format!("{dir}/{name}")
    }
}

/// A streaming filtered atomic write in progress.
pub struct StorageWrite {
    inner: GroupWriter<Box<dyn WriteSink>>,
}

impl std::io::Write for StorageWrite {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl StorageWrite {
    /// Flush filters, commit the underlying write, and return the group for
    /// results.
    pub fn commit(self) -> Result<FilterGroup> {
        let (sink, group) = self.inner.close()?;
        sink.commit()?;
        Ok(group)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use assert_fs::TempDir;

    use super::*;
    use crate::compress::gzip::{GzipCompress, GzipDecompress};
    use crate::filter::{HashFilter, SizeFilter};
    use crate::transport::local::LocalTransport;

    fn scratch() -> (TempDir, Storage) {
        let temp = TempDir::new().unwrap();
        let storage = Storage::open(Arc::new(LocalTransport::new(temp.path())));
        (temp, storage)
    }

    #[test]
    fn path_discipline() {
        let (_temp, storage) = scratch();
        assert!(storage.read("/etc/passwd").is_err());
        assert!(storage.read("a/../b").is_err());
        assert!(storage.read("a//b").is_err());
    }

    #[test]
    fn filtered_write_then_read() {
        let (_temp, storage) = scratch();
        storage.path_create("archive/main", true).unwrap();

        let group = FilterGroup::new()
            .with(Box::new(SizeFilter::new()))
            .with(Box::new(GzipCompress::new(6)));
        let group = storage
            .write_filtered("archive/main/seg", b"raw segment bytes", group)
            .unwrap();
        assert_eq!(group.result("size").unwrap().as_u64(), Some(17));

        let group = FilterGroup::new()
            .with(Box::new(GzipDecompress::new()))
            .with(Box::new(HashFilter::sha1()));
        let (content, group) = storage.read_filtered("archive/main/seg", group).unwrap();
        assert_eq!(content, b"raw segment bytes");
        assert!(group.result("sha1").is_some());
    }

    #[test]
    fn streaming_write_commits_atomically() {
        let (_temp, storage) = scratch();
        let mut write = storage.open_write("file", FilterGroup::new()).unwrap();
        write.write_all(b"0123456789").unwrap();
        assert!(!storage.exists("file").unwrap());
        write.commit().unwrap();
        assert_eq!(storage.read("file").unwrap(), "0123456789".as_bytes());
    }

    #[test]
    fn exists_cached_answers_from_one_listing() {
        let (_temp, storage) = scratch();
        storage.write("present", b"x").unwrap();
        assert!(storage.exists_cached("", "present").unwrap());
        assert!(!storage.exists_cached("", "absent").unwrap());

        // The cache holds until flushed.
        storage.write("late", b"y").unwrap();
        assert!(!storage.exists_cached("", "late").unwrap());
        storage.flush_cache();
        assert!(storage.exists_cached("", "late").unwrap());
    }

    #[test]
    fn missing_directory_lists_empty() {
        let (_temp, storage) = scratch();
        let list = storage.list("no/such/dir").unwrap();
        assert!(list.files.is_empty() && list.dirs.is_empty());
    }

    #[test]
    fn remove_tolerates_missing_when_asked() {
        let (_temp, storage) = scratch();
        storage.remove("ghost", false).unwrap();
        assert_eq!(storage.remove("ghost", true).unwrap_err().code(), 38);
    }

    #[test]
    fn walk_is_depth_first_sorted() {
        let (_temp, storage) = scratch();
        storage.path_create("a/b", true).unwrap();
        storage.write("a/2", b"").unwrap();
        storage.write("a/1", b"").unwrap();
        storage.write("a/b/3", b"").unwrap();
        assert_eq!(storage.walk("a").unwrap(), ["a/1", "a/2", "a/b/3"]);
    }
}
