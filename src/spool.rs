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

//! The archive spool: filesystem queues between the synchronous archive
//! commands and the async daemon.
//!
//! Layout: `<spool-path>/archive/<stanza>/out/` for push,
//! `<spool-path>/archive/<stanza>/in/` for get. The producer copies
//! segments in; the consumer writes `<segment>.ok` or `<segment>.error`
//! beside them. A batch-level failure before per-segment dispatch leaves a
//! global `error` file. Each status file holds the code on the first line
//! and the message on the rest.
//!
//! State machine per segment: absent -> queued -> in-flight -> ok |
//! error. `error` is terminal for the daemon's batch; the next synchronous
//! invocation clears it and retries.

use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::config::Options;
use crate::{Error, Result};

/// Which queue of the stanza's spool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// archive-push: segments on their way to the repository.
    Out,
    /// archive-get: segments prefetched from the repository.
    In,
}

impl Direction {
    fn dir_name(&self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

/// Per-segment outcome recorded by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentStatus {
    Ok { warning: Option<String> },
    Error { code: u8, message: String },
}

/// One stanza's spool directories.
#[derive(Debug, Clone)]
pub struct Spool {
    base: PathBuf,
}

impl Spool {
    /// Open (and create) the spool for the configured stanza.
    pub fn open(options: &Options) -> Result<Spool> {
        let stanza = options.stanza()?;
        let base = options.spool_path.join("archive").join(stanza);
        for direction in [Direction::Out, Direction::In] {
            let dir = base.join(direction.dir_name());
            std::fs::create_dir_all(&dir).map_err(|source| Error::FileWrite {
                path: dir,
                source,
            })?;
        }
        Ok(Spool { base })
    }

    pub fn dir(&self, direction: Direction) -> PathBuf {
        self.base.join(direction.dir_name())
    }

    fn status_path(&self, direction: Direction, segment: &str, ok: bool) -> PathBuf {
        self.dir(direction)
            .join(format!("{segment}.{}", if ok { "ok" } else { "error" }))
    }

    /// The recorded status of a segment, if any. An `ok` file wins over a
    /// stale `error` file.
    pub fn status(&self, direction: Direction, segment: &str) -> Result<Option<SegmentStatus>> {
        let ok_path = self.status_path(direction, segment, true);
        if ok_path.exists() {
            let content = read_to_string(&ok_path)?;
            let warning = content.trim();
            return Ok(Some(SegmentStatus::Ok {
                warning: if warning.is_empty() {
                    None
                } else {
                    Some(warning.to_owned())
                },
            }));
        }
        let error_path = self.status_path(direction, segment, false);
        if error_path.exists() {
            let content = read_to_string(&error_path)?;
            let (code, message) = parse_error_status(&content);
            return Ok(Some(SegmentStatus::Error { code, message }));
        }
        Ok(None)
    }

    pub fn write_ok(
        &self,
        direction: Direction,
        segment: &str,
        warning: Option<&str>,
    ) -> Result<()> {
        let path = self.status_path(direction, segment, true);
        trace!(?path, "write ok status");
        write_file(&path, warning.unwrap_or("").as_bytes())?;
        // A fresh ok supersedes any previous error.
        let _ = std::fs::remove_file(self.status_path(direction, segment, false));
        Ok(())
    }

    pub fn write_error(
        &self,
        direction: Direction,
        segment: &str,
        code: u8,
        message: &str,
    ) -> Result<()> {
        let path = self.status_path(direction, segment, false);
        debug!(?path, code, "write error status");
        write_file(&path, format!("{code}\n{message}").as_bytes())
    }

    /// Remove a segment's status files; missing files error only when
    /// `error_on_missing`.
    pub fn clear_status(
        &self,
        direction: Direction,
        segment: &str,
        error_on_missing: bool,
    ) -> Result<()> {
        let mut removed = false;
        for ok in [true, false] {
            let path = self.status_path(direction, segment, ok);
            match std::fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
                Err(source) => return Err(Error::FileWrite { path, source }),
            }
        }
        if error_on_missing && !removed {
            return Err(Error::FileMissing {
                path: self
                    .status_path(direction, segment, true)
                    .to_string_lossy()
                    .into_owned(),
            });
        }
        Ok(())
    }

    /// Copy a segment into the queue (single producer side).
    pub fn add(&self, direction: Direction, segment: &str, source: &Path) -> Result<()> {
        let target = self.dir(direction).join(segment);
        std::fs::copy(source, &target).map_err(|source_err| Error::FileWrite {
            path: target,
            source: source_err,
        })?;
        Ok(())
    }

    /// Write segment content directly into the queue (the get side).
    pub fn put(&self, direction: Direction, segment: &str, content: &[u8]) -> Result<()> {
        let target = self.dir(direction).join(segment);
        std::fs::write(&target, content).map_err(|source| Error::FileWrite {
            path: target,
            source,
        })
    }

    pub fn segment_path(&self, direction: Direction, segment: &str) -> PathBuf {
        self.dir(direction).join(segment)
    }

    /// Queued segment names, status files excluded, sorted.
    pub fn list(&self, direction: Direction) -> Result<Vec<String>> {
        let dir = self.dir(direction);
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|source| Error::FileOpen {
            path: dir,
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| Error::FileRead {
                path: self.dir(direction),
                source,
            })?;
            if let Ok(name) = entry.file_name().into_string() {
                if !name.ends_with(".ok") && !name.ends_with(".error") && name != "error" {
                    names.push(name);
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Remove a queued segment; removal races with the other side are
    /// tolerated.
    pub fn remove(&self, direction: Direction, segment: &str) -> Result<()> {
        let path = self.dir(direction).join(segment);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::FileWrite { path, source }),
        }
    }

    /// Record an abort of the whole daemon batch.
    pub fn write_global_error(&self, direction: Direction, code: u8, message: &str) -> Result<()> {
        write_file(
            &self.dir(direction).join("error"),
            format!("{code}\n{message}").as_bytes(),
        )
    }

    pub fn global_error(&self, direction: Direction) -> Result<Option<(u8, String)>> {
        let path = self.dir(direction).join("error");
        if !path.exists() {
            return Ok(None);
        }
        let content = read_to_string(&path)?;
        Ok(Some(parse_error_status(&content)))
    }

    pub fn clear_global_error(&self, direction: Direction) -> Result<()> {
        let path = self.dir(direction).join("error");
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::FileWrite { path, source }),
        }
    }
}

fn parse_error_status(content: &str) -> (u8, String) {
    let mut lines = content.splitn(2, '\n');
    let code = lines
        .next()
        .and_then(|line| line.trim().parse().ok())
        .unwrap_or(70);
    let message = lines.next().unwrap_or("").trim().to_owned();
    (code, message)
}

fn read_to_string(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::FileRead {
        path: path.to_owned(),
        source,
    })
}

fn write_file(path: &Path, content: &[u8]) -> Result<()> {
    std::fs::write(path, content).map_err(|source| Error::FileWrite {
        path: path.to_owned(),
        source,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_fixtures::ScratchRepo;

    fn spool() -> (ScratchRepo, Spool) {
        let fixture = ScratchRepo::new();
        let spool = Spool::open(fixture.options()).unwrap();
        (fixture, spool)
    }

    #[test]
    fn status_lifecycle() {
        let (_fixture, spool) = spool();
        let segment = "000000010000000000000001";
        assert_eq!(spool.status(Direction::Out, segment).unwrap(), None);

        spool
            .write_error(Direction::Out, segment, 55, "format trouble")
            .unwrap();
        assert_eq!(
            spool.status(Direction::Out, segment).unwrap(),
            Some(SegmentStatus::Error {
                code: 55,
                message: "format trouble".into()
            })
        );

        // ok supersedes error.
        spool.write_ok(Direction::Out, segment, None).unwrap();
        assert_eq!(
            spool.status(Direction::Out, segment).unwrap(),
            Some(SegmentStatus::Ok { warning: None })
        );

        spool.clear_status(Direction::Out, segment, true).unwrap();
        assert_eq!(spool.status(Direction::Out, segment).unwrap(), None);
        // Now nothing is left to clear.
        assert_eq!(
            spool
                .clear_status(Direction::Out, segment, true)
                .unwrap_err()
                .code(),
            38
        );
        spool.clear_status(Direction::Out, segment, false).unwrap();
    }

    #[test]
    fn list_excludes_status_files() {
        let (_fixture, spool) = spool();
        spool
            .put(Direction::Out, "000000010000000000000002", b"data")
            .unwrap();
        spool
            .put(Direction::Out, "000000010000000000000001", b"data")
            .unwrap();
        spool
            .write_ok(Direction::Out, "000000010000000000000001", None)
            .unwrap();
        spool
            .write_global_error(Direction::Out, 42, "locked")
            .unwrap();

        assert_eq!(
            spool.list(Direction::Out).unwrap(),
            [
                "000000010000000000000001",
                "000000010000000000000002",
            ]
        );
    }

    #[test]
    fn global_error_round_trip() {
        let (_fixture, spool) = spool();
        assert_eq!(spool.global_error(Direction::Out).unwrap(), None);
        spool
            .write_global_error(Direction::Out, 42, "lock held by 123")
            .unwrap();
        assert_eq!(
            spool.global_error(Direction::Out).unwrap(),
            Some((42, "lock held by 123".into()))
        );
        spool.clear_global_error(Direction::Out).unwrap();
        assert_eq!(spool.global_error(Direction::Out).unwrap(), None);
    }

    #[test]
    fn ok_with_warning() {
        let (_fixture, spool) = spool();
        spool
            .write_ok(Direction::In, "000000010000000000000001", Some("was missing"))
            .unwrap();
        assert_eq!(
            spool.status(Direction::In, "000000010000000000000001").unwrap(),
            Some(SegmentStatus::Ok {
                warning: Some("was missing".into())
            })
        );
    }

    #[test]
    fn queues_are_separate() {
        let (_fixture, spool) = spool();
        spool
            .put(Direction::In, "000000010000000000000009", b"in")
            .unwrap();
        assert!(spool.list(Direction::Out).unwrap().is_empty());
        assert_eq!(spool.list(Direction::In).unwrap().len(), 1);
    }
}
