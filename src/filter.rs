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

//! Composable streaming transforms attached to repository reads and writes.
//!
//! A [Filter] consumes input chunks and produces output chunks; a
//! [FilterGroup] is an ordered list of filters driven by the endpoint that
//! owns it. Filters are single-producer, single-consumer, and synchronous;
//! all concurrency lives outside the filter boundary. A filter that cannot
//! consume its whole input in one call reports how much it took and is
//! re-entered with the remainder. On end of stream the group flushes each
//! filter left to right until it reports done, so the chain terminates for
//! finite buffers and long-running network streams alike.
//!
//! After the group finishes, each filter may surface a small typed result
//! (a digest, a byte count) keyed by its name.

use std::io::{self, Read, Write};

use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::{Error, Result, IO_BUFFER_SIZE};

/// A small typed value surfaced by a filter after the group finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterResult {
    U64(u64),
    Str(String),
    Bin(Vec<u8>),
    /// Page numbers that failed checksum verification.
    PageErrors(Vec<u32>),
}

impl FilterResult {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FilterResult::U64(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FilterResult::Str(value) => Some(value),
            _ => None,
        }
    }
}

/// A streaming byte transform.
pub trait Filter: Send {
    /// Name used to key this filter's result in the group.
    fn name(&self) -> &str;

    /// Consume some prefix of `input`, appending any transformed bytes to
    /// `output`, and return how many input bytes were consumed. The driver
    /// re-enters with the unconsumed remainder.
    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize>;

    /// Flush bounded internal state after end of input. Returns true when
    /// the filter is done; the driver calls again until it is.
    fn flush(&mut self, _output: &mut Vec<u8>) -> Result<bool> {
        Ok(true)
    }

    /// The typed result, if this filter produces one. Valid after flush
    /// reports done.
    fn result(&self) -> Option<FilterResult> {
        None
    }
}

/// An ordered list of filters between raw bytes and the caller's view.
#[derive(Default)]
pub struct FilterGroup {
    filters: Vec<Box<dyn Filter>>,
    finished: bool,
}

impl FilterGroup {
    pub fn new() -> FilterGroup {
        FilterGroup::default()
    }

    pub fn push(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        assert!(!self.finished, "group already finished");
        self.filters.push(filter);
        self
    }

    pub fn with(mut self, filter: Box<dyn Filter>) -> Self {
        self.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Push a chunk through every filter in order, appending the final
    /// stage's output to `output`.
    pub fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<()> {
        assert!(!self.finished, "group already finished");
        push_through(&mut self.filters, input, output)
    }

    /// Signal end of input: flush filters left to right, routing each
    /// filter's tail through the filters after it, until all report done.
    pub fn finish(&mut self, output: &mut Vec<u8>) -> Result<()> {
        assert!(!self.finished, "group already finished");
        for first in 0..self.filters.len() {
            loop {
                let mut flushed = Vec::new();
                let done = self.filters[first].flush(&mut flushed)?;
                let (_, downstream) = self.filters.split_at_mut(first + 1);
                push_through(downstream, &flushed, output)?;
                if done {
                    break;
                }
            }
        }
        self.finished = true;
        Ok(())
    }

    /// The result of the named filter. Valid after [FilterGroup::finish].
    pub fn result(&self, name: &str) -> Option<FilterResult> {
        assert!(self.finished, "results are gathered after finish");
        self.filters
            .iter()
            .find(|filter| filter.name() == name)
            .and_then(|filter| filter.result())
    }
}

/// Recover a crate error smuggled through the [io::Error] boundary of the
/// [Read]/[Write] adapters, keeping plain I/O errors intact.
pub(crate) fn lift_io_error(err: io::Error) -> Error {
    if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
        *err.into_inner()
            .expect("checked inner error")
            .downcast::<Error>()
            .expect("checked error type")
    } else {
        Error::FileRead {
            path: "filtered stream".into(),
            source: err,
        }
    }
}

/// Run `input` through a slice of filters sequentially, appending the last
/// stage's output to `output`. An empty slice copies input through.
fn push_through(filters: &mut [Box<dyn Filter>], input: &[u8], output: &mut Vec<u8>) -> Result<()> {
    if filters.is_empty() {
        output.extend_from_slice(input);
        return Ok(());
    }

    let (head, rest) = filters.split_first_mut().expect("nonempty filter slice");
    let mut staged = Vec::new();
    let mut offset = 0;
    while offset < input.len() {
        let consumed = head.process(&input[offset..], &mut staged)?;
        if consumed == 0 && staged.is_empty() {
            return Err(Error::Assert(format!(
                "filter {} stalled without consuming input",
                head.name()
            )));
        }
        offset += consumed;
        if !staged.is_empty() {
            push_through(rest, &staged, output)?;
            staged.clear();
        }
    }
    Ok(())
}

/// Counts the bytes flowing through, surfacing the total as a result.
pub struct SizeFilter {
    name: String,
    total: u64,
}

impl SizeFilter {
    pub fn new() -> SizeFilter {
        SizeFilter::named("size")
    }

    /// A second size filter in one group needs its own key, e.g. to measure
    /// both the logical and the stored side of a compressing write.
    pub fn named(name: &str) -> SizeFilter {
        SizeFilter {
            name: name.to_owned(),
            total: 0,
        }
    }
}

impl Default for SizeFilter {
    fn default() -> Self {
        SizeFilter::new()
    }
}

impl Filter for SizeFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        self.total += input.len() as u64;
        output.extend_from_slice(input);
        Ok(input.len())
    }

    fn result(&self) -> Option<FilterResult> {
        Some(FilterResult::U64(self.total))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    Sha1,
    Sha256,
}

enum HashState {
    Sha1(Sha1),
    Sha256(Sha256),
}

/// Content hash over the bytes flowing through, surfaced as lowercase hex.
pub struct HashFilter {
    state: HashState,
}

impl HashFilter {
    pub fn new(hash_type: HashType) -> HashFilter {
        let state = match hash_type {
            HashType::Sha1 => HashState::Sha1(Sha1::new()),
            HashType::Sha256 => HashState::Sha256(Sha256::new()),
        };
        HashFilter { state }
    }

    pub fn sha1() -> HashFilter {
        HashFilter::new(HashType::Sha1)
    }

    pub fn sha256() -> HashFilter {
        HashFilter::new(HashType::Sha256)
    }
}

impl Filter for HashFilter {
    fn name(&self) -> &str {
        match self.state {
            HashState::Sha1(_) => "sha1",
            HashState::Sha256(_) => "sha256",
        }
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        match &mut self.state {
            HashState::Sha1(hasher) => hasher.update(input),
            HashState::Sha256(hasher) => hasher.update(input),
        }
        output.extend_from_slice(input);
        Ok(input.len())
    }

    fn result(&self) -> Option<FilterResult> {
        let digest = match &self.state {
            HashState::Sha1(hasher) => hex::encode(hasher.clone().finalize()),
            HashState::Sha256(hasher) => hex::encode(hasher.clone().finalize()),
        };
        Some(FilterResult::Str(digest))
    }
}

/// Collects a copy of the bytes flowing through, surfaced as a buffer.
#[derive(Default)]
pub struct CaptureFilter {
    captured: Vec<u8>,
}

impl CaptureFilter {
    pub fn new() -> CaptureFilter {
        CaptureFilter::default()
    }
}

impl Filter for CaptureFilter {
    fn name(&self) -> &str {
        "capture"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        self.captured.extend_from_slice(input);
        output.extend_from_slice(input);
        Ok(input.len())
    }

    fn result(&self) -> Option<FilterResult> {
        Some(FilterResult::Bin(self.captured.clone()))
    }
}

/// Pull-side endpoint: reads raw bytes from `inner` and serves the filtered
/// view through [Read].
pub struct GroupReader<R: Read> {
    inner: R,
    group: FilterGroup,
    pending: Vec<u8>,
    pending_offset: usize,
    raw: Vec<u8>,
    eof: bool,
}

impl<R: Read> GroupReader<R> {
    pub fn new(inner: R, group: FilterGroup) -> GroupReader<R> {
        GroupReader {
            inner,
            group,
            pending: Vec::new(),
            pending_offset: 0,
            raw: vec![0; IO_BUFFER_SIZE],
            eof: false,
        }
    }

    /// Drain the remaining stream and hand back the group for results.
    pub fn finish(mut self) -> Result<FilterGroup> {
        let mut sink = [0u8; 8192];
        loop {
            match self.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) => return Err(lift_io_error(err)),
            }
        }
        Ok(self.group)
    }

    fn fill(&mut self) -> io::Result<()> {
        while self.pending_offset >= self.pending.len() && !self.eof {
            self.pending.clear();
            self.pending_offset = 0;
            let got = self.inner.read(&mut self.raw)?;
            if got == 0 {
                self.eof = true;
                self.group
                    .finish(&mut self.pending)
                    .map_err(io::Error::other)?;
            } else {
                self.group
                    .process(&self.raw[..got], &mut self.pending)
                    .map_err(io::Error::other)?;
            }
        }
        Ok(())
    }
}

impl<R: Read> Read for GroupReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.fill()?;
        let available = &self.pending[self.pending_offset..];
        let take = available.len().min(buf.len());
        buf[..take].copy_from_slice(&available[..take]);
        self.pending_offset += take;
        Ok(take)
    }
}

/// Push-side endpoint: accepts plain bytes and writes the filtered view to
/// `inner`. Call [GroupWriter::close] to flush the chain's tail.
pub struct GroupWriter<W: Write> {
    inner: W,
    group: FilterGroup,
    staged: Vec<u8>,
}

impl<W: Write> GroupWriter<W> {
    pub fn new(inner: W, group: FilterGroup) -> GroupWriter<W> {
        GroupWriter {
            inner,
            group,
            staged: Vec::new(),
        }
    }

    /// Flush filters to completion and return the inner writer and group.
    pub fn close(mut self) -> Result<(W, FilterGroup)> {
        self.staged.clear();
        self.group.finish(&mut self.staged)?;
        self.inner
            .write_all(&self.staged)
            .and_then(|_| self.inner.flush())
            .map_err(|source| Error::FileWrite {
                path: "filtered write".into(),
                source,
            })?;
        Ok((self.inner, self.group))
    }
}

impl<W: Write> Write for GroupWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staged.clear();
        self.group
            .process(buf, &mut self.staged)
            .map_err(io::Error::other)?;
        self.inner.write_all(&self.staged)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compress::gzip::{GzipCompress, GzipDecompress};

    #[test]
    fn empty_group_copies_through() {
        let mut group = FilterGroup::new();
        let mut out = Vec::new();
        group.process(b"some bytes", &mut out).unwrap();
        group.finish(&mut out).unwrap();
        assert_eq!(out, b"some bytes");
    }

    #[test]
    fn size_and_hash_observe_the_same_stream() {
        let mut group = FilterGroup::new()
            .with(Box::new(SizeFilter::new()))
            .with(Box::new(HashFilter::sha1()));
        let mut out = Vec::new();
        group.process(b"0123456789", &mut out).unwrap();
        group.process(b"abcdef", &mut out).unwrap();
        group.finish(&mut out).unwrap();

        assert_eq!(out, b"0123456789abcdef");
        assert_eq!(group.result("size").unwrap().as_u64(), Some(16));
        // Digest of the 16 input bytes, independent of chunking.
        assert_eq!(
            group.result("sha1").unwrap().as_str().unwrap(),
            "fe5567e8d769550852182cdf69d74bb16dff8e29",
        );
    }

    #[test]
    fn compress_then_decompress_round_trips() {
        let input: Vec<u8> = (0..100_000u32).flat_map(|n| n.to_le_bytes()).collect();
        let mut group = FilterGroup::new()
            .with(Box::new(GzipCompress::new(6)))
            .with(Box::new(GzipDecompress::new()))
            .with(Box::new(SizeFilter::new()));
        let mut out = Vec::new();
        for chunk in input.chunks(4096) {
            group.process(chunk, &mut out).unwrap();
        }
        group.finish(&mut out).unwrap();
        assert_eq!(out, input);
        assert_eq!(
            group.result("size").unwrap().as_u64(),
            Some(input.len() as u64)
        );
    }

    #[test]
    fn capture_collects_output_side() {
        let mut group = FilterGroup::new()
            .with(Box::new(GzipCompress::new(6)))
            .with(Box::new(CaptureFilter::new()));
        let mut out = Vec::new();
        group.process(b"compress me", &mut out).unwrap();
        group.finish(&mut out).unwrap();
        match group.result("capture").unwrap() {
            FilterResult::Bin(captured) => assert_eq!(captured, out),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn group_reader_serves_filtered_bytes() {
        let mut compressed = Vec::new();
        {
            let mut group = FilterGroup::new().with(Box::new(GzipCompress::new(6)));
            group.process(b"the text to store", &mut compressed).unwrap();
            group.finish(&mut compressed).unwrap();
        }

        let group = FilterGroup::new().with(Box::new(GzipDecompress::new()));
        let mut reader = GroupReader::new(&compressed[..], group);
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"the text to store");
    }

    #[test]
    fn group_writer_flushes_tail_on_close() {
        let group = FilterGroup::new().with(Box::new(GzipCompress::new(6)));
        let mut writer = GroupWriter::new(Vec::new(), group);
        writer.write_all(b"written through filters").unwrap();
        let (compressed, _) = writer.close().unwrap();

        let group = FilterGroup::new().with(Box::new(GzipDecompress::new()));
        let mut reader = GroupReader::new(&compressed[..], group);
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain).unwrap();
        assert_eq!(plain, b"written through filters");
    }

    #[test]
    fn finite_input_reaches_done() {
        // A group of every pass-through filter terminates in one pass.
        let mut group = FilterGroup::new()
            .with(Box::new(SizeFilter::new()))
            .with(Box::new(HashFilter::sha256()))
            .with(Box::new(CaptureFilter::new()));
        let mut out = Vec::new();
        group.process(&[0u8; 1_000_000], &mut out).unwrap();
        group.finish(&mut out).unwrap();
        assert_eq!(group.result("size").unwrap().as_u64(), Some(1_000_000));
    }
}
