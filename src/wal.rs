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

//! WAL segment names and archive file names.
//!
//! A segment is named `TTTTTTTTLLLLLLLLSSSSSSSS`: eight hex digits each of
//! timeline, log, and segment-within-log. The number of segments per log is
//! `0x1_0000_0000 / wal_segment_size`, so the name mapping depends on the
//! cluster's segment size. Stored archive files append the content hash and
//! an optional compression extension: `<segment>-<sha1>[.gz|.lz4]`.

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A parsed WAL segment name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WalSegment {
    pub timeline: u32,
    pub log: u32,
    pub seg: u32,
}

impl WalSegment {
    pub fn new(timeline: u32, log: u32, seg: u32) -> WalSegment {
        WalSegment { timeline, log, seg }
    }

    /// True when `name` is a well-formed segment name.
    pub fn is_segment_name(name: &str) -> bool {
        name.len() == 24 && name.chars().all(|c| c.is_ascii_hexdigit())
    }

    /// True for timeline history files (`TTTTTTTT.history`).
    pub fn is_history_name(name: &str) -> bool {
        name.len() == 16
            && name.ends_with(".history")
            && name[..8].chars().all(|c| c.is_ascii_hexdigit())
    }

    /// The first sixteen hex digits, used as the storage directory so one
    /// directory never collects more than one log's worth of segments.
    pub fn directory(&self) -> String {
        format!("{:08X}{:08X}", self.timeline, self.log)
    }

    /// The following segment on the same timeline.
    pub fn next(&self, wal_segment_size: usize) -> WalSegment {
        let segs_per_log = (0x1_0000_0000u64 / wal_segment_size as u64) as u32;
        if self.seg + 1 >= segs_per_log {
            WalSegment {
                timeline: self.timeline,
                log: self.log + 1,
                seg: 0,
            }
        } else {
            WalSegment {
                timeline: self.timeline,
                log: self.log,
                seg: self.seg + 1,
            }
        }
    }

    /// The next `count` segments in order, starting with this one. This is
    /// the ideal prefetch queue for recovery starting here.
    pub fn ideal_queue(&self, wal_segment_size: usize, count: usize) -> Vec<WalSegment> {
        let mut queue = Vec::with_capacity(count);
        let mut segment = *self;
        for _ in 0..count {
            queue.push(segment);
            segment = segment.next(wal_segment_size);
        }
        queue
    }

    /// Extract the segment part of a stored archive file name
    /// (`<segment>-<sha1>[.gz|.lz4]`).
    pub fn from_archive_file(name: &str) -> Option<WalSegment> {
        let segment_part = name.split('-').next()?;
        if !WalSegment::is_segment_name(segment_part) {
            return None;
        }
        segment_part.parse().ok()
    }
}

impl fmt::Display for WalSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}{:08X}{:08X}",
            self.timeline, self.log, self.seg
        )
    }
}

impl FromStr for WalSegment {
    type Err = Error;

    fn from_str(name: &str) -> Result<WalSegment> {
        if !WalSegment::is_segment_name(name) {
            return Err(Error::Format(format!("'{name}' is not a WAL segment name")));
        }
        Ok(WalSegment {
            timeline: u32::from_str_radix(&name[0..8], 16).expect("checked hex"),
            log: u32::from_str_radix(&name[8..16], 16).expect("checked hex"),
            seg: u32::from_str_radix(&name[16..24], 16).expect("checked hex"),
        })
    }
}

/// Build the stored file name for a segment with its content hash.
pub fn archive_file_name(segment: &WalSegment, sha1: &str, extension: &str) -> String {
    format!("{segment}-{sha1}{extension}")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::WAL_SEGMENT_SIZE_DEFAULT;

    #[test]
    fn parse_and_format() {
        let segment: WalSegment = "000000010000000200000003".parse().unwrap();
        assert_eq!(segment, WalSegment::new(1, 2, 3));
        assert_eq!(segment.to_string(), "000000010000000200000003");
        assert_eq!(segment.directory(), "0000000100000002");
    }

    #[test]
    fn rejects_malformed_names() {
        assert!("00000001000000020000000".parse::<WalSegment>().is_err());
        assert!("00000001000000020000000G".parse::<WalSegment>().is_err());
        assert!(!WalSegment::is_segment_name("backup.info"));
        assert!(WalSegment::is_history_name("00000002.history"));
        assert!(!WalSegment::is_history_name("0000000X.history"));
    }

    #[test]
    fn next_carries_into_log_boundary() {
        // 16 MiB segments: 256 per log.
        let segment = WalSegment::new(1, 2, 0xFF);
        assert_eq!(
            segment.next(WAL_SEGMENT_SIZE_DEFAULT),
            WalSegment::new(1, 3, 0)
        );
        // 64 MiB segments: 64 per log.
        let segment = WalSegment::new(1, 2, 0x3F);
        assert_eq!(
            segment.next(64 * 1024 * 1024),
            WalSegment::new(1, 3, 0)
        );
    }

    #[test]
    fn ideal_queue_crosses_boundaries() {
        let start = WalSegment::new(1, 0, 0xFE);
        let queue = start.ideal_queue(WAL_SEGMENT_SIZE_DEFAULT, 4);
        assert_eq!(
            queue.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            [
                "0000000100000000000000FE",
                "0000000100000000000000FF",
                "000000010000000100000000",
                "000000010000000100000001",
            ]
        );
    }

    #[test]
    fn archive_file_names() {
        let segment = WalSegment::new(1, 0, 1);
        let name = archive_file_name(
            &segment,
            "35bee5464c1678318912dd919b31be7e94217302",
            ".gz",
        );
        assert_eq!(
            name,
            "000000010000000000000001-35bee5464c1678318912dd919b31be7e94217302.gz"
        );
        assert_eq!(
            WalSegment::from_archive_file(&name),
            Some(segment)
        );
        assert_eq!(WalSegment::from_archive_file("00000002.history"), None);
    }
}
