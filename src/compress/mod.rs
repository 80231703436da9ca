// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! Compression codecs for repository files.
//!
//! Archive segments and backup files may be stored compressed; the algorithm
//! is recorded as a file name extension so a repository remains readable
//! after the configured default changes.

use crate::filter::Filter;
use crate::{Error, Result};

pub mod gzip;
pub mod lz4;

/// Compression applied to stored files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressType {
    #[default]
    None,
    Gzip,
    Lz4,
}

impl CompressType {
    pub fn from_option(name: &str) -> Result<CompressType> {
        match name {
            "none" => Ok(CompressType::None),
            "gz" | "gzip" => Ok(CompressType::Gzip),
            "lz4" => Ok(CompressType::Lz4),
            other => Err(Error::OptionInvalid(format!(
                "'{other}' is not a valid compress-type"
            ))),
        }
    }

    /// The extension appended to stored file names, with leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            CompressType::None => "",
            CompressType::Gzip => ".gz",
            CompressType::Lz4 => ".lz4",
        }
    }

    /// Recognize the compression of a stored file from its name.
    pub fn from_name(name: &str) -> CompressType {
        if name.ends_with(".gz") {
            CompressType::Gzip
        } else if name.ends_with(".lz4") {
            CompressType::Lz4
        } else {
            CompressType::None
        }
    }

    pub fn compress_filter(&self, level: u32) -> Option<Box<dyn Filter>> {
        match self {
            CompressType::None => None,
            CompressType::Gzip => Some(Box::new(gzip::GzipCompress::new(level))),
            CompressType::Lz4 => Some(Box::new(lz4::Lz4Compress::new())),
        }
    }

    pub fn decompress_filter(&self) -> Option<Box<dyn Filter>> {
        match self {
            CompressType::None => None,
            CompressType::Gzip => Some(Box::new(gzip::GzipDecompress::new())),
            CompressType::Lz4 => Some(Box::new(lz4::Lz4Decompress::new())),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn extension_round_trip() {
        for compress_type in [CompressType::None, CompressType::Gzip, CompressType::Lz4] {
            let name = format!("000000010000000000000001{}", compress_type.extension());
            assert_eq!(CompressType::from_name(&name), compress_type);
        }
    }

    #[test]
    fn option_names() {
        assert_eq!(
            CompressType::from_option("gz").unwrap(),
            CompressType::Gzip
        );
        assert_eq!(
            CompressType::from_option("lz4").unwrap(),
            CompressType::Lz4
        );
        assert!(CompressType::from_option("zstd").is_err());
    }
}
