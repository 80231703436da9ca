// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! Gzip filters over flate2.

use std::io::Write;

use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;

use crate::filter::Filter;
use crate::{Error, Result};

fn gzip_error(err: std::io::Error) -> Error {
    Error::Format(format!("gzip stream: {err}"))
}

/// Streaming gzip compression.
pub struct GzipCompress {
    encoder: Option<GzEncoder<Vec<u8>>>,
}

impl GzipCompress {
    pub fn new(level: u32) -> GzipCompress {
        GzipCompress {
            encoder: Some(GzEncoder::new(Vec::new(), Compression::new(level))),
        }
    }
}

impl Filter for GzipCompress {
    fn name(&self) -> &str {
        "gzip-compress"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let encoder = self.encoder.as_mut().expect("encoder open");
        encoder.write_all(input).map_err(gzip_error)?;
        output.append(encoder.get_mut());
        Ok(input.len())
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> Result<bool> {
        if let Some(encoder) = self.encoder.take() {
            let tail = encoder.finish().map_err(gzip_error)?;
            output.extend_from_slice(&tail);
        }
        Ok(true)
    }
}

/// Streaming gzip decompression.
pub struct GzipDecompress {
    decoder: Option<GzDecoder<Vec<u8>>>,
}

impl GzipDecompress {
    pub fn new() -> GzipDecompress {
        GzipDecompress {
            decoder: Some(GzDecoder::new(Vec::new())),
        }
    }
}

impl Default for GzipDecompress {
    fn default() -> Self {
        GzipDecompress::new()
    }
}

impl Filter for GzipDecompress {
    fn name(&self) -> &str {
        "gzip-decompress"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        let decoder = self.decoder.as_mut().expect("decoder open");
        decoder.write_all(input).map_err(gzip_error)?;
        output.append(decoder.get_mut());
        Ok(input.len())
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> Result<bool> {
        if let Some(decoder) = self.decoder.take() {
            // Errors here mean the stream was truncated or corrupt.
            let tail = decoder.finish().map_err(gzip_error)?;
            output.extend_from_slice(&tail);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::FilterGroup;

    #[test]
    fn round_trip_chunked() {
        let input: Vec<u8> = b"repeated text ".repeat(10_000);

        let mut compressed = Vec::new();
        let mut group = FilterGroup::new().with(Box::new(GzipCompress::new(6)));
        for chunk in input.chunks(1000) {
            group.process(chunk, &mut compressed).unwrap();
        }
        group.finish(&mut compressed).unwrap();
        assert!(compressed.len() < input.len() / 10);

        let mut plain = Vec::new();
        let mut group = FilterGroup::new().with(Box::new(GzipDecompress::new()));
        for chunk in compressed.chunks(777) {
            group.process(chunk, &mut plain).unwrap();
        }
        group.finish(&mut plain).unwrap();
        assert_eq!(plain, input);
    }

    #[test]
    fn truncated_stream_fails() {
        let mut compressed = Vec::new();
        let mut group = FilterGroup::new().with(Box::new(GzipCompress::new(6)));
        group.process(b"some content", &mut compressed).unwrap();
        group.finish(&mut compressed).unwrap();

        let mut plain = Vec::new();
        let mut group = FilterGroup::new().with(Box::new(GzipDecompress::new()));
        group
            .process(&compressed[..compressed.len() - 5], &mut plain)
            .unwrap();
        assert!(group.finish(&mut plain).is_err());
    }

    #[test]
    fn empty_input_produces_valid_stream() {
        let mut compressed = Vec::new();
        let mut group = FilterGroup::new().with(Box::new(GzipCompress::new(6)));
        group.finish(&mut compressed).unwrap();
        assert!(!compressed.is_empty());

        let mut plain = Vec::new();
        let mut group = FilterGroup::new().with(Box::new(GzipDecompress::new()));
        group.process(&compressed, &mut plain).unwrap();
        group.finish(&mut plain).unwrap();
        assert!(plain.is_empty());
    }
}
