// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! Lz4 frame filters over lz4_flex.

use std::io::{Read, Write};

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::filter::Filter;
use crate::{Error, Result};

fn lz4_error(err: impl std::fmt::Display) -> Error {
    Error::Format(format!("lz4 stream: {err}"))
}

/// Lz4 frame compression.
///
/// Input streams into the frame encoder as it arrives; the encoded frame is
/// emitted at flush, so the working set is bounded by the compressed size of
/// one repository object.
pub struct Lz4Compress {
    encoder: Option<FrameEncoder<Vec<u8>>>,
}

impl Lz4Compress {
    pub fn new() -> Lz4Compress {
        Lz4Compress {
            encoder: Some(FrameEncoder::new(Vec::new())),
        }
    }
}

impl Default for Lz4Compress {
    fn default() -> Self {
        Lz4Compress::new()
    }
}

impl Filter for Lz4Compress {
    fn name(&self) -> &str {
        "lz4-compress"
    }

    fn process(&mut self, input: &[u8], _output: &mut Vec<u8>) -> Result<usize> {
        let encoder = self.encoder.as_mut().expect("encoder open");
        encoder.write_all(input).map_err(lz4_error)?;
        Ok(input.len())
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> Result<bool> {
        if let Some(encoder) = self.encoder.take() {
            let encoded = encoder.finish().map_err(lz4_error)?;
            output.extend_from_slice(&encoded);
        }
        Ok(true)
    }
}

/// Lz4 frame decompression.
///
/// The frame is buffered and decoded at flush; bounded by the size of one
/// repository object.
#[derive(Default)]
pub struct Lz4Decompress {
    encoded: Vec<u8>,
}

impl Lz4Decompress {
    pub fn new() -> Lz4Decompress {
        Lz4Decompress::default()
    }
}

impl Filter for Lz4Decompress {
    fn name(&self) -> &str {
        "lz4-decompress"
    }

    fn process(&mut self, input: &[u8], _output: &mut Vec<u8>) -> Result<usize> {
        self.encoded.extend_from_slice(input);
        Ok(input.len())
    }

    fn flush(&mut self, output: &mut Vec<u8>) -> Result<bool> {
        let mut decoder = FrameDecoder::new(&self.encoded[..]);
        decoder.read_to_end(output).map_err(lz4_error)?;
        self.encoded.clear();
        Ok(true)
    }
}
