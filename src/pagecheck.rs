// Bulwark backup system.
// Copyright 2023, 2024 Martin Pool.

//! PostgreSQL data page checksum verification.
//!
//! Pages carry an FNV-1a derived checksum over the page contents (with the
//! checksum field itself zeroed) mixed with the block number. The filter
//! verifies each 8 KiB page flowing through a backup read and collects the
//! block numbers that fail, surfacing them as a filter result; the manifest
//! records them per file.

use crate::filter::{Filter, FilterResult};
use crate::{Result, PG_PAGE_SIZE};

const N_SUMS: usize = 32;
/// Prime multiplier of the FNV-1a hash.
const FNV_PRIME: u32 = 16777619;

/// Base offsets that start each of the parallel FNV hashes in a different
/// state.
const CHECKSUM_BASE_OFFSETS: [u32; N_SUMS] = [
    0x5B1F36E9, 0xB8525960, 0x02AB50AA, 0x1DE66D2A, 0x79FF467A, 0x9BB9F8A3, 0x217E7CD2, 0x83E13D2C,
    0xF8D4474F, 0xE39EB970, 0x42C6AE16, 0x993216FA, 0x7B093B5D, 0x98DAFF3C, 0xF718902A, 0x0B1C9CDB,
    0xE58F764B, 0x187636BC, 0x5D7B3BB1, 0xE73DE7DE, 0x92BEC979, 0xCCA6C0B2, 0x304A0979, 0x85AA43D4,
    0x783125BB, 0x6CA8EAA2, 0xE407EAC6, 0x4B5CFC3E, 0x9FBF8C76, 0x15CA20BE, 0xF2CA9FD3, 0x959BD756,
];

fn checksum_comp(checksum: u32, value: u32) -> u32 {
    let tmp = checksum ^ value;
    tmp.wrapping_mul(FNV_PRIME) ^ (tmp >> 17)
}

/// Offset of the pd_checksum field within the page header.
const CHECKSUM_OFFSET: usize = 8;

/// Compute the checksum of one page as PostgreSQL stores it.
///
/// The stored pd_checksum field is excluded from the calculation; the block
/// number is mixed in to catch transposed pages.
pub fn page_checksum(page: &[u8], block_number: u32) -> u16 {
    assert_eq!(page.len(), PG_PAGE_SIZE);

    let mut sums = CHECKSUM_BASE_OFFSETS;
    let words_per_round = N_SUMS;
    let rounds = PG_PAGE_SIZE / (4 * words_per_round);
    for round in 0..rounds {
        for (lane, sum) in sums.iter_mut().enumerate() {
            let offset = (round * words_per_round + lane) * 4;
            let mut value = u32::from_le_bytes(
                page[offset..offset + 4]
                    .try_into()
                    .expect("4-byte page word"),
            );
            // pd_checksum occupies the low half of this word.
            if offset == CHECKSUM_OFFSET {
                value &= 0xFFFF_0000;
            }
            *sum = checksum_comp(*sum, value);
        }
    }

    // Two rounds of zeroes for additional mixing.
    for _ in 0..2 {
        for sum in sums.iter_mut() {
            *sum = checksum_comp(*sum, 0);
        }
    }

    let mut checksum: u32 = 0;
    for sum in sums {
        checksum ^= sum;
    }
    checksum ^= block_number;

    // Reduce with an offset of one so a valid checksum is never zero.
    ((checksum % 65535) + 1) as u16
}

fn stored_checksum(page: &[u8]) -> u16 {
    u16::from_le_bytes([page[CHECKSUM_OFFSET], page[CHECKSUM_OFFSET + 1]])
}

/// Write the checksum into a page image. Used by tests and by nothing else:
/// real pages arrive already stamped by the server.
#[cfg(test)]
pub(crate) fn stamp_page(page: &mut [u8], block_number: u32) {
    let checksum = page_checksum(page, block_number);
    page[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_le_bytes());
}

/// Verifies page checksums on a stream of pages, passing the bytes through
/// unchanged and surfacing the failing block numbers.
pub struct PageChecksumFilter {
    partial: Vec<u8>,
    next_block: u32,
    errors: Vec<u32>,
}

impl PageChecksumFilter {
    /// `first_block` is the block number of the first page in the stream,
    /// nonzero for segmented relations (`.1`, `.2`, ... forks).
    pub fn new(first_block: u32) -> PageChecksumFilter {
        PageChecksumFilter {
            partial: Vec::with_capacity(PG_PAGE_SIZE),
            next_block: first_block,
            errors: Vec::new(),
        }
    }

    fn verify_page(&mut self, page: &[u8]) {
        let block_number = self.next_block;
        self.next_block += 1;

        // All-zero pages are valid: they are newly extended space.
        if page.iter().all(|&byte| byte == 0) {
            return;
        }
        // A zero stored checksum means checksums were never enabled for
        // this page.
        let stored = stored_checksum(page);
        if stored == 0 {
            return;
        }
        if page_checksum(page, block_number) != stored {
            self.errors.push(block_number);
        }
    }
}

impl Filter for PageChecksumFilter {
    fn name(&self) -> &str {
        "page-checksum"
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> Result<usize> {
        output.extend_from_slice(input);

        let mut rest = input;
        if !self.partial.is_empty() {
            let need = PG_PAGE_SIZE - self.partial.len();
            let take = need.min(rest.len());
            self.partial.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.partial.len() == PG_PAGE_SIZE {
                let page = std::mem::take(&mut self.partial);
                self.verify_page(&page);
                self.partial = page;
                self.partial.clear();
            }
        }
        let mut chunks = rest.chunks_exact(PG_PAGE_SIZE);
        for page in &mut chunks {
            self.verify_page(page);
        }
        self.partial.extend_from_slice(chunks.remainder());
        Ok(input.len())
    }

    fn result(&self) -> Option<FilterResult> {
        // Trailing bytes short of a whole page (a file caught
        // mid-extension) pass through unverified.
        Some(FilterResult::PageErrors(self.errors.clone()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::filter::FilterGroup;

    fn page_with_content(block_number: u32) -> Vec<u8> {
        let mut page = vec![0u8; PG_PAGE_SIZE];
        // A minimal header plus recognizable body bytes.
        page[..8].copy_from_slice(&0x0102_0304_0506_0708u64.to_le_bytes());
        for (index, byte) in page[64..128].iter_mut().enumerate() {
            *byte = index as u8 + 1;
        }
        stamp_page(&mut page, block_number);
        page
    }

    fn run_filter(stream: &[u8], first_block: u32) -> Vec<u32> {
        let mut group =
            FilterGroup::new().with(Box::new(PageChecksumFilter::new(first_block)));
        let mut out = Vec::new();
        for chunk in stream.chunks(3000) {
            group.process(chunk, &mut out).unwrap();
        }
        group.finish(&mut out).unwrap();
        assert_eq!(out, stream);
        match group.result("page-checksum").unwrap() {
            FilterResult::PageErrors(errors) => errors,
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn valid_pages_pass() {
        let mut stream = Vec::new();
        for block in 0..4 {
            stream.extend(page_with_content(block));
        }
        assert_eq!(run_filter(&stream, 0), Vec::<u32>::new());
    }

    #[test]
    fn corrupt_page_is_reported() {
        let mut stream = Vec::new();
        for block in 0..4 {
            stream.extend(page_with_content(block));
        }
        stream[2 * PG_PAGE_SIZE + 100] ^= 0xff;
        assert_eq!(run_filter(&stream, 0), vec![2]);
    }

    #[test]
    fn transposed_page_is_reported() {
        // A page stamped for block 0 appearing at block 1.
        let mut stream = page_with_content(0);
        stream.extend(page_with_content(0));
        assert_eq!(run_filter(&stream, 0), vec![1]);
    }

    #[test]
    fn zero_pages_and_unchecksummed_pages_pass() {
        let mut stream = vec![0u8; PG_PAGE_SIZE];
        let mut unchecksummed = page_with_content(1);
        unchecksummed[CHECKSUM_OFFSET] = 0;
        unchecksummed[CHECKSUM_OFFSET + 1] = 0;
        stream.extend(unchecksummed);
        assert_eq!(run_filter(&stream, 0), Vec::<u32>::new());
    }

    #[test]
    fn first_block_offset_applies() {
        let stream = page_with_content(131072);
        assert_eq!(run_filter(&stream, 131072), Vec::<u32>::new());
    }
}
