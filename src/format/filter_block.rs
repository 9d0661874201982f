//! Filter blocks: approximate-membership queries over 64 Ki-row spans.
//!
//! A filter block covers up to 65 536 consecutive rows of one column. It is
//! a rank-select quotient filter built in one batch when the block seals:
//! each row's xxh3 fingerprint splits into a 16-bit quotient and an 8- or
//! 16-bit remainder; remainders are stored grouped by quotient, and a unary
//! run-length bitvector with sampled select recovers each quotient's run in
//! expected O(1).
//!
//! ## Block layout
//!
//! ```text
//! [block prefix: 16 bytes]
//! n_stored:     u32    remainders stored (after in-run dedup)
//! remainder_bits: u8   8 or 16
//! _pad:         [u8; 3]
//! unary_words:  u32    run-length bitvector length in u64 words
//! n_samples:    u32    select samples
//! [unary bitvector: u64 * unary_words]
//!   one '1' per quotient (65 537 including the terminator), each followed
//!   by one '0' per remainder in that quotient's run
//! [select samples: u32 * n_samples, bit position of every 64th one]
//! [remainders: n_stored * 1 or 2 bytes, little-endian]
//! ```
//!
//! False-positive rate is the expected run length over the remainder space:
//! about 2^-16 at 16 bits and 2^-8 at 8 bits for a full block.

use crate::error::{Result, StrataError};
use crate::format::{legal_block_size, BLOCK_HEADER_LEN};
use crate::io::BlockHandle;

/// Rows covered by one filter block.
pub const FILTER_BLOCK_ROWS: u64 = 1 << 16;

/// Quotient width in bits; one slot per possible quotient.
const QUOTIENT_BITS: u32 = 16;
const N_QUOTIENTS: usize = 1 << QUOTIENT_BITS;

/// Every 64th set bit's position is sampled for select.
const SELECT_SAMPLE: usize = 64;

const BODY_FIXED: usize = 16;

/// Remainder width per value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterBits {
    /// 8 bits per value: ~1.5 % worst-case false positives, target 0.4 %.
    B8,
    /// 16 bits per value: target 0.002 % false positives.
    B16,
}

impl FilterBits {
    pub fn as_u8(self) -> u8 {
        match self {
            FilterBits::B8 => 8,
            FilterBits::B16 => 16,
        }
    }

    pub fn from_u8(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(FilterBits::B8),
            16 => Some(FilterBits::B16),
            _ => None,
        }
    }

    fn bytes(self) -> usize {
        self.as_u8() as usize / 8
    }
}

#[inline]
fn split(hash: u64, bits: FilterBits) -> (u32, u16) {
    let quotient = (hash >> 48) as u32;
    let remainder = match bits {
        FilterBits::B8 => ((hash >> 40) & 0xFF) as u16,
        FilterBits::B16 => ((hash >> 32) & 0xFFFF) as u16,
    };
    (quotient, remainder)
}

/// Fingerprint of an archived value, as inserted and queried.
#[inline]
pub fn fingerprint(archived: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(archived)
}

// ============================================================================
// Builder
// ============================================================================

/// Accumulates fingerprints for one filter block.
pub struct FilterBlockBuilder {
    bits: FilterBits,
    min_size: usize,
    hashes: Vec<u64>,
}

impl FilterBlockBuilder {
    pub fn new(bits: FilterBits, min_size: usize) -> Self {
        Self {
            bits,
            min_size,
            hashes: Vec::new(),
        }
    }

    /// Rows covered so far.
    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// A block seals at exactly [`FILTER_BLOCK_ROWS`] rows.
    pub fn is_full(&self) -> bool {
        self.hashes.len() as u64 >= FILTER_BLOCK_ROWS
    }

    pub fn push(&mut self, hash: u64) {
        debug_assert!(!self.is_full());
        self.hashes.push(hash);
    }

    /// Seal the block. Returns `None` if no rows were covered.
    pub fn finish(&mut self) -> Result<Option<Vec<u8>>> {
        if self.hashes.is_empty() {
            return Ok(None);
        }
        let mut pairs: Vec<(u32, u16)> = self
            .hashes
            .drain(..)
            .map(|hash| split(hash, self.bits))
            .collect();
        pairs.sort_unstable();
        pairs.dedup();
        let n = pairs.len();

        let unary_bits = N_QUOTIENTS + 1 + n;
        let unary_words = (unary_bits + 63) / 64;
        let mut unary = vec![0u64; unary_words];
        let mut samples = Vec::with_capacity(N_QUOTIENTS / SELECT_SAMPLE + 2);

        let mut pos = 0usize;
        let mut ones = 0usize;
        let mut next = 0usize;
        let mut set_one = |pos: usize, ones: &mut usize, samples: &mut Vec<u32>| {
            if *ones % SELECT_SAMPLE == 0 {
                samples.push(pos as u32);
            }
            unary[pos / 64] |= 1 << (pos % 64);
            *ones += 1;
        };
        for q in 0..N_QUOTIENTS as u32 {
            set_one(pos, &mut ones, &mut samples);
            pos += 1;
            while next < n && pairs[next].0 == q {
                pos += 1;
                next += 1;
            }
        }
        set_one(pos, &mut ones, &mut samples);
        debug_assert_eq!(pos + 1, unary_bits);

        let body_len = BODY_FIXED + unary_words * 8 + samples.len() * 4 + n * self.bits.bytes();
        let size = legal_block_size(BLOCK_HEADER_LEN + body_len, self.min_size)?;
        let mut buf = Vec::with_capacity(size);
        buf.resize(BLOCK_HEADER_LEN, 0);
        buf.extend_from_slice(&(n as u32).to_le_bytes());
        buf.push(self.bits.as_u8());
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&(unary_words as u32).to_le_bytes());
        buf.extend_from_slice(&(samples.len() as u32).to_le_bytes());
        for word in &unary {
            buf.extend_from_slice(&word.to_le_bytes());
        }
        for sample in &samples {
            buf.extend_from_slice(&sample.to_le_bytes());
        }
        match self.bits {
            FilterBits::B8 => {
                for &(_, r) in &pairs {
                    buf.push(r as u8);
                }
            }
            FilterBits::B16 => {
                for &(_, r) in &pairs {
                    buf.extend_from_slice(&r.to_le_bytes());
                }
            }
        }
        buf.resize(size, 0);
        Ok(Some(buf))
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Lookup over one filter block image.
#[derive(Clone)]
pub struct FilterBlockReader {
    block: BlockHandle,
    n: usize,
    bits: FilterBits,
    unary_off: usize,
    samples_off: usize,
    remainders_off: usize,
}

impl FilterBlockReader {
    pub fn new(block: BlockHandle, offset: u64) -> Result<Self> {
        let corrupt = |detail: &str| StrataError::corrupt(offset, detail);
        let len = block.len();
        if len < BLOCK_HEADER_LEN + BODY_FIXED {
            return Err(corrupt("filter block too small"));
        }
        let base = BLOCK_HEADER_LEN;
        let n = u32::from_le_bytes(block[base..base + 4].try_into().unwrap()) as usize;
        let bits = FilterBits::from_u8(block[base + 4])
            .ok_or_else(|| corrupt("filter block has invalid remainder width"))?;
        let unary_words =
            u32::from_le_bytes(block[base + 8..base + 12].try_into().unwrap()) as usize;
        let n_samples =
            u32::from_le_bytes(block[base + 12..base + 16].try_into().unwrap()) as usize;

        let unary_off = base + BODY_FIXED;
        let samples_off = unary_off + unary_words * 8;
        let remainders_off = samples_off + n_samples * 4;
        if remainders_off + n * bits.bytes() > len {
            return Err(corrupt("filter block sections overflow the block"));
        }
        if unary_words * 64 < N_QUOTIENTS + 1 + n || n_samples == 0 {
            return Err(corrupt("filter block unary section truncated"));
        }
        Ok(Self {
            block,
            n,
            bits,
            unary_off,
            samples_off,
            remainders_off,
        })
    }

    fn word(&self, i: usize) -> u64 {
        let off = self.unary_off + i * 8;
        u64::from_le_bytes(self.block[off..off + 8].try_into().unwrap())
    }

    fn sample(&self, i: usize) -> usize {
        let off = self.samples_off + i * 4;
        u32::from_le_bytes(self.block[off..off + 4].try_into().unwrap()) as usize
    }

    /// Bit position of the `i`-th set bit (0-based).
    fn select1(&self, i: usize) -> usize {
        let mut pos = self.sample(i / SELECT_SAMPLE);
        let mut remaining = i % SELECT_SAMPLE;
        if remaining == 0 {
            return pos;
        }
        // Finish the sampled word past the sampled bit, then whole words.
        let mut word_idx = pos / 64;
        let mut word = self.word(word_idx) & !((1u64 << (pos % 64)) | ((1u64 << (pos % 64)) - 1));
        loop {
            let ones = word.count_ones() as usize;
            if ones >= remaining {
                for _ in 1..remaining {
                    word &= word - 1;
                }
                pos = word_idx * 64 + word.trailing_zeros() as usize;
                return pos;
            }
            remaining -= ones;
            word_idx += 1;
            word = self.word(word_idx);
        }
    }

    fn remainder(&self, i: usize) -> u16 {
        match self.bits {
            FilterBits::B8 => self.block[self.remainders_off + i] as u16,
            FilterBits::B16 => {
                let off = self.remainders_off + i * 2;
                u16::from_le_bytes(self.block[off..off + 2].try_into().unwrap())
            }
        }
    }

    /// Approximate membership: `false` is definitive, `true` may be a false
    /// positive.
    pub fn contains(&self, hash: u64) -> bool {
        let (quotient, remainder) = split(hash, self.bits);
        let q = quotient as usize;
        let run_start = self.select1(q) - q;
        let run_end = self.select1(q + 1) - (q + 1);
        debug_assert!(run_end <= self.n);
        (run_start..run_end).any(|i| self.remainder(i) == remainder)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::block::{read_block, BlockWriter};
    use crate::format::{BlockKind, ChecksumKind};
    use crate::io::MemFile;

    fn seal(builder: &mut FilterBlockBuilder) -> FilterBlockReader {
        let mut buf = builder.finish().unwrap().unwrap();
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let loc = writer.write_block(BlockKind::Filter, 0, &mut buf).unwrap();
        let block = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::Filter).unwrap();
        FilterBlockReader::new(block, loc.offset).unwrap()
    }

    fn hash_of(i: u64) -> u64 {
        xxhash_rust::xxh3::xxh3_64(&i.to_le_bytes())
    }

    #[test]
    fn test_no_false_negatives() {
        for bits in [FilterBits::B8, FilterBits::B16] {
            let mut builder = FilterBlockBuilder::new(bits, 8192);
            for i in 0..10_000u64 {
                builder.push(hash_of(i));
            }
            let reader = seal(&mut builder);
            for i in 0..10_000u64 {
                assert!(reader.contains(hash_of(i)), "lost key {i}");
            }
        }
    }

    #[test]
    fn test_false_positive_rate() {
        let mut builder = FilterBlockBuilder::new(FilterBits::B16, 8192);
        for i in 0..65_536u64 {
            builder.push(hash_of(i));
        }
        let reader = seal(&mut builder);

        let mut false_positives = 0;
        let probes = 20_000u64;
        for i in 0..probes {
            if reader.contains(hash_of(1 << 40 | i)) {
                false_positives += 1;
            }
        }
        // Expected rate ~2^-16; 20 in 20 000 would already be 0.1 %.
        assert!(false_positives < 20, "{false_positives} false positives");
    }

    #[test]
    fn test_full_block_seals() {
        let mut builder = FilterBlockBuilder::new(FilterBits::B8, 8192);
        for i in 0..FILTER_BLOCK_ROWS {
            assert!(!builder.is_full());
            builder.push(hash_of(i));
        }
        assert!(builder.is_full());
        let reader = seal(&mut builder);
        assert!(reader.contains(hash_of(12_345)));

        // The builder re-arms for the next 64 Ki rows.
        assert!(builder.is_empty());
    }

    #[test]
    fn test_empty_finish() {
        let mut builder = FilterBlockBuilder::new(FilterBits::B16, 8192);
        assert!(builder.finish().unwrap().is_none());
    }

    #[test]
    fn test_duplicate_hashes_collapse() {
        let mut builder = FilterBlockBuilder::new(FilterBits::B16, 8192);
        for _ in 0..100 {
            builder.push(hash_of(7));
        }
        let reader = seal(&mut builder);
        assert_eq!(reader.n, 1);
        assert!(reader.contains(hash_of(7)));
    }
}
