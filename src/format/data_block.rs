//! Data blocks: serialized values plus a trailer indexing them.
//!
//! ## Block layout
//!
//! ```text
//! [block prefix: 16 bytes]
//! [values: each padded to its type's alignment, root-first]
//! [zero padding to the final block length minus the trailer]
//! [trailer: value_count entries, then value_count: u16]
//!   entry (last column):   root_off: u16
//!   entry (other columns): root_off: u16, row_start: u48, row_end: u48
//! ```
//!
//! `row_start..row_end` is the row group this value owns in the next column.
//! The trailer sits at the block tail so a reader can locate it from the
//! block length alone; access to entry `j` is O(1).
//!
//! A block commits when the next value would exceed its power-of-two budget,
//! when the value count would reach 2^16, or when the next root offset would
//! overflow the u16 trailer field. The budget starts at the configured
//! minimum and doubles only to admit a value that cannot fit otherwise, so a
//! block larger than 64 KiB holds a single oversize tail value and the u16
//! root bound still holds.

use std::ops::Range;

use crate::error::{Result, StrataError};
use crate::format::{
    align_up, get_u48, legal_block_size, put_u48, BlockLocation, BLOCK_HEADER_LEN,
    MAX_BLOCK_ENTRIES, MAX_ROW,
};
use crate::io::BlockHandle;

/// Trailer entry size with and without row ranges.
const ENTRY_WITH_ROWS: usize = 14;
const ENTRY_BARE: usize = 2;

// ============================================================================
// Builder
// ============================================================================

/// Accumulates archived values into one data block.
pub struct DataBlockBuilder {
    buf: Vec<u8>,
    entries: Vec<TrailerEntry>,
    /// Current power-of-two byte budget; resets to `min_size` per block.
    target: usize,
    min_size: usize,
    has_row_ranges: bool,
    first_row: u64,
}

struct TrailerEntry {
    root: u16,
    rows: Option<Range<u64>>,
}

/// A sealed data block ready for the block layer, plus its summary.
pub struct FinishedDataBlock {
    pub buf: Vec<u8>,
    pub first_row: u64,
    pub n_values: usize,
}

impl DataBlockBuilder {
    /// `min_size` is the smallest block this builder emits (a legal block
    /// length); `has_row_ranges` is set on every column but the last.
    pub fn new(min_size: usize, has_row_ranges: bool) -> Self {
        let mut buf = Vec::with_capacity(min_size);
        buf.resize(BLOCK_HEADER_LEN, 0);
        Self {
            buf,
            entries: Vec::new(),
            target: min_size,
            min_size,
            has_row_ranges,
            first_row: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn n_values(&self) -> usize {
        self.entries.len()
    }

    pub fn first_row(&self) -> u64 {
        self.first_row
    }

    fn entry_size(&self) -> usize {
        if self.has_row_ranges {
            ENTRY_WITH_ROWS
        } else {
            ENTRY_BARE
        }
    }

    fn trailer_len(&self, n: usize) -> usize {
        n * self.entry_size() + 2
    }

    /// Would pushing an `len`-byte value at `align` overflow this block?
    pub fn needs_commit(&self, len: usize, align: usize) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let root = align_up(self.buf.len(), align);
        let projected = root + len + self.trailer_len(self.entries.len() + 1);
        projected > self.target
            || root > u16::MAX as usize
            || self.entries.len() >= MAX_BLOCK_ENTRIES
    }

    /// Append one archived value. The caller has already checked
    /// [`needs_commit`](Self::needs_commit) and sealed if necessary.
    pub fn push(&mut self, archived: &[u8], align: usize, rows: Option<Range<u64>>) -> Result<()> {
        debug_assert!(!self.needs_commit(archived.len(), align));
        debug_assert_eq!(rows.is_some(), self.has_row_ranges);
        if let Some(rows) = &rows {
            if rows.end > MAX_ROW {
                return Err(StrataError::BoundsExceeded(format!(
                    "row range end {} exceeds 48-bit row capacity",
                    rows.end
                )));
            }
        }

        let root = align_up(self.buf.len(), align);
        // Grow the budget for a value that cannot fit at the current target.
        let mut projected = root + archived.len() + self.trailer_len(self.entries.len() + 1);
        while projected > self.target {
            self.target = legal_block_size(self.target + 1, self.min_size)?;
            projected = root + archived.len() + self.trailer_len(self.entries.len() + 1);
        }

        self.buf.resize(root, 0);
        self.buf.extend_from_slice(archived);
        self.entries.push(TrailerEntry {
            root: root as u16,
            rows,
        });
        Ok(())
    }

    /// Seal the block: pad to the final length and write the trailer.
    /// Returns `None` if no values were pushed.
    pub fn finish(&mut self) -> Result<Option<FinishedDataBlock>> {
        if self.entries.is_empty() {
            return Ok(None);
        }
        let n = self.entries.len();
        let total = self.buf.len() + self.trailer_len(n);
        let size = legal_block_size(total, self.min_size)?;

        self.buf.resize(size - self.trailer_len(n), 0);
        for entry in &self.entries {
            self.buf.extend_from_slice(&entry.root.to_le_bytes());
            if let Some(rows) = &entry.rows {
                put_u48(&mut self.buf, rows.start);
                put_u48(&mut self.buf, rows.end);
            }
        }
        self.buf.extend_from_slice(&(n as u16).to_le_bytes());
        debug_assert_eq!(self.buf.len(), size);

        let buf = std::mem::take(&mut self.buf);
        Ok(Some(FinishedDataBlock {
            buf,
            first_row: self.first_row,
            n_values: n,
        }))
    }

    /// Re-arm the builder for the next block, recycling the written buffer.
    pub fn restart(&mut self, mut buf: Vec<u8>, first_row: u64) {
        buf.clear();
        buf.resize(BLOCK_HEADER_LEN, 0);
        self.buf = buf;
        self.entries.clear();
        self.target = self.min_size;
        self.first_row = first_row;
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Random access over one data block image.
#[derive(Clone)]
pub struct DataBlockReader {
    block: BlockHandle,
    n_values: usize,
    entries_off: usize,
    entry_size: usize,
    has_row_ranges: bool,
}

impl DataBlockReader {
    /// `expect_row_ranges` is set on every column but the last; a flag
    /// mismatch means the block does not belong where the index said.
    pub fn new(block: BlockHandle, location: BlockLocation, expect_row_ranges: bool) -> Result<Self> {
        let has_row_ranges = super::block::block_flags(&block) & super::block::FLAG_ROW_RANGES != 0;
        if has_row_ranges != expect_row_ranges {
            return Err(StrataError::corrupt(
                location.offset,
                "data block row-range flag does not match its column",
            ));
        }
        let len = block.len();
        let n_values = u16::from_le_bytes(block[len - 2..].try_into().unwrap()) as usize;
        let entry_size = if has_row_ranges {
            ENTRY_WITH_ROWS
        } else {
            ENTRY_BARE
        };
        let entries_off = len
            .checked_sub(2 + n_values * entry_size)
            .filter(|&off| off >= BLOCK_HEADER_LEN)
            .ok_or_else(|| {
                StrataError::corrupt(location.offset, "data block trailer overflows the block")
            })?;
        Ok(Self {
            block,
            n_values,
            entries_off,
            entry_size,
            has_row_ranges,
        })
    }

    pub fn n_values(&self) -> usize {
        self.n_values
    }

    /// Raw block bytes, for in-place value access through the codec.
    pub fn bytes(&self) -> &[u8] {
        &self.block
    }

    /// Root offset of value `j` within the block.
    pub fn root(&self, j: usize) -> usize {
        debug_assert!(j < self.n_values);
        let off = self.entries_off + j * self.entry_size;
        u16::from_le_bytes(self.block[off..off + 2].try_into().unwrap()) as usize
    }

    /// Row group of value `j` in the next column; `None` in the last column.
    pub fn row_range(&self, j: usize) -> Option<Range<u64>> {
        if !self.has_row_ranges {
            return None;
        }
        debug_assert!(j < self.n_values);
        let off = self.entries_off + j * self.entry_size + 2;
        let start = get_u48(&self.block, off);
        let end = get_u48(&self.block, off + 6);
        Some(start..end)
    }

    /// Owned copy of value `j`.
    pub fn value<V: crate::codec::ColumnValue>(&self, j: usize) -> V {
        V::read_archived(&self.block, self.root(j))
    }

    /// Binary search for the best match for `probe` among the rows of this
    /// block (based at `first_row`) that fall inside `target_rows`. `bias`
    /// is `Less` to accept larger values (forward seek) or `Greater` to
    /// accept smaller ones (reverse seek); rows outside `target_rows` steer
    /// the search by position.
    pub fn find_best_match<V: crate::codec::ColumnValue>(
        &self,
        first_row: u64,
        target_rows: &Range<u64>,
        probe: &V,
        bias: std::cmp::Ordering,
    ) -> Option<usize> {
        use std::cmp::Ordering;

        let mut start = 0;
        let mut end = self.n_values;
        let mut best = None;
        while start < end {
            let mid = (start + end) / 2;
            let row = first_row + mid as u64;
            match super::index_block::range_compare(target_rows, row) {
                Ordering::Equal => {
                    let cmp = V::cmp_archived(&self.block, self.root(mid), probe).reverse();
                    match cmp {
                        Ordering::Less => end = mid,
                        Ordering::Equal => return Some(mid),
                        Ordering::Greater => start = mid + 1,
                    }
                    if cmp == bias {
                        best = Some(mid);
                    }
                }
                Ordering::Less => end = mid,
                Ordering::Greater => start = mid + 1,
            }
        }
        best
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ColumnValue;
    use crate::format::block::{BlockWriter, FLAG_ROW_RANGES};
    use crate::format::{BlockKind, ChecksumKind};
    use crate::io::MemFile;

    fn seal_and_read(
        builder: &mut DataBlockBuilder,
        expect_rows: bool,
    ) -> (DataBlockReader, usize) {
        let finished = builder.finish().unwrap().unwrap();
        let size = finished.buf.len();
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let flags = if expect_rows { FLAG_ROW_RANGES } else { 0 };
        let mut buf = finished.buf;
        let loc = writer.write_block(BlockKind::Data, flags, &mut buf).unwrap();
        let block = super::super::block::read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::Data)
            .unwrap();
        (DataBlockReader::new(block, loc, expect_rows).unwrap(), size)
    }

    #[test]
    fn test_round_trip_last_column() {
        let mut builder = DataBlockBuilder::new(8192, false);
        let mut scratch = Vec::new();
        for i in 0..100u64 {
            scratch.clear();
            (i * 3).archive(&mut scratch);
            assert!(!builder.needs_commit(scratch.len(), u64::ALIGN));
            builder.push(&scratch, u64::ALIGN, None).unwrap();
        }
        let (reader, size) = seal_and_read(&mut builder, false);
        assert_eq!(size, 8192);
        assert_eq!(reader.n_values(), 100);
        for i in 0..100u64 {
            assert_eq!(reader.value::<u64>(i as usize), i * 3);
            assert_eq!(reader.row_range(i as usize), None);
        }
    }

    #[test]
    fn test_round_trip_with_row_ranges() {
        let mut builder = DataBlockBuilder::new(8192, true);
        let mut scratch = Vec::new();
        for i in 0..10u64 {
            scratch.clear();
            i.archive(&mut scratch);
            builder
                .push(&scratch, u64::ALIGN, Some(i * 4..(i + 1) * 4))
                .unwrap();
        }
        let (reader, _) = seal_and_read(&mut builder, true);
        assert_eq!(reader.row_range(7), Some(28..32));
        assert_eq!(reader.row_range(0), Some(0..4));
    }

    #[test]
    fn test_commit_threshold() {
        let mut builder = DataBlockBuilder::new(4096, false);
        let value = vec![0xABu8; 500];
        let mut scratch = Vec::new();
        let mut pushed = 0;
        loop {
            scratch.clear();
            value.archive(&mut scratch);
            if builder.needs_commit(scratch.len(), <Vec<u8>>::ALIGN) {
                break;
            }
            builder.push(&scratch, <Vec<u8>>::ALIGN, None).unwrap();
            pushed += 1;
        }
        // 504 bytes of payload and 2 of trailer per value in a 4 KiB block.
        assert_eq!(pushed, 8);
        let (reader, size) = seal_and_read(&mut builder, false);
        assert_eq!(size, 4096);
        assert_eq!(reader.n_values(), 8);
        assert_eq!(reader.value::<Vec<u8>>(3), value);
    }

    #[test]
    fn test_oversize_value_grows_block() {
        let mut builder = DataBlockBuilder::new(8192, false);
        let blob = vec![7u8; 32 * 1024];
        let mut scratch = Vec::new();
        blob.archive(&mut scratch);
        assert!(!builder.needs_commit(scratch.len(), <Vec<u8>>::ALIGN));
        builder.push(&scratch, <Vec<u8>>::ALIGN, None).unwrap();

        let (reader, size) = seal_and_read(&mut builder, false);
        assert_eq!(size, 65536);
        assert_eq!(reader.value::<Vec<u8>>(0), blob);
    }

    #[test]
    fn test_alignment_of_roots() {
        let mut builder = DataBlockBuilder::new(8192, false);
        let mut scratch = Vec::new();
        1u8.archive(&mut scratch);
        builder.push(&scratch, u8::ALIGN, None).unwrap();
        scratch.clear();
        2u64.archive(&mut scratch);
        builder.push(&scratch, u64::ALIGN, None).unwrap();

        let (reader, _) = seal_and_read(&mut builder, false);
        assert_eq!(reader.root(0) % u8::ALIGN, 0);
        assert_eq!(reader.root(1) % u64::ALIGN, 0);
        assert_eq!(reader.value::<u64>(1), 2);
    }

    #[test]
    fn test_restart_recycles_buffer() {
        let mut builder = DataBlockBuilder::new(4096, false);
        let mut scratch = Vec::new();
        9u64.archive(&mut scratch);
        builder.push(&scratch, u64::ALIGN, None).unwrap();
        let finished = builder.finish().unwrap().unwrap();
        builder.restart(finished.buf, 1);
        assert!(builder.is_empty());
        assert_eq!(builder.first_row(), 1);

        builder.push(&scratch, u64::ALIGN, None).unwrap();
        let (reader, _) = seal_and_read(&mut builder, false);
        assert_eq!(reader.value::<u64>(0), 9);
    }

    #[test]
    fn test_empty_finish() {
        let mut builder = DataBlockBuilder::new(8192, false);
        assert!(builder.finish().unwrap().is_none());
    }
}
