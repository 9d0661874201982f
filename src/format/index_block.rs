//! Index blocks: interior nodes of the value-index and row-index trees.
//!
//! Each column keeps two parallel trees over the same data blocks. The
//! **value index** supports seeks by value; its entries are variable length
//! because they embed the first and last archived value of the child
//! subtree. The **row index** supports seeks by row number and sequential
//! scans; its entries are fixed 12 bytes, so the block needs no entry-offset
//! map.
//!
//! ## Value-index block layout
//!
//! ```text
//! [block prefix: 16 bytes]
//! [entries, back to back:]
//!   first_row:       u48      first row of the child subtree
//!   child:           u48      packed block pointer (offset, shift, kind)
//!   filter_row_base: u48      only when the column has a filter; row base
//!                             of the covering filter block, all-ones when
//!                             the subtree spans a filter boundary
//!   first_value_len: varint
//!   <pad to value alignment>
//!   first_value:     bytes    archived form
//!   last_value_len:  varint
//!   <pad to value alignment>
//!   last_value:      bytes
//! [zero padding]
//! [entry-offset map: u32 per entry]
//! [entry_count: u16]
//! ```
//!
//! ## Row-index block layout
//!
//! ```text
//! [block prefix: 16 bytes]
//! [entries: first_row: u48, child: u48, fixed 12 bytes each]
//! [zero padding]
//! [entry_count: u16]
//! ```
//!
//! Searching a value index is a binary search on entry bounds; searching a
//! row index is a binary search on `first_row`. An index entry's bounds
//! exactly equal the first/last value and first row of its child subtree.

use std::cmp::Ordering;
use std::ops::Range;

use crate::codec::ColumnValue;
use crate::error::{Result, StrataError};
use crate::format::{
    align_up, decode_varint, encode_varint, get_u48, legal_block_size, put_u48, varint_len,
    BlockLocation, ChildPtr, ABSENT_U48, BLOCK_HEADER_LEN, MAX_BLOCK_ENTRIES,
};
use crate::io::BlockHandle;

const ROW_ENTRY_LEN: usize = 12;

// ============================================================================
// Entries
// ============================================================================

/// One value-index entry, as assembled by the column writer. The embedded
/// values are archived bytes; the codec that produced them owns their
/// meaning.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub first_row: u64,
    pub child: ChildPtr,
    /// Row base of the filter block covering the child subtree, when the
    /// column has a filter and the subtree does not span a filter boundary.
    pub filter_row_base: Option<u64>,
    pub first_value: Vec<u8>,
    pub last_value: Vec<u8>,
}

/// One row-index entry.
#[derive(Debug, Clone, Copy)]
pub struct RowIndexEntry {
    pub first_row: u64,
    pub child: ChildPtr,
}

/// Summary of a sealed index block, promoted to the level above.
#[derive(Debug, Clone)]
pub struct IndexSummary {
    pub first_row: u64,
    pub first_value: Vec<u8>,
    pub last_value: Vec<u8>,
    pub n_entries: usize,
}

/// A sealed index block ready for the block layer.
pub struct FinishedIndexBlock {
    pub buf: Vec<u8>,
    pub summary: IndexSummary,
}

// ============================================================================
// Value-index builder
// ============================================================================

/// Accumulates entries for one value-index (or filter-index) block.
pub struct ValueIndexBlockBuilder {
    buf: Vec<u8>,
    offsets: Vec<u32>,
    target: usize,
    min_size: usize,
    min_branch: usize,
    with_filter: bool,
    align: usize,
    first_row: u64,
    first_value: Vec<u8>,
    last_value: Vec<u8>,
}

impl ValueIndexBlockBuilder {
    pub fn new(min_size: usize, min_branch: usize, with_filter: bool, align: usize) -> Self {
        let mut buf = Vec::with_capacity(min_size);
        buf.resize(BLOCK_HEADER_LEN, 0);
        Self {
            buf,
            offsets: Vec::new(),
            target: min_size,
            min_size,
            min_branch,
            with_filter,
            align,
            first_row: 0,
            first_value: Vec::new(),
            last_value: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn fixed_len(&self) -> usize {
        if self.with_filter {
            18
        } else {
            12
        }
    }

    fn encoded_len(&self, entry: &IndexEntry, from: usize) -> usize {
        let mut pos = from + self.fixed_len();
        pos += varint_len(entry.first_value.len() as u64);
        pos = align_up(pos, self.align);
        pos += entry.first_value.len();
        pos += varint_len(entry.last_value.len() as u64);
        pos = align_up(pos, self.align);
        pos += entry.last_value.len();
        pos - from
    }

    fn trailer_len(&self, n: usize) -> usize {
        n * 4 + 2
    }

    /// Would pushing `entry` overflow this block? An index block does not
    /// commit before reaching the minimum branching factor; it grows
    /// instead.
    pub fn needs_commit(&self, entry: &IndexEntry) -> bool {
        let n = self.offsets.len();
        if n == 0 {
            return false;
        }
        let projected =
            self.buf.len() + self.encoded_len(entry, self.buf.len()) + self.trailer_len(n + 1);
        (projected > self.target && n >= self.min_branch) || n >= MAX_BLOCK_ENTRIES
    }

    pub fn push(&mut self, entry: IndexEntry) -> Result<()> {
        debug_assert!(!self.needs_commit(&entry));
        let start = self.buf.len();
        if start > u32::MAX as usize {
            return Err(StrataError::BoundsExceeded(
                "index entry offset exceeds u32 capacity".to_string(),
            ));
        }
        let mut projected =
            start + self.encoded_len(&entry, start) + self.trailer_len(self.offsets.len() + 1);
        while projected > self.target {
            self.target = legal_block_size(self.target + 1, self.min_size)?;
            projected =
                start + self.encoded_len(&entry, start) + self.trailer_len(self.offsets.len() + 1);
        }

        self.offsets.push(start as u32);
        put_u48(&mut self.buf, entry.first_row);
        put_u48(&mut self.buf, entry.child.packed());
        if self.with_filter {
            put_u48(&mut self.buf, entry.filter_row_base.unwrap_or(ABSENT_U48));
        }
        encode_varint(entry.first_value.len() as u64, &mut self.buf);
        let root = align_up(self.buf.len(), self.align);
        self.buf.resize(root, 0);
        self.buf.extend_from_slice(&entry.first_value);
        encode_varint(entry.last_value.len() as u64, &mut self.buf);
        let root = align_up(self.buf.len(), self.align);
        self.buf.resize(root, 0);
        self.buf.extend_from_slice(&entry.last_value);

        if self.offsets.len() == 1 {
            self.first_row = entry.first_row;
            self.first_value = entry.first_value;
        }
        self.last_value = entry.last_value;
        Ok(())
    }

    /// Seal the block. Returns `None` if no entries were pushed.
    pub fn finish(&mut self) -> Result<Option<FinishedIndexBlock>> {
        let n = self.offsets.len();
        if n == 0 {
            return Ok(None);
        }
        let total = self.buf.len() + self.trailer_len(n);
        let size = legal_block_size(total, self.min_size)?;

        self.buf.resize(size - self.trailer_len(n), 0);
        for offset in &self.offsets {
            self.buf.extend_from_slice(&offset.to_le_bytes());
        }
        self.buf.extend_from_slice(&(n as u16).to_le_bytes());
        debug_assert_eq!(self.buf.len(), size);

        let buf = std::mem::take(&mut self.buf);
        Ok(Some(FinishedIndexBlock {
            buf,
            summary: IndexSummary {
                first_row: self.first_row,
                first_value: std::mem::take(&mut self.first_value),
                last_value: std::mem::take(&mut self.last_value),
                n_entries: n,
            },
        }))
    }

    /// Re-arm the builder, recycling the written buffer.
    pub fn restart(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(BLOCK_HEADER_LEN, 0);
        self.buf = buf;
        self.offsets.clear();
        self.target = self.min_size;
    }
}

// ============================================================================
// Row-index builder
// ============================================================================

/// Accumulates fixed 12-byte entries for one row-index block.
pub struct RowIndexBlockBuilder {
    buf: Vec<u8>,
    n: usize,
    target: usize,
    min_size: usize,
    min_branch: usize,
    first_row: u64,
}

impl RowIndexBlockBuilder {
    pub fn new(min_size: usize, min_branch: usize) -> Self {
        let mut buf = Vec::with_capacity(min_size);
        buf.resize(BLOCK_HEADER_LEN, 0);
        Self {
            buf,
            n: 0,
            target: min_size,
            min_size,
            min_branch,
            first_row: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn needs_commit(&self) -> bool {
        if self.n == 0 {
            return false;
        }
        let projected = self.buf.len() + ROW_ENTRY_LEN + 2;
        (projected > self.target && self.n >= self.min_branch) || self.n >= MAX_BLOCK_ENTRIES
    }

    pub fn push(&mut self, entry: RowIndexEntry) -> Result<()> {
        debug_assert!(!self.needs_commit());
        let projected = self.buf.len() + ROW_ENTRY_LEN + 2;
        if projected > self.target {
            self.target = legal_block_size(projected, self.min_size)?;
        }
        if self.n == 0 {
            self.first_row = entry.first_row;
        }
        put_u48(&mut self.buf, entry.first_row);
        put_u48(&mut self.buf, entry.child.packed());
        self.n += 1;
        Ok(())
    }

    /// Seal the block. Returns the buffer and the block's first row.
    pub fn finish(&mut self) -> Result<Option<(Vec<u8>, u64, usize)>> {
        if self.n == 0 {
            return Ok(None);
        }
        let size = legal_block_size(self.buf.len() + 2, self.min_size)?;
        self.buf.resize(size - 2, 0);
        self.buf
            .extend_from_slice(&(self.n as u16).to_le_bytes());

        let buf = std::mem::take(&mut self.buf);
        let n = self.n;
        Ok(Some((buf, self.first_row, n)))
    }

    pub fn restart(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        buf.resize(BLOCK_HEADER_LEN, 0);
        self.buf = buf;
        self.n = 0;
    }
}

// ============================================================================
// Value-index reader
// ============================================================================

/// A parsed value-index entry, with roots into the block image for in-place
/// comparison of the embedded bounds.
#[derive(Debug, Clone, Copy)]
pub struct ValueEntryRef {
    pub first_row: u64,
    pub child: ChildPtr,
    pub filter_row_base: Option<u64>,
    pub first_root: usize,
    pub last_root: usize,
}

/// Random access and search over one value-index block image.
#[derive(Clone)]
pub struct ValueIndexBlockReader {
    block: BlockHandle,
    location: BlockLocation,
    n: usize,
    map_off: usize,
    with_filter: bool,
    align: usize,
}

impl ValueIndexBlockReader {
    pub fn new(
        block: BlockHandle,
        location: BlockLocation,
        expect_filter: bool,
        align: usize,
    ) -> Result<Self> {
        let with_filter =
            super::block::block_flags(&block) & super::block::FLAG_FILTER_PTRS != 0;
        if with_filter != expect_filter {
            return Err(StrataError::corrupt(
                location.offset,
                "value-index filter flag does not match its column",
            ));
        }
        let len = block.len();
        let n = u16::from_le_bytes(block[len - 2..].try_into().unwrap()) as usize;
        let map_off = len
            .checked_sub(2 + n * 4)
            .filter(|&off| off >= BLOCK_HEADER_LEN)
            .ok_or_else(|| {
                StrataError::corrupt(location.offset, "entry-offset map overflows the block")
            })?;
        Ok(Self {
            block,
            location,
            n,
            map_off,
            with_filter,
            align,
        })
    }

    pub fn n_entries(&self) -> usize {
        self.n
    }

    pub fn bytes(&self) -> &[u8] {
        &self.block
    }

    fn corrupt(&self, detail: &str) -> StrataError {
        StrataError::corrupt(self.location.offset, detail)
    }

    /// Parse entry `i`.
    pub fn entry(&self, i: usize) -> Result<ValueEntryRef> {
        debug_assert!(i < self.n);
        let map = self.map_off + i * 4;
        let mut pos =
            u32::from_le_bytes(self.block[map..map + 4].try_into().unwrap()) as usize;
        let fixed = if self.with_filter { 18 } else { 12 };
        if pos < BLOCK_HEADER_LEN || pos + fixed > self.map_off {
            return Err(self.corrupt("index entry offset out of range"));
        }

        let first_row = get_u48(&self.block, pos);
        let child = ChildPtr::unpack(get_u48(&self.block, pos + 6))
            .map_err(|e| self.corrupt(&e))?;
        let filter_row_base = if self.with_filter {
            Some(get_u48(&self.block, pos + 12)).filter(|&base| base != ABSENT_U48)
        } else {
            None
        };
        pos += fixed;

        let first_len =
            decode_varint(&self.block[..self.map_off], &mut pos).map_err(|e| self.corrupt(&e))?;
        let first_root = align_up(pos, self.align);
        pos = first_root + first_len as usize;
        let last_len =
            decode_varint(&self.block[..self.map_off], &mut pos).map_err(|e| self.corrupt(&e))?;
        let last_root = align_up(pos, self.align);
        pos = last_root + last_len as usize;
        if pos > self.map_off {
            return Err(self.corrupt("index entry extends past the entry-offset map"));
        }

        Ok(ValueEntryRef {
            first_row,
            child,
            filter_row_base,
            first_root,
            last_root,
        })
    }

    /// Row range covered by entry `i`'s subtree; `node_end` bounds the last
    /// entry (it is the end of this block's own subtree).
    pub fn child_rows(&self, i: usize, node_end: u64) -> Result<Range<u64>> {
        let start = self.entry(i)?.first_row;
        let end = if i + 1 < self.n {
            self.entry(i + 1)?.first_row
        } else {
            node_end
        };
        Ok(start..end)
    }

    /// Entry whose subtree contains `row`, if any.
    pub fn find_row(&self, row: u64, node_end: u64) -> Result<Option<usize>> {
        let mut range = 0..self.n;
        while !range.is_empty() {
            let mid = (range.start + range.end) / 2;
            let rows = self.child_rows(mid, node_end)?;
            if row < rows.start {
                range.end = mid;
            } else if row >= rows.end {
                range.start = mid + 1;
            } else {
                return Ok(Some(mid));
            }
        }
        Ok(None)
    }

    /// Find the child subtree holding the best match for `probe` within
    /// `target_rows`, following the bound order: the search runs over
    /// `2 * n_entries` bound positions (first and last value of each entry),
    /// steering by row position for bounds outside `target_rows` and by
    /// value comparison inside it. `bias` is `Less` to accept larger values
    /// (forward seek) or `Greater` to accept smaller ones (reverse seek).
    pub fn find_best_match<V: ColumnValue>(
        &self,
        target_rows: &Range<u64>,
        node_end: u64,
        probe: &V,
        bias: Ordering,
    ) -> Result<Option<usize>> {
        let mut start = 0;
        let mut end = self.n * 2;
        let mut best = None;
        while start < end {
            let mid = (start + end) / 2;
            let entry = self.entry(mid / 2)?;
            let (row, root) = if mid % 2 == 0 {
                (entry.first_row, entry.first_root)
            } else {
                (self.child_rows(mid / 2, node_end)?.end - 1, entry.last_root)
            };
            let cmp = match range_compare(target_rows, row) {
                Ordering::Equal => {
                    let cmp = V::cmp_archived(&self.block, root, probe).reverse();
                    if cmp == Ordering::Equal {
                        return Ok(Some(mid / 2));
                    }
                    cmp
                }
                cmp => cmp,
            };
            if cmp == Ordering::Less {
                end = mid;
            } else {
                start = mid + 1;
            }
            if cmp == bias {
                best = Some(mid / 2);
            }
        }
        Ok(best)
    }
}

/// Position of `target` relative to `range`, from the perspective of a probe
/// sitting inside the range: rows before it compare `Greater` (move right),
/// rows past it compare `Less` (move left).
pub(crate) fn range_compare(range: &Range<u64>, target: u64) -> Ordering {
    if target < range.start {
        Ordering::Greater
    } else if target >= range.end {
        Ordering::Less
    } else {
        Ordering::Equal
    }
}

// ============================================================================
// Row-index reader
// ============================================================================

/// Random access and search over one row-index block image.
#[derive(Clone)]
pub struct RowIndexBlockReader {
    block: BlockHandle,
    n: usize,
}

impl RowIndexBlockReader {
    pub fn new(block: BlockHandle, location: BlockLocation) -> Result<Self> {
        let len = block.len();
        let n = u16::from_le_bytes(block[len - 2..].try_into().unwrap()) as usize;
        if BLOCK_HEADER_LEN + n * ROW_ENTRY_LEN > len - 2 {
            return Err(StrataError::corrupt(
                location.offset,
                "row-index entries overflow the block",
            ));
        }
        Ok(Self { block, n })
    }

    pub fn n_entries(&self) -> usize {
        self.n
    }

    pub fn entry(&self, i: usize) -> Result<RowIndexEntry> {
        debug_assert!(i < self.n);
        let pos = BLOCK_HEADER_LEN + i * ROW_ENTRY_LEN;
        let first_row = get_u48(&self.block, pos);
        let child = ChildPtr::unpack(get_u48(&self.block, pos + 6)).map_err(|e| {
            StrataError::InvariantViolated(format!("row-index entry {i}: {e}"))
        })?;
        Ok(RowIndexEntry { first_row, child })
    }

    /// Row range covered by entry `i`'s subtree.
    pub fn child_rows(&self, i: usize, node_end: u64) -> Result<Range<u64>> {
        let start = self.entry(i)?.first_row;
        let end = if i + 1 < self.n {
            self.entry(i + 1)?.first_row
        } else {
            node_end
        };
        Ok(start..end)
    }

    /// Entry whose subtree contains `row`, if any.
    pub fn find_row(&self, row: u64, node_end: u64) -> Result<Option<usize>> {
        let mut range = 0..self.n;
        while !range.is_empty() {
            let mid = (range.start + range.end) / 2;
            let rows = self.child_rows(mid, node_end)?;
            if row < rows.start {
                range.end = mid;
            } else if row >= rows.end {
                range.start = mid + 1;
            } else {
                return Ok(Some(mid));
            }
        }
        Ok(None)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ColumnValue;
    use crate::format::block::{read_block, BlockWriter, FLAG_FILTER_PTRS};
    use crate::format::{BlockKind, ChecksumKind};
    use crate::io::MemFile;

    fn archived(v: u64) -> Vec<u8> {
        let mut out = Vec::new();
        v.archive(&mut out);
        out
    }

    fn child(offset: u64, is_index: bool) -> ChildPtr {
        ChildPtr {
            location: BlockLocation { offset, shift: 1 },
            is_index,
        }
    }

    fn seal_value_block(
        builder: &mut ValueIndexBlockBuilder,
        with_filter: bool,
    ) -> ValueIndexBlockReader {
        let finished = builder.finish().unwrap().unwrap();
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let flags = if with_filter { FLAG_FILTER_PTRS } else { 0 };
        let mut buf = finished.buf;
        let loc = writer
            .write_block(BlockKind::ValueIndex, flags, &mut buf)
            .unwrap();
        let block = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::ValueIndex).unwrap();
        ValueIndexBlockReader::new(block, loc, with_filter, u64::ALIGN).unwrap()
    }

    #[test]
    fn test_value_entry_round_trip() {
        let mut builder = ValueIndexBlockBuilder::new(8192, 32, true, u64::ALIGN);
        for i in 0..10u64 {
            builder
                .push(IndexEntry {
                    first_row: i * 100,
                    child: child(i * 8192, false),
                    filter_row_base: (i % 2 == 0).then_some(0),
                    first_value: archived(i * 1000),
                    last_value: archived(i * 1000 + 999),
                })
                .unwrap();
        }
        let reader = seal_value_block(&mut builder, true);
        assert_eq!(reader.n_entries(), 10);

        let e = reader.entry(3).unwrap();
        assert_eq!(e.first_row, 300);
        assert_eq!(e.child, child(3 * 8192, false));
        assert_eq!(e.filter_row_base, None);
        assert_eq!(u64::read_archived(reader.bytes(), e.first_root), 3000);
        assert_eq!(u64::read_archived(reader.bytes(), e.last_root), 3999);
        assert_eq!(reader.entry(4).unwrap().filter_row_base, Some(0));
        assert_eq!(reader.child_rows(3, 1000).unwrap(), 300..400);
        assert_eq!(reader.child_rows(9, 1000).unwrap(), 900..1000);
    }

    #[test]
    fn test_value_find_row() {
        let mut builder = ValueIndexBlockBuilder::new(8192, 32, false, u64::ALIGN);
        for i in 0..8u64 {
            builder
                .push(IndexEntry {
                    first_row: i * 50,
                    child: child(i * 8192, true),
                    filter_row_base: None,
                    first_value: archived(i),
                    last_value: archived(i),
                })
                .unwrap();
        }
        let reader = seal_value_block(&mut builder, false);
        assert_eq!(reader.find_row(0, 400).unwrap(), Some(0));
        assert_eq!(reader.find_row(399, 400).unwrap(), Some(7));
        assert_eq!(reader.find_row(125, 400).unwrap(), Some(2));
        assert_eq!(reader.find_row(400, 400).unwrap(), None);
    }

    #[test]
    fn test_value_find_best_match() {
        // Entries over rows 0..80, values 0..800 in steps of 10.
        let mut builder = ValueIndexBlockBuilder::new(8192, 32, false, u64::ALIGN);
        for i in 0..8u64 {
            builder
                .push(IndexEntry {
                    first_row: i * 10,
                    child: child(i * 8192, false),
                    filter_row_base: None,
                    first_value: archived(i * 100),
                    last_value: archived(i * 100 + 90),
                })
                .unwrap();
        }
        let reader = seal_value_block(&mut builder, false);
        let all = 0..80u64;

        // Forward: first value >= probe.
        let hit = reader
            .find_best_match(&all, 80, &250u64, Ordering::Less)
            .unwrap();
        assert_eq!(hit, Some(2));
        // Exact bound match.
        let hit = reader
            .find_best_match(&all, 80, &300u64, Ordering::Less)
            .unwrap();
        assert_eq!(hit, Some(3));
        // Past the top: no match forward.
        let hit = reader
            .find_best_match(&all, 80, &10_000u64, Ordering::Less)
            .unwrap();
        assert_eq!(hit, None);
        // Reverse: last value <= probe.
        let hit = reader
            .find_best_match(&all, 80, &250u64, Ordering::Greater)
            .unwrap();
        assert_eq!(hit, Some(2));
        let hit = reader
            .find_best_match(&all, 80, &5u64, Ordering::Greater)
            .unwrap();
        assert_eq!(hit, None);

        // Row scoping: restrict to rows 30..50 and probe below its values.
        let hit = reader
            .find_best_match(&(30..50), 80, &0u64, Ordering::Less)
            .unwrap();
        assert_eq!(hit, Some(3));
    }

    #[test]
    fn test_value_block_growth_below_min_branch() {
        // Large embedded bounds exceed 4 KiB long before 32 entries; the
        // block must grow rather than commit early.
        let mut builder = ValueIndexBlockBuilder::new(4096, 32, false, <Vec<u8>>::ALIGN);
        let big = vec![0xEEu8; 400];
        for i in 0..32u64 {
            let mut val = Vec::new();
            big.archive(&mut val);
            let entry = IndexEntry {
                first_row: i,
                child: child(i * 4096, false),
                filter_row_base: None,
                first_value: val.clone(),
                last_value: val,
            };
            assert!(!builder.needs_commit(&entry), "entry {i} forced a commit");
            builder.push(entry).unwrap();
        }
        let finished = builder.finish().unwrap().unwrap();
        assert_eq!(finished.summary.n_entries, 32);
        assert!(finished.buf.len() > 4096);
        assert!(finished.buf.len().is_power_of_two());
    }

    #[test]
    fn test_row_index_round_trip() {
        let mut builder = RowIndexBlockBuilder::new(8192, 32);
        for i in 0..100u64 {
            builder
                .push(RowIndexEntry {
                    first_row: i * 7,
                    child: child(i * 8192, i % 2 == 0),
                })
                .unwrap();
        }
        let (mut buf, first_row, n) = builder.finish().unwrap().unwrap();
        assert_eq!((first_row, n), (0, 100));

        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let loc = writer
            .write_block(BlockKind::RowIndex, 0, &mut buf)
            .unwrap();
        let block = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::RowIndex).unwrap();
        let reader = RowIndexBlockReader::new(block, loc).unwrap();

        assert_eq!(reader.n_entries(), 100);
        let e = reader.entry(13).unwrap();
        assert_eq!(e.first_row, 91);
        assert!(!e.child.is_index);
        assert_eq!(reader.find_row(91, 700).unwrap(), Some(13));
        assert_eq!(reader.find_row(97, 700).unwrap(), Some(13));
        assert_eq!(reader.find_row(98, 700).unwrap(), Some(14));
        assert_eq!(reader.find_row(699, 700).unwrap(), Some(99));
        assert_eq!(reader.find_row(700, 700).unwrap(), None);
    }

    #[test]
    fn test_row_index_commit_threshold() {
        let mut builder = RowIndexBlockBuilder::new(8192, 32);
        let mut pushed = 0;
        while !builder.needs_commit() {
            builder
                .push(RowIndexEntry {
                    first_row: pushed,
                    child: child(0, false),
                })
                .unwrap();
            pushed += 1;
        }
        // (8192 - 16 - 2) / 12 entries fit in the first block.
        assert_eq!(pushed, 681);
    }
}
