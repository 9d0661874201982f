//! Streaming column writer: the single-pass tree builder.
//!
//! The writer receives one column's rows in sorted order and builds the
//! column's data blocks, its two index trees, and (optionally) its filter
//! tree, holding at most one in-progress block per tree level. That stack of
//! open builders is the whole writer state, which is what bounds writer
//! memory by tree height rather than file size.
//!
//! A push lands in the level-0 data builder. When a block would overflow it
//! is sealed, written, and summarized as an entry pushed one level up; a
//! level that overflows in turn seals and promotes the same way. At end of
//! column every level drains upward, leaving a single root per tree.
//!
//! Because every level seals under the same thresholds (minimum branching
//! factor, minimum block size), every data block sits at the same depth and
//! the tree stays balanced. An oversize value widens its block in 2x steps
//! instead of forking a level.

use std::ops::Range;

use crate::codec::ColumnValue;
use crate::error::{Result, StrataError};
use crate::format::block::{BlockWriter, FLAG_FILTER_PTRS, FLAG_ROW_RANGES};
use crate::format::data_block::DataBlockBuilder;
use crate::format::filter_block::{fingerprint, FilterBits, FilterBlockBuilder, FILTER_BLOCK_ROWS};
use crate::format::index_block::{
    IndexEntry, RowIndexBlockBuilder, RowIndexEntry, ValueIndexBlockBuilder,
};
use crate::format::trailer::ColumnRoots;
use crate::format::{BlockKind, BlockLocation, ChildPtr, MAX_ROW};
use crate::io::FileWrite;

/// Per-column write options.
#[derive(Debug, Clone, Copy)]
pub struct ColumnOptions {
    /// Build the value-index tree. Disable for columns that are only ever
    /// scanned or entered by row.
    pub value_index: bool,
    /// Build a filter tree at the given remainder width.
    pub filter: Option<FilterBits>,
}

impl Default for ColumnOptions {
    fn default() -> Self {
        Self {
            value_index: true,
            filter: None,
        }
    }
}

/// Shared sizing knobs, copied out of [`Parameters`](super::Parameters).
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeShape {
    pub data_block_size: usize,
    pub index_block_size: usize,
    pub min_branch: usize,
}

/// Row base of the filter block covering `[first_row, last_row]`, if the
/// span does not cross a filter block boundary.
fn covering_filter_base(first_row: u64, last_row: u64) -> Option<u64> {
    (first_row / FILTER_BLOCK_ROWS == last_row / FILTER_BLOCK_ROWS)
        .then(|| first_row & !(FILTER_BLOCK_ROWS - 1))
}

// ============================================================================
// Index level stacks
// ============================================================================

/// Stack of open value-index builders, one per tree level. Also used for
/// the filter-index tree, which shares the value-index block format.
struct ValueIndexStack {
    levels: Vec<ValueIndexBlockBuilder>,
    kind: BlockKind,
    shape: TreeShape,
    with_filter: bool,
    align: usize,
}

impl ValueIndexStack {
    fn new(kind: BlockKind, shape: TreeShape, with_filter: bool, align: usize) -> Self {
        Self {
            levels: Vec::new(),
            kind,
            shape,
            with_filter,
            align,
        }
    }

    fn flags(&self) -> u8 {
        if self.with_filter {
            FLAG_FILTER_PTRS
        } else {
            0
        }
    }

    fn new_level(&self) -> ValueIndexBlockBuilder {
        ValueIndexBlockBuilder::new(
            self.shape.index_block_size,
            self.shape.min_branch,
            self.with_filter,
            self.align,
        )
    }

    /// Push `entry` at `level`, sealing and promoting first if the open
    /// block is full. Recursion depth is the tree height.
    fn push<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
        level: usize,
        entry: IndexEntry,
    ) -> Result<()> {
        if self.levels.len() == level {
            self.levels.push(self.new_level());
        }
        if self.levels[level].needs_commit(&entry) {
            let finished = self.levels[level]
                .finish()?
                .expect("a committing builder is not empty");
            let mut buf = finished.buf;
            let location = blocks.write_block(self.kind, self.flags(), &mut buf)?;
            self.levels[level].restart(buf);

            let summary = finished.summary;
            self.push(
                blocks,
                level + 1,
                IndexEntry {
                    first_row: summary.first_row,
                    child: ChildPtr {
                        location,
                        is_index: true,
                    },
                    filter_row_base: self
                        .with_filter
                        .then(|| covering_filter_base(summary.first_row, entry.first_row - 1))
                        .flatten(),
                    first_value: summary.first_value,
                    last_value: summary.last_value,
                },
            )?;
        }
        self.levels[level].push(entry)
    }

    /// Drain every level upward and return the root block, if any entries
    /// were ever pushed.
    fn finish<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
        column_rows: u64,
    ) -> Result<Option<BlockLocation>> {
        let mut level = 0;
        let mut root = None;
        while level < self.levels.len() {
            if let Some(finished) = self.levels[level].finish()? {
                let mut buf = finished.buf;
                let location = blocks.write_block(self.kind, self.flags(), &mut buf)?;
                if level + 1 == self.levels.len() {
                    root = Some(location);
                } else {
                    let summary = finished.summary;
                    self.push(
                        blocks,
                        level + 1,
                        IndexEntry {
                            first_row: summary.first_row,
                            child: ChildPtr {
                                location,
                                is_index: true,
                            },
                            filter_row_base: self
                                .with_filter
                                .then(|| covering_filter_base(summary.first_row, column_rows - 1))
                                .flatten(),
                            first_value: summary.first_value,
                            last_value: summary.last_value,
                        },
                    )?;
                }
            }
            level += 1;
        }
        Ok(root)
    }
}

/// Stack of open row-index builders, one per tree level.
struct RowIndexStack {
    levels: Vec<RowIndexBlockBuilder>,
    shape: TreeShape,
}

impl RowIndexStack {
    fn new(shape: TreeShape) -> Self {
        Self {
            levels: Vec::new(),
            shape,
        }
    }

    fn push<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
        level: usize,
        entry: RowIndexEntry,
    ) -> Result<()> {
        if self.levels.len() == level {
            self.levels
                .push(RowIndexBlockBuilder::new(
                    self.shape.index_block_size,
                    self.shape.min_branch,
                ));
        }
        if self.levels[level].needs_commit() {
            let (mut buf, first_row, _) = self.levels[level]
                .finish()?
                .expect("a committing builder is not empty");
            let location = blocks.write_block(BlockKind::RowIndex, 0, &mut buf)?;
            self.levels[level].restart(buf);
            self.push(
                blocks,
                level + 1,
                RowIndexEntry {
                    first_row,
                    child: ChildPtr {
                        location,
                        is_index: true,
                    },
                },
            )?;
        }
        self.levels[level].push(entry)
    }

    fn finish<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
    ) -> Result<Option<BlockLocation>> {
        let mut level = 0;
        let mut root = None;
        while level < self.levels.len() {
            if let Some((mut buf, first_row, _)) = self.levels[level].finish()? {
                let location = blocks.write_block(BlockKind::RowIndex, 0, &mut buf)?;
                if level + 1 == self.levels.len() {
                    root = Some(location);
                } else {
                    self.push(
                        blocks,
                        level + 1,
                        RowIndexEntry {
                            first_row,
                            child: ChildPtr {
                                location,
                                is_index: true,
                            },
                        },
                    )?;
                }
            }
            level += 1;
        }
        Ok(root)
    }
}

// ============================================================================
// Filter tree
// ============================================================================

/// Filter blocks plus the filter-index tree over them. The value bounds of
/// the current filter block are tracked here because the block builder only
/// sees fingerprints.
struct FilterTree {
    builder: FilterBlockBuilder,
    index: ValueIndexStack,
    row_base: u64,
    first_value: Option<Vec<u8>>,
    last_value: Vec<u8>,
}

impl FilterTree {
    fn new(bits: FilterBits, shape: TreeShape, align: usize) -> Self {
        Self {
            builder: FilterBlockBuilder::new(bits, shape.index_block_size),
            index: ValueIndexStack::new(BlockKind::FilterIndex, shape, false, align),
            row_base: 0,
            first_value: None,
            last_value: Vec::new(),
        }
    }

    fn push<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
        archived: &[u8],
    ) -> Result<()> {
        if self.first_value.is_none() {
            self.first_value = Some(archived.to_vec());
        }
        self.last_value.clear();
        self.last_value.extend_from_slice(archived);
        self.builder.push(fingerprint(archived));
        if self.builder.is_full() {
            self.seal(blocks)?;
        }
        Ok(())
    }

    fn seal<W: FileWrite>(&mut self, blocks: &mut BlockWriter<W>) -> Result<()> {
        let rows_covered = self.builder.len() as u64;
        let Some(mut buf) = self.builder.finish()? else {
            return Ok(());
        };
        let location = blocks.write_block(BlockKind::Filter, 0, &mut buf)?;
        tracing::debug!(
            offset = location.offset,
            rows = rows_covered,
            row_base = self.row_base,
            "filter block sealed"
        );
        self.index.push(
            blocks,
            0,
            IndexEntry {
                first_row: self.row_base,
                child: ChildPtr {
                    location,
                    is_index: false,
                },
                filter_row_base: None,
                first_value: self.first_value.take().unwrap_or_default(),
                last_value: std::mem::take(&mut self.last_value),
            },
        )?;
        self.row_base += rows_covered;
        Ok(())
    }

    fn finish<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
        column_rows: u64,
    ) -> Result<Option<BlockLocation>> {
        self.seal(blocks)?;
        self.index.finish(blocks, column_rows)
    }
}

// ============================================================================
// Column writer
// ============================================================================

/// Builds one column of a strata file from a sorted stream of values.
///
/// `tail` is the row group the next column produced for each value; it is
/// required on every column but the last and must abut the previous value's
/// range.
pub struct ColumnWriter<V: ColumnValue> {
    column: usize,
    data: DataBlockBuilder,
    value_index: Option<ValueIndexStack>,
    row_index: RowIndexStack,
    filter: Option<FilterTree>,
    rows: u64,
    /// Last value of the current row group, for the sort-order check.
    group_last: Option<V>,
    /// Archived first/last values of the open data block.
    block_first_value: Option<Vec<u8>>,
    block_last_value: Vec<u8>,
    scratch: Vec<u8>,
    has_row_ranges: bool,
    next_tail_start: u64,
}

impl<V: ColumnValue> ColumnWriter<V> {
    pub(crate) fn new(
        column: usize,
        is_last_column: bool,
        options: ColumnOptions,
        shape: TreeShape,
    ) -> Self {
        debug_assert!(V::ALIGN.is_power_of_two() && V::ALIGN <= crate::codec::MAX_VALUE_ALIGN);
        let has_row_ranges = !is_last_column;
        Self {
            column,
            data: DataBlockBuilder::new(shape.data_block_size, has_row_ranges),
            value_index: options
                .value_index
                .then(|| {
                    ValueIndexStack::new(
                        BlockKind::ValueIndex,
                        shape,
                        options.filter.is_some(),
                        V::ALIGN,
                    )
                }),
            row_index: RowIndexStack::new(shape),
            filter: options.filter.map(|bits| FilterTree::new(bits, shape, V::ALIGN)),
            rows: 0,
            group_last: None,
            block_first_value: None,
            block_last_value: Vec::new(),
            scratch: Vec::new(),
            has_row_ranges,
            next_tail_start: 0,
        }
    }

    /// Rows pushed so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Start a new row group: the sort order restarts with it.
    pub fn start_group(&mut self) {
        self.group_last = None;
    }

    /// Push the next sorted value, with the row group it owns in the next
    /// column (required on every column but the last).
    pub fn push<W: FileWrite>(
        &mut self,
        blocks: &mut BlockWriter<W>,
        value: &V,
        tail: Option<Range<u64>>,
    ) -> Result<()> {
        if self.rows >= MAX_ROW {
            return Err(StrataError::BoundsExceeded(format!(
                "column {} exceeds 48-bit row capacity",
                self.column
            )));
        }
        if let Some(last) = &self.group_last {
            if value <= last {
                return Err(StrataError::OutOfOrder {
                    column: self.column,
                });
            }
        }
        debug_assert_eq!(tail.is_some(), self.has_row_ranges);
        if let Some(tail) = &tail {
            debug_assert_eq!(tail.start, self.next_tail_start, "row groups must abut");
            self.next_tail_start = tail.end;
        }

        self.scratch.clear();
        value.archive(&mut self.scratch);

        if let Some(filter) = &mut self.filter {
            filter.push(blocks, &self.scratch)?;
        }

        if self.data.needs_commit(self.scratch.len(), V::ALIGN) {
            self.seal_data(blocks)?;
        }
        self.data.push(&self.scratch, V::ALIGN, tail)?;

        if self.value_index.is_some() {
            if self.block_first_value.is_none() {
                self.block_first_value = Some(self.scratch.clone());
            }
            self.block_last_value.clear();
            self.block_last_value.extend_from_slice(&self.scratch);
        }
        self.group_last = Some(value.clone());
        self.rows += 1;
        Ok(())
    }

    /// Seal the open data block and promote its summary into both index
    /// trees.
    fn seal_data<W: FileWrite>(&mut self, blocks: &mut BlockWriter<W>) -> Result<()> {
        let Some(finished) = self.data.finish()? else {
            return Ok(());
        };
        let flags = if self.has_row_ranges { FLAG_ROW_RANGES } else { 0 };
        let mut buf = finished.buf;
        let location = blocks.write_block(BlockKind::Data, flags, &mut buf)?;
        self.data.restart(buf, self.rows);

        let first_row = finished.first_row;
        let last_row = self.rows - 1;
        tracing::debug!(
            column = self.column,
            offset = location.offset,
            values = finished.n_values,
            first_row,
            "data block sealed"
        );

        let child = ChildPtr {
            location,
            is_index: false,
        };
        if let Some(stack) = &mut self.value_index {
            let entry = IndexEntry {
                first_row,
                child,
                filter_row_base: self
                    .filter
                    .is_some()
                    .then(|| covering_filter_base(first_row, last_row))
                    .flatten(),
                first_value: self.block_first_value.take().unwrap_or_default(),
                last_value: std::mem::take(&mut self.block_last_value),
            };
            stack.push(blocks, 0, entry)?;
        }
        self.row_index.push(blocks, 0, RowIndexEntry { first_row, child })
    }

    /// Drain every open block and return the column's roots for the file
    /// trailer.
    pub fn finish<W: FileWrite>(&mut self, blocks: &mut BlockWriter<W>) -> Result<ColumnRoots> {
        if self.rows == 0 {
            return Ok(ColumnRoots::default());
        }
        self.seal_data(blocks)?;
        let value_index_root = match &mut self.value_index {
            Some(stack) => stack.finish(blocks, self.rows)?,
            None => None,
        };
        let row_index_root = self.row_index.finish(blocks)?;
        let filter_index_root = match &mut self.filter {
            Some(filter) => filter.finish(blocks, self.rows)?,
            None => None,
        };
        tracing::debug!(
            column = self.column,
            rows = self.rows,
            "column finished"
        );
        Ok(ColumnRoots {
            rows: self.rows,
            value_index_root,
            row_index_root,
            filter_index_root,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::block::read_block;
    use crate::format::index_block::RowIndexBlockReader;
    use crate::format::ChecksumKind;
    use crate::io::MemFile;

    fn shape() -> TreeShape {
        TreeShape {
            data_block_size: 4096,
            index_block_size: 4096,
            min_branch: 4,
        }
    }

    fn write_column(n: u64) -> (MemFile, ColumnRoots) {
        let file = MemFile::new();
        let mut blocks = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let mut col: ColumnWriter<u64> =
            ColumnWriter::new(0, true, ColumnOptions::default(), shape());
        for i in 0..n {
            col.push(&mut blocks, &(i * 2), None).unwrap();
        }
        let roots = col.finish(&mut blocks).unwrap();
        (file, roots)
    }

    /// Walk the row-index tree counting rows under each data block.
    fn count_tree_rows(file: &MemFile, loc: BlockLocation, node_end: u64) -> (u64, usize) {
        let block = read_block(file, ChecksumKind::Xxh3, loc, BlockKind::RowIndex).unwrap();
        let reader = RowIndexBlockReader::new(block, loc).unwrap();
        let mut rows = 0;
        let mut depth = 1;
        for i in 0..reader.n_entries() {
            let entry = reader.entry(i).unwrap();
            let child_rows = reader.child_rows(i, node_end).unwrap();
            if entry.child.is_index {
                let (r, d) = count_tree_rows(file, entry.child.location, child_rows.end);
                rows += r;
                depth = depth.max(1 + d);
            } else {
                rows += child_rows.end - child_rows.start;
            }
        }
        (rows, depth)
    }

    #[test]
    fn test_empty_column() {
        let (_, roots) = write_column(0);
        assert_eq!(roots.rows, 0);
        assert!(roots.value_index_root.is_none());
        assert!(roots.row_index_root.is_none());
    }

    #[test]
    fn test_single_block_column() {
        let (file, roots) = write_column(100);
        assert_eq!(roots.rows, 100);
        // Both roots exist even for a single data block.
        let row_root = roots.row_index_root.unwrap();
        let (rows, depth) = count_tree_rows(&file, row_root, 100);
        assert_eq!(rows, 100);
        assert_eq!(depth, 1);
        assert!(roots.filter_index_root.is_none());
    }

    #[test]
    fn test_multi_level_tree_counts_all_rows() {
        // 4 KiB data blocks hold ~400 u64 rows and a 4 KiB row-index block
        // ~340 entries, so 500 000 rows forces an interior row-index level.
        let (file, roots) = write_column(500_000);
        let (rows, depth) = count_tree_rows(&file, roots.row_index_root.unwrap(), 500_000);
        assert_eq!(rows, 500_000);
        assert!(depth >= 2, "expected an interior level, got depth {depth}");
    }

    #[test]
    fn test_out_of_order_rejected() {
        let file = MemFile::new();
        let mut blocks = BlockWriter::new(file, ChecksumKind::Xxh3, None);
        let mut col: ColumnWriter<u64> =
            ColumnWriter::new(0, true, ColumnOptions::default(), shape());
        col.push(&mut blocks, &10, None).unwrap();
        let err = col.push(&mut blocks, &10, None).unwrap_err();
        assert!(matches!(err, StrataError::OutOfOrder { column: 0 }));

        // A new row group restarts the order.
        col.start_group();
        col.push(&mut blocks, &3, None).unwrap();
    }

    #[test]
    fn test_filter_tree_built() {
        let file = MemFile::new();
        let mut blocks = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let options = ColumnOptions {
            value_index: true,
            filter: Some(FilterBits::B16),
        };
        let mut col: ColumnWriter<u64> = ColumnWriter::new(0, true, options, shape());
        for i in 0..1000u64 {
            col.push(&mut blocks, &i, None).unwrap();
        }
        let roots = col.finish(&mut blocks).unwrap();
        assert!(roots.filter_index_root.is_some());
        assert!(roots.value_index_root.is_some());
    }

    #[test]
    fn test_covering_filter_base() {
        assert_eq!(covering_filter_base(0, 100), Some(0));
        assert_eq!(covering_filter_base(65_535, 65_535), Some(0));
        assert_eq!(covering_filter_base(65_535, 65_536), None);
        assert_eq!(covering_filter_base(65_536, 70_000), Some(65_536));
        assert_eq!(covering_filter_base(200_000, 200_001), Some(196_608));
    }
}
