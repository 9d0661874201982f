//! Cursors: the read-time state machine over one column.
//!
//! A cursor is scoped to a row-group range `[row_lo, row_hi)` within its
//! column and is always in one of three states: before the group, on a row,
//! or after the group. Seeks position it on a row or a terminal; `move_next`
//! and `move_prev` step one row at a time and stop at the terminals, which
//! never wrap.
//!
//! Positioned cursors hold one data block and at most one row-index block
//! per tree level; that stack doubles as the re-descent hint when a step
//! crosses a block boundary, so sequential scans touch each block once.
//! Cursors clone cheaply (row numbers plus shared block handles), which is
//! how callers fan out into sibling row groups.
//!
//! Value seeks descend the value-index tree. Because an index or data block
//! can span row-group boundaries, and values restart their sort order at
//! each group, the per-block binary search steers by row position for
//! entries outside the cursor's range and by value comparison inside it;
//! see [`ValueIndexBlockReader::find_best_match`].

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::Range;
use std::sync::Arc;

use crate::codec::ColumnValue;
use crate::error::{Result, StrataError};
use crate::format::data_block::DataBlockReader;
use crate::format::filter_block::{fingerprint, FilterBlockReader};
use crate::format::index_block::{RowIndexBlockReader, ValueIndexBlockReader};
use crate::format::trailer::ColumnRoots;
use crate::format::{BlockKind, BlockLocation};
use crate::read::file::LayerFile;

/// Seek direction: forward positions to the least row whose value is `>=`
/// the probe, reverse to the greatest row whose value is `<=` it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    fn bias(self) -> Ordering {
        match self {
            Direction::Forward => Ordering::Less,
            Direction::Reverse => Ordering::Greater,
        }
    }
}

// ============================================================================
// Path
// ============================================================================

/// A positioned row: the data block holding it plus the row-index blocks
/// walked to reach it. The stack may be empty right after a value seek; the
/// next block crossing rebuilds it from the root.
#[derive(Clone)]
struct Path {
    row: u64,
    first_row: u64,
    data: DataBlockReader,
    row_stack: Vec<RowLevel>,
    /// Filter pointer from the value-index entry that led here, if a value
    /// seek did.
    filter_row_base: Option<u64>,
}

#[derive(Clone)]
struct RowLevel {
    reader: RowIndexBlockReader,
    /// Row range of this block's whole subtree.
    rows: Range<u64>,
}

impl Path {
    fn contains(&self, row: u64) -> bool {
        row >= self.first_row && row < self.first_row + self.data.n_values() as u64
    }

    fn index_in_block(&self) -> usize {
        (self.row - self.first_row) as usize
    }
}

#[derive(Clone)]
enum Position {
    Before,
    At(Path),
    After,
}

// ============================================================================
// Cursor
// ============================================================================

/// Cursor over the rows `[row_lo, row_hi)` of one column.
pub struct Cursor<V: ColumnValue> {
    file: Arc<LayerFile>,
    column: usize,
    rows: Range<u64>,
    pos: Position,
    _marker: PhantomData<fn() -> V>,
}

impl<V: ColumnValue> Clone for Cursor<V> {
    fn clone(&self) -> Self {
        Self {
            file: self.file.clone(),
            column: self.column,
            rows: self.rows.clone(),
            pos: self.pos.clone(),
            _marker: PhantomData,
        }
    }
}

impl<V: ColumnValue> Cursor<V> {
    pub(crate) fn new(file: Arc<LayerFile>, column: usize, rows: Range<u64>) -> Self {
        Self {
            file,
            column,
            rows,
            pos: Position::Before,
            _marker: PhantomData,
        }
    }

    fn col(&self) -> &ColumnRoots {
        &self.file.columns[self.column]
    }

    fn expect_row_ranges(&self) -> bool {
        self.column + 1 < self.file.n_columns()
    }

    /// Number of rows in the cursor's row group.
    pub fn len(&self) -> u64 {
        self.rows.end - self.rows.start
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `true` if the cursor is on a row.
    pub fn has_value(&self) -> bool {
        matches!(self.pos, Position::At(_))
    }

    pub fn is_before(&self) -> bool {
        matches!(self.pos, Position::Before)
    }

    pub fn is_after(&self) -> bool {
        matches!(self.pos, Position::After)
    }

    /// The current row's value, or `None` on a terminal.
    pub fn value(&self) -> Option<V> {
        match &self.pos {
            Position::At(path) => Some(path.data.value(path.index_in_block())),
            _ => None,
        }
    }

    /// Absolute row number within the column, or `None` on a terminal.
    pub fn row_number(&self) -> Option<u64> {
        match &self.pos {
            Position::At(path) => Some(path.row),
            _ => None,
        }
    }

    /// Absolute position for ordering cursors: terminals collapse to the
    /// group bounds.
    pub fn absolute_position(&self) -> u64 {
        match &self.pos {
            Position::Before => self.rows.start,
            Position::At(path) => path.row,
            Position::After => self.rows.end,
        }
    }

    /// Rows at and after the current position.
    pub fn remaining_rows(&self) -> u64 {
        match &self.pos {
            Position::Before => self.len(),
            Position::At(path) => self.rows.end - path.row,
            Position::After => 0,
        }
    }

    /// The row group the current row owns in the next column; `None` on a
    /// terminal or in the last column.
    pub fn child_range(&self) -> Option<Range<u64>> {
        match &self.pos {
            Position::At(path) => path.data.row_range(path.index_in_block()),
            _ => None,
        }
    }

    /// A cursor over a sub-range of this row group (positions are
    /// group-relative), positioned before it.
    pub fn subset(&self, range: Range<u64>) -> Self {
        let start = self.rows.start + range.start;
        let end = (self.rows.start + range.end).min(self.rows.end);
        Self::new(self.file.clone(), self.column, start..end.max(start))
    }

    // ------------------------------------------------------------------
    // Row positioning
    // ------------------------------------------------------------------

    /// Position on group-relative row `r`. Past-the-end goes to `After`;
    /// an empty group always seeks to `Before`.
    pub fn seek_row(&mut self, r: u64) -> Result<()> {
        if self.is_empty() {
            self.pos = Position::Before;
            Ok(())
        } else if r < self.len() {
            self.move_to_row(self.rows.start + r)
        } else {
            self.pos = Position::After;
            Ok(())
        }
    }

    /// Move to the first row. No effect on an empty group.
    pub fn move_first(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.move_to_row(self.rows.start)
    }

    /// Move to the last row. No effect on an empty group.
    pub fn move_last(&mut self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        self.move_to_row(self.rows.end - 1)
    }

    /// Advance one row; from `Before` to the first row; sticks at `After`.
    pub fn move_next(&mut self) -> Result<()> {
        let next = match &self.pos {
            Position::Before => self.rows.start,
            Position::At(path) => path.row + 1,
            Position::After => return Ok(()),
        };
        if next < self.rows.end {
            self.move_to_row(next)
        } else {
            self.pos = Position::After;
            Ok(())
        }
    }

    /// Step back one row; from `After` to the last row; sticks at `Before`.
    pub fn move_prev(&mut self) -> Result<()> {
        match &self.pos {
            Position::Before => Ok(()),
            Position::At(path) => {
                if path.row > self.rows.start {
                    self.move_to_row(path.row - 1)
                } else {
                    self.pos = Position::Before;
                    Ok(())
                }
            }
            Position::After => {
                if self.is_empty() {
                    self.pos = Position::Before;
                    Ok(())
                } else {
                    self.move_to_row(self.rows.end - 1)
                }
            }
        }
    }

    fn move_to_row(&mut self, row: u64) -> Result<()> {
        debug_assert!(self.rows.contains(&row));
        if let Position::At(path) = &mut self.pos {
            if path.contains(row) {
                path.row = row;
                return Ok(());
            }
        }
        let hint = match &self.pos {
            Position::At(path) => Some(path),
            _ => None,
        };
        let path = self.path_for_row(row, hint)?;
        self.pos = Position::At(path);
        Ok(())
    }

    /// Build a path to `row`, reusing the hint's row-index stack where its
    /// subtrees still cover the target.
    fn path_for_row(&self, row: u64, hint: Option<&Path>) -> Result<Path> {
        if let Some(hint) = hint {
            for depth in (0..hint.row_stack.len()).rev() {
                if hint.row_stack[depth].rows.contains(&row) {
                    let stack = hint.row_stack[..=depth].to_vec();
                    return self.descend_rows(row, stack);
                }
            }
        }
        let col = self.col();
        let root = col.row_index_root.ok_or_else(|| {
            StrataError::InvariantViolated(format!(
                "column {} has rows but no row index root",
                self.column
            ))
        })?;
        let block = self.file.read_cached(root, BlockKind::RowIndex)?;
        let reader = RowIndexBlockReader::new(block, root)?;
        self.descend_rows(
            row,
            vec![RowLevel {
                reader,
                rows: 0..col.rows,
            }],
        )
    }

    fn descend_rows(&self, row: u64, mut stack: Vec<RowLevel>) -> Result<Path> {
        loop {
            let (slot, entry, child_rows) = {
                let level = stack.last().expect("row descent starts at the root");
                let slot = level.reader.find_row(row, level.rows.end)?.ok_or_else(|| {
                    StrataError::InvariantViolated(format!("row {row} missing from row index"))
                })?;
                (
                    slot,
                    level.reader.entry(slot)?,
                    level.reader.child_rows(slot, level.rows.end)?,
                )
            };
            if entry.child.is_index {
                let block = self
                    .file
                    .read_cached(entry.child.location, BlockKind::RowIndex)?;
                let reader = RowIndexBlockReader::new(block, entry.child.location)?;
                stack.push(RowLevel {
                    reader,
                    rows: child_rows,
                });
            } else {
                // Hint the next sibling: a scan will want it next.
                let level = stack.last().expect("row descent starts at the root");
                if slot + 1 < level.reader.n_entries() {
                    if let Ok(next) = level.reader.entry(slot + 1) {
                        self.file.prefetch(next.child.location);
                    }
                }
                let data = self.read_data_block(entry.child.location)?;
                if data.n_values() as u64 != child_rows.end - child_rows.start {
                    return Err(StrataError::InvariantViolated(format!(
                        "data block at {} holds {} values, index claims {:?}",
                        entry.child.location.offset,
                        data.n_values(),
                        child_rows
                    )));
                }
                return Ok(Path {
                    row,
                    first_row: child_rows.start,
                    data,
                    row_stack: stack,
                    filter_row_base: None,
                });
            }
        }
    }

    fn read_data_block(&self, location: BlockLocation) -> Result<DataBlockReader> {
        let block = self.file.read_cached(location, BlockKind::Data)?;
        DataBlockReader::new(block, location, self.expect_row_ranges())
    }

    // ------------------------------------------------------------------
    // Value seeks
    // ------------------------------------------------------------------

    /// Position on the least row of the group whose value is `>= probe`
    /// (forward) or the greatest row whose value is `<= probe` (reverse).
    /// No qualifying row leaves the cursor `After` (forward) or `Before`
    /// (reverse).
    pub fn seek_value(&mut self, probe: &V, direction: Direction) -> Result<()> {
        if self.is_empty() {
            self.pos = Position::Before;
            return Ok(());
        }
        let col = self.col();
        let root = col.value_index_root.ok_or_else(|| {
            StrataError::SchemaMismatch(format!(
                "column {} was written without a value index",
                self.column
            ))
        })?;
        let with_filter = col.filter_index_root.is_some();
        let bias = direction.bias();
        tracing::trace!(column = self.column, ?direction, "value seek");

        let mut location = root;
        let mut node_rows = 0..col.rows;
        loop {
            let block = self.file.read_cached(location, BlockKind::ValueIndex)?;
            let reader = ValueIndexBlockReader::new(block, location, with_filter, V::ALIGN)?;
            let Some(slot) = reader.find_best_match(&self.rows, node_rows.end, probe, bias)?
            else {
                self.pos = Self::seek_miss(direction);
                return Ok(());
            };
            let entry = reader.entry(slot)?;
            let child_rows = reader.child_rows(slot, node_rows.end)?;
            if entry.child.is_index {
                location = entry.child.location;
                node_rows = child_rows;
                continue;
            }

            let data = self.read_data_block(entry.child.location)?;
            let hit = data.find_best_match(child_rows.start, &self.rows, probe, bias);
            self.pos = match hit {
                Some(index) => Position::At(Path {
                    row: child_rows.start + index as u64,
                    first_row: child_rows.start,
                    data,
                    row_stack: Vec::new(),
                    filter_row_base: entry.filter_row_base,
                }),
                None => Self::seek_miss(direction),
            };
            return Ok(());
        }
    }

    fn seek_miss(direction: Direction) -> Position {
        match direction {
            Direction::Forward => Position::After,
            Direction::Reverse => Position::Before,
        }
    }

    // ------------------------------------------------------------------
    // Approximate membership
    // ------------------------------------------------------------------

    /// Approximate membership of `probe` in this row group. `false` is
    /// definitive; `true` is confirmed against the data tree, so the only
    /// approximation is in how much work a miss costs. Falls back to an
    /// exact seek when the column carries no filter.
    pub fn contains_approx(&self, probe: &V) -> Result<bool> {
        if self.is_empty() {
            return Ok(false);
        }
        if self.col().filter_index_root.is_none() {
            return self.contains_exact(probe);
        }
        let mut archived = Vec::new();
        probe.archive(&mut archived);
        let hash = fingerprint(&archived);

        if let Some(filter) = self.filter_leaf_for(probe)? {
            if !filter.contains(hash) {
                return Ok(false);
            }
        }
        self.contains_exact(probe)
    }

    fn contains_exact(&self, probe: &V) -> Result<bool> {
        let mut cursor = self.clone();
        cursor.seek_value(probe, Direction::Forward)?;
        Ok(match &cursor.pos {
            Position::At(path) => {
                V::cmp_archived(
                    path.data.bytes(),
                    path.data.root(path.index_in_block()),
                    probe,
                ) == Ordering::Equal
            }
            _ => false,
        })
    }

    /// Find the filter block that would cover `probe`'s position in this
    /// row group, if any.
    ///
    /// A positioned cursor whose data block sits inside the group and
    /// carries a covering filter pointer resolves the filter by row number
    /// alone when the probe falls inside the block's value bounds; this is
    /// the one-extra-read path from an interior position. Everything else
    /// descends the filter index by value.
    fn filter_leaf_for(&self, probe: &V) -> Result<Option<FilterBlockReader>> {
        let col = self.col();
        let root = col
            .filter_index_root
            .expect("caller checked the filter root");

        if let Position::At(path) = &self.pos {
            if let Some(base) = path.filter_row_base {
                let block_end = path.first_row + path.data.n_values() as u64;
                let in_group =
                    path.first_row >= self.rows.start && block_end <= self.rows.end;
                if in_group {
                    let bytes = path.data.bytes();
                    let above_first =
                        V::cmp_archived(bytes, path.data.root(0), probe) != Ordering::Greater;
                    let below_last = V::cmp_archived(
                        bytes,
                        path.data.root(path.data.n_values() - 1),
                        probe,
                    ) != Ordering::Less;
                    if above_first && below_last {
                        return self.filter_leaf_by_row(root, base).map(Some);
                    }
                }
            }
        }

        let mut location = root;
        let mut node_rows = 0..col.rows;
        loop {
            let block = self.file.read_cached(location, BlockKind::FilterIndex)?;
            let reader = ValueIndexBlockReader::new(block, location, false, V::ALIGN)?;
            let Some(slot) =
                reader.find_best_match(&self.rows, node_rows.end, probe, Ordering::Less)?
            else {
                return Ok(None);
            };
            let entry = reader.entry(slot)?;
            let child_rows = reader.child_rows(slot, node_rows.end)?;
            if entry.child.is_index {
                location = entry.child.location;
                node_rows = child_rows;
                continue;
            }
            let block = self
                .file
                .read_cached(entry.child.location, BlockKind::Filter)?;
            return Ok(Some(FilterBlockReader::new(
                block,
                entry.child.location.offset,
            )?));
        }
    }

    /// Resolve a filter block by its row base through the filter index.
    fn filter_leaf_by_row(&self, root: BlockLocation, row: u64) -> Result<FilterBlockReader> {
        let col = self.col();
        let mut location = root;
        let mut node_rows = 0..col.rows;
        loop {
            let block = self.file.read_cached(location, BlockKind::FilterIndex)?;
            let reader = ValueIndexBlockReader::new(block, location, false, V::ALIGN)?;
            let slot = reader.find_row(row, node_rows.end)?.ok_or_else(|| {
                StrataError::InvariantViolated(format!(
                    "row {row} missing from filter index"
                ))
            })?;
            let entry = reader.entry(slot)?;
            let child_rows = reader.child_rows(slot, node_rows.end)?;
            if entry.child.is_index {
                location = entry.child.location;
                node_rows = child_rows;
                continue;
            }
            let block = self
                .file
                .read_cached(entry.child.location, BlockKind::Filter)?;
            return FilterBlockReader::new(block, entry.child.location.offset);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
