//! File readers: open, verify, and hand out cursors.
//!
//! Opening a file reads and verifies the header block (offset 0) and the
//! trailer block (the last 4 KiB). A file whose trailer cannot be verified
//! is treated as non-existent. The typed readers additionally check the
//! column count and per-column value type tags against the caller's codec
//! choice, so a cursor never interprets bytes with the wrong codec.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::codec::ColumnValue;
use crate::error::{Result, StrataError};
use crate::format::block::read_block;
use crate::format::trailer::{ColumnRoots, FileHeader, FileTrailer, FIXED_BLOCK_LEN};
use crate::format::{BlockKind, BlockLocation, ChecksumKind, BLOCK_ALIGN};
use crate::io::{BlockHandle, FileRead, StdFileReader};
use crate::read::cache::BlockCache;
use crate::read::cursor::Cursor;

/// Process-unique id per opened file, for block cache keys.
static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// An open, verified strata file. Shared by every cursor into it.
pub(crate) struct LayerFile {
    file: Box<dyn FileRead>,
    id: u64,
    checksum: ChecksumKind,
    pub(crate) header: FileHeader,
    pub(crate) columns: Vec<ColumnRoots>,
    cache: BlockCache,
}

impl LayerFile {
    fn open(file: Box<dyn FileRead>, cache: BlockCache) -> Result<Arc<Self>> {
        let len = file.len();
        if len < 2 * BLOCK_ALIGN || len % BLOCK_ALIGN != 0 {
            return Err(StrataError::corrupt(
                0,
                format!("file length {len} is not a positive multiple of {BLOCK_ALIGN}"),
            ));
        }

        let header_block = file.read(0, FIXED_BLOCK_LEN)?;
        let header = FileHeader::decode(&header_block)?;

        let trailer_offset = len - BLOCK_ALIGN;
        let trailer_block = file.read(trailer_offset, FIXED_BLOCK_LEN)?;
        let trailer = FileTrailer::decode(&trailer_block, trailer_offset, header.checksum)?;
        if trailer.columns.len() != header.n_columns() {
            return Err(StrataError::corrupt(
                trailer_offset,
                format!(
                    "trailer lists {} columns, header {}",
                    trailer.columns.len(),
                    header.n_columns()
                ),
            ));
        }
        for column in &trailer.columns {
            for root in [
                column.value_index_root,
                column.row_index_root,
                column.filter_index_root,
            ]
            .into_iter()
            .flatten()
            {
                if root.offset + root.size() > len {
                    return Err(StrataError::corrupt(
                        trailer_offset,
                        "trailer root points past end of file",
                    ));
                }
            }
            if column.rows > 0 && column.row_index_root.is_none() {
                return Err(StrataError::corrupt(
                    trailer_offset,
                    "non-empty column without a row index root",
                ));
            }
        }

        Ok(Arc::new(Self {
            file,
            id: NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed),
            checksum: header.checksum,
            header,
            columns: trailer.columns,
            cache,
        }))
    }

    /// Read a block through the shared cache, verifying it on a miss.
    pub(crate) fn read_cached(
        &self,
        location: BlockLocation,
        kind: BlockKind,
    ) -> Result<BlockHandle> {
        if let Some(block) = self.cache.get(self.id, location.offset) {
            return Ok(block);
        }
        tracing::trace!(offset = location.offset, kind = ?kind, "block cache miss");
        let block = read_block(self.file.as_ref(), self.checksum, location, kind)?;
        self.cache.insert(self.id, location.offset, block.clone());
        Ok(block)
    }

    /// Best-effort hint that a block will be read soon.
    pub(crate) fn prefetch(&self, location: BlockLocation) {
        if self.cache.get(self.id, location.offset).is_none() {
            self.file
                .prefetch(&[(location.offset, location.size() as usize)]);
        }
    }

    pub(crate) fn n_columns(&self) -> usize {
        self.header.n_columns()
    }
}

fn check_schema(file: &LayerFile, expected_tags: &[String]) -> Result<()> {
    if file.n_columns() != expected_tags.len() {
        return Err(StrataError::SchemaMismatch(format!(
            "file has {} column(s), reader expects {}",
            file.n_columns(),
            expected_tags.len()
        )));
    }
    for (column, (actual, expected)) in file
        .header
        .type_tags
        .iter()
        .zip(expected_tags)
        .enumerate()
    {
        if actual != expected {
            return Err(StrataError::SchemaMismatch(format!(
                "column {column} holds values of type {actual:?}, reader expects {expected:?}"
            )));
        }
    }
    Ok(())
}

macro_rules! reader_common {
    () => {
        /// Number of columns in the file.
        pub fn n_columns(&self) -> usize {
            self.file.n_columns()
        }

        /// Number of rows in `column`.
        pub fn n_rows(&self, column: usize) -> u64 {
            self.file.columns[column].rows
        }

        /// Value from the header's free-form metadata map.
        pub fn meta_value(&self, key: &str) -> Option<&str> {
            self.file.header.meta_value(key)
        }
    };
}

// ============================================================================
// Typed readers
// ============================================================================

/// Reader for a 1-column strata file.
pub struct Reader1<V0: ColumnValue> {
    file: Arc<LayerFile>,
    _marker: PhantomData<fn() -> V0>,
}

impl<V0: ColumnValue> std::fmt::Debug for Reader1<V0> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader1").finish_non_exhaustive()
    }
}

impl<V0: ColumnValue> Reader1<V0> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(
            Box::new(StdFileReader::open(path)?),
            BlockCache::new(),
        )
    }

    pub fn open_with(file: Box<dyn FileRead>, cache: BlockCache) -> Result<Self> {
        let file = LayerFile::open(file, cache)?;
        check_schema(&file, &[V0::type_tag()])?;
        Ok(Self {
            file,
            _marker: PhantomData,
        })
    }

    reader_common!();

    /// Cursor over all of column 0, positioned before the first row.
    pub fn rows(&self) -> Cursor<V0> {
        Cursor::new(self.file.clone(), 0, 0..self.file.columns[0].rows)
    }
}

/// Reader for a 2-column strata file.
pub struct Reader2<V0: ColumnValue, V1: ColumnValue> {
    file: Arc<LayerFile>,
    _marker: PhantomData<fn() -> (V0, V1)>,
}

impl<V0: ColumnValue, V1: ColumnValue> std::fmt::Debug for Reader2<V0, V1> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader2").finish_non_exhaustive()
    }
}

impl<V0: ColumnValue, V1: ColumnValue> Reader2<V0, V1> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(
            Box::new(StdFileReader::open(path)?),
            BlockCache::new(),
        )
    }

    pub fn open_with(file: Box<dyn FileRead>, cache: BlockCache) -> Result<Self> {
        let file = LayerFile::open(file, cache)?;
        check_schema(&file, &[V0::type_tag(), V1::type_tag()])?;
        Ok(Self {
            file,
            _marker: PhantomData,
        })
    }

    reader_common!();

    /// Cursor over all of column 0, positioned before the first row.
    pub fn rows(&self) -> Cursor<V0> {
        Cursor::new(self.file.clone(), 0, 0..self.file.columns[0].rows)
    }

    /// Cursor over the column-1 row group owned by `cursor`'s current row.
    /// Empty if the cursor is not on a row.
    pub fn enter_child(&self, cursor: &Cursor<V0>) -> Cursor<V1> {
        let range = cursor.child_range().unwrap_or(0..0);
        Cursor::new(self.file.clone(), 1, range)
    }
}

/// Reader for a 3-column strata file.
pub struct Reader3<V0: ColumnValue, V1: ColumnValue, V2: ColumnValue> {
    file: Arc<LayerFile>,
    _marker: PhantomData<fn() -> (V0, V1, V2)>,
}

impl<V0: ColumnValue, V1: ColumnValue, V2: ColumnValue> Reader3<V0, V1, V2> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(
            Box::new(StdFileReader::open(path)?),
            BlockCache::new(),
        )
    }

    pub fn open_with(file: Box<dyn FileRead>, cache: BlockCache) -> Result<Self> {
        let file = LayerFile::open(file, cache)?;
        check_schema(&file, &[V0::type_tag(), V1::type_tag(), V2::type_tag()])?;
        Ok(Self {
            file,
            _marker: PhantomData,
        })
    }

    reader_common!();

    pub fn rows(&self) -> Cursor<V0> {
        Cursor::new(self.file.clone(), 0, 0..self.file.columns[0].rows)
    }

    pub fn enter_child0(&self, cursor: &Cursor<V0>) -> Cursor<V1> {
        let range = cursor.child_range().unwrap_or(0..0);
        Cursor::new(self.file.clone(), 1, range)
    }

    pub fn enter_child1(&self, cursor: &Cursor<V1>) -> Cursor<V2> {
        let range = cursor.child_range().unwrap_or(0..0);
        Cursor::new(self.file.clone(), 2, range)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileWrite, MemFile};
    use crate::write::{Parameters, Writer1};

    fn small_file() -> MemFile {
        let file = MemFile::new();
        let mut writer: Writer1<u64, MemFile> =
            Writer1::new(file.clone(), Parameters::default()).unwrap();
        for i in 0..100u64 {
            writer.write0(&i).unwrap();
        }
        writer.close().unwrap();
        file
    }

    #[test]
    fn test_open_and_inspect() {
        let file = small_file();
        let reader: Reader1<u64> =
            Reader1::open_with(Box::new(file), BlockCache::new()).unwrap();
        assert_eq!(reader.n_columns(), 1);
        assert_eq!(reader.n_rows(0), 100);
    }

    #[test]
    fn test_wrong_value_type_rejected() {
        let file = small_file();
        let err = Reader1::<String>::open_with(Box::new(file), BlockCache::new()).unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
    }

    #[test]
    fn test_wrong_column_count_rejected() {
        let file = small_file();
        let err =
            Reader2::<u64, u64>::open_with(Box::new(file), BlockCache::new()).unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
    }

    #[test]
    fn test_unsealed_file_rejected() {
        // A file with data but no trailer must read as non-existent.
        let mut file = MemFile::new();
        file.append(&[0u8; 4096]).unwrap();
        file.append(&[1u8; 4096]).unwrap();
        let err = Reader1::<u64>::open_with(Box::new(file), BlockCache::new()).unwrap_err();
        assert!(matches!(
            err,
            StrataError::CorruptBlock { .. } | StrataError::SchemaMismatch(_)
        ));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let mut file = MemFile::new();
        file.append(&[0u8; 1000]).unwrap();
        let err = Reader1::<u64>::open_with(Box::new(file), BlockCache::new()).unwrap_err();
        assert!(matches!(err, StrataError::CorruptBlock { .. }));
    }
}
