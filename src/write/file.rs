//! File writers: compose the header, the column writers, and the trailer.
//!
//! A writer emits the header block first, then drives its column writers to
//! completion, assembles the trailer from their roots, syncs, and atomically
//! publishes the file. Without a successful publish the file is invisible;
//! a dropped or failed writer leaves nothing behind.
//!
//! [`Writer1`], [`Writer2`], and [`Writer3`] fix the column count and value
//! types, and enforce the feeding protocol: rows for column `i + 1` are
//! written first, then the column-`i` row that owns them. The rows written
//! to column `i + 1` since the last column-`i` row become that row's group,
//! which is how abutting, non-overlapping row groups are guaranteed by
//! construction.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::codec::ColumnValue;
use crate::error::{Result, StrataError};
use crate::format::block::BlockWriter;
use crate::format::trailer::{ColumnRoots, FileHeader, FileTrailer, FORMAT_VERSION};
use crate::format::{BlockKind, ChecksumKind, BLOCK_ALIGN};
use crate::io::{FileWrite, StdFileWriter};
use crate::read::{Reader1, Reader2, Reader3};
use crate::write::column::{ColumnOptions, ColumnWriter, TreeShape};

/// Configuration for writing a strata file. The defaults are good for
/// production use; tests shrink the tree knobs to force deep trees on small
/// inputs.
#[derive(Clone)]
pub struct Parameters {
    /// Minimum data-block size in bytes. Power of two, at least 4 KiB.
    pub data_block_size: usize,
    /// Minimum index-block size in bytes. Power of two, at least 4 KiB.
    pub index_block_size: usize,
    /// Minimum entries per committed index block.
    pub min_branch: usize,
    /// Block checksum algorithm, recorded in the header.
    pub checksum: ChecksumKind,
    /// Free-form key/value metadata stored in the header.
    pub meta: Vec<(String, String)>,
    /// Cooperative cancellation flag, checked at block-write boundaries.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            data_block_size: 8192,
            index_block_size: 8192,
            min_branch: 32,
            checksum: ChecksumKind::Xxh3,
            meta: Vec::new(),
            cancel: None,
        }
    }
}

impl Parameters {
    /// Attach a debug name, stored in the header metadata.
    pub fn with_debug_name(mut self, name: impl Into<String>) -> Self {
        self.meta.push(("name".to_string(), name.into()));
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn validate(&self) -> Result<()> {
        for (label, size) in [
            ("data block size", self.data_block_size),
            ("index block size", self.index_block_size),
        ] {
            if size < BLOCK_ALIGN as usize || !size.is_power_of_two() {
                return Err(StrataError::InvariantViolated(format!(
                    "{label} {size} must be a power of two of at least {BLOCK_ALIGN}"
                )));
            }
        }
        if self.min_branch < 2 {
            return Err(StrataError::InvariantViolated(
                "minimum branching factor must be at least 2".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn shape(&self) -> TreeShape {
        TreeShape {
            data_block_size: self.data_block_size,
            index_block_size: self.index_block_size,
            min_branch: self.min_branch,
        }
    }
}

/// Shared writer core: the block appender plus header/trailer plumbing.
struct WriterCore<W: FileWrite> {
    blocks: BlockWriter<W>,
    parameters: Parameters,
}

impl<W: FileWrite> WriterCore<W> {
    fn new(file: W, parameters: Parameters, type_tags: Vec<String>) -> Result<Self> {
        parameters.validate()?;
        let mut blocks = BlockWriter::new(
            file,
            parameters.checksum,
            parameters.cancel.clone(),
        );
        let header = FileHeader {
            version: FORMAT_VERSION,
            checksum: parameters.checksum,
            type_tags,
            meta: parameters.meta.clone(),
        };
        let mut buf = header.encode()?;
        blocks.write_block(BlockKind::FileHeader, 0, &mut buf)?;
        Ok(Self { blocks, parameters })
    }

    /// Write the trailer, sync, and publish. The file becomes visible only
    /// if every step succeeds.
    fn seal(mut self, columns: Vec<ColumnRoots>) -> Result<W> {
        let trailer = FileTrailer { columns };
        let mut buf = trailer.encode();
        self.blocks.write_block(BlockKind::FileTrailer, 0, &mut buf)?;
        self.blocks.sync()?;
        self.blocks.publish()?;
        tracing::debug!(bytes = self.blocks.next_offset(), "strata file sealed");
        Ok(self.blocks.into_file())
    }
}

macro_rules! forward_core {
    () => {
        /// Returns the number of rows written to column 0 so far.
        pub fn n_rows(&self) -> u64 {
            self.col0.rows()
        }
    };
}

// ============================================================================
// Writer1
// ============================================================================

/// Writes a 1-column strata file.
///
/// ```no_run
/// use stratafile::{Parameters, Writer1};
///
/// let mut writer =
///     Writer1::<u64>::create("batch.strata".as_ref(), Parameters::default()).unwrap();
/// for i in 0..1000u64 {
///     writer.write0(&i).unwrap();
/// }
/// writer.close().unwrap();
/// ```
pub struct Writer1<V0: ColumnValue, W: FileWrite = StdFileWriter> {
    core: WriterCore<W>,
    col0: ColumnWriter<V0>,
}

impl<V0: ColumnValue, W: FileWrite> std::fmt::Debug for Writer1<V0, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer1").finish_non_exhaustive()
    }
}

impl<V0: ColumnValue> Writer1<V0, StdFileWriter> {
    /// Create a writer that publishes to `path` on close.
    pub fn create(path: &Path, parameters: Parameters) -> Result<Self> {
        Self::create_with_options(path, parameters, ColumnOptions::default())
    }

    pub fn create_with_options(
        path: &Path,
        parameters: Parameters,
        options: ColumnOptions,
    ) -> Result<Self> {
        let file = StdFileWriter::create(path).map_err(StrataError::WriteFailed)?;
        Self::new_with_options(file, parameters, options)
    }

    /// Close and reopen the finished file as a reader.
    pub fn into_reader(self) -> Result<Reader1<V0>> {
        let path = self.core.blocks.file().path().to_path_buf();
        self.close()?;
        Reader1::open(&path)
    }
}

impl<V0: ColumnValue, W: FileWrite> Writer1<V0, W> {
    pub fn new(file: W, parameters: Parameters) -> Result<Self> {
        Self::new_with_options(file, parameters, ColumnOptions::default())
    }

    pub fn new_with_options(
        file: W,
        parameters: Parameters,
        options: ColumnOptions,
    ) -> Result<Self> {
        let core = WriterCore::new(file, parameters, vec![V0::type_tag()])?;
        let shape = core.parameters.shape();
        Ok(Self {
            core,
            col0: ColumnWriter::new(0, true, options, shape),
        })
    }

    /// Write the next row of column 0. `value` must be greater than the
    /// previous row's value.
    pub fn write0(&mut self, value: &V0) -> Result<()> {
        self.col0.push(&mut self.core.blocks, value, None)
    }

    forward_core!();

    /// Finish the file: flush every open block, write the trailer, sync,
    /// and publish.
    pub fn close(mut self) -> Result<W> {
        let roots = self.col0.finish(&mut self.core.blocks)?;
        self.core.seal(vec![roots])
    }
}

// ============================================================================
// Writer2
// ============================================================================

/// Writes a 2-column strata file.
///
/// Rows for column 1 are written first; the next [`write0`](Self::write0)
/// takes ownership of them as the new row's (possibly empty) row group:
///
/// ```no_run
/// use stratafile::{Parameters, Writer2};
///
/// let mut writer =
///     Writer2::<u64, u32>::create("batch.strata".as_ref(), Parameters::default()).unwrap();
/// for i in 0..1000u64 {
///     for j in 0..4u32 {
///         writer.write1(&j).unwrap();
///     }
///     writer.write0(&i).unwrap();
/// }
/// writer.close().unwrap();
/// ```
pub struct Writer2<V0: ColumnValue, V1: ColumnValue, W: FileWrite = StdFileWriter> {
    core: WriterCore<W>,
    col0: ColumnWriter<V0>,
    col1: ColumnWriter<V1>,
    group_start: u64,
}

impl<V0: ColumnValue, V1: ColumnValue> Writer2<V0, V1, StdFileWriter> {
    pub fn create(path: &Path, parameters: Parameters) -> Result<Self> {
        Self::create_with_options(path, parameters, Default::default(), Default::default())
    }

    pub fn create_with_options(
        path: &Path,
        parameters: Parameters,
        options0: ColumnOptions,
        options1: ColumnOptions,
    ) -> Result<Self> {
        let file = StdFileWriter::create(path).map_err(StrataError::WriteFailed)?;
        Self::new_with_options(file, parameters, options0, options1)
    }

    pub fn into_reader(self) -> Result<Reader2<V0, V1>> {
        let path = self.core.blocks.file().path().to_path_buf();
        self.close()?;
        Reader2::open(&path)
    }
}

impl<V0: ColumnValue, V1: ColumnValue, W: FileWrite> Writer2<V0, V1, W> {
    pub fn new(file: W, parameters: Parameters) -> Result<Self> {
        Self::new_with_options(file, parameters, Default::default(), Default::default())
    }

    pub fn new_with_options(
        file: W,
        parameters: Parameters,
        options0: ColumnOptions,
        options1: ColumnOptions,
    ) -> Result<Self> {
        let core = WriterCore::new(file, parameters, vec![V0::type_tag(), V1::type_tag()])?;
        let shape = core.parameters.shape();
        Ok(Self {
            core,
            col0: ColumnWriter::new(0, false, options0, shape),
            col1: ColumnWriter::new(1, true, options1, shape),
            group_start: 0,
        })
    }

    /// Write the next row of column 0. The column-1 rows written since the
    /// previous call become this row's row group.
    pub fn write0(&mut self, value: &V0) -> Result<()> {
        let group_end = self.col1.rows();
        self.col0
            .push(&mut self.core.blocks, value, Some(self.group_start..group_end))?;
        self.col1.start_group();
        self.group_start = group_end;
        Ok(())
    }

    /// Write the next row of column 1. `value` must be greater than the
    /// previous value written since the last [`write0`](Self::write0).
    pub fn write1(&mut self, value: &V1) -> Result<()> {
        self.col1.push(&mut self.core.blocks, value, None)
    }

    forward_core!();

    pub fn close(mut self) -> Result<W> {
        if self.group_start != self.col1.rows() {
            return Err(StrataError::InvariantViolated(
                "column 1 rows written without a closing column 0 row".to_string(),
            ));
        }
        let roots0 = self.col0.finish(&mut self.core.blocks)?;
        let roots1 = self.col1.finish(&mut self.core.blocks)?;
        self.core.seal(vec![roots0, roots1])
    }
}

// ============================================================================
// Writer3
// ============================================================================

/// Writes a 3-column strata file; the feeding protocol extends that of
/// [`Writer2`] one level down.
pub struct Writer3<V0: ColumnValue, V1: ColumnValue, V2: ColumnValue, W: FileWrite = StdFileWriter>
{
    core: WriterCore<W>,
    col0: ColumnWriter<V0>,
    col1: ColumnWriter<V1>,
    col2: ColumnWriter<V2>,
    group_start0: u64,
    group_start1: u64,
}

impl<V0: ColumnValue, V1: ColumnValue, V2: ColumnValue> Writer3<V0, V1, V2, StdFileWriter> {
    pub fn create(path: &Path, parameters: Parameters) -> Result<Self> {
        let file = StdFileWriter::create(path).map_err(StrataError::WriteFailed)?;
        Self::new(file, parameters)
    }

    pub fn into_reader(self) -> Result<Reader3<V0, V1, V2>> {
        let path = self.core.blocks.file().path().to_path_buf();
        self.close()?;
        Reader3::open(&path)
    }
}

impl<V0: ColumnValue, V1: ColumnValue, V2: ColumnValue, W: FileWrite> Writer3<V0, V1, V2, W> {
    pub fn new(file: W, parameters: Parameters) -> Result<Self> {
        Self::new_with_options(file, parameters, Default::default(), Default::default(), Default::default())
    }

    pub fn new_with_options(
        file: W,
        parameters: Parameters,
        options0: ColumnOptions,
        options1: ColumnOptions,
        options2: ColumnOptions,
    ) -> Result<Self> {
        let core = WriterCore::new(
            file,
            parameters,
            vec![V0::type_tag(), V1::type_tag(), V2::type_tag()],
        )?;
        let shape = core.parameters.shape();
        Ok(Self {
            core,
            col0: ColumnWriter::new(0, false, options0, shape),
            col1: ColumnWriter::new(1, false, options1, shape),
            col2: ColumnWriter::new(2, true, options2, shape),
            group_start0: 0,
            group_start1: 0,
        })
    }

    pub fn write0(&mut self, value: &V0) -> Result<()> {
        let group_end = self.col1.rows();
        self.col0
            .push(&mut self.core.blocks, value, Some(self.group_start0..group_end))?;
        self.col1.start_group();
        self.group_start0 = group_end;
        Ok(())
    }

    pub fn write1(&mut self, value: &V1) -> Result<()> {
        let group_end = self.col2.rows();
        self.col1
            .push(&mut self.core.blocks, value, Some(self.group_start1..group_end))?;
        self.col2.start_group();
        self.group_start1 = group_end;
        Ok(())
    }

    pub fn write2(&mut self, value: &V2) -> Result<()> {
        self.col2.push(&mut self.core.blocks, value, None)
    }

    forward_core!();

    pub fn close(mut self) -> Result<W> {
        if self.group_start0 != self.col1.rows() || self.group_start1 != self.col2.rows() {
            return Err(StrataError::InvariantViolated(
                "inner rows written without a closing outer row".to_string(),
            ));
        }
        let roots0 = self.col0.finish(&mut self.core.blocks)?;
        let roots1 = self.col1.finish(&mut self.core.blocks)?;
        let roots2 = self.col2.finish(&mut self.core.blocks)?;
        self.core.seal(vec![roots0, roots1, roots2])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemFile;

    #[test]
    fn test_empty_file_is_header_and_trailer() {
        let file = MemFile::new();
        let writer: Writer1<u64, MemFile> =
            Writer1::new(file.clone(), Parameters::default()).unwrap();
        writer.close().unwrap();
        assert_eq!(crate::io::FileRead::len(&file), 8192);
    }

    #[test]
    fn test_dangling_inner_rows_rejected() {
        let file = MemFile::new();
        let mut writer: Writer2<u64, u64, MemFile> =
            Writer2::new(file, Parameters::default()).unwrap();
        writer.write1(&1).unwrap();
        let err = writer.close().unwrap_err();
        assert!(matches!(err, StrataError::InvariantViolated(_)));
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let parameters = Parameters {
            data_block_size: 5000,
            ..Parameters::default()
        };
        let err = Writer1::<u64, MemFile>::new(MemFile::new(), parameters).unwrap_err();
        assert!(matches!(err, StrataError::InvariantViolated(_)));
    }

    #[test]
    fn test_cancel_surfaces_mid_write() {
        let cancel = Arc::new(AtomicBool::new(false));
        let parameters = Parameters {
            data_block_size: 4096,
            ..Parameters::default()
        }
        .with_cancel(cancel.clone());
        let mut writer: Writer1<u64, MemFile> =
            Writer1::new(MemFile::new(), parameters).unwrap();
        for i in 0..100u64 {
            writer.write0(&i).unwrap();
        }
        cancel.store(true, std::sync::atomic::Ordering::Relaxed);
        let err = writer.close().unwrap_err();
        assert!(matches!(err, StrataError::Cancelled));
    }
}
