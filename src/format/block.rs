//! Block layer: checksum-framed reads and writes of typed blocks.
//!
//! Every block starts with a 16-byte prefix:
//!
//! ```text
//! magic:      u32   block type ("ST..")
//! size_shift: u8    block length = 4096 << size_shift
//! flags:      u8    per-kind flag bits
//! reserved:   u16   zero
//! checksum:   u64   checksum of the body (bytes 16..length), computed
//!                   after the body is padded to its final length
//! ```
//!
//! The layer owns no buffers: writers hand in a fully laid-out block with a
//! zeroed prefix, readers get pooled [`BlockHandle`]s from the I/O
//! collaborator.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, StrataError};
use crate::format::{size_shift, BlockKind, BlockLocation, ChecksumKind, BLOCK_HEADER_LEN};
use crate::io::{BlockHandle, FileRead, FileWrite};

/// Flag bit on data blocks: the trailer carries row ranges (set on every
/// column but the last).
pub const FLAG_ROW_RANGES: u8 = 1;

/// Flag bit on value-index blocks: entries carry a filter row base.
pub const FLAG_FILTER_PTRS: u8 = 1;

// ============================================================================
// Writing
// ============================================================================

/// Appends checksummed blocks to a [`FileWrite`].
pub struct BlockWriter<W: FileWrite> {
    file: W,
    checksum: ChecksumKind,
    next_offset: u64,
    cancel: Option<Arc<AtomicBool>>,
}

impl<W: FileWrite> BlockWriter<W> {
    pub fn new(file: W, checksum: ChecksumKind, cancel: Option<Arc<AtomicBool>>) -> Self {
        Self {
            file,
            checksum,
            next_offset: 0,
            cancel,
        }
    }

    /// Offset the next block will be written at.
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Write one block. `block` must already have its final (legal) length
    /// with a zeroed 16-byte prefix; this fills the prefix and appends.
    pub fn write_block(
        &mut self,
        kind: BlockKind,
        flags: u8,
        block: &mut [u8],
    ) -> Result<BlockLocation> {
        if let Some(cancel) = &self.cancel {
            if cancel.load(Ordering::Relaxed) {
                return Err(StrataError::Cancelled);
            }
        }
        let shift = size_shift(block.len())?;
        let checksum = self.checksum.compute(&block[BLOCK_HEADER_LEN..]);

        block[0..4].copy_from_slice(&kind.magic().to_le_bytes());
        block[4] = shift;
        block[5] = flags;
        block[6..8].copy_from_slice(&[0u8; 2]);
        block[8..16].copy_from_slice(&checksum.to_le_bytes());

        let offset = self.file.append(block).map_err(StrataError::WriteFailed)?;
        if offset != self.next_offset {
            return Err(StrataError::InvariantViolated(format!(
                "collaborator appended at offset {offset}, expected {}",
                self.next_offset
            )));
        }
        self.next_offset += block.len() as u64;

        let location = BlockLocation::new(offset, shift)?;
        tracing::debug!(
            kind = ?kind,
            offset,
            size = block.len(),
            "block written"
        );
        Ok(location)
    }

    /// Durably flush all blocks written so far.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync().map_err(StrataError::WriteFailed)
    }

    /// Atomically publish the finished file.
    pub fn publish(&mut self) -> Result<()> {
        self.file.publish().map_err(StrataError::WriteFailed)
    }

    pub fn into_file(self) -> W {
        self.file
    }

    pub fn file(&self) -> &W {
        &self.file
    }
}

// ============================================================================
// Reading
// ============================================================================

/// Read one block and verify magic, shift, and checksum. Any mismatch is
/// [`StrataError::CorruptBlock`].
pub fn read_block(
    file: &dyn FileRead,
    checksum: ChecksumKind,
    location: BlockLocation,
    expected: BlockKind,
) -> Result<BlockHandle> {
    let size = location.size() as usize;
    if location.offset + size as u64 > file.len() {
        return Err(StrataError::corrupt(
            location.offset,
            format!("{size}-byte block extends past end of file"),
        ));
    }
    let block = file.read(location.offset, size)?;
    verify_block(&block, checksum, location, expected)?;
    Ok(block)
}

/// Verification half of [`read_block`], usable on an already-loaded image.
pub fn verify_block(
    block: &[u8],
    checksum: ChecksumKind,
    location: BlockLocation,
    expected: BlockKind,
) -> Result<()> {
    let magic = u32::from_le_bytes(block[0..4].try_into().unwrap());
    if magic != expected.magic() {
        return Err(StrataError::corrupt(
            location.offset,
            format!("magic {magic:#010x}, expected {:?}", expected),
        ));
    }
    if block[4] != location.shift {
        return Err(StrataError::corrupt(
            location.offset,
            format!("size shift {} does not match reference {}", block[4], location.shift),
        ));
    }
    let stored = u64::from_le_bytes(block[8..16].try_into().unwrap());
    let computed = checksum.compute(&block[BLOCK_HEADER_LEN..]);
    if stored != computed {
        return Err(StrataError::corrupt(
            location.offset,
            format!("checksum {stored:#018x}, computed {computed:#018x}"),
        ));
    }
    Ok(())
}

/// Flags byte of a block image.
pub fn block_flags(block: &[u8]) -> u8 {
    block[5]
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemFile;

    fn empty_block(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn test_write_read_round_trip() {
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);

        let mut block = empty_block(8192);
        block[100] = 0xAA;
        let loc = writer.write_block(BlockKind::Data, FLAG_ROW_RANGES, &mut block).unwrap();
        assert_eq!(loc, BlockLocation { offset: 0, shift: 1 });

        let read = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::Data).unwrap();
        assert_eq!(read[100], 0xAA);
        assert_eq!(block_flags(&read), FLAG_ROW_RANGES);
    }

    #[test]
    fn test_offsets_are_monotonic() {
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file, ChecksumKind::Xxh3, None);
        let a = writer
            .write_block(BlockKind::Data, 0, &mut empty_block(4096))
            .unwrap();
        let b = writer
            .write_block(BlockKind::RowIndex, 0, &mut empty_block(16384))
            .unwrap();
        let c = writer
            .write_block(BlockKind::FileTrailer, 0, &mut empty_block(4096))
            .unwrap();
        assert_eq!((a.offset, b.offset, c.offset), (0, 4096, 20480));
    }

    #[test]
    fn test_corrupt_body_detected() {
        let mut file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let loc = writer
            .write_block(BlockKind::Data, 0, &mut empty_block(4096))
            .unwrap();

        // Flip one body byte behind the writer's back.
        let image = file.read(0, 4096).unwrap();
        let mut bytes = image.to_vec();
        bytes[1000] ^= 1;
        file = MemFile::new();
        file.append(&bytes).unwrap();

        let err = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::Data).unwrap_err();
        assert!(matches!(err, StrataError::CorruptBlock { .. }));
    }

    #[test]
    fn test_wrong_kind_detected() {
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let loc = writer
            .write_block(BlockKind::Data, 0, &mut empty_block(4096))
            .unwrap();
        let err = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::RowIndex).unwrap_err();
        assert!(matches!(err, StrataError::CorruptBlock { .. }));
    }

    #[test]
    fn test_truncated_file_detected() {
        let file = MemFile::new();
        let loc = BlockLocation { offset: 0, shift: 0 };
        let err = read_block(&file, ChecksumKind::Xxh3, loc, BlockKind::Data).unwrap_err();
        assert!(matches!(err, StrataError::CorruptBlock { .. }));
    }

    #[test]
    fn test_cancellation() {
        let cancel = Arc::new(AtomicBool::new(false));
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file, ChecksumKind::Xxh3, Some(cancel.clone()));
        writer
            .write_block(BlockKind::Data, 0, &mut empty_block(4096))
            .unwrap();
        cancel.store(true, Ordering::Relaxed);
        let err = writer
            .write_block(BlockKind::Data, 0, &mut empty_block(4096))
            .unwrap_err();
        assert!(matches!(err, StrataError::Cancelled));
    }
}
