//! File header and file trailer blocks.
//!
//! The header is the first 4 KiB of the file, the trailer the last. A file
//! whose trailer cannot be verified is treated as non-existent: the trailer
//! is only written after every other block, and the writer publishes the
//! file only after the trailer is synced.
//!
//! ## Header block layout (after the 16-byte prefix)
//!
//! ```text
//! version:       u32
//! n_columns:     u8      1..=3
//! checksum_algo: u8      recorded per file; the same algorithm frames
//!                        every block including this one
//! _pad:          u16
//! per column:    varint len + value type tag (UTF-8)
//! kv_count:      u16
//! per pair:      varint len + key, varint len + value
//! ```
//!
//! ## Trailer block layout (after the 16-byte prefix)
//!
//! ```text
//! n_columns: u8
//! _pad:      [u8; 7]
//! per column:
//!   rows:              u64
//!   value_index_root:  u40 offset/4096 + u8 shift (0xFF = absent)
//!   row_index_root:    u40 + u8
//!   filter_index_root: u40 + u8
//! ```

use crate::error::{Result, StrataError};
use crate::format::{
    decode_varint, encode_varint, read_root, write_root, BlockKind, BlockLocation, ChecksumKind,
    BLOCK_ALIGN, BLOCK_HEADER_LEN,
};

/// Increment on each incompatible format change.
pub const FORMAT_VERSION: u32 = 1;

/// Maximum columns per file.
pub const MAX_COLUMNS: usize = 3;

/// Fixed block length of the header and trailer blocks.
pub const FIXED_BLOCK_LEN: usize = BLOCK_ALIGN as usize;

// ============================================================================
// File header
// ============================================================================

/// Decoded file header.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub version: u32,
    pub checksum: ChecksumKind,
    /// Value type tag per column, recorded at write time and checked at
    /// open.
    pub type_tags: Vec<String>,
    /// Free-form key/value map (e.g. a debug name).
    pub meta: Vec<(String, String)>,
}

impl FileHeader {
    pub fn n_columns(&self) -> usize {
        self.type_tags.len()
    }

    pub fn meta_value(&self, key: &str) -> Option<&str> {
        self.meta
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Lay out the header block with a zeroed prefix, ready for the block
    /// layer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; BLOCK_HEADER_LEN];
        buf.extend_from_slice(&self.version.to_le_bytes());
        buf.push(self.type_tags.len() as u8);
        buf.push(self.checksum.as_u8());
        buf.extend_from_slice(&[0u8; 2]);
        for tag in &self.type_tags {
            encode_varint(tag.len() as u64, &mut buf);
            buf.extend_from_slice(tag.as_bytes());
        }
        buf.extend_from_slice(&(self.meta.len() as u16).to_le_bytes());
        for (key, value) in &self.meta {
            encode_varint(key.len() as u64, &mut buf);
            buf.extend_from_slice(key.as_bytes());
            encode_varint(value.len() as u64, &mut buf);
            buf.extend_from_slice(value.as_bytes());
        }
        if buf.len() > FIXED_BLOCK_LEN {
            return Err(StrataError::BoundsExceeded(format!(
                "header metadata needs {} bytes, the header block holds {}",
                buf.len(),
                FIXED_BLOCK_LEN
            )));
        }
        buf.resize(FIXED_BLOCK_LEN, 0);
        Ok(buf)
    }

    /// Decode and verify the header block at offset 0.
    ///
    /// This is the bootstrap read: the checksum algorithm is read from the
    /// unverified body first, then used to verify the block it came from.
    pub fn decode(block: &[u8]) -> Result<Self> {
        if block.len() != FIXED_BLOCK_LEN {
            return Err(StrataError::corrupt(0, "header block has wrong length"));
        }
        let checksum = ChecksumKind::from_u8(block[BLOCK_HEADER_LEN + 5]).ok_or_else(|| {
            StrataError::SchemaMismatch(format!(
                "unknown checksum algorithm id {}",
                block[BLOCK_HEADER_LEN + 5]
            ))
        })?;
        let location = BlockLocation { offset: 0, shift: 0 };
        super::block::verify_block(block, checksum, location, BlockKind::FileHeader)?;

        let corrupt = |detail: &str| StrataError::corrupt(0, detail);
        let body = &block[BLOCK_HEADER_LEN..];
        let version = u32::from_le_bytes(body[0..4].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(StrataError::SchemaMismatch(format!(
                "file format version {version}, this build reads {FORMAT_VERSION}"
            )));
        }
        let n_columns = body[4] as usize;
        if !(1..=MAX_COLUMNS).contains(&n_columns) {
            return Err(StrataError::SchemaMismatch(format!(
                "file has {n_columns} columns, expected 1..={MAX_COLUMNS}"
            )));
        }

        let mut pos = 8;
        let read_str = |pos: &mut usize| -> Result<String> {
            let len = decode_varint(body, pos).map_err(|e| corrupt(&e))? as usize;
            let end = pos
                .checked_add(len)
                .filter(|&end| end <= body.len())
                .ok_or_else(|| corrupt("header string overflows the block"))?;
            let s = std::str::from_utf8(&body[*pos..end])
                .map_err(|_| corrupt("header string is not UTF-8"))?
                .to_string();
            *pos = end;
            Ok(s)
        };

        let mut type_tags = Vec::with_capacity(n_columns);
        for _ in 0..n_columns {
            type_tags.push(read_str(&mut pos)?);
        }
        if pos + 2 > body.len() {
            return Err(corrupt("header metadata truncated"));
        }
        let kv_count = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let mut meta = Vec::with_capacity(kv_count);
        for _ in 0..kv_count {
            let key = read_str(&mut pos)?;
            let value = read_str(&mut pos)?;
            meta.push((key, value));
        }

        Ok(Self {
            version,
            checksum,
            type_tags,
            meta,
        })
    }
}

// ============================================================================
// File trailer
// ============================================================================

/// Per-column roots recorded in the trailer. Roots are always index blocks;
/// a root is absent when the column is empty (or, for the value and filter
/// trees, when the column was written without them).
#[derive(Debug, Clone, Copy, Default)]
pub struct ColumnRoots {
    pub rows: u64,
    pub value_index_root: Option<BlockLocation>,
    pub row_index_root: Option<BlockLocation>,
    pub filter_index_root: Option<BlockLocation>,
}

/// Decoded file trailer.
#[derive(Debug, Clone)]
pub struct FileTrailer {
    pub columns: Vec<ColumnRoots>,
}

impl FileTrailer {
    /// Lay out the trailer block with a zeroed prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; BLOCK_HEADER_LEN];
        buf.push(self.columns.len() as u8);
        buf.extend_from_slice(&[0u8; 7]);
        for column in &self.columns {
            buf.extend_from_slice(&column.rows.to_le_bytes());
            write_root(&mut buf, column.value_index_root);
            write_root(&mut buf, column.row_index_root);
            write_root(&mut buf, column.filter_index_root);
        }
        buf.resize(FIXED_BLOCK_LEN, 0);
        buf
    }

    /// Decode and verify the trailer block at `offset` (the last 4 KiB of
    /// the file).
    pub fn decode(block: &[u8], offset: u64, checksum: ChecksumKind) -> Result<Self> {
        if block.len() != FIXED_BLOCK_LEN {
            return Err(StrataError::corrupt(offset, "trailer block has wrong length"));
        }
        let location = BlockLocation { offset, shift: 0 };
        super::block::verify_block(block, checksum, location, BlockKind::FileTrailer)?;

        let body = &block[BLOCK_HEADER_LEN..];
        let n_columns = body[0] as usize;
        if !(1..=MAX_COLUMNS).contains(&n_columns) {
            return Err(StrataError::corrupt(
                offset,
                format!("trailer lists {n_columns} columns"),
            ));
        }
        let mut columns = Vec::with_capacity(n_columns);
        let mut pos = 8;
        for _ in 0..n_columns {
            let rows = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
            let value_index_root = read_root(body[pos + 8..pos + 14].try_into().unwrap())
                .map_err(|e| StrataError::corrupt(offset, e))?;
            let row_index_root = read_root(body[pos + 14..pos + 20].try_into().unwrap())
                .map_err(|e| StrataError::corrupt(offset, e))?;
            let filter_index_root = read_root(body[pos + 20..pos + 26].try_into().unwrap())
                .map_err(|e| StrataError::corrupt(offset, e))?;
            pos += 26;
            columns.push(ColumnRoots {
                rows,
                value_index_root,
                row_index_root,
                filter_index_root,
            });
        }
        Ok(Self { columns })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::block::{read_block, BlockWriter};
    use crate::io::{FileRead, MemFile};

    fn write_and_load(kind: BlockKind, mut buf: Vec<u8>) -> (MemFile, Vec<u8>) {
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let loc = writer.write_block(kind, 0, &mut buf).unwrap();
        let block = read_block(&file, ChecksumKind::Xxh3, loc, kind).unwrap();
        (file, block.to_vec())
    }

    #[test]
    fn test_header_round_trip() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            checksum: ChecksumKind::Xxh3,
            type_tags: vec!["u64".to_string(), "bytes".to_string()],
            meta: vec![("name".to_string(), "batch-0017".to_string())],
        };
        let (_, block) = write_and_load(BlockKind::FileHeader, header.encode().unwrap());
        let decoded = FileHeader::decode(&block).unwrap();
        assert_eq!(decoded.n_columns(), 2);
        assert_eq!(decoded.type_tags, header.type_tags);
        assert_eq!(decoded.meta_value("name"), Some("batch-0017"));
        assert_eq!(decoded.meta_value("missing"), None);
    }

    #[test]
    fn test_header_rejects_unknown_checksum() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            checksum: ChecksumKind::Xxh3,
            type_tags: vec!["u64".to_string()],
            meta: vec![],
        };
        let (_, mut block) = write_and_load(BlockKind::FileHeader, header.encode().unwrap());
        block[BLOCK_HEADER_LEN + 5] = 99;
        let err = FileHeader::decode(&block).unwrap_err();
        assert!(matches!(err, StrataError::SchemaMismatch(_)));
    }

    #[test]
    fn test_header_detects_corruption() {
        let header = FileHeader {
            version: FORMAT_VERSION,
            checksum: ChecksumKind::Xxh3,
            type_tags: vec!["u64".to_string()],
            meta: vec![],
        };
        let (_, mut block) = write_and_load(BlockKind::FileHeader, header.encode().unwrap());
        block[100] ^= 0xFF;
        let err = FileHeader::decode(&block).unwrap_err();
        assert!(matches!(err, StrataError::CorruptBlock { .. }));
    }

    #[test]
    fn test_trailer_round_trip() {
        let trailer = FileTrailer {
            columns: vec![
                ColumnRoots {
                    rows: 1000,
                    value_index_root: Some(BlockLocation {
                        offset: 8192,
                        shift: 1,
                    }),
                    row_index_root: Some(BlockLocation {
                        offset: 16384,
                        shift: 1,
                    }),
                    filter_index_root: None,
                },
                ColumnRoots {
                    rows: 0,
                    value_index_root: None,
                    row_index_root: None,
                    filter_index_root: None,
                },
            ],
        };
        let file = MemFile::new();
        let mut writer = BlockWriter::new(file.clone(), ChecksumKind::Xxh3, None);
        let mut buf = trailer.encode();
        let loc = writer
            .write_block(BlockKind::FileTrailer, 0, &mut buf)
            .unwrap();

        let block = file.read(loc.offset, FIXED_BLOCK_LEN).unwrap();
        let decoded = FileTrailer::decode(&block, loc.offset, ChecksumKind::Xxh3).unwrap();
        assert_eq!(decoded.columns.len(), 2);
        assert_eq!(decoded.columns[0].rows, 1000);
        assert_eq!(
            decoded.columns[0].value_index_root,
            Some(BlockLocation {
                offset: 8192,
                shift: 1
            })
        );
        assert!(decoded.columns[0].filter_index_root.is_none());
        assert!(decoded.columns[1].row_index_root.is_none());
    }
}
