//! Error types for strata file operations.

use std::io;
use thiserror::Error;

/// Result type alias using [`StrataError`].
pub type Result<T> = std::result::Result<T, StrataError>;

/// Errors surfaced by the strata file reader and writer.
///
/// Neither side retries internally: retries and backoff belong to the I/O
/// collaborator, and once it reports a permanent error the writer aborts and
/// the file is discarded.
#[derive(Error, Debug)]
pub enum StrataError {
    /// A block failed checksum, magic, or size verification on read. The
    /// cursor that hit this is unusable; other blocks of the file may still
    /// be readable.
    #[error("corrupt block at offset {offset}: {detail}")]
    CorruptBlock { offset: u64, detail: String },

    /// The file header disagrees with what the caller expects: format
    /// version, column count, checksum algorithm, or column value types.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The file's index structure disagrees with its content. The file
    /// should be treated as corrupt.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// The I/O collaborator reported an error during a build. The partially
    /// written file has no trailer and is unreadable.
    #[error("write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// Writer input violated the column sort order. The writer is unusable.
    #[error("value out of sort order in column {column}")]
    OutOfOrder { column: usize },

    /// A row number, value count, or offset exceeds its packed-field
    /// capacity. Detected before the affected block is committed.
    #[error("bounds exceeded: {0}")]
    BoundsExceeded(String),

    /// Cooperative cancellation. No side effects persist.
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error outside the write path (open, read).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StrataError {
    /// Create a corrupt-block error.
    pub fn corrupt(offset: u64, detail: impl Into<String>) -> Self {
        StrataError::CorruptBlock {
            offset,
            detail: detail.into(),
        }
    }
}
