//! Strata files: checksummed, immutable containers for ordered,
//! hierarchically related column data.
//!
//! A strata file stores `n` in `1..=3` columns. Each column is a finite
//! ordered sequence of rows; column 0 is one row group, and every row of
//! column `i` owns a contiguous (possibly empty) row group in column
//! `i + 1`. Ignoring hierarchy, a 1-column file behaves like an on-disk
//! `BTreeSet<V0>` and a 2-column file like `BTreeMap<V0, BTreeSet<V1>>`.
//!
//! Files are written once, in one pass, in sorted order, and are immutable
//! afterwards: the [`write`] side streams data blocks and keeps the value,
//! row, and filter index trees balanced while holding one open block per
//! tree level, so writer memory is bounded by tree height. The [`read`]
//! side verifies the header and trailer at open and hands out [`Cursor`]s
//! that seek by value in O(log n), seek by row, scan in both directions,
//! descend into child row groups, and answer approximate membership
//! queries against the column's filter tree.
//!
//! The crate is a library for an enclosing computation engine: value types
//! come in through the [`ColumnValue`] codec trait, storage through the
//! [`io`] collaborator traits, and every failure is surfaced as a
//! [`StrataError`]; nothing retries internally.
//!
//! ```no_run
//! use stratafile::{Direction, Parameters, Writer1};
//!
//! let mut writer =
//!     Writer1::<u64>::create("batch.strata".as_ref(), Parameters::default())?;
//! for i in 0..1000u64 {
//!     writer.write0(&(i * 2))?;
//! }
//! let reader = writer.into_reader()?;
//!
//! let mut rows = reader.rows();
//! rows.seek_value(&500, Direction::Forward)?;
//! assert_eq!(rows.value(), Some(500));
//! assert_eq!(rows.row_number(), Some(250));
//! # Ok::<(), stratafile::StrataError>(())
//! ```

pub mod codec;
pub mod error;
pub mod format;
pub mod io;
pub mod read;
pub mod write;

// ── Errors ───────────────────────────────────────────────────────────────────
pub use error::{Result, StrataError};

// ── Codec ────────────────────────────────────────────────────────────────────
pub use codec::ColumnValue;

// ── Write side ───────────────────────────────────────────────────────────────
pub use format::filter_block::FilterBits;
pub use format::ChecksumKind;
pub use write::{ColumnOptions, Parameters, Writer1, Writer2, Writer3};

// ── Read side ────────────────────────────────────────────────────────────────
pub use read::{BlockCache, Cursor, Direction, Reader1, Reader2, Reader3};

// ── I/O collaborator ─────────────────────────────────────────────────────────
pub use io::{BlockHandle, BufferPool, FileRead, FileWrite, MemFile};
