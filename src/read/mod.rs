//! Read side: file opening, block caching, and cursors.

pub mod cache;
pub mod cursor;
pub mod file;

pub use cache::BlockCache;
pub use cursor::{Cursor, Direction};
pub use file::{Reader1, Reader2, Reader3};
