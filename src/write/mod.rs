//! Streaming write side: column tree builders and file writers.

pub mod column;
pub mod file;

pub use column::{ColumnOptions, ColumnWriter};
pub use file::{Parameters, Writer1, Writer2, Writer3};
