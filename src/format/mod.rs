//! On-disk formats.
//!
//! - [`tiff`]: the classic TIFF subset stack files are built from
//! - [`mptiff`]: the multi-page stack layout with its private index, display and
//!   comment blocks, plus the incremental writer and the matching reader

pub mod mptiff;
pub mod tiff;
