//! Integration tests for mmstack.
//!
//! These tests verify end-to-end functionality including:
//! - Round trips through real stack files, before and after reopening
//! - File size caps and roll-over naming
//! - Blank filling of interrupted acquisitions
//! - Index map, display settings and sidecar file contents
//! - The background sink and backend substitution

mod integration {
    pub mod test_utils;

    pub mod file_size_tests;
    pub mod pipeline_tests;
    pub mod storage_tests;
}
