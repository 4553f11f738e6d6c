//! Multi-page stack files.
//!
//! A stack file is a classic big-endian TIFF with private blocks around the
//! image directories:
//!
//! ```text
//! 0       TIFF header ("MM", 42, offset of first IFD = 40 + summary length)
//! 8       [INDEX_MAP_OFFSET_HEADER][offset of index map]
//! 16      [DISPLAY_SETTINGS_OFFSET_HEADER][offset of display settings]
//! 24      [COMMENTS_OFFSET_HEADER][offset of comments]
//! 32      [SUMMARY_MD_HEADER][length] summary JSON
//! ...     per image: IFD, [RGB bits], pixels, X/Y resolution, metadata JSON
//! ...     [INDEX_MAP_HEADER][count] count x (c, z, t, p, IFD offset)
//! ...     OME-XML (first IFD's ImageDescription points here)
//! ...     [DISPLAY_SETTINGS_HEADER][reserved] display JSON, zero padded
//! ...     [COMMENTS_HEADER][length] comments JSON
//! ```
//!
//! The offset records at 8, 16 and 24 are filled in when the file is closed,
//! so a reader finds every trailer block without scanning the IFD chain.

mod reader;
mod writer;

pub use reader::MultipageTiffReader;
pub use writer::{MultipageTiffWriter, WriterOptions};

use crate::format::tiff::ByteOrder;

// =============================================================================
// Layout constants
// =============================================================================

/// Byte order of every file this crate writes.
pub const WRITE_BYTE_ORDER: ByteOrder = ByteOrder::BigEndian;

pub const INDEX_MAP_OFFSET_HEADER: u32 = 54_773_648;
pub const INDEX_MAP_HEADER: u32 = 3_453_623;
pub const SUMMARY_MD_HEADER: u32 = 2_355_492;
pub const DISPLAY_SETTINGS_OFFSET_HEADER: u32 = 483_765_892;
pub const DISPLAY_SETTINGS_HEADER: u32 = 347_834_724;
pub const COMMENTS_OFFSET_HEADER: u32 = 99_384_722;
pub const COMMENTS_HEADER: u32 = 84_720_485;

/// File offsets of the three offset records.
pub const INDEX_MAP_OFFSET_POSITION: u64 = 8;
pub const DISPLAY_SETTINGS_OFFSET_POSITION: u64 = 16;
pub const COMMENTS_OFFSET_POSITION: u64 = 24;

/// Offset of the summary block marker.
pub const SUMMARY_POSITION: u64 = 32;

/// Bytes before the summary JSON begins.
pub const SUMMARY_DATA_POSITION: u64 = 40;

/// Entries in every IFD except an OME file's first, which has one more.
pub const ENTRIES_PER_IFD: u16 = 13;

/// Bytes reserved for display settings per channel.
pub const DISPLAY_SETTINGS_BYTES_PER_CHANNEL: u64 = 256;

/// Bytes of one index map entry: four coordinates and an offset.
pub const INDEX_MAP_ENTRY_SIZE: u64 = 20;

/// Hard ceiling imposed by 32-bit TIFF offsets.
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Default reservation for the comments block.
pub const DEFAULT_COMMENTS_RESERVE: u64 = 1024 * 1024;

/// Default padding kept free below the file size limit.
pub const DEFAULT_SAFETY_MARGIN: u64 = 1_000_000;

/// Margin added to the pre-allocation estimate.
pub const PREALLOCATION_MARGIN: u64 = 2_000_000;

/// Per-image overhead assumed by the pre-allocation estimate.
pub const PREALLOCATION_PER_IMAGE: u64 = 2000;

// =============================================================================
// FileLimits
// =============================================================================

/// Size budget of each stack file.
///
/// `has_space_to_write` keeps `comments_reserve` and `safety_margin` free
/// below `max_file_size` so the trailer blocks always fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimits {
    pub max_file_size: u64,
    pub comments_reserve: u64,
    pub safety_margin: u64,
}

impl Default for FileLimits {
    fn default() -> Self {
        Self {
            max_file_size: MAX_FILE_SIZE,
            comments_reserve: DEFAULT_COMMENTS_RESERVE,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

impl FileLimits {
    /// Limits for a smaller maximum, with reserves scaled down proportionally.
    ///
    /// The maximum is clamped to 4 GiB.
    pub fn with_max_file_size(max_file_size: u64) -> Self {
        let max_file_size = max_file_size.min(MAX_FILE_SIZE);
        let scale = |value: u64| -> u64 {
            ((value as u128 * max_file_size as u128) / MAX_FILE_SIZE as u128) as u64
        };
        Self {
            max_file_size,
            comments_reserve: scale(DEFAULT_COMMENTS_RESERVE).max(1024),
            safety_margin: scale(DEFAULT_SAFETY_MARGIN).max(1024),
        }
    }
}
