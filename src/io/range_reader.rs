use bytes::Bytes;

use crate::error::IoError;

/// Trait for reading byte ranges from a dataset file.
///
/// This abstraction lets the TIFF parser work on files that are still being
/// appended to, as well as on in-memory buffers in tests. Reads are
/// positional, so implementations must not depend on a shared cursor.
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Get the current size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging).
    fn identifier(&self) -> &str;
}

impl RangeReader for Bytes {
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let start = offset as usize;
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if end > self.len() {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size: self.len() as u64,
            });
        }
        Ok(self.slice(start..end))
    }

    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn identifier(&self) -> &str {
        "memory"
    }
}

// =============================================================================
// Endian Helper Functions
// =============================================================================
//
// Files written by this crate are big-endian, but the reader honours whatever
// the header declares. These helpers are used by the TIFF parser and encoder.

/// Read a little-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

/// Read a big-endian u16 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 2 bytes.
#[inline]
pub fn read_u16_be(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Read a little-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Read a big-endian u32 from a byte slice.
///
/// # Panics
/// Panics if the slice has fewer than 4 bytes.
#[inline]
pub fn read_u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Write a u16 into the first two bytes of `out`, little-endian.
#[inline]
pub fn write_u16_le(out: &mut [u8], value: u16) {
    out[..2].copy_from_slice(&value.to_le_bytes());
}

/// Write a u16 into the first two bytes of `out`, big-endian.
#[inline]
pub fn write_u16_be(out: &mut [u8], value: u16) {
    out[..2].copy_from_slice(&value.to_be_bytes());
}

/// Write a u32 into the first four bytes of `out`, little-endian.
#[inline]
pub fn write_u32_le(out: &mut [u8], value: u32) {
    out[..4].copy_from_slice(&value.to_le_bytes());
}

/// Write a u32 into the first four bytes of `out`, big-endian.
#[inline]
pub fn write_u32_be(out: &mut [u8], value: u32) {
    out[..4].copy_from_slice(&value.to_be_bytes());
}
