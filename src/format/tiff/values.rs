//! TIFF tag value reading.
//!
//! Values can be stored either inline in the IFD entry (for small values)
//! or at an offset in the file (for strings, rationals and arrays).

use bytes::Bytes;

use crate::error::TiffError;
use crate::io::RangeReader;

use super::parser::{ByteOrder, IfdEntry};
use super::tags::FieldType;

// =============================================================================
// ValueReader
// =============================================================================

/// Reads tag values from a TIFF file.
///
/// Combines a [`RangeReader`] with the file's byte order.
pub struct ValueReader<'a, R: RangeReader + ?Sized> {
    reader: &'a R,
    byte_order: ByteOrder,
}

impl<'a, R: RangeReader + ?Sized> ValueReader<'a, R> {
    /// Create a new ValueReader.
    pub fn new(reader: &'a R, byte_order: ByteOrder) -> Self {
        Self { reader, byte_order }
    }

    /// Get the byte order used for decoding.
    #[inline]
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// Read raw bytes for an IFD entry's value.
    ///
    /// For inline values, returns the bytes from the entry.
    /// For offset values, fetches the bytes from the file.
    pub fn read_bytes(&self, entry: &IfdEntry) -> Result<Bytes, TiffError> {
        let size = entry
            .value_byte_size()
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if entry.is_inline {
            Ok(Bytes::copy_from_slice(
                &entry.value_offset_bytes[..size as usize],
            ))
        } else {
            let offset = entry.value_offset(self.byte_order);
            Ok(self.reader.read_exact_at(offset, size as usize)?)
        }
    }

    /// Read a single u32 value from an entry.
    ///
    /// Handles both Short and Long field types, converting as needed.
    pub fn read_u32(&self, entry: &IfdEntry) -> Result<u32, TiffError> {
        if let Some(value) = entry.inline_u32(self.byte_order) {
            return Ok(value);
        }

        Err(TiffError::InvalidTagValue {
            tag: "unknown",
            message: format!(
                "expected a single Short or Long, got type {} count {}",
                entry.field_type_raw, entry.count
            ),
        })
    }

    /// Read a list of u32 values (Short or Long).
    pub fn read_u32_array(&self, entry: &IfdEntry) -> Result<Vec<u32>, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        let bytes = self.read_bytes(entry)?;
        let count = entry.count as usize;
        let values = match field_type {
            FieldType::Short => (0..count)
                .map(|i| self.byte_order.read_u16(&bytes[i * 2..]) as u32)
                .collect(),
            FieldType::Long => (0..count)
                .map(|i| self.byte_order.read_u32(&bytes[i * 4..]))
                .collect(),
            _ => {
                return Err(TiffError::InvalidTagValue {
                    tag: "unknown",
                    message: format!("expected Short or Long for array, got {:?}", field_type),
                })
            }
        };
        Ok(values)
    }

    /// Read a single rational as `(numerator, denominator)`.
    pub fn read_rational(&self, entry: &IfdEntry) -> Result<(u32, u32), TiffError> {
        if entry.field_type != Some(FieldType::Rational) || entry.count != 1 {
            return Err(TiffError::InvalidTagValue {
                tag: "resolution",
                message: format!(
                    "expected one Rational, got type {} count {}",
                    entry.field_type_raw, entry.count
                ),
            });
        }
        let bytes = self.read_bytes(entry)?;
        Ok((
            self.byte_order.read_u32(&bytes[0..4]),
            self.byte_order.read_u32(&bytes[4..8]),
        ))
    }

    /// Read a string value from an entry (ASCII type).
    ///
    /// Everything from the first NUL onwards is dropped.
    pub fn read_string(&self, entry: &IfdEntry) -> Result<String, TiffError> {
        let field_type = entry
            .field_type
            .ok_or(TiffError::UnknownFieldType(entry.field_type_raw))?;

        if field_type != FieldType::Ascii {
            return Err(TiffError::InvalidTagValue {
                tag: "unknown",
                message: format!("expected Ascii type for string, got {:?}", field_type),
            });
        }

        let bytes = self.read_bytes(entry)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}

// =============================================================================
// Tests
// =============================================================================
