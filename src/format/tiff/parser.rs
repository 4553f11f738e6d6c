//! TIFF header and IFD structure parsing.
//!
//! Multi-page stack files are classic TIFF (32-bit offsets); the 4 GiB cap on
//! every file keeps them out of BigTIFF territory.
//!
//! # TIFF Header Structure
//!
//! ```text
//! Bytes 0-1: Byte order (0x4949 = little-endian "II", 0x4D4D = big-endian "MM")
//! Bytes 2-3: Version (42 = 0x002A)
//! Bytes 4-7: Offset to first IFD (4 bytes)
//! ```
//!
//! # IFD Structure
//!
//! ```text
//! 2 bytes        entry count N
//! N x 12 bytes   entries: tag (2), field type (2), count (4), value/offset (4)
//! 4 bytes        offset of next IFD (0 terminates the chain)
//! ```

use crate::error::TiffError;
use crate::io::{
    read_u16_be, read_u16_le, read_u32_be, read_u32_le, write_u16_be, write_u16_le, write_u32_be,
    write_u32_le,
};

use super::tags::{FieldType, TiffTag};

// =============================================================================
// Constants
// =============================================================================

/// Magic bytes indicating little-endian byte order ("II" for Intel)
const BYTE_ORDER_LITTLE_ENDIAN: u16 = 0x4949;

/// Magic bytes indicating big-endian byte order ("MM" for Motorola)
const BYTE_ORDER_BIG_ENDIAN: u16 = 0x4D4D;

/// Version number for classic TIFF
pub const VERSION_TIFF: u16 = 42;

/// Size of classic TIFF header in bytes
pub const TIFF_HEADER_SIZE: usize = 8;

/// Size of one IFD entry in bytes
pub const IFD_ENTRY_SIZE: usize = 12;

/// Size of the entry count field at the start of an IFD
pub const IFD_COUNT_SIZE: usize = 2;

/// Size of the next IFD offset field at the end of an IFD
pub const IFD_NEXT_OFFSET_SIZE: usize = 4;

// =============================================================================
// ByteOrder
// =============================================================================

/// Byte order (endianness) of a TIFF file.
///
/// TIFF files declare their byte order in the first two bytes of the header.
/// All multi-byte values in the file must be read and written in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian ("II" = Intel)
    LittleEndian,
    /// Big-endian ("MM" = Motorola)
    BigEndian,
}

impl ByteOrder {
    /// The two magic bytes that open a file in this byte order.
    #[inline]
    pub const fn magic(self) -> [u8; 2] {
        match self {
            ByteOrder::LittleEndian => [b'I', b'I'],
            ByteOrder::BigEndian => [b'M', b'M'],
        }
    }

    /// Read a u16 from a byte slice using this byte order.
    #[inline]
    pub fn read_u16(self, bytes: &[u8]) -> u16 {
        match self {
            ByteOrder::LittleEndian => read_u16_le(bytes),
            ByteOrder::BigEndian => read_u16_be(bytes),
        }
    }

    /// Read a u32 from a byte slice using this byte order.
    #[inline]
    pub fn read_u32(self, bytes: &[u8]) -> u32 {
        match self {
            ByteOrder::LittleEndian => read_u32_le(bytes),
            ByteOrder::BigEndian => read_u32_be(bytes),
        }
    }

    /// Write a u16 into the start of `out` using this byte order.
    #[inline]
    pub fn write_u16(self, out: &mut [u8], value: u16) {
        match self {
            ByteOrder::LittleEndian => write_u16_le(out, value),
            ByteOrder::BigEndian => write_u16_be(out, value),
        }
    }

    /// Write a u32 into the start of `out` using this byte order.
    #[inline]
    pub fn write_u32(self, out: &mut [u8], value: u32) {
        match self {
            ByteOrder::LittleEndian => write_u32_le(out, value),
            ByteOrder::BigEndian => write_u32_be(out, value),
        }
    }
}

// =============================================================================
// TiffHeader
// =============================================================================

/// Parsed TIFF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TiffHeader {
    /// Byte order for all multi-byte values in the file
    pub byte_order: ByteOrder,

    /// Offset to the first IFD in the file
    pub first_ifd_offset: u64,
}

impl TiffHeader {
    /// Parse a TIFF header from raw bytes.
    ///
    /// # Errors
    /// - `FileTooSmall` if there aren't enough bytes for the header
    /// - `InvalidMagic` if byte order bytes are not II or MM
    /// - `InvalidVersion` if version is not 42
    /// - `InvalidIfdOffset` if the first IFD offset is outside the file
    pub fn parse(bytes: &[u8], file_size: u64) -> Result<Self, TiffError> {
        if bytes.len() < TIFF_HEADER_SIZE {
            return Err(TiffError::FileTooSmall {
                required: TIFF_HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        // Read as little-endian because we're checking for specific byte patterns
        let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
        let byte_order = match magic {
            BYTE_ORDER_LITTLE_ENDIAN => ByteOrder::LittleEndian,
            BYTE_ORDER_BIG_ENDIAN => ByteOrder::BigEndian,
            _ => return Err(TiffError::InvalidMagic(magic)),
        };

        let version = byte_order.read_u16(&bytes[2..4]);
        if version != VERSION_TIFF {
            return Err(TiffError::InvalidVersion(version));
        }

        let first_ifd_offset = byte_order.read_u32(&bytes[4..8]) as u64;
        if first_ifd_offset >= file_size {
            return Err(TiffError::InvalidIfdOffset(first_ifd_offset));
        }

        Ok(TiffHeader {
            byte_order,
            first_ifd_offset,
        })
    }

    /// Encode a header in `byte_order` pointing at `first_ifd_offset`.
    pub fn encode(byte_order: ByteOrder, first_ifd_offset: u32) -> [u8; TIFF_HEADER_SIZE] {
        let mut out = [0u8; TIFF_HEADER_SIZE];
        out[0..2].copy_from_slice(&byte_order.magic());
        byte_order.write_u16(&mut out[2..4], VERSION_TIFF);
        byte_order.write_u32(&mut out[4..8], first_ifd_offset);
        out
    }
}

// =============================================================================
// IfdEntry
// =============================================================================

/// A single 12-byte IFD entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfdEntry {
    /// Raw tag number
    pub tag_raw: u16,

    /// Known tag, if recognised
    pub tag: Option<TiffTag>,

    /// Raw field type number
    pub field_type_raw: u16,

    /// Known field type, if recognised
    pub field_type: Option<FieldType>,

    /// Number of values
    pub count: u32,

    /// The raw 4-byte value/offset field
    pub value_offset_bytes: [u8; 4],

    /// Whether the value is stored inline in `value_offset_bytes`
    pub is_inline: bool,
}

impl IfdEntry {
    /// Parse an entry from exactly 12 bytes.
    pub fn parse(bytes: &[u8], byte_order: ByteOrder) -> Self {
        let tag_raw = byte_order.read_u16(&bytes[0..2]);
        let field_type_raw = byte_order.read_u16(&bytes[2..4]);
        let count = byte_order.read_u32(&bytes[4..8]);
        let mut value_offset_bytes = [0u8; 4];
        value_offset_bytes.copy_from_slice(&bytes[8..12]);

        let field_type = FieldType::from_u16(field_type_raw);
        let is_inline = field_type
            .map(|ft| ft.fits_inline(count as u64))
            .unwrap_or(false);

        IfdEntry {
            tag_raw,
            tag: TiffTag::from_u16(tag_raw),
            field_type_raw,
            field_type,
            count,
            value_offset_bytes,
            is_inline,
        }
    }

    /// Total size of the value in bytes, if the field type is known.
    pub fn value_byte_size(&self) -> Option<u64> {
        self.field_type
            .map(|ft| ft.size_in_bytes() as u64 * self.count as u64)
    }

    /// Interpret the value field as an offset into the file.
    #[inline]
    pub fn value_offset(&self, byte_order: ByteOrder) -> u64 {
        byte_order.read_u32(&self.value_offset_bytes) as u64
    }

    /// Get a single inline integer value (Short or Long, count 1).
    ///
    /// Short values are left-justified in the 4-byte field.
    pub fn inline_u32(&self, byte_order: ByteOrder) -> Option<u32> {
        if self.count != 1 {
            return None;
        }
        match self.field_type? {
            FieldType::Short => Some(byte_order.read_u16(&self.value_offset_bytes) as u32),
            FieldType::Long => Some(byte_order.read_u32(&self.value_offset_bytes)),
            _ => None,
        }
    }
}

// =============================================================================
// Ifd
// =============================================================================

/// A parsed Image File Directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ifd {
    /// Entries in file order
    pub entries: Vec<IfdEntry>,

    /// Offset of the next IFD (0 if this is the last one)
    pub next_ifd_offset: u64,
}

impl Ifd {
    /// Number of bytes an IFD with `entry_count` entries occupies.
    #[inline]
    pub const fn calculate_size(entry_count: u64) -> usize {
        IFD_COUNT_SIZE + entry_count as usize * IFD_ENTRY_SIZE + IFD_NEXT_OFFSET_SIZE
    }

    /// Parse an IFD from bytes starting at its entry count.
    pub fn parse(bytes: &[u8], byte_order: ByteOrder) -> Result<Self, TiffError> {
        if bytes.len() < IFD_COUNT_SIZE {
            return Err(TiffError::FileTooSmall {
                required: IFD_COUNT_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }

        let entry_count = byte_order.read_u16(&bytes[0..2]) as u64;
        let required = Self::calculate_size(entry_count);
        if bytes.len() < required {
            return Err(TiffError::FileTooSmall {
                required: required as u64,
                actual: bytes.len() as u64,
            });
        }

        let entries = (0..entry_count as usize)
            .map(|i| {
                let start = IFD_COUNT_SIZE + i * IFD_ENTRY_SIZE;
                IfdEntry::parse(&bytes[start..start + IFD_ENTRY_SIZE], byte_order)
            })
            .collect();

        let next_start = required - IFD_NEXT_OFFSET_SIZE;
        let next_ifd_offset = byte_order.read_u32(&bytes[next_start..required]) as u64;

        Ok(Ifd {
            entries,
            next_ifd_offset,
        })
    }

    /// Find the entry for a known tag.
    pub fn get_entry_by_tag(&self, tag: TiffTag) -> Option<&IfdEntry> {
        self.entries.iter().find(|e| e.tag == Some(tag))
    }

    /// Read a required inline integer tag.
    pub fn required_u32(
        &self,
        tag: TiffTag,
        name: &'static str,
        byte_order: ByteOrder,
    ) -> Result<u32, TiffError> {
        let entry = self.get_entry_by_tag(tag).ok_or(TiffError::MissingTag(name))?;
        entry
            .inline_u32(byte_order)
            .ok_or_else(|| TiffError::InvalidTagValue {
                tag: name,
                message: format!(
                    "expected a single Short or Long, got type {} count {}",
                    entry.field_type_raw, entry.count
                ),
            })
    }

    /// Image width in pixels.
    pub fn image_width(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(TiffTag::ImageWidth)?
            .inline_u32(byte_order)
    }

    /// Image height in pixels.
    pub fn image_height(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(TiffTag::ImageLength)?
            .inline_u32(byte_order)
    }

    /// Samples per pixel (1 for grayscale, 3 for RGB).
    pub fn samples_per_pixel(&self, byte_order: ByteOrder) -> Option<u32> {
        self.get_entry_by_tag(TiffTag::SamplesPerPixel)?
            .inline_u32(byte_order)
    }
}

// =============================================================================
// Tests
// =============================================================================
