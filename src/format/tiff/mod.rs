//! Classic TIFF primitives used by stack files.
//!
//! # Key Concepts
//!
//! - **Byte order**: TIFF files declare their endianness (II = little-endian, MM = big-endian)
//!   in the header. All multi-byte values must be read and written respecting this order.
//!
//! - **IFD (Image File Directory)**: Contains the tags describing one image plane and
//!   points at its pixel strip and at the next IFD.
//!
//! - **Inline vs offset values**: Small values are stored inline in the IFD entry,
//!   larger values are stored at an offset pointed to by the entry.
//!
//! Parsing lives in [`parser`] and [`values`]; the writing side is the typed encoder in
//! [`encoder`] so that byte layout can be tested without touching a file.

mod encoder;
mod parser;
mod tags;
mod values;

pub use encoder::{encode_entry, encode_marker, encode_u16s, encode_u32s, IfdEncoder};
pub use parser::{
    ByteOrder, Ifd, IfdEntry, TiffHeader, IFD_COUNT_SIZE, IFD_ENTRY_SIZE, IFD_NEXT_OFFSET_SIZE,
    TIFF_HEADER_SIZE, VERSION_TIFF,
};
pub use tags::{
    FieldType, TiffTag, COMPRESSION_NONE, PHOTOMETRIC_BLACK_IS_ZERO, PHOTOMETRIC_RGB,
    RESOLUTION_UNIT_CENTIMETER,
};
pub use values::ValueReader;
