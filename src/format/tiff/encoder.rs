//! Typed encoders for IFDs and private blocks.
//!
//! All layout arithmetic lives here so the writer only decides *what* goes
//! into a directory, never at which byte it lands.

use super::parser::{ByteOrder, Ifd, IFD_COUNT_SIZE, IFD_ENTRY_SIZE};
use super::tags::{FieldType, TiffTag};

/// Encode one 12-byte IFD entry.
///
/// Short values with count 1 are left-justified in the value field, as TIFF
/// requires; everything else is written as a 4-byte value or offset.
pub fn encode_entry(
    byte_order: ByteOrder,
    tag: TiffTag,
    field_type: FieldType,
    count: u32,
    value: u32,
) -> [u8; IFD_ENTRY_SIZE] {
    let mut out = [0u8; IFD_ENTRY_SIZE];
    byte_order.write_u16(&mut out[0..2], tag.as_u16());
    byte_order.write_u16(&mut out[2..4], field_type.as_u16());
    byte_order.write_u32(&mut out[4..8], count);
    if field_type == FieldType::Short && count == 1 {
        byte_order.write_u16(&mut out[8..10], value as u16);
    } else {
        byte_order.write_u32(&mut out[8..12], value);
    }
    out
}

/// Builds an IFD of a fixed number of entries, in the order they are added.
#[derive(Debug)]
pub struct IfdEncoder {
    byte_order: ByteOrder,
    buf: Vec<u8>,
    capacity: u16,
    written: u16,
}

impl IfdEncoder {
    /// Start an IFD that will hold exactly `entry_count` entries.
    pub fn new(byte_order: ByteOrder, entry_count: u16) -> Self {
        let mut buf = vec![0u8; Ifd::calculate_size(entry_count as u64)];
        byte_order.write_u16(&mut buf[0..2], entry_count);
        Self {
            byte_order,
            buf,
            capacity: entry_count,
            written: 0,
        }
    }

    /// Byte position of the next entry relative to the start of the IFD.
    pub fn next_entry_position(&self) -> usize {
        IFD_COUNT_SIZE + self.written as usize * IFD_ENTRY_SIZE
    }

    /// Append an entry.
    ///
    /// # Panics
    /// Panics if more entries are added than the IFD was sized for.
    pub fn entry(&mut self, tag: TiffTag, field_type: FieldType, count: u32, value: u32) {
        assert!(self.written < self.capacity, "IFD entry table is full");
        let start = self.next_entry_position();
        let encoded = encode_entry(self.byte_order, tag, field_type, count, value);
        self.buf[start..start + IFD_ENTRY_SIZE].copy_from_slice(&encoded);
        self.written += 1;
    }

    /// Byte position of the next-IFD offset field relative to the IFD start.
    pub fn next_offset_position(&self) -> usize {
        self.buf.len() - 4
    }

    /// Set the next-IFD offset and return the encoded directory.
    pub fn finish(mut self, next_ifd_offset: u32) -> Vec<u8> {
        let pos = self.next_offset_position();
        self.byte_order.write_u32(&mut self.buf[pos..], next_ifd_offset);
        self.buf
    }
}

/// Encode an 8-byte `[marker][value]` record, the shape of every private
/// block header and offset record in a stack file.
pub fn encode_marker(byte_order: ByteOrder, marker: u32, value: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    byte_order.write_u32(&mut out[0..4], marker);
    byte_order.write_u32(&mut out[4..8], value);
    out
}

/// Encode a sequence of u32 values.
pub fn encode_u32s(byte_order: ByteOrder, values: &[u32]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * 4];
    for (chunk, value) in out.chunks_exact_mut(4).zip(values) {
        byte_order.write_u32(chunk, *value);
    }
    out
}

/// Encode a sequence of u16 values.
pub fn encode_u16s(byte_order: ByteOrder, values: &[u16]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * 2];
    for (chunk, value) in out.chunks_exact_mut(2).zip(values) {
        byte_order.write_u16(chunk, *value);
    }
    out
}
