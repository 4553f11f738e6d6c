//! Tagged images: a pixel buffer plus its JSON tag map.

use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ImageError, MetadataError};
use crate::format::tiff::ByteOrder;
use crate::label::ImageLabel;
use crate::metadata::{self, keys, JsonMap, SummaryInfo};

// =============================================================================
// PixelType
// =============================================================================

/// Pixel layouts an acquisition can declare.
///
/// RGB types arrive as four components per pixel (the fourth unused) and
/// are stored as three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelType {
    Gray8,
    Gray16,
    Gray32,
    Rgb32,
    Rgb64,
}

impl PixelType {
    pub const fn as_str(self) -> &'static str {
        match self {
            PixelType::Gray8 => "GRAY8",
            PixelType::Gray16 => "GRAY16",
            PixelType::Gray32 => "GRAY32",
            PixelType::Rgb32 => "RGB32",
            PixelType::Rgb64 => "RGB64",
        }
    }

    /// Bytes per sample.
    pub const fn byte_depth(self) -> u32 {
        match self {
            PixelType::Gray8 | PixelType::Rgb32 => 1,
            PixelType::Gray16 | PixelType::Rgb64 => 2,
            PixelType::Gray32 => 4,
        }
    }

    pub const fn is_rgb(self) -> bool {
        matches!(self, PixelType::Rgb32 | PixelType::Rgb64)
    }

    /// Samples per pixel in the in-memory buffer.
    pub const fn source_samples(self) -> u32 {
        if self.is_rgb() {
            4
        } else {
            1
        }
    }

    /// Samples per pixel on disk.
    pub const fn stored_samples(self) -> u32 {
        if self.is_rgb() {
            3
        } else {
            1
        }
    }

    /// Bytes of pixel data one image occupies on disk.
    pub const fn stored_bytes(self, width: u32, height: u32) -> u64 {
        width as u64 * height as u64 * self.byte_depth() as u64 * self.stored_samples() as u64
    }

    /// Number of samples a buffer of this type must hold.
    pub const fn source_len(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.source_samples() as usize
    }

    /// Largest displayable value, used as the default contrast maximum.
    pub const fn display_max(self) -> u32 {
        match self {
            PixelType::Gray8 | PixelType::Rgb32 => 255,
            PixelType::Gray16 | PixelType::Rgb64 | PixelType::Gray32 => 65535,
        }
    }

    /// Infer the type from TIFF sample layout.
    pub fn from_layout(bits_per_sample: u32, samples_per_pixel: u32) -> Option<Self> {
        match (bits_per_sample, samples_per_pixel) {
            (8, 1) => Some(PixelType::Gray8),
            (16, 1) => Some(PixelType::Gray16),
            (32, 1) => Some(PixelType::Gray32),
            (8, 3) => Some(PixelType::Rgb32),
            (16, 3) => Some(PixelType::Rgb64),
            _ => None,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GRAY8" => Ok(PixelType::Gray8),
            "GRAY16" => Ok(PixelType::Gray16),
            "GRAY32" => Ok(PixelType::Gray32),
            "RGB32" => Ok(PixelType::Rgb32),
            "RGB64" => Ok(PixelType::Rgb64),
            other => Err(MetadataError::UnknownPixelType(other.to_string())),
        }
    }
}

// =============================================================================
// PixelBuffer
// =============================================================================

/// Raw pixel samples.
#[derive(Debug, Clone, PartialEq)]
pub enum PixelBuffer {
    /// 8-bit samples (GRAY8, RGB32)
    Bytes(Bytes),
    /// 16-bit samples (GRAY16, RGB64)
    Shorts(Vec<u16>),
    /// 32-bit float samples (GRAY32)
    Floats(Vec<f32>),
}

impl PixelBuffer {
    /// All-zero buffer for one image of the given geometry.
    pub fn zeroed(pixel_type: PixelType, width: u32, height: u32) -> Self {
        let len = pixel_type.source_len(width, height);
        match pixel_type.byte_depth() {
            1 => PixelBuffer::Bytes(Bytes::from(vec![0u8; len])),
            2 => PixelBuffer::Shorts(vec![0u16; len]),
            _ => PixelBuffer::Floats(vec![0f32; len]),
        }
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::Bytes(b) => b.len(),
            PixelBuffer::Shorts(s) => s.len(),
            PixelBuffer::Floats(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the sample width matches the pixel type.
    pub fn matches(&self, pixel_type: PixelType) -> bool {
        matches!(
            (self, pixel_type.byte_depth()),
            (PixelBuffer::Bytes(_), 1) | (PixelBuffer::Shorts(_), 2) | (PixelBuffer::Floats(_), 4)
        )
    }

    pub(crate) fn sample_name(&self) -> &'static str {
        match self {
            PixelBuffer::Bytes(_) => "8-bit buffer",
            PixelBuffer::Shorts(_) => "16-bit buffer",
            PixelBuffer::Floats(_) => "32-bit float buffer",
        }
    }

    /// Encode samples in their on-disk layout.
    ///
    /// RGB buffers lose every fourth component; multi-byte samples are
    /// written in `byte_order`. Gray 8-bit data is returned without copying.
    pub fn encode(&self, rgb: bool, byte_order: ByteOrder) -> Bytes {
        let keep = |i: &usize| !rgb || (i + 1) % 4 != 0;
        match self {
            PixelBuffer::Bytes(b) if !rgb => b.clone(),
            PixelBuffer::Bytes(b) => b
                .iter()
                .enumerate()
                .filter(|(i, _)| keep(i))
                .map(|(_, v)| *v)
                .collect::<Vec<u8>>()
                .into(),
            PixelBuffer::Shorts(s) => {
                let mut out = BytesMut::with_capacity(s.len() * 2);
                for (_, v) in s.iter().enumerate().filter(|(i, _)| keep(i)) {
                    match byte_order {
                        ByteOrder::BigEndian => out.put_u16(*v),
                        ByteOrder::LittleEndian => out.put_u16_le(*v),
                    }
                }
                out.freeze()
            }
            PixelBuffer::Floats(f) => {
                let mut out = BytesMut::with_capacity(f.len() * 4);
                for v in f {
                    match byte_order {
                        ByteOrder::BigEndian => out.put_f32(*v),
                        ByteOrder::LittleEndian => out.put_f32_le(*v),
                    }
                }
                out.freeze()
            }
        }
    }

    /// Decode an on-disk strip back into an in-memory buffer.
    ///
    /// RGB data is re-expanded to four components with a zero fourth sample.
    pub fn decode(data: &[u8], pixel_type: PixelType, byte_order: ByteOrder) -> Self {
        let rgb = pixel_type.is_rgb();
        match pixel_type.byte_depth() {
            1 if !rgb => PixelBuffer::Bytes(Bytes::copy_from_slice(data)),
            1 => {
                let mut out = Vec::with_capacity(data.len() / 3 * 4);
                for px in data.chunks_exact(3) {
                    out.extend_from_slice(px);
                    out.push(0);
                }
                PixelBuffer::Bytes(Bytes::from(out))
            }
            2 => {
                let samples = data.chunks_exact(2).map(|c| byte_order.read_u16(c));
                if rgb {
                    let samples: Vec<u16> = samples.collect();
                    let mut out = Vec::with_capacity(samples.len() / 3 * 4);
                    for px in samples.chunks_exact(3) {
                        out.extend_from_slice(px);
                        out.push(0);
                    }
                    PixelBuffer::Shorts(out)
                } else {
                    PixelBuffer::Shorts(samples.collect())
                }
            }
            _ => PixelBuffer::Floats(
                data.chunks_exact(4)
                    .map(|c| f32::from_bits(byte_order.read_u32(c)))
                    .collect(),
            ),
        }
    }
}

// =============================================================================
// TaggedImage
// =============================================================================

/// One image plane with its metadata.
///
/// Once handed to storage the image is owned by the writer; callers keep
/// no alias to its tag map.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedImage {
    pub pixels: PixelBuffer,
    pub tags: JsonMap,
}

impl TaggedImage {
    pub fn new(pixels: PixelBuffer, tags: JsonMap) -> Self {
        Self { pixels, tags }
    }

    /// Canonical label of this image.
    pub fn label(&self) -> Result<ImageLabel, MetadataError> {
        ImageLabel::from_tags(&self.tags)
    }

    /// All-zero placeholder for `label` with the acquisition's geometry.
    pub fn blank(label: ImageLabel, summary: &SummaryInfo) -> Self {
        let mut tags = JsonMap::new();
        metadata::set_indices(
            &mut tags,
            label.channel,
            label.slice,
            label.frame,
            label.position,
        );
        tags.insert(keys::WIDTH.to_string(), summary.width.into());
        tags.insert(keys::HEIGHT.to_string(), summary.height.into());
        tags.insert(
            keys::PIXEL_TYPE.to_string(),
            summary.pixel_type.as_str().into(),
        );
        Self {
            pixels: PixelBuffer::zeroed(summary.pixel_type, summary.width, summary.height),
            tags,
        }
    }

    /// Check the image against the acquisition's declared geometry.
    ///
    /// Nothing is written for an image that fails validation.
    pub fn validate(&self, summary: &SummaryInfo) -> Result<(), ImageError> {
        let width = metadata::width(&self.tags)?;
        let height = metadata::height(&self.tags)?;
        if width != summary.width || height != summary.height {
            return Err(ImageError::DimensionMismatch {
                width,
                height,
                expected_width: summary.width,
                expected_height: summary.height,
            });
        }

        let pixel_type = metadata::pixel_type(&self.tags)?;
        if pixel_type != summary.pixel_type {
            return Err(ImageError::PixelTypeMismatch {
                expected: summary.pixel_type.to_string(),
                actual: pixel_type.to_string(),
            });
        }
        if !self.pixels.matches(pixel_type) {
            return Err(ImageError::PixelTypeMismatch {
                expected: pixel_type.to_string(),
                actual: self.pixels.sample_name().to_string(),
            });
        }

        let expected = pixel_type.source_len(width, height);
        if self.pixels.len() != expected {
            return Err(ImageError::PixelCountMismatch {
                expected,
                actual: self.pixels.len(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
