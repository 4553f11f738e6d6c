//! Test utilities for integration tests.
//!
//! This module provides summary builders, a synthetic image generator and
//! helpers that inspect stack files byte by byte.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde_json::{json, Value};

use mmstack::format::mptiff::{INDEX_MAP_HEADER, INDEX_MAP_OFFSET_HEADER, INDEX_MAP_OFFSET_POSITION};
use mmstack::io::read_u32_be;
use mmstack::{ImageLabel, JsonMap, PixelBuffer, PixelType, TaggedImage};

pub const WIDTH: u32 = 16;
pub const HEIGHT: u32 = 8;

// =============================================================================
// Summary Metadata
// =============================================================================

/// Builder for acquisition summary metadata.
#[derive(Debug, Clone)]
pub struct SummaryBuilder {
    summary: JsonMap,
}

impl SummaryBuilder {
    pub fn new(pixel_type: PixelType) -> Self {
        let summary = json!({
            "Prefix": "run",
            "Width": WIDTH,
            "Height": HEIGHT,
            "PixelType": pixel_type.as_str(),
            "Channels": 1,
            "Slices": 1,
            "Frames": 1,
            "Positions": 1,
            "Comment": "synthetic test data",
        });
        Self {
            summary: object(summary),
        }
    }

    pub fn dims(mut self, channels: u32, slices: u32, frames: u32, positions: u32) -> Self {
        self.summary.insert("Channels".into(), json!(channels));
        self.summary.insert("Slices".into(), json!(slices));
        self.summary.insert("Frames".into(), json!(frames));
        self.summary.insert("Positions".into(), json!(positions));
        let names: Vec<String> = (0..channels).map(|c| format!("Ch{}", c)).collect();
        self.summary.insert("ChNames".into(), json!(names));
        self
    }

    pub fn order(mut self, slices_first: bool, time_first: bool) -> Self {
        self.summary.insert("SlicesFirst".into(), json!(slices_first));
        self.summary.insert("TimeFirst".into(), json!(time_first));
        self
    }

    pub fn prefix(mut self, prefix: &str) -> Self {
        self.summary.insert("Prefix".into(), json!(prefix));
        self
    }

    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.summary.insert("Width".into(), json!(width));
        self.summary.insert("Height".into(), json!(height));
        self
    }

    pub fn build(self) -> JsonMap {
        self.summary
    }
}

pub fn object(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

// =============================================================================
// Synthetic Images
// =============================================================================

/// Pixel value pattern unique to each label.
fn sample(label: ImageLabel, i: usize) -> usize {
    1 + label.channel as usize * 3
        + label.slice as usize * 5
        + label.frame as usize * 11
        + label.position as usize * 17
        + i
}

/// Synthetic image of the default size.
pub fn image(pixel_type: PixelType, label: ImageLabel) -> TaggedImage {
    sized_image(pixel_type, label, WIDTH, HEIGHT)
}

/// Synthetic image whose pixels and tags are derived from its label.
pub fn sized_image(pixel_type: PixelType, label: ImageLabel, width: u32, height: u32) -> TaggedImage {
    let len = pixel_type.source_len(width, height);
    let pixels = match pixel_type {
        PixelType::Gray8 | PixelType::Rgb32 => {
            PixelBuffer::Bytes(Bytes::from((0..len).map(|i| sample(label, i) as u8).collect::<Vec<_>>()))
        }
        PixelType::Gray16 | PixelType::Rgb64 => {
            PixelBuffer::Shorts((0..len).map(|i| (sample(label, i) * 257) as u16).collect())
        }
        PixelType::Gray32 => {
            PixelBuffer::Floats((0..len).map(|i| sample(label, i) as f32 * 0.5).collect())
        }
    };

    let tags = json!({
        "ChannelIndex": label.channel,
        "SliceIndex": label.slice,
        "FrameIndex": label.frame,
        "PositionIndex": label.position,
        "PositionName": format!("Pos{}", label.position),
        "Width": width,
        "Height": height,
        "PixelType": pixel_type.as_str(),
        "Exposure-ms": 12.5,
        "Camera": "Synthetic",
        "ElapsedTime-ms": label.frame as f64 * 100.0,
    });
    TaggedImage::new(pixels, object(tags))
}

/// Labels of a full acquisition in the order the hardware produces them.
pub fn acquisition_order(
    channels: u32,
    slices: u32,
    frames: u32,
    positions: u32,
    slices_first: bool,
) -> Vec<ImageLabel> {
    let mut labels = Vec::new();
    for frame in 0..frames {
        for position in 0..positions {
            if slices_first {
                for channel in 0..channels {
                    for slice in 0..slices {
                        labels.push(ImageLabel::new(channel, slice, frame, position));
                    }
                }
            } else {
                for slice in 0..slices {
                    for channel in 0..channels {
                        labels.push(ImageLabel::new(channel, slice, frame, position));
                    }
                }
            }
        }
    }
    labels
}

/// True when every tag of `original` has the same value in `read`.
pub fn tags_preserved(original: &JsonMap, read: &JsonMap) -> bool {
    original.iter().all(|(key, value)| read.get(key) == Some(value))
}

// =============================================================================
// On-disk inspection
// =============================================================================

/// Stack files in `dir`, sorted by name.
pub fn tiff_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().map(|ext| ext == "tif").unwrap_or(false))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// File names of the stack files in `dir`.
pub fn tiff_file_names(dir: &Path) -> Vec<String> {
    tiff_files(dir)
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect()
}

/// Number of entries in the index map of a finished stack file.
pub fn index_map_entry_count(path: &Path) -> u32 {
    let bytes = fs::read(path).unwrap();
    let record = INDEX_MAP_OFFSET_POSITION as usize;
    assert_eq!(read_u32_be(&bytes[record..]), INDEX_MAP_OFFSET_HEADER);
    let offset = read_u32_be(&bytes[record + 4..]) as usize;
    assert_eq!(read_u32_be(&bytes[offset..]), INDEX_MAP_HEADER);
    read_u32_be(&bytes[offset + 4..])
}

/// Big-endian magic and version at the start of a stack file.
pub fn is_big_endian_tiff(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && &bytes[0..2] == b"MM" && bytes[2..4] == [0, 42]
}
