//! Metadata keys and typed accessors.
//!
//! Image tags and summary metadata are ordered JSON objects. Integer fields
//! are accepted either as JSON numbers or as numeric strings, since older
//! acquisitions store everything as text.

use serde_json::{json, Value};

use crate::error::MetadataError;
use crate::image::PixelType;
use crate::label::AcquisitionOrder;

/// Ordered JSON object used for image tags and summary metadata.
pub type JsonMap = serde_json::Map<String, Value>;

// =============================================================================
// Keys
// =============================================================================

/// Tag and summary key names.
pub mod keys {
    pub const CHANNEL_INDEX: &str = "ChannelIndex";
    pub const SLICE_INDEX: &str = "SliceIndex";
    pub const FRAME_INDEX: &str = "FrameIndex";
    pub const POSITION_INDEX: &str = "PositionIndex";
    pub const POSITION_NAME: &str = "PositionName";
    pub const WIDTH: &str = "Width";
    pub const HEIGHT: &str = "Height";
    pub const PIXEL_TYPE: &str = "PixelType";
    pub const PIXEL_SIZE_UM: &str = "PixelSizeUm";
    pub const FILE_NAME: &str = "FileName";

    pub const PREFIX: &str = "Prefix";
    pub const CHANNELS: &str = "Channels";
    pub const SLICES: &str = "Slices";
    pub const FRAMES: &str = "Frames";
    pub const POSITIONS: &str = "Positions";
    pub const POSITION_NAMES: &str = "PositionNames";
    pub const SLICES_FIRST: &str = "SlicesFirst";
    pub const TIME_FIRST: &str = "TimeFirst";
    pub const COMMENT: &str = "Comment";
    pub const SUMMARY: &str = "Summary";
    pub const CHANNEL_NAMES: &str = "ChNames";
    pub const CHANNEL_COLORS: &str = "ChColors";
    pub const CHANNEL_CONTRAST_MIN: &str = "ChContrastMin";
    pub const CHANNEL_CONTRAST_MAX: &str = "ChContrastMax";

    /// Display-and-comments document keys.
    pub const DISPLAY_CHANNELS: &str = "Channels";
    pub const DISPLAY_COMMENTS: &str = "Comments";
}

// =============================================================================
// Accessors
// =============================================================================

/// Read an integer value, accepting numbers and numeric strings.
pub fn get_i64(tags: &JsonMap, key: &'static str) -> Result<i64, MetadataError> {
    let value = tags.get(key).ok_or(MetadataError::MissingKey(key))?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| MetadataError::InvalidValue {
                key,
                message: format!("{} is not an integer", n),
            }),
        Value::String(s) => s.trim().parse().map_err(|_| MetadataError::InvalidValue {
            key,
            message: format!("'{}' is not an integer", s),
        }),
        other => Err(MetadataError::InvalidValue {
            key,
            message: format!("expected an integer, got {}", other),
        }),
    }
}

/// Read a non-negative index or count.
pub fn get_u32(tags: &JsonMap, key: &'static str) -> Result<u32, MetadataError> {
    let value = get_i64(tags, key)?;
    u32::try_from(value).map_err(|_| MetadataError::InvalidValue {
        key,
        message: format!("{} is out of range", value),
    })
}

/// Read a floating point value, accepting numbers and numeric strings.
pub fn get_f64(tags: &JsonMap, key: &'static str) -> Result<f64, MetadataError> {
    match tags.get(key).ok_or(MetadataError::MissingKey(key))? {
        Value::Number(n) => n.as_f64().ok_or_else(|| MetadataError::InvalidValue {
            key,
            message: format!("{} is not a number", n),
        }),
        Value::String(s) => s.trim().parse().map_err(|_| MetadataError::InvalidValue {
            key,
            message: format!("'{}' is not a number", s),
        }),
        other => Err(MetadataError::InvalidValue {
            key,
            message: format!("expected a number, got {}", other),
        }),
    }
}

/// Read a boolean, falling back to `default` when absent or unparseable.
pub fn get_bool_or(tags: &JsonMap, key: &str, default: bool) -> bool {
    match tags.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.parse().unwrap_or(default),
        _ => default,
    }
}

/// Read a string value.
pub fn get_str<'a>(tags: &'a JsonMap, key: &'static str) -> Result<&'a str, MetadataError> {
    tags.get(key)
        .ok_or(MetadataError::MissingKey(key))?
        .as_str()
        .ok_or_else(|| MetadataError::InvalidValue {
            key,
            message: "expected a string".to_string(),
        })
}

pub fn channel_index(tags: &JsonMap) -> Result<u32, MetadataError> {
    get_u32(tags, keys::CHANNEL_INDEX)
}

pub fn slice_index(tags: &JsonMap) -> Result<u32, MetadataError> {
    get_u32(tags, keys::SLICE_INDEX)
}

pub fn frame_index(tags: &JsonMap) -> Result<u32, MetadataError> {
    get_u32(tags, keys::FRAME_INDEX)
}

pub fn position_index(tags: &JsonMap) -> Result<u32, MetadataError> {
    get_u32(tags, keys::POSITION_INDEX)
}

pub fn width(tags: &JsonMap) -> Result<u32, MetadataError> {
    get_u32(tags, keys::WIDTH)
}

pub fn height(tags: &JsonMap) -> Result<u32, MetadataError> {
    get_u32(tags, keys::HEIGHT)
}

pub fn pixel_type(tags: &JsonMap) -> Result<PixelType, MetadataError> {
    get_str(tags, keys::PIXEL_TYPE)?.parse()
}

/// Physical pixel size in micrometres, if present and numeric.
pub fn pixel_size_um(tags: &JsonMap) -> Option<f64> {
    get_f64(tags, keys::PIXEL_SIZE_UM).ok()
}

/// Position name, if the image carries one.
pub fn position_name(tags: &JsonMap) -> Option<&str> {
    get_str(tags, keys::POSITION_NAME).ok().filter(|s| !s.is_empty())
}

/// Stamp the four coordinate indices onto a tag map.
pub fn set_indices(tags: &mut JsonMap, channel: u32, slice: u32, frame: u32, position: u32) {
    tags.insert(keys::CHANNEL_INDEX.to_string(), json!(channel));
    tags.insert(keys::SLICE_INDEX.to_string(), json!(slice));
    tags.insert(keys::FRAME_INDEX.to_string(), json!(frame));
    tags.insert(keys::POSITION_INDEX.to_string(), json!(position));
}

/// Parse a JSON object from text.
pub fn parse_object(text: &str) -> Result<JsonMap, MetadataError> {
    match serde_json::from_str::<Value>(text)? {
        Value::Object(map) => Ok(map),
        other => Err(MetadataError::Json(format!(
            "expected a JSON object, got {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// SummaryInfo
// =============================================================================

/// Acquisition-wide facts extracted from summary metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SummaryInfo {
    pub width: u32,
    pub height: u32,
    pub pixel_type: PixelType,
    pub channels: u32,
    pub slices: u32,
    pub frames: u32,
    pub positions: u32,
    pub prefix: Option<String>,
    pub order: AcquisitionOrder,
}

impl SummaryInfo {
    /// Extract acquisition geometry from summary metadata.
    ///
    /// Width, height and pixel type are required. Dimension counts default
    /// to 1 when absent; a non-positive position count is treated as 1.
    pub fn from_summary(summary: &JsonMap) -> Result<Self, MetadataError> {
        let count = |key: &'static str| -> Result<u32, MetadataError> {
            match get_i64(summary, key) {
                Ok(n) => u32::try_from(n.max(1)).map_err(|_| MetadataError::InvalidValue {
                    key,
                    message: format!("{} is out of range", n),
                }),
                Err(MetadataError::MissingKey(_)) => Ok(1),
                Err(e) => Err(e),
            }
        };

        Ok(Self {
            width: width(summary)?,
            height: height(summary)?,
            pixel_type: pixel_type(summary)?,
            channels: count(keys::CHANNELS)?,
            slices: count(keys::SLICES)?,
            frames: count(keys::FRAMES)?,
            positions: count(keys::POSITIONS)?,
            prefix: summary
                .get(keys::PREFIX)
                .and_then(Value::as_str)
                .map(str::to_string),
            order: AcquisitionOrder::from_summary(summary),
        })
    }

    /// Bytes one image occupies on disk.
    pub fn bytes_per_image(&self) -> u64 {
        self.pixel_type.stored_bytes(self.width, self.height)
    }

    /// Upper bound on the number of planes in the whole acquisition.
    pub fn total_planes(&self) -> u64 {
        self.channels as u64 * self.slices as u64 * self.frames as u64 * self.positions as u64
    }
}

// =============================================================================
// Display settings
// =============================================================================

/// Derive the display-and-comments document from summary metadata.
///
/// The result has the shape
/// `{"Channels": [{"Name", "Color", "Min", "Max", "Gamma"}...], "Comments": {"Summary": <Comment>}}`
/// with one entry per declared channel.
pub fn display_and_comments_from_summary(summary: &JsonMap) -> JsonMap {
    let channels = match get_i64(summary, keys::CHANNELS) {
        Ok(n) => n.max(1) as usize,
        Err(_) => 1,
    };
    let array = |key: &str| -> Vec<Value> {
        summary
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    };
    let names = array(keys::CHANNEL_NAMES);
    let colors = array(keys::CHANNEL_COLORS);
    let mins = array(keys::CHANNEL_CONTRAST_MIN);
    let maxes = array(keys::CHANNEL_CONTRAST_MAX);

    let default_max = summary
        .get(keys::PIXEL_TYPE)
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<PixelType>().ok())
        .map(|t| t.display_max())
        .unwrap_or(65535);

    let channel_settings: Vec<Value> = (0..channels)
        .map(|i| {
            json!({
                "Name": names.get(i).cloned().unwrap_or_else(|| json!(format!("Channel {}", i))),
                "Color": colors.get(i).cloned().unwrap_or(json!(16777215)),
                "Min": mins.get(i).cloned().unwrap_or(json!(0)),
                "Max": maxes.get(i).cloned().unwrap_or(json!(default_max)),
                "Gamma": 1.0,
            })
        })
        .collect();

    let comment = summary
        .get(keys::COMMENT)
        .cloned()
        .unwrap_or_else(|| json!(""));

    let mut comments = JsonMap::new();
    comments.insert(keys::SUMMARY.to_string(), comment);

    let mut out = JsonMap::new();
    out.insert(
        keys::DISPLAY_CHANNELS.to_string(),
        Value::Array(channel_settings),
    );
    out.insert(keys::DISPLAY_COMMENTS.to_string(), Value::Object(comments));
    out
}

// =============================================================================
// Tests
// =============================================================================
