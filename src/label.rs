//! Image labels and acquisition ordering.
//!
//! A label is the canonical `channel_slice_frame_position` key of one image.
//! [`LabelIndex`] keeps labels sorted in the order the acquisition produced
//! them, which depends on the slices-first and time-first conventions declared
//! in the summary metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::MetadataError;
use crate::metadata::{self, keys, JsonMap};

// =============================================================================
// ImageLabel
// =============================================================================

/// Logical coordinate of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageLabel {
    pub channel: u32,
    pub slice: u32,
    pub frame: u32,
    pub position: u32,
}

impl ImageLabel {
    pub const fn new(channel: u32, slice: u32, frame: u32, position: u32) -> Self {
        Self {
            channel,
            slice,
            frame,
            position,
        }
    }

    /// Read the label from an image's tags.
    ///
    /// Channel, slice and frame are required. A missing position index means
    /// position 0, as in single-position acquisitions.
    pub fn from_tags(tags: &JsonMap) -> Result<Self, MetadataError> {
        let position = match metadata::position_index(tags) {
            Ok(p) => p,
            Err(MetadataError::MissingKey(_)) => 0,
            Err(e) => return Err(e),
        };
        Ok(Self {
            channel: metadata::channel_index(tags)?,
            slice: metadata::slice_index(tags)?,
            frame: metadata::frame_index(tags)?,
            position,
        })
    }

    /// The four indices in label order.
    pub const fn indices(&self) -> [u32; 4] {
        [self.channel, self.slice, self.frame, self.position]
    }
}

impl fmt::Display for ImageLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.channel, self.slice, self.frame, self.position
        )
    }
}

impl FromStr for ImageLabel {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('_').collect();
        if parts.len() != 4 {
            return Err(MetadataError::InvalidLabel(s.to_string()));
        }
        let mut indices = [0u32; 4];
        for (slot, part) in indices.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| MetadataError::InvalidLabel(s.to_string()))?;
        }
        Ok(Self::new(indices[0], indices[1], indices[2], indices[3]))
    }
}

// =============================================================================
// AcquisitionOrder
// =============================================================================

/// Order in which an acquisition visits its dimensions.
///
/// `slices_first` means slices change faster than channels; `time_first`
/// means all frames of a position are taken before moving to the next
/// position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquisitionOrder {
    pub slices_first: bool,
    pub time_first: bool,
}

impl Default for AcquisitionOrder {
    fn default() -> Self {
        Self {
            slices_first: true,
            time_first: false,
        }
    }
}

impl AcquisitionOrder {
    pub const fn new(slices_first: bool, time_first: bool) -> Self {
        Self {
            slices_first,
            time_first,
        }
    }

    /// Read `SlicesFirst` (default true) and `TimeFirst` (default false).
    pub fn from_summary(summary: &JsonMap) -> Self {
        Self {
            slices_first: metadata::get_bool_or(summary, keys::SLICES_FIRST, true),
            time_first: metadata::get_bool_or(summary, keys::TIME_FIRST, false),
        }
    }

    /// Sort key, slowest-changing index first.
    pub fn sort_key(&self, label: &ImageLabel) -> [u32; 4] {
        let (outer, second) = if self.time_first {
            (label.position, label.frame)
        } else {
            (label.frame, label.position)
        };
        let (third, inner) = if self.slices_first {
            (label.channel, label.slice)
        } else {
            (label.slice, label.channel)
        };
        [outer, second, third, inner]
    }
}

// =============================================================================
// LabelIndex
// =============================================================================

/// Map from label to value, iterated in acquisition order.
#[derive(Debug, Clone)]
pub struct LabelIndex<V> {
    order: AcquisitionOrder,
    entries: BTreeMap<[u32; 4], (ImageLabel, V)>,
}

impl<V> Default for LabelIndex<V> {
    fn default() -> Self {
        Self::new(AcquisitionOrder::default())
    }
}

impl<V> LabelIndex<V> {
    pub fn new(order: AcquisitionOrder) -> Self {
        Self {
            order,
            entries: BTreeMap::new(),
        }
    }

    pub fn order(&self) -> AcquisitionOrder {
        self.order
    }

    /// Insert a value, returning the previous value for the label.
    pub fn insert(&mut self, label: ImageLabel, value: V) -> Option<V> {
        self.entries
            .insert(self.order.sort_key(&label), (label, value))
            .map(|(_, old)| old)
    }

    pub fn get(&self, label: &ImageLabel) -> Option<&V> {
        self.entries
            .get(&self.order.sort_key(label))
            .map(|(_, value)| value)
    }

    pub fn contains(&self, label: &ImageLabel) -> bool {
        self.entries.contains_key(&self.order.sort_key(label))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = (&ImageLabel, &V)> {
        self.entries.values().map(|(label, value)| (label, value))
    }

    /// Labels in acquisition order.
    pub fn labels(&self) -> impl Iterator<Item = &ImageLabel> {
        self.entries.values().map(|(label, _)| label)
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|(_, value)| value)
    }

    /// First label in acquisition order.
    pub fn first(&self) -> Option<&ImageLabel> {
        self.entries.values().next().map(|(label, _)| label)
    }

    /// Rebuild the index under a different ordering convention.
    pub fn reorder(self, order: AcquisitionOrder) -> Self {
        let mut out = Self::new(order);
        for (label, value) in self.entries.into_values() {
            out.insert(label, value);
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================
