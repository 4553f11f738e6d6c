//! Storage backends for tagged images.
//!
//! Acquisition code talks to storage through [`TaggedImageStorage`]. Two
//! backends implement it:
//!
//! - [`MultipageTiffStorage`] streams images into size-capped stack files,
//!   grouped into one file set per stage position
//! - [`RamStorage`] keeps everything in memory
//!
//! [`StorageBackend`] is the closed set of both, for callers that pick a
//! backend at runtime.

mod file_set;
mod multipage;
mod ram;

pub use multipage::{MultipageTiffStorage, StorageState};
pub use ram::RamStorage;

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{MetadataError, StorageError};
use crate::format::mptiff::FileLimits;
use crate::image::TaggedImage;
use crate::label::ImageLabel;
use crate::metadata::{self, keys, JsonMap, SummaryInfo};
use crate::ome::OmeMetadata;

// =============================================================================
// TaggedImageStorage
// =============================================================================

/// Capabilities shared by every storage backend.
///
/// Writes happen on one thread at a time; see [`ImageSink`](crate::sink::ImageSink)
/// for handing images over from a producer thread.
pub trait TaggedImageStorage: Send {
    /// Store one image.
    ///
    /// Fails with [`StorageError::ReadOnly`] once the dataset is finished
    /// and with [`StorageError::Image`] when the image does not match the
    /// summary metadata; nothing is written in either case.
    fn put_image(&mut self, image: TaggedImage) -> Result<(), StorageError>;

    /// Look up an image. Absence is not an error.
    fn get_image(&self, channel: u32, slice: u32, frame: u32, position: u32)
        -> Option<TaggedImage>;

    /// Look up the tags of an image.
    fn get_image_tags(&self, channel: u32, slice: u32, frame: u32, position: u32)
        -> Option<JsonMap>;

    /// Every stored label, in acquisition order.
    fn image_keys(&self) -> Vec<ImageLabel>;

    /// End the acquisition. Calling this again has no effect.
    fn finished(&mut self) -> Result<(), StorageError>;

    fn is_finished(&self) -> bool;

    fn summary_metadata(&self) -> &JsonMap;

    /// Replace the summary metadata, reordering the label index if the
    /// acquisition order changed.
    fn set_summary_metadata(&mut self, summary: JsonMap) -> Result<(), StorageError>;

    fn display_and_comments(&self) -> JsonMap;

    fn set_display_and_comments(&mut self, settings: JsonMap);

    /// Persist the current display settings and comments.
    fn write_display_settings(&mut self) -> Result<(), StorageError>;

    /// Highest frame index stored so far.
    fn last_acquired_frame(&self) -> Option<u32>;

    /// Bytes used by the dataset.
    fn data_set_size(&self) -> u64;

    /// Directory holding the dataset, if it lives on disk.
    fn disk_location(&self) -> Option<&Path>;

    /// Release every file handle.
    fn close(&mut self);
}

// =============================================================================
// StorageBackend
// =============================================================================

/// One of the available backends.
#[derive(Debug)]
pub enum StorageBackend {
    MultipageTiff(MultipageTiffStorage),
    Ram(RamStorage),
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $call:expr) => {
        match $self {
            StorageBackend::MultipageTiff($inner) => $call,
            StorageBackend::Ram($inner) => $call,
        }
    };
}

impl TaggedImageStorage for StorageBackend {
    fn put_image(&mut self, image: TaggedImage) -> Result<(), StorageError> {
        delegate!(self, s => s.put_image(image))
    }

    fn get_image(&self, channel: u32, slice: u32, frame: u32, position: u32) -> Option<TaggedImage> {
        delegate!(self, s => s.get_image(channel, slice, frame, position))
    }

    fn get_image_tags(&self, channel: u32, slice: u32, frame: u32, position: u32) -> Option<JsonMap> {
        delegate!(self, s => s.get_image_tags(channel, slice, frame, position))
    }

    fn image_keys(&self) -> Vec<ImageLabel> {
        delegate!(self, s => s.image_keys())
    }

    fn finished(&mut self) -> Result<(), StorageError> {
        delegate!(self, s => s.finished())
    }

    fn is_finished(&self) -> bool {
        delegate!(self, s => s.is_finished())
    }

    fn summary_metadata(&self) -> &JsonMap {
        delegate!(self, s => s.summary_metadata())
    }

    fn set_summary_metadata(&mut self, summary: JsonMap) -> Result<(), StorageError> {
        delegate!(self, s => s.set_summary_metadata(summary))
    }

    fn display_and_comments(&self) -> JsonMap {
        delegate!(self, s => s.display_and_comments())
    }

    fn set_display_and_comments(&mut self, settings: JsonMap) {
        delegate!(self, s => s.set_display_and_comments(settings))
    }

    fn write_display_settings(&mut self) -> Result<(), StorageError> {
        delegate!(self, s => s.write_display_settings())
    }

    fn last_acquired_frame(&self) -> Option<u32> {
        delegate!(self, s => s.last_acquired_frame())
    }

    fn data_set_size(&self) -> u64 {
        delegate!(self, s => s.data_set_size())
    }

    fn disk_location(&self) -> Option<&Path> {
        delegate!(self, s => s.disk_location())
    }

    fn close(&mut self) {
        delegate!(self, s => s.close())
    }
}

// =============================================================================
// Options
// =============================================================================

/// Configuration of a multipage dataset.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Write a `<base>_metadata.txt` sidecar next to each file set
    pub separate_metadata_file: bool,

    /// One file set per stage position instead of one for the whole dataset
    pub split_by_position: bool,

    /// Skip pre-allocation and `sync_all`
    pub fast_storage_mode: bool,

    /// Embed OME-XML and use the `.ome.tif` extension
    pub ome_tiff: bool,

    /// Size budget of each file
    pub limits: FileLimits,

    /// Notified when the disk cannot hold the acquisition
    pub abort: Option<Arc<dyn AbortSignal>>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            separate_metadata_file: false,
            split_by_position: true,
            fast_storage_mode: false,
            ome_tiff: true,
            limits: FileLimits::default(),
            abort: None,
        }
    }
}

// =============================================================================
// Abort signalling
// =============================================================================

/// Receives a request to stop the acquisition.
pub trait AbortSignal: Send + Sync + fmt::Debug {
    fn request_abort(&self);
}

/// Abort signal backed by a shared flag the producer polls.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl AbortSignal for AbortFlag {
    fn request_abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// AcquisitionState
// =============================================================================

/// Bookkeeping shared by every file set of one acquisition.
#[derive(Debug)]
pub(crate) struct AcquisitionState {
    pub summary: JsonMap,
    pub info: SummaryInfo,
    pub ome: Option<OmeMetadata>,
    pub ome_xml: Option<String>,
    pub last_frame: u32,
    pub last_acquired_position: u32,
}

impl AcquisitionState {
    pub fn new(summary: JsonMap, ome_tiff: bool) -> Result<Self, MetadataError> {
        let info = SummaryInfo::from_summary(&summary)?;
        let ome = ome_tiff.then(|| {
            let names = summary
                .get(keys::CHANNEL_NAMES)
                .and_then(|v| v.as_array())
                .map(|names| {
                    names
                        .iter()
                        .map(|n| n.as_str().map(str::to_string).unwrap_or_else(|| n.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let mut ome = OmeMetadata::new(&info).with_channel_names(names);
            if let Some(size) = metadata::pixel_size_um(&summary) {
                ome.set_pixel_size_um(size);
            }
            reserve_declared_names(&mut ome, &summary, &info);
            ome
        });
        Ok(Self {
            summary,
            info,
            ome,
            ome_xml: None,
            last_frame: 0,
            last_acquired_position: 0,
        })
    }

    /// Worst-case OME-XML length of the finished dataset.
    pub fn ome_estimate(&self) -> u64 {
        self.ome
            .as_ref()
            .map(|ome| ome.estimate_len(self.info.total_planes(), self.info.positions))
            .unwrap_or(0)
    }

    /// Render the OME-XML once; later calls return the same text.
    pub fn ome_xml(&mut self) -> Option<&str> {
        if self.ome_xml.is_none() {
            self.ome_xml = self.ome.as_ref().map(OmeMetadata::to_xml);
        }
        self.ome_xml.as_deref()
    }
}

/// Cover the file and position names of every position the summary lists,
/// so files filled before a later position starts keep enough room.
fn reserve_declared_names(ome: &mut OmeMetadata, summary: &JsonMap, info: &SummaryInfo) {
    let prefix = info.prefix.as_deref().unwrap_or_default();
    let names = summary
        .get(keys::POSITION_NAMES)
        .and_then(|v| v.as_array())
        .map(|names| names.iter().filter_map(|n| n.as_str()).collect::<Vec<_>>())
        .unwrap_or_default();
    for name in names {
        let file_name = format!("{}_MMStack_{}_{}.ome.tif", prefix, name, u32::MAX);
        ome.reserve_names(&file_name, Some(name));
    }
}
