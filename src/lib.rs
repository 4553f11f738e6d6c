//! # mmstack
//!
//! Storage engine for microscope acquisitions written as multi-page TIFF stacks.
//!
//! Images arrive one at a time while the acquisition runs. Each carries a pixel
//! buffer and a JSON tag map naming its channel, slice, frame and stage
//! position. The engine appends them to size-capped TIFF files together with a
//! private index map, per-image metadata, OME-XML and display settings, so a
//! dataset can be reopened later and queried by coordinate.
//!
//! ## Features
//!
//! - **Incremental writing**: one IFD and one scatter write per image, with
//!   roll-over to a new file before the 4 GiB limit
//! - **Position split**: one file set per stage position, or one for the whole dataset
//! - **Gap filling**: interrupted acquisitions are padded with blank planes so
//!   the last frame is complete
//! - **Background sink**: a bounded queue and a writer thread decouple producers
//!   from disk I/O
//!
//! ## Architecture
//!
//! - [`io`] - Positional file reads and endian helpers
//! - [`mod@format`] - TIFF primitives and the stack writer/reader pair
//! - [`image`], [`metadata`], [`label`] - Tagged images, tag accessors and coordinates
//! - [`ome`] - OME-XML plane bookkeeping
//! - [`storage`] - The storage trait and its backends
//! - [`sink`] - Producer/writer hand-off
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use mmstack::{MultipageTiffStorage, StorageOptions, TaggedImageStorage};
//!
//! # fn run(images: Vec<mmstack::TaggedImage>) -> Result<(), mmstack::StorageError> {
//! let summary = serde_json::json!({
//!     "Prefix": "run", "Width": 512, "Height": 512, "PixelType": "GRAY16",
//!     "Channels": 2, "Slices": 5, "Frames": 10,
//! });
//! let summary = summary.as_object().cloned().unwrap_or_default();
//!
//! let mut storage = MultipageTiffStorage::create("/data/run", summary, StorageOptions::default())?;
//! for image in images {
//!     storage.put_image(image)?;
//! }
//! storage.finished()?;
//!
//! let first = storage.get_image(0, 0, 0, 0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod image;
pub mod io;
pub mod label;
pub mod metadata;
pub mod ome;
pub mod sink;
pub mod storage;

// Re-export commonly used types
pub use config::{AcquireConfig, Cli, Command, InspectConfig, InspectOutputFormat};
pub use error::{ImageError, IoError, MetadataError, StorageError, TiffError};
pub use format::mptiff::{FileLimits, MultipageTiffReader, MultipageTiffWriter, WriterOptions};
pub use format::tiff::{ByteOrder, TiffHeader, TiffTag};
pub use image::{PixelBuffer, PixelType, TaggedImage};
pub use io::{FileRangeReader, RangeReader};
pub use label::{AcquisitionOrder, ImageLabel, LabelIndex};
pub use metadata::{JsonMap, SummaryInfo};
pub use ome::OmeMetadata;
pub use sink::{ImageSink, QueueItem, SinkReport};
pub use storage::{
    AbortFlag, AbortSignal, MultipageTiffStorage, RamStorage, StorageBackend, StorageOptions,
    StorageState, TaggedImageStorage,
};
