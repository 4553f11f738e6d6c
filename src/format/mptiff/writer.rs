//! Incremental writer for one stack file.
//!
//! Images are appended while the acquisition runs: each call to
//! [`MultipageTiffWriter::write_image`] lays out one IFD followed by its
//! pixel strip, resolution rationals and metadata string, and hands the
//! whole record to the OS in a single vectored write. The writer never
//! rolls over by itself; the owner asks [`MultipageTiffWriter::has_space_to_write`]
//! first and opens a new file when the answer is no.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{ImageError, IoError, MetadataError, StorageError, TiffError};
use crate::format::tiff::{
    encode_entry, encode_marker, encode_u16s, encode_u32s, FieldType, Ifd, IfdEncoder,
    TiffHeader, TiffTag, COMPRESSION_NONE, PHOTOMETRIC_BLACK_IS_ZERO, PHOTOMETRIC_RGB,
    RESOLUTION_UNIT_CENTIMETER,
};
use crate::image::{PixelBuffer, TaggedImage};
use crate::label::ImageLabel;
use crate::metadata::{self, display_and_comments_from_summary, keys, JsonMap, SummaryInfo};
use crate::storage::AbortSignal;

use super::reader::MultipageTiffReader;
use super::{
    FileLimits, COMMENTS_HEADER, COMMENTS_OFFSET_HEADER, COMMENTS_OFFSET_POSITION,
    DISPLAY_SETTINGS_BYTES_PER_CHANNEL, DISPLAY_SETTINGS_HEADER, DISPLAY_SETTINGS_OFFSET_HEADER,
    DISPLAY_SETTINGS_OFFSET_POSITION, ENTRIES_PER_IFD, INDEX_MAP_ENTRY_SIZE, INDEX_MAP_HEADER,
    INDEX_MAP_OFFSET_HEADER, INDEX_MAP_OFFSET_POSITION, PREALLOCATION_MARGIN,
    PREALLOCATION_PER_IMAGE, SUMMARY_DATA_POSITION, SUMMARY_MD_HEADER, SUMMARY_POSITION,
    WRITE_BYTE_ORDER,
};

/// Delay before a failed pre-allocation asks the acquisition to abort.
const ABORT_DELAY: Duration = Duration::from_secs(1);

/// Bytes of the RGB BitsPerSample triple.
const RGB_BITS_SIZE: u64 = 6;

/// Bytes of the X and Y resolution rationals.
const RESOLUTION_SIZE: u64 = 16;

/// Bytes of the three trailer block headers.
const TRAILER_HEADERS_SIZE: u64 = 24;

/// ASCII values of this length or less would be stored inline.
const MIN_OUT_OF_LINE_ASCII: usize = 5;

// =============================================================================
// WriterOptions
// =============================================================================

/// Per-file behaviour shared by every writer of a dataset.
#[derive(Debug, Clone, Default)]
pub struct WriterOptions {
    /// Reserve an ImageDescription entry in the first IFD for OME-XML
    pub ome_tiff: bool,

    /// Skip pre-allocation and `sync_all`
    pub fast_storage_mode: bool,

    /// Size budget of the file
    pub limits: FileLimits,

    /// Notified when the disk cannot hold the acquisition
    pub abort: Option<Arc<dyn AbortSignal>>,
}

// =============================================================================
// MultipageTiffWriter
// =============================================================================

/// Owns one stack file from creation until it is closed.
pub struct MultipageTiffWriter {
    path: PathBuf,
    file_name: String,
    file: Option<File>,
    options: WriterOptions,
    summary: SummaryInfo,
    display_and_comments: JsonMap,
    reader: Arc<MultipageTiffReader>,

    /// Append cursor; every record starts here
    file_position: u64,
    first_ifd_offset: u64,
    next_ifd_offset_location: Option<u64>,
    ome_description_tag_position: Option<u64>,

    /// IFD offsets in write order, plus the slot of each label
    index_map: Vec<(ImageLabel, u32)>,
    index_slots: HashMap<ImageLabel, usize>,

    /// (channel, slice, frame) of every IFD in write order
    plane_indices: Vec<(u32, u32, u32)>,

    finished: bool,
}

impl std::fmt::Debug for MultipageTiffWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultipageTiffWriter")
            .field("path", &self.path)
            .field("file_position", &self.file_position)
            .field("images", &self.index_map.len())
            .field("finished", &self.finished)
            .field("closed", &self.file.is_none())
            .finish()
    }
}

impl MultipageTiffWriter {
    /// Create `directory/file_name` and write the header and summary block.
    ///
    /// In safe mode the file is pre-allocated to an upper-bound estimate of
    /// its final size. If that fails the error is logged and the abort
    /// signal fires shortly afterwards; the writer itself stays usable.
    pub fn open(
        directory: &Path,
        file_name: &str,
        summary: &JsonMap,
        options: WriterOptions,
    ) -> Result<Self, StorageError> {
        let info = SummaryInfo::from_summary(summary)?;
        let display_and_comments = display_and_comments_from_summary(summary);

        let mut header_summary = summary.clone();
        header_summary.remove(keys::COMMENT);
        let summary_text = serde_json::to_string(&header_summary).map_err(MetadataError::from)?;

        let path = directory.join(file_name);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| IoError::from_io(&path, e))?;

        if !options.fast_storage_mode {
            let estimate = (summary_text.len() as u64
                + PREALLOCATION_MARGIN
                + info.frames as u64
                    * info.channels as u64
                    * info.slices as u64
                    * (info.bytes_per_image() + PREALLOCATION_PER_IMAGE))
                .min(options.limits.max_file_size);
            if let Err(e) = file.set_len(estimate) {
                error!(
                    file = %path.display(),
                    bytes = estimate,
                    error = %e,
                    "Insufficient space on disk: no room to write data"
                );
                request_abort_later(options.abort.clone());
            }
        }

        let first_ifd_offset = SUMMARY_DATA_POSITION + summary_text.len() as u64;
        let mut head = [0u8; SUMMARY_DATA_POSITION as usize];
        head[..8].copy_from_slice(&TiffHeader::encode(
            WRITE_BYTE_ORDER,
            first_ifd_offset as u32,
        ));
        let summary_pos = SUMMARY_POSITION as usize;
        head[summary_pos..summary_pos + 8].copy_from_slice(&encode_marker(
            WRITE_BYTE_ORDER,
            SUMMARY_MD_HEADER,
            summary_text.len() as u32,
        ));
        write_vectored_at(&mut file, 0, &[&head, summary_text.as_bytes()])
            .map_err(|e| IoError::from_io(&path, e))?;

        let reader = Arc::new(MultipageTiffReader::for_writer(
            &path,
            header_summary,
            display_and_comments.clone(),
        )?);

        debug!(file = %path.display(), "Opened stack file for writing");

        Ok(Self {
            file_name: file_name.to_string(),
            path,
            file: Some(file),
            options,
            summary: info,
            display_and_comments,
            reader,
            file_position: first_ifd_offset,
            first_ifd_offset,
            next_ifd_offset_location: None,
            ome_description_tag_position: None,
            index_map: Vec::new(),
            index_slots: HashMap::new(),
            plane_indices: Vec::new(),
            finished: false,
        })
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Reader serving the images of this file.
    pub fn reader(&self) -> Arc<MultipageTiffReader> {
        Arc::clone(&self.reader)
    }

    /// Current append position.
    pub fn file_position(&self) -> u64 {
        self.file_position
    }

    /// Number of images written.
    pub fn image_count(&self) -> usize {
        self.index_map.len()
    }

    /// Labels in write order.
    pub fn labels(&self) -> impl Iterator<Item = &ImageLabel> {
        self.index_map.iter().map(|(label, _)| label)
    }

    pub fn contains(&self, label: &ImageLabel) -> bool {
        self.index_slots.contains_key(label)
    }

    /// (channel, slice, frame) of every IFD in write order.
    pub fn plane_indices(&self) -> &[(u32, u32, u32)] {
        &self.plane_indices
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Replace the display settings and comments written at close.
    pub fn set_display_and_comments(&mut self, settings: JsonMap) {
        self.display_and_comments = settings;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }

    // -------------------------------------------------------------------------
    // Space accounting
    // -------------------------------------------------------------------------

    /// Whether `image` and every trailer block still fit below the limit.
    ///
    /// `ome_estimate` is the worst-case OME-XML length the file must still
    /// be able to hold when it is closed.
    pub fn has_space_to_write(&self, image: &TaggedImage, ome_estimate: u64) -> bool {
        let metadata_len = serde_json::to_string(&image.tags)
            .map(|s| s.len())
            .unwrap_or(0);
        self.has_space_for(metadata_len as u64, ome_estimate)
    }

    /// Same as [`has_space_to_write`](Self::has_space_to_write) for a
    /// metadata string of known length.
    pub fn has_space_for(&self, metadata_len: u64, ome_estimate: u64) -> bool {
        let limits = &self.options.limits;
        let index_map_size = (self.index_map.len() as u64 + 1) * INDEX_MAP_ENTRY_SIZE + 8;
        let ifd_size = Ifd::calculate_size(ENTRIES_PER_IFD as u64 + 1) as u64
            + RGB_BITS_SIZE
            + RESOLUTION_SIZE;
        let display_size = self.summary.channels as u64 * DISPLAY_SETTINGS_BYTES_PER_CHANNEL;

        let required = self.file_position
            + metadata_len
            + 1
            + index_map_size
            + ifd_size
            + self.summary.bytes_per_image()
            + limits.comments_reserve
            + display_size
            + TRAILER_HEADERS_SIZE
            + limits.safety_margin
            + ome_estimate;
        required < limits.max_file_size
    }

    // -------------------------------------------------------------------------
    // Image records
    // -------------------------------------------------------------------------

    /// Append one image and return the offset of its IFD.
    ///
    /// Any embedded `Summary` key is dropped from the stored tags.
    pub fn write_image(&mut self, mut image: TaggedImage) -> Result<u32, StorageError> {
        if self.finished || self.file.is_none() {
            return Err(TiffError::Closed.into());
        }
        image.tags.remove(keys::SUMMARY);
        let label = image.label()?;
        if self.index_slots.contains_key(&label) {
            return Err(ImageError::DuplicateLabel(label.to_string()).into());
        }

        let bo = WRITE_BYTE_ORDER;
        let pixel_type = self.summary.pixel_type;
        let rgb = pixel_type.is_rgb();
        let bytes_per_image = self.summary.bytes_per_image();

        let pixels = image.pixels.encode(rgb, bo);
        if pixels.len() as u64 != bytes_per_image {
            return Err(ImageError::PixelCountMismatch {
                expected: pixel_type.source_len(self.summary.width, self.summary.height),
                actual: image.pixels.len(),
            }
            .into());
        }

        let (numerator, denominator) = resolution(&image.tags);
        let resolution = encode_u32s(bo, &[numerator, denominator, numerator, denominator]);

        let mut metadata_text = serde_json::to_string(&image.tags).map_err(MetadataError::from)?;
        metadata_text.push('\0');
        // Keep the value out of line
        while metadata_text.len() < MIN_OUT_OF_LINE_ASCII {
            metadata_text.push('\0');
        }

        let with_description = self.options.ome_tiff && self.index_map.is_empty();
        let entry_count = ENTRIES_PER_IFD + u16::from(with_description);

        let ifd_offset = self.file_position;
        let ifd_size = Ifd::calculate_size(entry_count as u64) as u64;
        let bits_offset = ifd_offset + ifd_size;
        let strip_offset = bits_offset + if rgb { RGB_BITS_SIZE } else { 0 };
        let x_resolution_offset = strip_offset + bytes_per_image;
        let y_resolution_offset = x_resolution_offset + 8;
        let metadata_offset = y_resolution_offset + 8;
        let next_ifd_offset = metadata_offset + metadata_text.len() as u64;
        if next_ifd_offset > u32::MAX as u64 {
            return Err(ImageError::TooLarge {
                label: label.to_string(),
                max_file_size: self.options.limits.max_file_size,
            }
            .into());
        }

        let bits = pixel_type.byte_depth() * 8;
        let samples = pixel_type.stored_samples();
        let height = self.summary.height;

        let mut ifd = IfdEncoder::new(bo, entry_count);
        ifd.entry(TiffTag::ImageWidth, FieldType::Long, 1, self.summary.width);
        ifd.entry(TiffTag::ImageLength, FieldType::Long, 1, height);
        if rgb {
            ifd.entry(TiffTag::BitsPerSample, FieldType::Short, 3, bits_offset as u32);
        } else {
            ifd.entry(TiffTag::BitsPerSample, FieldType::Short, 1, bits);
        }
        ifd.entry(TiffTag::Compression, FieldType::Short, 1, COMPRESSION_NONE);
        ifd.entry(
            TiffTag::PhotometricInterpretation,
            FieldType::Short,
            1,
            if rgb {
                PHOTOMETRIC_RGB
            } else {
                PHOTOMETRIC_BLACK_IS_ZERO
            },
        );
        if with_description {
            self.ome_description_tag_position = Some(ifd_offset + ifd.next_entry_position() as u64);
            ifd.entry(TiffTag::ImageDescription, FieldType::Ascii, 0, 0);
        }
        ifd.entry(TiffTag::StripOffsets, FieldType::Long, 1, strip_offset as u32);
        ifd.entry(TiffTag::SamplesPerPixel, FieldType::Short, 1, samples);
        if height <= u16::MAX as u32 {
            ifd.entry(TiffTag::RowsPerStrip, FieldType::Short, 1, height);
        } else {
            ifd.entry(TiffTag::RowsPerStrip, FieldType::Long, 1, height);
        }
        ifd.entry(
            TiffTag::StripByteCounts,
            FieldType::Long,
            1,
            bytes_per_image as u32,
        );
        ifd.entry(
            TiffTag::XResolution,
            FieldType::Rational,
            1,
            x_resolution_offset as u32,
        );
        ifd.entry(
            TiffTag::YResolution,
            FieldType::Rational,
            1,
            y_resolution_offset as u32,
        );
        ifd.entry(
            TiffTag::ResolutionUnit,
            FieldType::Short,
            1,
            RESOLUTION_UNIT_CENTIMETER,
        );
        ifd.entry(
            TiffTag::MicroManagerMetadata,
            FieldType::Ascii,
            metadata_text.len() as u32,
            metadata_offset as u32,
        );
        let next_offset_location = ifd_offset + ifd.next_offset_position() as u64;
        let ifd_bytes = ifd.finish(next_ifd_offset as u32);

        let rgb_bits = if rgb {
            encode_u16s(bo, &[bits as u16; 3])
        } else {
            Vec::new()
        };

        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        write_vectored_at(
            file,
            ifd_offset,
            &[
                &ifd_bytes,
                &rgb_bits,
                &pixels,
                &resolution,
                metadata_text.as_bytes(),
            ],
        )
        .map_err(|e| IoError::from_io(&self.path, e))?;

        let offset = ifd_offset as u32;
        self.index_slots.insert(label, self.index_map.len());
        self.index_map.push((label, offset));
        self.reader.register(label, offset);
        self.plane_indices
            .push((label.channel, label.slice, label.frame));
        self.next_ifd_offset_location = Some(next_offset_location);
        self.file_position = next_ifd_offset;

        debug!(
            label = %label,
            file = %self.file_name,
            offset = ifd_offset,
            "Wrote image"
        );
        Ok(offset)
    }

    /// Append an all-zero image for `label`.
    pub fn write_blank_image(&mut self, label: ImageLabel) -> Result<u32, StorageError> {
        let blank = TaggedImage::blank(label, &self.summary);
        self.write_image(blank)
    }

    /// Replace the pixel strip of an image already in this file.
    ///
    /// Tags and IFD bytes are left untouched, so nothing else moves.
    pub fn overwrite_pixels(
        &mut self,
        label: ImageLabel,
        pixels: &PixelBuffer,
    ) -> Result<(), StorageError> {
        let pixel_type = self.summary.pixel_type;
        let slot = *self
            .index_slots
            .get(&label)
            .ok_or_else(|| TiffError::LabelNotFound(label.to_string()))?;
        let ifd_offset = self.index_map[slot].1 as u64;

        if !pixels.matches(pixel_type) {
            return Err(ImageError::PixelTypeMismatch {
                expected: pixel_type.to_string(),
                actual: pixels.sample_name().to_string(),
            }
            .into());
        }
        let encoded = pixels.encode(pixel_type.is_rgb(), WRITE_BYTE_ORDER);
        if encoded.len() as u64 != self.summary.bytes_per_image() {
            return Err(ImageError::PixelCountMismatch {
                expected: pixel_type.source_len(self.summary.width, self.summary.height),
                actual: pixels.len(),
            }
            .into());
        }

        let entry_count = if self.options.ome_tiff && ifd_offset == self.first_ifd_offset {
            ENTRIES_PER_IFD + 1
        } else {
            ENTRIES_PER_IFD
        };
        let strip_offset = ifd_offset
            + Ifd::calculate_size(entry_count as u64) as u64
            + if pixel_type.is_rgb() { RGB_BITS_SIZE } else { 0 };

        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        write_vectored_at(file, strip_offset, &[&encoded])
            .map_err(|e| IoError::from_io(&self.path, e))?;
        debug!(label = %label, file = %self.file_name, "Overwrote pixels");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Finishing
    // -------------------------------------------------------------------------

    /// Terminate the IFD chain and write the index map.
    ///
    /// The file stays open so it can still be closed with OME-XML later.
    /// Calling this more than once has no further effect.
    pub fn finish(&mut self) -> Result<(), StorageError> {
        if self.finished {
            return Ok(());
        }
        let bo = WRITE_BYTE_ORDER;
        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        let path = &self.path;

        if let Some(location) = self.next_ifd_offset_location {
            write_vectored_at(file, location, &[&[0u8; 4]]).map_err(|e| IoError::from_io(path, e))?;
        }

        let index_offset = self.file_position;
        let mut block = Vec::with_capacity(8 + self.index_map.len() * INDEX_MAP_ENTRY_SIZE as usize);
        block.extend_from_slice(&encode_marker(
            bo,
            INDEX_MAP_HEADER,
            self.index_map.len() as u32,
        ));
        for (label, offset) in &self.index_map {
            let [c, z, t, p] = label.indices();
            block.extend_from_slice(&encode_u32s(bo, &[c, z, t, p, *offset]));
        }
        write_vectored_at(file, index_offset, &[&block]).map_err(|e| IoError::from_io(path, e))?;
        write_vectored_at(
            file,
            INDEX_MAP_OFFSET_POSITION,
            &[&encode_marker(bo, INDEX_MAP_OFFSET_HEADER, index_offset as u32)],
        )
        .map_err(|e| IoError::from_io(path, e))?;

        self.file_position += block.len() as u64;
        self.finished = true;
        debug!(
            file = %self.file_name,
            images = self.index_map.len(),
            "Wrote index map"
        );
        Ok(())
    }

    /// Write the trailer blocks, trim the file and release the handle.
    ///
    /// Every block is attempted even if an earlier one fails; the first
    /// error is returned once the handle has been released.
    pub fn close(&mut self, ome_xml: Option<&str>) -> Result<(), StorageError> {
        if self.file.is_none() {
            return Ok(());
        }

        let mut first_error: Option<StorageError> = None;
        let mut record = |result: Result<(), StorageError>, block: &str, file: &str| {
            if let Err(e) = result {
                error!(file = %file, block = %block, error = %e, "Failed to write trailer block");
                first_error.get_or_insert(e);
            }
        };

        let file_name = self.file_name.clone();
        record(self.finish(), "index map", &file_name);
        if self.options.ome_tiff {
            if let Some(xml) = ome_xml {
                record(self.write_ome_xml(xml), "OME-XML", &file_name);
            }
        }
        record(self.write_display_settings(), "display settings", &file_name);
        record(self.write_comments(), "comments", &file_name);
        record(self.truncate_and_sync(), "truncate", &file_name);

        self.file = None;
        info!(
            file = %self.file_name,
            images = self.index_map.len(),
            bytes = self.file_position,
            "Closed stack file"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write_ome_xml(&mut self, xml: &str) -> Result<(), StorageError> {
        let Some(tag_position) = self.ome_description_tag_position else {
            return Ok(());
        };
        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        let mut text = Vec::with_capacity(xml.len() + 1);
        text.extend_from_slice(xml.as_bytes());
        text.push(0);

        let entry = encode_entry(
            WRITE_BYTE_ORDER,
            TiffTag::ImageDescription,
            FieldType::Ascii,
            text.len() as u32,
            self.file_position as u32,
        );
        write_vectored_at(file, self.file_position, &[&text])
            .map_err(|e| IoError::from_io(&self.path, e))?;
        write_vectored_at(file, tag_position, &[&entry])
            .map_err(|e| IoError::from_io(&self.path, e))?;
        self.file_position += text.len() as u64;
        Ok(())
    }

    fn write_display_settings(&mut self) -> Result<(), StorageError> {
        let bo = WRITE_BYTE_ORDER;
        let channels = self
            .display_and_comments
            .get(keys::DISPLAY_CHANNELS)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let text = serde_json::to_string(&channels).map_err(MetadataError::from)?;

        let mut reserved = self.summary.channels as u64 * DISPLAY_SETTINGS_BYTES_PER_CHANNEL;
        if text.len() as u64 >= reserved {
            reserved = (text.len() as u64 / DISPLAY_SETTINGS_BYTES_PER_CHANNEL + 1)
                * DISPLAY_SETTINGS_BYTES_PER_CHANNEL;
        }

        let offset = self.file_position;
        let mut block = vec![0u8; 8 + reserved as usize];
        block[..8].copy_from_slice(&encode_marker(bo, DISPLAY_SETTINGS_HEADER, reserved as u32));
        block[8..8 + text.len()].copy_from_slice(text.as_bytes());

        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        write_vectored_at(file, offset, &[&block]).map_err(|e| IoError::from_io(&self.path, e))?;
        write_vectored_at(
            file,
            DISPLAY_SETTINGS_OFFSET_POSITION,
            &[&encode_marker(bo, DISPLAY_SETTINGS_OFFSET_HEADER, offset as u32)],
        )
        .map_err(|e| IoError::from_io(&self.path, e))?;
        self.file_position += block.len() as u64;
        Ok(())
    }

    fn write_comments(&mut self) -> Result<(), StorageError> {
        let bo = WRITE_BYTE_ORDER;
        let comments = self
            .display_and_comments
            .get(keys::DISPLAY_COMMENTS)
            .cloned()
            .unwrap_or_else(|| Value::Object(JsonMap::new()));
        let text = serde_json::to_string(&comments).map_err(MetadataError::from)?;

        let offset = self.file_position;
        let header = encode_marker(bo, COMMENTS_HEADER, text.len() as u32);
        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        write_vectored_at(file, offset, &[&header, text.as_bytes()])
            .map_err(|e| IoError::from_io(&self.path, e))?;
        write_vectored_at(
            file,
            COMMENTS_OFFSET_POSITION,
            &[&encode_marker(bo, COMMENTS_OFFSET_HEADER, offset as u32)],
        )
        .map_err(|e| IoError::from_io(&self.path, e))?;
        self.file_position += 8 + text.len() as u64;
        Ok(())
    }

    fn truncate_and_sync(&mut self) -> Result<(), StorageError> {
        let file = self.file.as_mut().ok_or(TiffError::Closed)?;
        file.set_len(self.file_position)
            .map_err(|e| IoError::from_io(&self.path, e))?;
        if !self.options.fast_storage_mode {
            file.sync_all()
                .map_err(|e| IoError::from_io(&self.path, e))?;
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Pixels per centimetre as a TIFF rational, `1/1` when the size is unknown.
fn resolution(tags: &JsonMap) -> (u32, u32) {
    let Some(size_um) = metadata::pixel_size_um(tags).filter(|s| s.is_finite() && *s > 0.0)
    else {
        return (1, 1);
    };
    let cm_per_pixel = 1.0e-4 * size_um;
    if cm_per_pixel.log10() >= 0.0 {
        (1, cm_per_pixel as u32)
    } else {
        ((1.0 / cm_per_pixel) as u32, 1)
    }
}

/// Seek to `offset` and write every buffer, retrying short writes.
fn write_vectored_at(file: &mut File, offset: u64, buffers: &[&[u8]]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    let mut slices: Vec<IoSlice<'_>> = buffers
        .iter()
        .filter(|b| !b.is_empty())
        .map(|b| IoSlice::new(b))
        .collect();
    let mut remaining = slices.as_mut_slice();
    while !remaining.is_empty() {
        match file.write_vectored(remaining) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "failed to write whole record",
                ))
            }
            Ok(n) => IoSlice::advance_slices(&mut remaining, n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn request_abort_later(signal: Option<Arc<dyn AbortSignal>>) {
    let Some(signal) = signal else {
        return;
    };
    let spawned = thread::Builder::new()
        .name("mmstack-abort".into())
        .spawn(move || {
            thread::sleep(ABORT_DELAY);
            signal.request_abort();
        });
    if let Err(e) = spawned {
        warn!(error = %e, "Could not schedule acquisition abort");
    }
}

// =============================================================================
// Tests
// =============================================================================
