//! Random-access reader for stack files.
//!
//! A reader is either attached to a writer, in which case the writer
//! registers every IFD as it lands and the file is reopened lazily on first
//! read, or opened on a finished file, in which case the index map and the
//! display and comments blocks are parsed up front.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{IoError, MetadataError, TiffError};
use crate::format::tiff::{
    encode_marker, ByteOrder, Ifd, TiffHeader, TiffTag, ValueReader, IFD_COUNT_SIZE,
    TIFF_HEADER_SIZE,
};
use crate::image::{PixelBuffer, PixelType, TaggedImage};
use crate::io::{FileRangeReader, RangeReader};
use crate::label::ImageLabel;
use crate::metadata::{self, display_and_comments_from_summary, keys, JsonMap};

use super::{
    COMMENTS_HEADER, COMMENTS_OFFSET_HEADER, COMMENTS_OFFSET_POSITION, DISPLAY_SETTINGS_HEADER,
    DISPLAY_SETTINGS_OFFSET_HEADER, DISPLAY_SETTINGS_OFFSET_POSITION, INDEX_MAP_ENTRY_SIZE,
    INDEX_MAP_HEADER, INDEX_MAP_OFFSET_HEADER, INDEX_MAP_OFFSET_POSITION, SUMMARY_DATA_POSITION,
    SUMMARY_MD_HEADER, SUMMARY_POSITION,
};

/// Reader over one stack file.
#[derive(Debug)]
pub struct MultipageTiffReader {
    path: PathBuf,
    file_name: String,
    byte_order: ByteOrder,
    source: RwLock<Option<Arc<FileRangeReader>>>,
    summary: JsonMap,
    index: RwLock<HashMap<ImageLabel, u32>>,
    display_and_comments: RwLock<JsonMap>,
}

impl MultipageTiffReader {
    /// Reader for a file that is still being written.
    pub(crate) fn for_writer(
        path: &Path,
        summary: JsonMap,
        display_and_comments: JsonMap,
    ) -> Result<Self, IoError> {
        Ok(Self {
            path: path.to_path_buf(),
            file_name: file_name_of(path),
            byte_order: super::WRITE_BYTE_ORDER,
            source: RwLock::new(None),
            summary,
            index: RwLock::new(HashMap::new()),
            display_and_comments: RwLock::new(display_and_comments),
        })
    }

    /// Open a finished stack file.
    ///
    /// Files whose index map is missing, typically because the writer never
    /// got to close them, are indexed by walking the IFD chain instead.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TiffError> {
        let path = path.as_ref();
        let source = FileRangeReader::open(path)?;
        let size = source.size();

        let head = source.read_exact_at(0, TIFF_HEADER_SIZE)?;
        let header = TiffHeader::parse(&head, size)?;
        let byte_order = header.byte_order;

        let summary = read_summary(&source, byte_order)?;

        let index = match read_offset_record(
            &source,
            byte_order,
            INDEX_MAP_OFFSET_POSITION,
            INDEX_MAP_OFFSET_HEADER,
        )? {
            Some(offset) => read_index_map(&source, byte_order, offset)?,
            None => {
                warn!(file = %path.display(), "Index map missing; scanning IFDs");
                scan_ifds(&source, byte_order, header.first_ifd_offset)?
            }
        };

        let mut display_and_comments = display_and_comments_from_summary(&summary);
        if let Some(offset) = read_offset_record(
            &source,
            byte_order,
            DISPLAY_SETTINGS_OFFSET_POSITION,
            DISPLAY_SETTINGS_OFFSET_HEADER,
        )? {
            match read_display_settings(&source, byte_order, offset) {
                Ok(channels) => {
                    display_and_comments.insert(keys::DISPLAY_CHANNELS.to_string(), channels);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Unreadable display settings"),
            }
        }
        if let Some(offset) = read_offset_record(
            &source,
            byte_order,
            COMMENTS_OFFSET_POSITION,
            COMMENTS_OFFSET_HEADER,
        )? {
            match read_comments(&source, byte_order, offset) {
                Ok(comments) => {
                    display_and_comments.insert(keys::DISPLAY_COMMENTS.to_string(), comments);
                }
                Err(e) => warn!(file = %path.display(), error = %e, "Unreadable comments"),
            }
        }

        debug!(
            file = %path.display(),
            images = index.len(),
            "Opened stack file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file_name: file_name_of(path),
            byte_order,
            source: RwLock::new(Some(Arc::new(source))),
            summary,
            index: RwLock::new(index),
            display_and_comments: RwLock::new(display_and_comments),
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

    /// Summary metadata stored in the file header.
    pub fn summary(&self) -> &JsonMap {
        &self.summary
    }

    pub fn display_and_comments(&self) -> JsonMap {
        self.display_and_comments.read().clone()
    }

    /// Labels of every image in this file, in no particular order.
    pub fn index_keys(&self) -> Vec<ImageLabel> {
        self.index.read().keys().copied().collect()
    }

    pub fn contains(&self, label: &ImageLabel) -> bool {
        self.index.read().contains_key(label)
    }

    pub(crate) fn register(&self, label: ImageLabel, offset: u32) {
        self.index.write().insert(label, offset);
    }

    // -------------------------------------------------------------------------
    // Images
    // -------------------------------------------------------------------------

    /// Read pixels and tags of one image.
    pub fn read_image(&self, label: &ImageLabel) -> Result<TaggedImage, TiffError> {
        let offset = self.offset_of(label)?;
        let source = self.source()?;
        let ifd = read_ifd(source.as_ref(), self.byte_order, offset)?;
        let values = ValueReader::new(source.as_ref(), self.byte_order);

        let tags = read_tags(&values, &ifd)?;
        let pixel_type = match metadata::pixel_type(&tags) {
            Ok(pixel_type) => pixel_type,
            Err(_) => layout_pixel_type(&values, &ifd)?,
        };

        let bo = self.byte_order;
        let strip_offset = ifd.required_u32(TiffTag::StripOffsets, "StripOffsets", bo)?;
        let strip_len = ifd.required_u32(TiffTag::StripByteCounts, "StripByteCounts", bo)?;
        let data = source.read_exact_at(strip_offset as u64, strip_len as usize)?;

        Ok(TaggedImage::new(
            PixelBuffer::decode(&data, pixel_type, bo),
            tags,
        ))
    }

    /// Read only the tags of one image.
    pub fn read_image_tags(&self, label: &ImageLabel) -> Result<JsonMap, TiffError> {
        let offset = self.offset_of(label)?;
        let source = self.source()?;
        let ifd = read_ifd(source.as_ref(), self.byte_order, offset)?;
        read_tags(&ValueReader::new(source.as_ref(), self.byte_order), &ifd)
    }

    fn offset_of(&self, label: &ImageLabel) -> Result<u64, TiffError> {
        self.index
            .read()
            .get(label)
            .map(|offset| *offset as u64)
            .ok_or_else(|| TiffError::LabelNotFound(label.to_string()))
    }

    fn source(&self) -> Result<Arc<FileRangeReader>, TiffError> {
        if let Some(source) = self.source.read().as_ref() {
            return Ok(Arc::clone(source));
        }
        let mut slot = self.source.write();
        if let Some(source) = slot.as_ref() {
            return Ok(Arc::clone(source));
        }
        let source = Arc::new(FileRangeReader::open(&self.path)?);
        *slot = Some(Arc::clone(&source));
        Ok(source)
    }

    // -------------------------------------------------------------------------
    // Display settings and comments
    // -------------------------------------------------------------------------

    /// Rewrite the display settings block of a finished file in place.
    ///
    /// Fails with [`TiffError::BlockOverflow`] when `channels` does not fit
    /// the space reserved when the file was closed.
    pub fn rewrite_display_settings(&self, channels: &Value) -> Result<(), TiffError> {
        let source = self.source()?;
        let bo = self.byte_order;
        let offset = read_offset_record(
            source.as_ref(),
            bo,
            DISPLAY_SETTINGS_OFFSET_POSITION,
            DISPLAY_SETTINGS_OFFSET_HEADER,
        )?
        .ok_or(TiffError::MissingTag("display settings offset"))?;
        let reserved = read_block_header(
            source.as_ref(),
            bo,
            offset,
            DISPLAY_SETTINGS_HEADER,
            "display settings",
        )?;

        let text = serde_json::to_string(channels).map_err(MetadataError::from)?;
        if text.len() as u64 > reserved as u64 {
            return Err(TiffError::BlockOverflow {
                block: "display settings",
                capacity: reserved,
                required: text.len() as u64,
            });
        }
        let mut block = vec![0u8; reserved as usize];
        block[..text.len()].copy_from_slice(text.as_bytes());
        self.write_at(&[(offset + 8, &block)])?;

        self.display_and_comments
            .write()
            .insert(keys::DISPLAY_CHANNELS.to_string(), channels.clone());
        Ok(())
    }

    /// Append a new comments block and point the comments record at it.
    pub fn rewrite_comments(&self, comments: &Value) -> Result<(), TiffError> {
        let bo = self.byte_order;
        let text = serde_json::to_string(comments).map_err(MetadataError::from)?;
        let offset = self.source()?.size();

        let mut block = Vec::with_capacity(8 + text.len());
        block.extend_from_slice(&encode_marker(bo, COMMENTS_HEADER, text.len() as u32));
        block.extend_from_slice(text.as_bytes());
        let record = encode_marker(bo, COMMENTS_OFFSET_HEADER, offset as u32);
        self.write_at(&[(offset, &block), (COMMENTS_OFFSET_POSITION, &record)])?;

        self.display_and_comments
            .write()
            .insert(keys::DISPLAY_COMMENTS.to_string(), comments.clone());
        Ok(())
    }

    fn write_at(&self, chunks: &[(u64, &[u8])]) -> Result<(), TiffError> {
        let io_err = |e| IoError::from_io(&self.path, e);
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(io_err)?;
        for (offset, bytes) in chunks {
            file.seek(SeekFrom::Start(*offset)).map_err(io_err)?;
            file.write_all(bytes).map_err(io_err)?;
        }
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Release the read handle. Later reads reopen the file.
    pub fn close(&self) {
        self.source.write().take();
    }
}

// =============================================================================
// Block parsing
// =============================================================================

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn read_block_header<R: RangeReader + ?Sized>(
    source: &R,
    bo: ByteOrder,
    offset: u64,
    expected: u32,
    block: &'static str,
) -> Result<u32, TiffError> {
    let bytes = source.read_exact_at(offset, 8)?;
    let found = bo.read_u32(&bytes[0..4]);
    if found != expected {
        return Err(TiffError::InvalidBlockHeader {
            block,
            expected,
            found,
        });
    }
    Ok(bo.read_u32(&bytes[4..8]))
}

/// Offset stored in one of the records at 8, 16 or 24, or `None` if the
/// record was never filled in.
fn read_offset_record<R: RangeReader + ?Sized>(
    source: &R,
    bo: ByteOrder,
    position: u64,
    marker: u32,
) -> Result<Option<u64>, TiffError> {
    let bytes = source.read_exact_at(position, 8)?;
    if bo.read_u32(&bytes[0..4]) != marker {
        return Ok(None);
    }
    let offset = bo.read_u32(&bytes[4..8]) as u64;
    if offset == 0 || offset >= source.size() {
        return Ok(None);
    }
    Ok(Some(offset))
}

fn read_summary<R: RangeReader + ?Sized>(source: &R, bo: ByteOrder) -> Result<JsonMap, TiffError> {
    if source.size() < SUMMARY_DATA_POSITION {
        return Err(TiffError::FileTooSmall {
            required: SUMMARY_DATA_POSITION,
            actual: source.size(),
        });
    }
    let len = read_block_header(source, bo, SUMMARY_POSITION, SUMMARY_MD_HEADER, "summary")?;
    let text = source.read_exact_at(SUMMARY_DATA_POSITION, len as usize)?;
    Ok(metadata::parse_object(&String::from_utf8_lossy(&text))?)
}

fn read_index_map<R: RangeReader + ?Sized>(
    source: &R,
    bo: ByteOrder,
    offset: u64,
) -> Result<HashMap<ImageLabel, u32>, TiffError> {
    let count = read_block_header(source, bo, offset, INDEX_MAP_HEADER, "index map")?;
    let data = source.read_exact_at(offset + 8, count as usize * INDEX_MAP_ENTRY_SIZE as usize)?;
    let mut index = HashMap::with_capacity(count as usize);
    for entry in data.chunks_exact(INDEX_MAP_ENTRY_SIZE as usize) {
        let field = |i: usize| bo.read_u32(&entry[i * 4..i * 4 + 4]);
        let label = ImageLabel::new(field(0), field(1), field(2), field(3));
        index.insert(label, field(4));
    }
    Ok(index)
}

fn scan_ifds<R: RangeReader + ?Sized>(
    source: &R,
    bo: ByteOrder,
    first_ifd_offset: u64,
) -> Result<HashMap<ImageLabel, u32>, TiffError> {
    let values = ValueReader::new(source, bo);
    let mut index = HashMap::new();
    let mut offset = first_ifd_offset;
    while offset != 0 && offset < source.size() {
        let ifd = match read_ifd(source, bo, offset) {
            Ok(ifd) => ifd,
            Err(e) => {
                warn!(offset, error = %e, "IFD chain ends in a damaged directory");
                break;
            }
        };
        let label = read_tags(&values, &ifd)
            .and_then(|tags| ImageLabel::from_tags(&tags).map_err(TiffError::from));
        match label {
            Ok(label) => {
                index.insert(label, offset as u32);
            }
            Err(e) => warn!(offset, error = %e, "Skipping IFD without a usable label"),
        }
        if ifd.next_ifd_offset <= offset {
            break;
        }
        offset = ifd.next_ifd_offset;
    }
    Ok(index)
}

fn read_display_settings<R: RangeReader + ?Sized>(
    source: &R,
    bo: ByteOrder,
    offset: u64,
) -> Result<Value, TiffError> {
    let reserved = read_block_header(source, bo, offset, DISPLAY_SETTINGS_HEADER, "display settings")?;
    let data = source.read_exact_at(offset + 8, reserved as usize)?;
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    Ok(serde_json::from_slice(&data[..end]).map_err(MetadataError::from)?)
}

fn read_comments<R: RangeReader + ?Sized>(
    source: &R,
    bo: ByteOrder,
    offset: u64,
) -> Result<Value, TiffError> {
    let len = read_block_header(source, bo, offset, COMMENTS_HEADER, "comments")?;
    let data = source.read_exact_at(offset + 8, len as usize)?;
    Ok(serde_json::from_slice(&data).map_err(MetadataError::from)?)
}

// =============================================================================
// IFD parsing
// =============================================================================

fn read_ifd<R: RangeReader + ?Sized>(source: &R, bo: ByteOrder, offset: u64) -> Result<Ifd, TiffError> {
    let count_bytes: Bytes = source
        .read_exact_at(offset, IFD_COUNT_SIZE)
        .map_err(|_| TiffError::InvalidIfdOffset(offset))?;
    let entry_count = bo.read_u16(&count_bytes) as u64;
    let bytes = source.read_exact_at(offset, Ifd::calculate_size(entry_count))?;
    Ifd::parse(&bytes, bo)
}

fn read_tags<R: RangeReader + ?Sized>(values: &ValueReader<'_, R>, ifd: &Ifd) -> Result<JsonMap, TiffError> {
    let entry = ifd
        .get_entry_by_tag(TiffTag::MicroManagerMetadata)
        .ok_or(TiffError::MissingTag("MicroManagerMetadata"))?;
    let text = values.read_string(entry)?;
    Ok(metadata::parse_object(&text)?)
}

fn layout_pixel_type<R: RangeReader + ?Sized>(
    values: &ValueReader<'_, R>,
    ifd: &Ifd,
) -> Result<PixelType, TiffError> {
    let bo = values.byte_order();
    let bits_entry = ifd
        .get_entry_by_tag(TiffTag::BitsPerSample)
        .ok_or(TiffError::MissingTag("BitsPerSample"))?;
    let bits = values
        .read_u32_array(bits_entry)?
        .first()
        .copied()
        .unwrap_or(8);
    let samples = ifd.samples_per_pixel(bo).unwrap_or(1);
    PixelType::from_layout(bits, samples).ok_or_else(|| TiffError::InvalidTagValue {
        tag: "BitsPerSample",
        message: format!("{} bits x {} samples is not a supported layout", bits, samples),
    })
}

// =============================================================================
// Tests
// =============================================================================
