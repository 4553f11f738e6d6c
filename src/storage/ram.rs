//! In-memory backend.

use std::path::Path;

use tracing::debug;

use crate::error::StorageError;
use crate::image::{PixelBuffer, TaggedImage};
use crate::label::{ImageLabel, LabelIndex};
use crate::metadata::{display_and_comments_from_summary, keys, JsonMap, SummaryInfo};

use super::TaggedImageStorage;

/// Keeps every image in memory. Useful for previews and tests.
#[derive(Debug)]
pub struct RamStorage {
    summary: JsonMap,
    info: SummaryInfo,
    display_and_comments: JsonMap,
    images: LabelIndex<TaggedImage>,
    finished: bool,
    last_acquired_frame: Option<u32>,
}

impl RamStorage {
    pub fn new(summary: JsonMap) -> Result<Self, StorageError> {
        let info = SummaryInfo::from_summary(&summary)?;
        Ok(Self {
            display_and_comments: display_and_comments_from_summary(&summary),
            images: LabelIndex::new(info.order),
            summary,
            info,
            finished: false,
            last_acquired_frame: None,
        })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl TaggedImageStorage for RamStorage {
    fn put_image(&mut self, mut image: TaggedImage) -> Result<(), StorageError> {
        if self.finished {
            return Err(StorageError::ReadOnly);
        }
        image.validate(&self.info)?;
        let label = image.label()?;
        image.tags.remove(keys::SUMMARY);
        if self.images.insert(label, image).is_some() {
            debug!(label = %label, "Replaced image in memory");
        }
        self.last_acquired_frame = self.last_acquired_frame.max(Some(label.frame));
        Ok(())
    }

    fn get_image(&self, channel: u32, slice: u32, frame: u32, position: u32) -> Option<TaggedImage> {
        self.images
            .get(&ImageLabel::new(channel, slice, frame, position))
            .cloned()
    }

    fn get_image_tags(&self, channel: u32, slice: u32, frame: u32, position: u32) -> Option<JsonMap> {
        self.images
            .get(&ImageLabel::new(channel, slice, frame, position))
            .map(|image| image.tags.clone())
    }

    fn image_keys(&self) -> Vec<ImageLabel> {
        self.images.labels().copied().collect()
    }

    fn finished(&mut self) -> Result<(), StorageError> {
        self.finished = true;
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.finished
    }

    fn summary_metadata(&self) -> &JsonMap {
        &self.summary
    }

    fn set_summary_metadata(&mut self, summary: JsonMap) -> Result<(), StorageError> {
        let info = SummaryInfo::from_summary(&summary)?;
        if info.order != self.images.order() {
            let images = std::mem::take(&mut self.images);
            self.images = images.reorder(info.order);
        }
        self.info = info;
        self.summary = summary;
        Ok(())
    }

    fn display_and_comments(&self) -> JsonMap {
        self.display_and_comments.clone()
    }

    fn set_display_and_comments(&mut self, settings: JsonMap) {
        self.display_and_comments = settings;
    }

    fn write_display_settings(&mut self) -> Result<(), StorageError> {
        Ok(())
    }

    fn last_acquired_frame(&self) -> Option<u32> {
        self.last_acquired_frame
    }

    /// Bytes held by pixel buffers.
    fn data_set_size(&self) -> u64 {
        self.images
            .values()
            .map(|image| match &image.pixels {
                PixelBuffer::Bytes(b) => b.len() as u64,
                PixelBuffer::Shorts(s) => s.len() as u64 * 2,
                PixelBuffer::Floats(f) => f.len() as u64 * 4,
            })
            .sum()
    }

    fn disk_location(&self) -> Option<&Path> {
        None
    }

    fn close(&mut self) {}
}
