//! The group of stack files holding one partition of a dataset.
//!
//! A file set appends to its newest writer until that writer runs out of
//! space, then finishes it and opens `<base>_<n>.<ext>`. It also tracks
//! whether images arrive in the predicted order; only a set whose order was
//! never broken can have the last frame of an aborted acquisition padded
//! with blank images.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ImageError, IoError, MetadataError, StorageError, TiffError};
use crate::format::mptiff::{MultipageTiffReader, MultipageTiffWriter, WriterOptions};
use crate::image::{PixelBuffer, TaggedImage};
use crate::label::ImageLabel;
use crate::metadata::{self, keys, JsonMap};

use super::AcquisitionState;

/// Reader handle published for one written image.
pub(crate) type Published = (ImageLabel, Arc<MultipageTiffReader>);

// =============================================================================
// Sidecar metadata file
// =============================================================================

/// `<base>_metadata.txt`: one JSON object with the summary first, then one
/// `FrameKey-<t>-<c>-<z>` entry per image.
#[derive(Debug)]
struct SidecarFile {
    path: PathBuf,
    out: BufWriter<File>,
}

impl SidecarFile {
    fn create(path: PathBuf, summary: &JsonMap) -> Result<Self, StorageError> {
        let file = File::create(&path).map_err(|e| IoError::from_io(&path, e))?;
        let mut sidecar = Self {
            path,
            out: BufWriter::new(file),
        };
        let text = serde_json::to_string_pretty(summary).map_err(MetadataError::from)?;
        sidecar.write(&format!("{{\r\n\"{}\": {}", keys::SUMMARY, text))?;
        Ok(sidecar)
    }

    fn append(&mut self, label: &ImageLabel, tags: &JsonMap) -> Result<(), StorageError> {
        let text = serde_json::to_string_pretty(tags).map_err(MetadataError::from)?;
        self.write(&format!(
            ",\r\n\"FrameKey-{}-{}-{}\": {}",
            label.frame, label.channel, label.slice, text
        ))
    }

    fn finish(mut self) -> Result<(), StorageError> {
        self.write("\r\n}\r\n")?;
        self.out
            .flush()
            .map_err(|e| IoError::from_io(&self.path, e))?;
        Ok(())
    }

    fn write(&mut self, text: &str) -> Result<(), StorageError> {
        self.out
            .write_all(text.as_bytes())
            .map_err(|e| IoError::from_io(&self.path, e))?;
        Ok(())
    }
}

// =============================================================================
// FileSet
// =============================================================================

#[derive(Debug)]
pub(crate) struct FileSet {
    directory: PathBuf,
    base_name: String,
    extension: &'static str,
    options: WriterOptions,
    split_by_position: bool,
    separate_metadata_file: bool,
    display_and_comments: Option<JsonMap>,

    writers: Vec<MultipageTiffWriter>,
    /// Name with the widest possible roll-over suffix
    longest_file_name: String,
    current_file_name: String,
    current_uuid: String,
    /// IFD index of the next image within the current file
    ifd_count: u32,
    sidecar: Option<SidecarFile>,

    next_expected: (u32, u32, u32),
    order_intact: bool,
    current_frame: u32,
    first_label: Option<ImageLabel>,
    finished: bool,
}

impl FileSet {
    pub fn new(
        directory: &Path,
        base_name: String,
        options: WriterOptions,
        split_by_position: bool,
        separate_metadata_file: bool,
    ) -> Self {
        let extension = if options.ome_tiff { ".ome.tif" } else { ".tif" };
        Self {
            directory: directory.to_path_buf(),
            current_file_name: format!("{}{}", base_name, extension),
            longest_file_name: format!("{}_{}{}", base_name, u32::MAX, extension),
            base_name,
            extension,
            options,
            split_by_position,
            separate_metadata_file,
            display_and_comments: None,
            writers: Vec::new(),
            current_uuid: new_uuid(),
            ifd_count: 0,
            sidecar: None,
            next_expected: (0, 0, 0),
            order_intact: true,
            current_frame: 0,
            first_label: None,
            finished: false,
        }
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    #[cfg(test)]
    pub fn file_count(&self) -> usize {
        self.writers.len()
    }

    #[cfg(test)]
    pub fn is_order_intact(&self) -> bool {
        self.order_intact
    }

    pub fn set_display_and_comments(&mut self, settings: JsonMap) {
        for writer in &mut self.writers {
            writer.set_display_and_comments(settings.clone());
        }
        self.display_and_comments = Some(settings);
    }

    // -------------------------------------------------------------------------
    // Writing
    // -------------------------------------------------------------------------

    /// Append one validated image, rolling over to a new file if needed.
    pub fn write_image(
        &mut self,
        mut image: TaggedImage,
        state: &mut AcquisitionState,
    ) -> Result<Published, StorageError> {
        if self.finished {
            return Err(StorageError::ReadOnly);
        }
        let label = image.label()?;
        if self.writers.iter().any(|w| w.contains(&label)) {
            return Err(ImageError::DuplicateLabel(label.to_string()).into());
        }
        image.tags.remove(keys::SUMMARY);
        let position_name = metadata::position_name(&image.tags).map(str::to_string);
        if let Some(ome) = state.ome.as_mut() {
            ome.reserve_names(&self.longest_file_name, position_name.as_deref());
        }

        let metadata_len = serde_json::to_string(&image.tags)
            .map_err(MetadataError::from)?
            .len() as u64
            + self.file_name_tag_len();
        self.ensure_space(label, metadata_len, state)?;

        image
            .tags
            .insert(keys::FILE_NAME.to_string(), Value::from(self.current_file_name.clone()));

        if let Some(sidecar) = self.sidecar.as_mut() {
            if let Err(e) = sidecar.append(&label, &image.tags) {
                error!(label = %label, error = %e, "Problem writing to metadata file");
            }
        }

        let writer = self.writers.last_mut().ok_or(TiffError::Closed)?;
        writer.write_image(image)?;
        let reader = writer.reader();

        if self.split_by_position {
            self.check_order(&label, state);
        } else {
            self.order_intact = false;
        }

        if let Some(ome) = state.ome.as_mut() {
            if label.frame > self.current_frame {
                ome.fill_in_missing_tiff_datas(self.current_frame, label.position);
            }
            ome.add_plane(
                label.position,
                position_name.as_deref(),
                label.channel,
                label.slice,
                label.frame,
                self.ifd_count,
                &self.current_file_name,
                &self.current_uuid,
            );
        }
        self.current_frame = label.frame;
        self.first_label.get_or_insert(label);
        state.last_frame = state.last_frame.max(label.frame);
        state.last_acquired_position = state.last_acquired_position.max(label.position);
        self.ifd_count += 1;

        Ok((label, reader))
    }

    /// Open the first writer, or roll over when the current one is full.
    ///
    /// Fails with [`ImageError::TooLarge`] when the image does not fit even
    /// in a file holding nothing else.
    fn ensure_space(
        &mut self,
        label: ImageLabel,
        metadata_len: u64,
        state: &AcquisitionState,
    ) -> Result<(), StorageError> {
        if self.writers.is_empty() {
            if self.separate_metadata_file && self.sidecar.is_none() {
                let path = self
                    .directory
                    .join(format!("{}_metadata.txt", self.base_name));
                self.sidecar = Some(SidecarFile::create(path, &state.summary)?);
            }
            self.open_writer(state)?;
        }

        let ome_estimate = state.ome_estimate();
        let writer = self.writers.last_mut().ok_or(TiffError::Closed)?;
        if writer.has_space_for(metadata_len, ome_estimate) {
            return Ok(());
        }

        if writer.image_count() > 0 {
            writer.finish()?;
            self.current_file_name = format!(
                "{}_{}{}",
                self.base_name,
                self.writers.len(),
                self.extension
            );
            self.current_uuid = new_uuid();
            self.ifd_count = 0;
            info!(
                file = %self.current_file_name,
                "File size limit reached; continuing in a new file"
            );
            self.open_writer(state)?;

            let writer = self.writers.last().ok_or(TiffError::Closed)?;
            if writer.has_space_for(metadata_len, ome_estimate) {
                return Ok(());
            }
        }

        error!(
            label = %label,
            file_set = %self.base_name,
            max_file_size = self.options.limits.max_file_size,
            "Image does not fit in an empty file"
        );
        Err(ImageError::TooLarge {
            label: label.to_string(),
            max_file_size: self.options.limits.max_file_size,
        }
        .into())
    }

    /// Bytes the `FileName` tag adds to an image's metadata, at most.
    fn file_name_tag_len(&self) -> u64 {
        let quoted = |text: &str| serde_json::to_string(text).map(|s| s.len()).unwrap_or(0);
        // Separator comma and colon
        (quoted(keys::FILE_NAME) + quoted(&self.longest_file_name) + 2) as u64
    }

    fn open_writer(&mut self, state: &AcquisitionState) -> Result<(), StorageError> {
        let mut writer = MultipageTiffWriter::open(
            &self.directory,
            &self.current_file_name,
            &state.summary,
            self.options.clone(),
        )?;
        if let Some(settings) = &self.display_and_comments {
            writer.set_display_and_comments(settings.clone());
        }
        self.writers.push(writer);
        Ok(())
    }

    /// Compare against the predicted coordinates and predict the next ones.
    fn check_order(&mut self, label: &ImageLabel, state: &AcquisitionState) {
        let (channel, slice, frame) = (label.channel, label.slice, label.frame);
        if (channel, slice, frame) != self.next_expected {
            if self.order_intact {
                warn!(
                    label = %label,
                    file_set = %self.base_name,
                    "Images arrived out of order; blank filling disabled"
                );
            }
            self.order_intact = false;
        }

        let info = &state.info;
        let (inner, outer, inner_count, outer_count) = if info.order.slices_first {
            (slice, channel, info.slices, info.channels)
        } else {
            (channel, slice, info.channels, info.slices)
        };
        let (mut next_inner, mut next_outer, mut next_frame) = (inner + 1, outer, frame);
        if next_inner >= inner_count {
            next_inner = 0;
            next_outer = outer + 1;
            if next_outer >= outer_count {
                next_outer = 0;
                next_frame = frame + 1;
            }
        }
        self.next_expected = if info.order.slices_first {
            (next_outer, next_inner, next_frame)
        } else {
            (next_inner, next_outer, next_frame)
        };
    }

    /// Overwrite the pixels of an image already in one of this set's files.
    pub fn overwrite_pixels(
        &mut self,
        label: ImageLabel,
        pixels: &PixelBuffer,
    ) -> Result<(), StorageError> {
        let writer = self
            .writers
            .iter_mut()
            .find(|w| w.contains(&label))
            .ok_or_else(|| TiffError::LabelNotFound(label.to_string()))?;
        writer.overwrite_pixels(label, pixels)
    }

    // -------------------------------------------------------------------------
    // Finishing
    // -------------------------------------------------------------------------

    /// Pad the last frame of an interrupted acquisition with blank images.
    ///
    /// Only runs when images arrived in the predicted order, the dataset is
    /// split by position and frames are not acquired position by position.
    pub fn finish_aborted_acq_if_needed(
        &mut self,
        state: &mut AcquisitionState,
    ) -> Result<Vec<Published>, StorageError> {
        if self.finished
            || !self.order_intact
            || !self.split_by_position
            || state.info.order.time_first
        {
            return Ok(Vec::new());
        }
        let frame = state.last_frame;
        self.complete_frame_with_blanks(frame, state)
    }

    fn complete_frame_with_blanks(
        &mut self,
        frame: u32,
        state: &mut AcquisitionState,
    ) -> Result<Vec<Published>, StorageError> {
        let Some(first) = self.first_label else {
            return Ok(Vec::new());
        };
        if state.info.frames <= frame + 1 {
            return Ok(Vec::new());
        }
        let position = first.position;
        if let Some(ome) = state.ome.as_mut() {
            ome.set_num_frames(position, frame + 1);
        }

        let mut published = Vec::new();
        for channel in 0..state.info.channels {
            for slice in 0..state.info.slices {
                let label = ImageLabel::new(channel, slice, frame, position);
                if self.writers.iter().any(|w| w.contains(&label)) {
                    continue;
                }
                let blank = TaggedImage::blank(label, &state.info);
                let metadata_len = serde_json::to_string(&blank.tags)
                    .map_err(MetadataError::from)?
                    .len() as u64;
                self.ensure_space(label, metadata_len, state)?;
                let writer = self.writers.last_mut().ok_or(TiffError::Closed)?;
                writer.write_blank_image(label)?;
                published.push((label, writer.reader()));

                if let Some(ome) = state.ome.as_mut() {
                    ome.add_plane(
                        position,
                        None,
                        channel,
                        slice,
                        frame,
                        self.ifd_count,
                        &self.current_file_name,
                        &self.current_uuid,
                    );
                }
                self.ifd_count += 1;
            }
        }
        if !published.is_empty() {
            info!(
                file_set = %self.base_name,
                frame,
                blanks = published.len(),
                "Filled last frame of aborted acquisition with blank images"
            );
        }
        Ok(published)
    }

    /// Close the sidecar, finish the last writer and close every file with
    /// the dataset's OME-XML. Runs once.
    ///
    /// Every writer is closed even if an earlier one fails; the first error
    /// is returned.
    pub fn finished(&mut self, state: &mut AcquisitionState) -> Result<(), StorageError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let mut first_error: Option<StorageError> = None;

        if let Some(sidecar) = self.sidecar.take() {
            if let Err(e) = sidecar.finish() {
                error!(file_set = %self.base_name, error = %e, "Failed to close metadata file");
                first_error.get_or_insert(e);
            }
        }

        let last_frame = state.last_frame;
        if let Some(ome) = state.ome.as_mut() {
            for position in 0..=state.last_acquired_position {
                ome.set_num_frames(position, last_frame + 1);
                ome.fill_in_missing_tiff_datas(last_frame, position);
            }
        }
        let ome_xml = state.ome_xml().map(str::to_string);

        if let Some(last) = self.writers.last_mut() {
            if let Err(e) = last.finish() {
                error!(file = %last.file_name(), error = %e, "Failed to finish file");
                first_error.get_or_insert(e);
            }
        }
        for writer in &mut self.writers {
            if let Err(e) = writer.close(ome_xml.as_deref()) {
                first_error.get_or_insert(e);
            }
        }
        debug!(
            file_set = %self.base_name,
            files = self.writers.len(),
            "File set finished"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn new_uuid() -> String {
    format!("urn:uuid:{}", Uuid::new_v4())
}

// =============================================================================
// Tests
// =============================================================================
