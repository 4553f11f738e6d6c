//! Dataset facade over file sets and readers.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{IoError, StorageError, TiffError};
use crate::format::mptiff::{MultipageTiffReader, WriterOptions};
use crate::image::{PixelBuffer, TaggedImage};
use crate::label::{AcquisitionOrder, ImageLabel, LabelIndex};
use crate::metadata::{self, display_and_comments_from_summary, keys, JsonMap, SummaryInfo};

use super::file_set::FileSet;
use super::{AcquisitionState, StorageOptions, TaggedImageStorage};

/// Lifecycle of a dataset. There is no way back from `Finished`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageState {
    /// Accepting images
    New,
    /// Padding and closing file sets
    Finishing,
    /// Read-only
    Finished,
}

/// Dataset stored as size-capped stack files in one directory.
#[derive(Debug)]
pub struct MultipageTiffStorage {
    directory: PathBuf,
    options: StorageOptions,
    state: StorageState,
    summary: JsonMap,
    display_and_comments: JsonMap,
    acquisition: Option<AcquisitionState>,
    file_sets: BTreeMap<u32, FileSet>,
    readers: LabelIndex<Arc<MultipageTiffReader>>,
    last_acquired_frame: Option<u32>,
}

impl MultipageTiffStorage {
    /// Start a new dataset in `directory`.
    ///
    /// The directory is created when the first image arrives.
    pub fn create(
        directory: impl Into<PathBuf>,
        summary: JsonMap,
        options: StorageOptions,
    ) -> Result<Self, StorageError> {
        let acquisition = AcquisitionState::new(summary.clone(), options.ome_tiff)?;
        let order = acquisition.info.order;
        Ok(Self {
            directory: directory.into(),
            options,
            state: StorageState::New,
            display_and_comments: display_and_comments_from_summary(&summary),
            summary,
            acquisition: Some(acquisition),
            file_sets: BTreeMap::new(),
            readers: LabelIndex::new(order),
            last_acquired_frame: None,
        })
    }

    /// Open an existing dataset read-only.
    ///
    /// Every `.tif` file in `directory` is indexed. Summary metadata and
    /// display settings come from the first file opened.
    pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let directory = directory.into();
        let mut paths: Vec<PathBuf> = fs::read_dir(&directory)
            .map_err(|e| IoError::from_io(&directory, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .map(|ext| ext == "tif" || ext == "TIF")
                        .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut readers = Vec::with_capacity(paths.len());
        for path in &paths {
            match MultipageTiffReader::open(path) {
                Ok(reader) => readers.push(Arc::new(reader)),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping unreadable file"),
            }
        }
        let Some(first) = readers.first() else {
            return Err(IoError::NotFound(format!(
                "no stack files in {}",
                directory.display()
            ))
            .into());
        };

        let summary = first.summary().clone();
        let display_and_comments = first.display_and_comments();
        let mut index = LabelIndex::new(AcquisitionOrder::from_summary(&summary));
        let mut last_frame = None;
        for reader in &readers {
            for label in reader.index_keys() {
                last_frame = last_frame.max(Some(label.frame));
                index.insert(label, Arc::clone(reader));
            }
        }

        info!(
            directory = %directory.display(),
            files = readers.len(),
            images = index.len(),
            "Opened dataset"
        );

        Ok(Self {
            directory,
            options: StorageOptions::default(),
            state: StorageState::Finished,
            summary,
            display_and_comments,
            acquisition: None,
            file_sets: BTreeMap::new(),
            readers: index,
            last_acquired_frame: last_frame,
        })
    }

    pub fn state(&self) -> StorageState {
        self.state
    }

    /// Number of file sets opened so far.
    pub fn file_set_count(&self) -> usize {
        self.file_sets.len()
    }

    /// Number of distinct files backing the stored images.
    pub fn file_count(&self) -> usize {
        self.unique_readers().len()
    }

    /// Overwrite the pixels of an image at position 0 while acquiring.
    ///
    /// Tags and file layout are unchanged.
    pub fn overwrite_pixels(
        &mut self,
        pixels: &PixelBuffer,
        channel: u32,
        slice: u32,
        frame: u32,
    ) -> Result<(), StorageError> {
        if self.state != StorageState::New {
            return Err(StorageError::ReadOnly);
        }
        let label = ImageLabel::new(channel, slice, frame, 0);
        let file_set = self
            .file_sets
            .get_mut(&0)
            .ok_or_else(|| TiffError::LabelNotFound(label.to_string()))?;
        file_set.overwrite_pixels(label, pixels)
    }

    fn file_set_base_name(&self, image: &TaggedImage, position: u32) -> String {
        let prefix = self
            .summary
            .get(keys::PREFIX)
            .and_then(Value::as_str)
            .filter(|p| !p.is_empty());
        let mut name = match prefix {
            Some(prefix) => format!("{}_MMStack", prefix),
            None => "MMStack".to_string(),
        };
        let positions = self
            .acquisition
            .as_ref()
            .map(|a| a.info.positions)
            .unwrap_or(1);
        if positions > 1 && self.options.split_by_position {
            match metadata::position_name(&image.tags) {
                Some(position_name) => {
                    name.push('_');
                    name.push_str(position_name);
                }
                None => name.push_str(&format!("_pos{}", position)),
            }
        }
        name
    }

    fn unique_readers(&self) -> Vec<Arc<MultipageTiffReader>> {
        let mut seen = HashSet::new();
        self.readers
            .values()
            .filter(|reader| seen.insert(reader.path().to_path_buf()))
            .cloned()
            .collect()
    }

    fn reader_for(
        &self,
        channel: u32,
        slice: u32,
        frame: u32,
        position: u32,
    ) -> Option<(ImageLabel, &Arc<MultipageTiffReader>)> {
        let label = ImageLabel::new(channel, slice, frame, position);
        self.readers.get(&label).map(|reader| (label, reader))
    }
}

impl TaggedImageStorage for MultipageTiffStorage {
    fn put_image(&mut self, image: TaggedImage) -> Result<(), StorageError> {
        if self.state != StorageState::New {
            return Err(StorageError::ReadOnly);
        }
        let acquisition = self.acquisition.as_ref().ok_or(StorageError::ReadOnly)?;
        image.validate(&acquisition.info)?;
        let label = image.label()?;

        let key = if self.options.split_by_position {
            label.position
        } else {
            0
        };
        if !self.file_sets.contains_key(&key) {
            fs::create_dir_all(&self.directory)
                .map_err(|e| IoError::from_io(&self.directory, e))?;
            let writer_options = WriterOptions {
                ome_tiff: self.options.ome_tiff,
                fast_storage_mode: self.options.fast_storage_mode,
                limits: self.options.limits,
                abort: self.options.abort.clone(),
            };
            let mut file_set = FileSet::new(
                &self.directory,
                self.file_set_base_name(&image, label.position),
                writer_options,
                self.options.split_by_position,
                self.options.separate_metadata_file,
            );
            file_set.set_display_and_comments(self.display_and_comments.clone());
            debug!(file_set = %file_set.base_name(), "Created file set");
            self.file_sets.insert(key, file_set);
        }

        let (Some(file_set), Some(acquisition)) =
            (self.file_sets.get_mut(&key), self.acquisition.as_mut())
        else {
            return Err(StorageError::ReadOnly);
        };
        let (label, reader) = file_set.write_image(image, acquisition)?;
        self.readers.insert(label, reader);
        self.last_acquired_frame = self.last_acquired_frame.max(Some(label.frame));
        Ok(())
    }

    fn get_image(&self, channel: u32, slice: u32, frame: u32, position: u32) -> Option<TaggedImage> {
        let (label, reader) = self.reader_for(channel, slice, frame, position)?;
        match reader.read_image(&label) {
            Ok(image) => Some(image),
            Err(e) => {
                error!(label = %label, file = %reader.file_name(), error = %e, "Failed to read image");
                None
            }
        }
    }

    fn get_image_tags(&self, channel: u32, slice: u32, frame: u32, position: u32) -> Option<JsonMap> {
        let (label, reader) = self.reader_for(channel, slice, frame, position)?;
        match reader.read_image_tags(&label) {
            Ok(tags) => Some(tags),
            Err(e) => {
                error!(label = %label, file = %reader.file_name(), error = %e, "Failed to read image tags");
                None
            }
        }
    }

    fn image_keys(&self) -> Vec<ImageLabel> {
        self.readers.labels().copied().collect()
    }

    fn finished(&mut self) -> Result<(), StorageError> {
        if self.state != StorageState::New {
            return Ok(());
        }
        self.state = StorageState::Finishing;
        let mut first_error: Option<StorageError> = None;

        if let Some(acquisition) = self.acquisition.as_mut() {
            for file_set in self.file_sets.values_mut() {
                match file_set.finish_aborted_acq_if_needed(acquisition) {
                    Ok(blanks) => {
                        for (label, reader) in blanks {
                            self.readers.insert(label, reader);
                        }
                    }
                    Err(e) => {
                        error!(file_set = %file_set.base_name(), error = %e, "Failed to fill aborted frame");
                        first_error.get_or_insert(e);
                    }
                }
            }
            for file_set in self.file_sets.values_mut() {
                if let Err(e) = file_set.finished(acquisition) {
                    error!(file_set = %file_set.base_name(), error = %e, "Failed to finish file set");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.state = StorageState::Finished;
        info!(
            directory = %self.directory.display(),
            images = self.readers.len(),
            "Dataset finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn is_finished(&self) -> bool {
        self.state == StorageState::Finished
    }

    fn summary_metadata(&self) -> &JsonMap {
        &self.summary
    }

    fn set_summary_metadata(&mut self, summary: JsonMap) -> Result<(), StorageError> {
        let info = SummaryInfo::from_summary(&summary)?;
        if self.state == StorageState::New && self.file_sets.is_empty() {
            self.acquisition = Some(AcquisitionState::new(summary.clone(), self.options.ome_tiff)?);
            self.display_and_comments = display_and_comments_from_summary(&summary);
        }
        if info.order != self.readers.order() {
            let readers = std::mem::take(&mut self.readers);
            self.readers = readers.reorder(info.order);
        }
        self.summary = summary;
        Ok(())
    }

    fn display_and_comments(&self) -> JsonMap {
        self.display_and_comments.clone()
    }

    fn set_display_and_comments(&mut self, settings: JsonMap) {
        if self.state == StorageState::New {
            for file_set in self.file_sets.values_mut() {
                file_set.set_display_and_comments(settings.clone());
            }
        }
        self.display_and_comments = settings;
    }

    fn write_display_settings(&mut self) -> Result<(), StorageError> {
        if self.state != StorageState::Finished {
            debug!("Display settings are written when the dataset is finished");
            return Ok(());
        }
        let channels = self
            .display_and_comments
            .get(keys::DISPLAY_CHANNELS)
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));
        let comments = self
            .display_and_comments
            .get(keys::DISPLAY_COMMENTS)
            .cloned()
            .unwrap_or_else(|| Value::Object(JsonMap::new()));

        for reader in self.unique_readers() {
            reader.rewrite_display_settings(&channels)?;
            reader.rewrite_comments(&comments)?;
        }
        Ok(())
    }

    fn last_acquired_frame(&self) -> Option<u32> {
        self.last_acquired_frame
    }

    fn data_set_size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.directory) else {
            return 0;
        };
        let mut total = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if meta.is_file() {
                total += meta.len();
            } else if meta.is_dir() {
                if let Ok(children) = fs::read_dir(entry.path()) {
                    total += children
                        .flatten()
                        .filter_map(|child| child.metadata().ok())
                        .filter(|m| m.is_file())
                        .map(|m| m.len())
                        .sum::<u64>();
                }
            }
        }
        total
    }

    fn disk_location(&self) -> Option<&Path> {
        Some(&self.directory)
    }

    fn close(&mut self) {
        if self.state == StorageState::New && !self.file_sets.is_empty() {
            warn!(
                directory = %self.directory.display(),
                "Closing a dataset that was never finished; finishing it first"
            );
            if let Err(e) = self.finished() {
                error!(error = %e, "Failed to finish dataset while closing");
            }
        }
        for reader in self.readers.values() {
            reader.close();
        }
    }
}
