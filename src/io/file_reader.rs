//! Positional reads from a local dataset file.
//!
//! A [`FileRangeReader`] keeps its own read-only handle, separate from the
//! writer's handle, so images can be served while the file is still growing.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::IoError;

use super::RangeReader;

/// Range reader over a file on the local file system.
#[derive(Debug)]
pub struct FileRangeReader {
    path: PathBuf,
    identifier: String,
    file: Mutex<File>,
}

impl FileRangeReader {
    /// Open `path` read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| IoError::from_io(&path, e))?;
        Ok(Self {
            identifier: path.display().to_string(),
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RangeReader for FileRangeReader {
    fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        let size = self.size();
        if offset.saturating_add(len as u64) > size {
            return Err(IoError::RangeOutOfBounds {
                offset,
                requested: len as u64,
                size,
            });
        }

        let mut buf = vec![0u8; len];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| IoError::from_io(&self.path, e))?;
        file.read_exact(&mut buf)
            .map_err(|e| IoError::from_io(&self.path, e))?;
        Ok(Bytes::from(buf))
    }

    fn size(&self) -> u64 {
        // The file can still be growing, so ask the OS every time.
        self.file
            .lock()
            .metadata()
            .map(|m| m.len())
            .unwrap_or(0)
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
