use std::path::Path;

use thiserror::Error;

/// I/O errors raised while touching dataset files on disk
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error reported by the operating system
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// File or directory not found
    #[error("Not found: {0}")]
    NotFound(String),
}

impl IoError {
    /// Wrap an OS error together with the path it happened on.
    pub fn from_io(path: impl AsRef<Path>, err: std::io::Error) -> Self {
        let path = path.as_ref().display().to_string();
        if err.kind() == std::io::ErrorKind::NotFound {
            return IoError::NotFound(path);
        }
        IoError::Io {
            path,
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for IoError {
    fn from(err: std::io::Error) -> Self {
        IoError::Io {
            path: "<unknown>".to_string(),
            message: err.to_string(),
        }
    }
}

/// Errors that can occur when reading or writing TIFF structures
#[derive(Debug, Clone, Error)]
pub enum TiffError {
    /// I/O error while accessing the file
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42, got {0}")]
    InvalidVersion(u16),

    /// File is too small to contain a valid TIFF header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file or to invalid location)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Tag has unexpected type or count
    #[error("Invalid tag value for {tag}: {message}")]
    InvalidTagValue { tag: &'static str, message: String },

    /// Unknown field type in IFD entry
    #[error("Unknown field type: {0}")]
    UnknownFieldType(u16),

    /// A private block did not start with its marker
    #[error("Invalid {block} header: expected {expected}, found {found}")]
    InvalidBlockHeader {
        block: &'static str,
        expected: u32,
        found: u32,
    },

    /// Rewritten block does not fit its reserved space
    #[error("{block} needs {required} bytes but only {capacity} are reserved")]
    BlockOverflow {
        block: &'static str,
        capacity: u32,
        required: u64,
    },

    /// Embedded JSON could not be interpreted
    #[error("Embedded metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Label is not present in this file's index map
    #[error("Image {0} is not stored in this file")]
    LabelNotFound(String),

    /// Write attempted after the writer released its file handle
    #[error("File has already been closed for writing")]
    Closed,
}

/// Errors raised while interpreting summary or per-image metadata
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// Required key is absent
    #[error("Missing metadata key: {0}")]
    MissingKey(&'static str),

    /// Key exists but holds an unusable value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },

    /// Pixel type string not recognised
    #[error("Unknown pixel type: {0}")]
    UnknownPixelType(String),

    /// Label string is not `channel_slice_frame_position`
    #[error("Invalid image label: {0}")]
    InvalidLabel(String),

    /// JSON text could not be parsed
    #[error("Malformed JSON: {0}")]
    Json(String),
}

impl From<serde_json::Error> for MetadataError {
    fn from(err: serde_json::Error) -> Self {
        MetadataError::Json(err.to_string())
    }
}

/// Per-image validation errors; the image is skipped, the stream continues
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// Width or height differs from the summary metadata
    #[error("Image is {width}x{height}, acquisition declares {expected_width}x{expected_height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        expected_width: u32,
        expected_height: u32,
    },

    /// Pixel type differs from the summary metadata
    #[error("Image pixel type {actual} does not match acquisition pixel type {expected}")]
    PixelTypeMismatch { expected: String, actual: String },

    /// Buffer holds the wrong number of samples for the declared geometry
    #[error("Pixel buffer holds {actual} samples, expected {expected}")]
    PixelCountMismatch { expected: usize, actual: usize },

    /// An image with the same coordinates was already stored
    #[error("Image {0} was already written")]
    DuplicateLabel(String),

    /// Image and trailer blocks cannot fit even in an empty file
    #[error("Image {label} does not fit in a file of at most {max_file_size} bytes")]
    TooLarge { label: String, max_file_size: u64 },

    /// Required image tags are missing or malformed
    #[error("Image metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

/// Errors surfaced by the storage layer
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Write attempted on a finished or reopened dataset
    #[error("Dataset is read-only")]
    ReadOnly,

    /// Image rejected before any bytes were written
    #[error("Image rejected: {0}")]
    Image(#[from] ImageError),

    /// TIFF encoding or decoding failed
    #[error("TIFF error: {0}")]
    Tiff(#[from] TiffError),

    /// File system failure
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Summary metadata unusable
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// The background writer thread is gone
    #[error("Storage worker has shut down")]
    WorkerClosed,
}
