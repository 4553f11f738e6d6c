//! Configuration for the `mmstack` binary.
//!
//! This module provides the command-line surface:
//! - Command-line arguments via clap
//! - Environment variables with `MMSTACK_` prefix
//! - Sensible defaults for all optional settings
//!
//! # Subcommands
//!
//! - `acquire`: run a synthetic acquisition into a new dataset directory
//! - `inspect`: open an existing dataset and print what it contains
//!
//! # Environment Variables
//!
//! - `MMSTACK_DIR` - Dataset directory
//! - `MMSTACK_PREFIX` - Acquisition prefix used in file names (default: synthetic)
//! - `MMSTACK_CHANNELS`, `MMSTACK_SLICES`, `MMSTACK_FRAMES`, `MMSTACK_POSITIONS` - Dimensions
//! - `MMSTACK_WIDTH`, `MMSTACK_HEIGHT` - Image size in pixels (default: 512x512)
//! - `MMSTACK_PIXEL_TYPE` - GRAY8, GRAY16, GRAY32, RGB32 or RGB64 (default: GRAY16)
//! - `MMSTACK_OME` - Embed OME-XML (default: true)
//! - `MMSTACK_SPLIT` - One file set per position (default: true)
//! - `MMSTACK_SIDECAR` - Write `<base>_metadata.txt` (default: false)
//! - `MMSTACK_FAST` - Skip pre-allocation and syncing (default: false)
//! - `MMSTACK_MAX_FILE_SIZE` - Per-file size cap in bytes (default: 4 GiB)
//! - `MMSTACK_QUEUE_CAPACITY` - Images buffered between producer and writer (default: 64)

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

use crate::format::mptiff::{FileLimits, MAX_FILE_SIZE};
use crate::image::PixelType;
use crate::metadata::JsonMap;
use crate::sink::DEFAULT_QUEUE_CAPACITY;
use crate::storage::StorageOptions;

// =============================================================================
// Default Values
// =============================================================================

/// Default acquisition prefix.
pub const DEFAULT_PREFIX: &str = "synthetic";

/// Default image width and height.
pub const DEFAULT_IMAGE_SIZE: u32 = 512;

/// Smallest per-file cap accepted from the command line.
pub const MIN_FILE_SIZE: u64 = 64 * 1024;

// =============================================================================
// CLI Arguments
// =============================================================================

/// mmstack - multi-page TIFF acquisition storage.
#[derive(Parser, Debug, Clone)]
#[command(name = "mmstack")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn into_command(self) -> Command {
        self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Write a synthetic acquisition to a new dataset.
    Acquire(AcquireConfig),

    /// Open a dataset and print its summary.
    Inspect(InspectConfig),
}

// =============================================================================
// Acquire
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct AcquireConfig {
    // =========================================================================
    // Dataset
    // =========================================================================
    /// Directory the dataset is written to.
    #[arg(long, env = "MMSTACK_DIR")]
    pub dir: PathBuf,

    /// Prefix used in file names.
    #[arg(long, default_value = DEFAULT_PREFIX, env = "MMSTACK_PREFIX")]
    pub prefix: String,

    // =========================================================================
    // Dimensions
    // =========================================================================
    #[arg(long, default_value_t = 1, env = "MMSTACK_CHANNELS")]
    pub channels: u32,

    #[arg(long, default_value_t = 1, env = "MMSTACK_SLICES")]
    pub slices: u32,

    #[arg(long, default_value_t = 1, env = "MMSTACK_FRAMES")]
    pub frames: u32,

    #[arg(long, default_value_t = 1, env = "MMSTACK_POSITIONS")]
    pub positions: u32,

    #[arg(long, default_value_t = DEFAULT_IMAGE_SIZE, env = "MMSTACK_WIDTH")]
    pub width: u32,

    #[arg(long, default_value_t = DEFAULT_IMAGE_SIZE, env = "MMSTACK_HEIGHT")]
    pub height: u32,

    /// GRAY8, GRAY16, GRAY32, RGB32 or RGB64.
    #[arg(long, default_value = "GRAY16", env = "MMSTACK_PIXEL_TYPE")]
    pub pixel_type: PixelType,

    /// Acquire all slices of a channel before moving to the next channel.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "MMSTACK_SLICES_FIRST")]
    pub slices_first: bool,

    // =========================================================================
    // Storage
    // =========================================================================
    /// Embed OME-XML and use the `.ome.tif` extension.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "MMSTACK_OME")]
    pub ome: bool,

    /// Write one file set per stage position.
    #[arg(long, default_value_t = true, action = ArgAction::Set, env = "MMSTACK_SPLIT")]
    pub split: bool,

    /// Also write a `<base>_metadata.txt` file per file set.
    #[arg(long, default_value_t = false, env = "MMSTACK_SIDECAR")]
    pub sidecar: bool,

    /// Skip pre-allocation and syncing.
    #[arg(long, default_value_t = false, env = "MMSTACK_FAST")]
    pub fast: bool,

    /// Size cap of each file in bytes.
    #[arg(long, default_value_t = MAX_FILE_SIZE, env = "MMSTACK_MAX_FILE_SIZE")]
    pub max_file_size: u64,

    // =========================================================================
    // Pipeline
    // =========================================================================
    /// Stop the acquisition after this many images.
    #[arg(long, env = "MMSTACK_ABORT_AFTER")]
    pub abort_after: Option<u64>,

    /// Images buffered between the producer and the writer thread.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY, env = "MMSTACK_QUEUE_CAPACITY")]
    pub queue_capacity: usize,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl AcquireConfig {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.dir.as_os_str().is_empty() {
            return Err("Dataset directory is required. Set --dir or MMSTACK_DIR".to_string());
        }

        for (name, value) in [
            ("channels", self.channels),
            ("slices", self.slices),
            ("frames", self.frames),
            ("positions", self.positions),
            ("width", self.width),
            ("height", self.height),
        ] {
            if value == 0 {
                return Err(format!("{} must be greater than 0", name));
            }
        }

        if self.max_file_size < MIN_FILE_SIZE || self.max_file_size > MAX_FILE_SIZE {
            return Err(format!(
                "max_file_size must be between {} and {} bytes",
                MIN_FILE_SIZE, MAX_FILE_SIZE
            ));
        }

        let image_bytes = self.pixel_type.stored_bytes(self.width, self.height);
        if image_bytes >= self.max_file_size / 2 {
            return Err(format!(
                "A {}x{} {} image ({} bytes) does not fit in a {} byte file",
                self.width,
                self.height,
                self.pixel_type,
                image_bytes,
                self.max_file_size
            ));
        }

        if self.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Number of images the full acquisition produces.
    pub fn total_images(&self) -> u64 {
        self.channels as u64 * self.slices as u64 * self.frames as u64 * self.positions as u64
    }

    /// Summary metadata describing the synthetic acquisition.
    pub fn summary(&self) -> JsonMap {
        let names: Vec<String> = (0..self.channels).map(|c| format!("Channel {}", c)).collect();
        let position_names: Vec<String> = (0..self.positions).map(|p| format!("Pos{}", p)).collect();
        let summary = json!({
            "Prefix": self.prefix,
            "Width": self.width,
            "Height": self.height,
            "PixelType": self.pixel_type.as_str(),
            "Channels": self.channels,
            "Slices": self.slices,
            "Frames": self.frames,
            "Positions": self.positions,
            "SlicesFirst": self.slices_first,
            "TimeFirst": false,
            "ChNames": names,
            "PositionNames": position_names,
            "PixelSizeUm": 1.0,
            "Comment": "",
        });
        match summary {
            serde_json::Value::Object(map) => map,
            _ => JsonMap::new(),
        }
    }

    /// Storage options derived from the flags.
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            separate_metadata_file: self.sidecar,
            split_by_position: self.split,
            fast_storage_mode: self.fast,
            ome_tiff: self.ome,
            limits: FileLimits::with_max_file_size(self.max_file_size),
            abort: None,
        }
    }
}

// =============================================================================
// Inspect
// =============================================================================

#[derive(Args, Debug, Clone)]
pub struct InspectConfig {
    /// Dataset directory to open.
    #[arg(env = "MMSTACK_DIR")]
    pub dir: PathBuf,

    /// List every image label.
    #[arg(long, default_value_t = false)]
    pub labels: bool,

    /// Output format.
    #[arg(long, value_enum, default_value_t = InspectOutputFormat::Text)]
    pub format: InspectOutputFormat,

    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

/// How `inspect` prints its report.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InspectOutputFormat {
    /// Human-readable summary
    Text,
    /// One JSON document
    Json,
}

impl InspectConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.dir.is_dir() {
            return Err(format!("{} is not a directory", self.dir.display()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AcquireConfig {
        AcquireConfig {
            dir: PathBuf::from("/tmp/mmstack-test"),
            prefix: "run".to_string(),
            channels: 2,
            slices: 3,
            frames: 2,
            positions: 1,
            width: 64,
            height: 32,
            pixel_type: PixelType::Gray16,
            slices_first: true,
            ome: true,
            split: true,
            sidecar: false,
            fast: false,
            max_file_size: MAX_FILE_SIZE,
            abort_after: None,
            queue_capacity: 8,
            verbose: false,
        }
    }

    #[test]
    fn test_valid_config() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_zero_dimension() {
        let mut config = test_config();
        config.slices = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("slices"));
    }

    #[test]
    fn test_max_file_size_bounds() {
        let mut config = test_config();
        config.max_file_size = 1024;
        assert!(config.validate().is_err());
        config.max_file_size = MAX_FILE_SIZE + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_image_must_fit_in_file() {
        let mut config = test_config();
        config.max_file_size = MIN_FILE_SIZE;
        config.width = 256;
        config.height = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_queue_capacity() {
        let mut config = test_config();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary() {
        let config = test_config();
        let summary = config.summary();
        assert_eq!(summary["Prefix"], "run");
        assert_eq!(summary["PixelType"], "GRAY16");
        assert_eq!(summary["Slices"], 3);
        assert_eq!(summary["ChNames"][1], "Channel 1");
        assert_eq!(config.total_images(), 12);
    }

    #[test]
    fn test_storage_options() {
        let mut config = test_config();
        config.max_file_size = 1024 * 1024;
        config.sidecar = true;
        let options = config.storage_options();
        assert!(options.separate_metadata_file);
        assert_eq!(options.limits.max_file_size, 1024 * 1024);
    }

    #[test]
    fn test_parse_acquire() {
        let cli = Cli::try_parse_from([
            "mmstack",
            "acquire",
            "--dir",
            "/tmp/data",
            "--channels",
            "3",
            "--pixel-type",
            "GRAY8",
        ])
        .unwrap();
        match cli.into_command() {
            Command::Acquire(config) => {
                assert_eq!(config.channels, 3);
                assert_eq!(config.pixel_type, PixelType::Gray8);
                assert_eq!(config.width, DEFAULT_IMAGE_SIZE);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_inspect() {
        let cli = Cli::try_parse_from(["mmstack", "inspect", "/tmp/data", "--format", "json"]).unwrap();
        match cli.into_command() {
            Command::Inspect(config) => {
                assert_eq!(config.dir, PathBuf::from("/tmp/data"));
                assert_eq!(config.format, InspectOutputFormat::Json);
                assert!(!config.labels);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_pixel_type() {
        let result = Cli::try_parse_from([
            "mmstack",
            "acquire",
            "--dir",
            "/tmp/data",
            "--pixel-type",
            "GRAY12",
        ]);
        assert!(result.is_err());
    }
}
