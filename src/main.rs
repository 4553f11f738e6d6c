//! mmstack - multi-page TIFF acquisition storage.
//!
//! This binary writes synthetic acquisitions and inspects existing datasets.

use std::process::ExitCode;
use std::sync::Arc;

use bytes::Bytes;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mmstack::{
    config::{AcquireConfig, Cli, Command, InspectConfig, InspectOutputFormat},
    AbortFlag, ImageLabel, ImageSink, JsonMap, MultipageTiffStorage, PixelBuffer, PixelType,
    TaggedImage, TaggedImageStorage,
};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Acquire(config) => run_acquire(config),
        Command::Inspect(config) => run_inspect(config),
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose { "mmstack=debug" } else { "mmstack=info" };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Acquire Command
// =============================================================================

fn run_acquire(config: AcquireConfig) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Configuration:");
    info!("  Directory: {}", config.dir.display());
    info!(
        "  Dimensions: {} channels, {} slices, {} frames, {} positions",
        config.channels, config.slices, config.frames, config.positions
    );
    info!(
        "  Images: {}x{} {}",
        config.width, config.height, config.pixel_type
    );
    info!(
        "  Storage: ome={}, split={}, sidecar={}, fast={}, max file size={} bytes",
        config.ome, config.split, config.sidecar, config.fast, config.max_file_size
    );

    let abort = AbortFlag::new();
    let mut options = config.storage_options();
    options.abort = Some(Arc::new(abort.clone()));

    let storage = match MultipageTiffStorage::create(&config.dir, config.summary(), options) {
        Ok(storage) => storage,
        Err(e) => {
            error!("Failed to create dataset: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let sink = match ImageSink::start(storage, config.queue_capacity) {
        Ok(sink) => sink,
        Err(e) => {
            error!("Failed to start writer thread: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let limit = config.abort_after.unwrap_or(u64::MAX);
    let mut produced = 0u64;
    for label in acquisition_labels(&config) {
        if produced >= limit {
            warn!(images = produced, "Acquisition aborted after {} images", produced);
            break;
        }
        if abort.is_requested() {
            warn!(images = produced, "Storage requested abort");
            break;
        }
        if let Err(e) = sink.push(synthetic_image(&config, label)) {
            error!("Writer thread stopped early: {}", e);
            break;
        }
        produced += 1;
    }

    let handle = sink.storage();
    let report = match sink.finish() {
        Ok(report) => report,
        Err(e) => {
            error!("Failed to finish acquisition: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let storage = handle.lock();
    info!("");
    info!("Acquisition complete:");
    info!("  Images stored: {}", report.images_stored);
    info!("  Images rejected: {}", report.images_rejected);
    info!("  Files: {}", storage.file_count());
    info!("  Dataset size: {} bytes", storage.data_set_size());
    info!("  Elapsed: {} ms", report.elapsed.as_millis());

    if let Some(e) = report.finish_error {
        error!("Dataset was not finalised cleanly: {}", e);
        return ExitCode::FAILURE;
    }
    if report.images_rejected > 0 {
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Labels of the full acquisition in the order a real one would produce them.
fn acquisition_labels(config: &AcquireConfig) -> Vec<ImageLabel> {
    let (outer_count, inner_count) = if config.slices_first {
        (config.channels, config.slices)
    } else {
        (config.slices, config.channels)
    };

    let mut labels = Vec::with_capacity(config.total_images() as usize);
    for frame in 0..config.frames {
        for position in 0..config.positions {
            for outer in 0..outer_count {
                for inner in 0..inner_count {
                    let (channel, slice) = if config.slices_first {
                        (outer, inner)
                    } else {
                        (inner, outer)
                    };
                    labels.push(ImageLabel::new(channel, slice, frame, position));
                }
            }
        }
    }
    labels
}

/// Diagonal ramp offset by the image coordinates, so every plane differs.
fn synthetic_image(config: &AcquireConfig, label: ImageLabel) -> TaggedImage {
    let len = config.pixel_type.source_len(config.width, config.height);
    let seed = label.channel + label.slice * 7 + label.frame * 13 + label.position * 31;
    let sample = |i: usize| seed as usize + i % config.width as usize + i / config.width as usize;

    let pixels = match config.pixel_type {
        PixelType::Gray8 | PixelType::Rgb32 => {
            PixelBuffer::Bytes(Bytes::from((0..len).map(|i| sample(i) as u8).collect::<Vec<_>>()))
        }
        PixelType::Gray16 | PixelType::Rgb64 => {
            PixelBuffer::Shorts((0..len).map(|i| sample(i) as u16).collect())
        }
        PixelType::Gray32 => PixelBuffer::Floats((0..len).map(|i| sample(i) as f32).collect()),
    };

    let tags = json!({
        "ChannelIndex": label.channel,
        "SliceIndex": label.slice,
        "FrameIndex": label.frame,
        "PositionIndex": label.position,
        "PositionName": format!("Pos{}", label.position),
        "Width": config.width,
        "Height": config.height,
        "PixelType": config.pixel_type.as_str(),
        "PixelSizeUm": 1.0,
        "Exposure-ms": 10.0,
    });
    let tags = match tags {
        serde_json::Value::Object(map) => map,
        _ => JsonMap::new(),
    };
    TaggedImage::new(pixels, tags)
}

// =============================================================================
// Inspect Command
// =============================================================================

/// Everything `inspect` reports about a dataset.
#[derive(Debug, Serialize)]
struct InspectReport {
    directory: String,
    files: usize,
    images: usize,
    last_frame: Option<u32>,
    size_bytes: u64,
    summary: JsonMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<Vec<String>>,
}

impl InspectReport {
    fn collect(config: &InspectConfig, storage: &MultipageTiffStorage) -> Self {
        let keys = storage.image_keys();
        Self {
            directory: config.dir.display().to_string(),
            files: storage.file_count(),
            images: keys.len(),
            last_frame: storage.last_acquired_frame(),
            size_bytes: storage.data_set_size(),
            summary: storage.summary_metadata().clone(),
            labels: config
                .labels
                .then(|| keys.iter().map(ToString::to_string).collect()),
        }
    }
}

fn run_inspect(config: InspectConfig) -> ExitCode {
    if config.verbose {
        init_logging(true);
    }

    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        return ExitCode::FAILURE;
    }

    let storage = match MultipageTiffStorage::open(&config.dir) {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let report = InspectReport::collect(&config, &storage);

    match config.format {
        InspectOutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        InspectOutputFormat::Text => print_report(&report),
    }

    ExitCode::SUCCESS
}

fn print_report(report: &InspectReport) {
    println!("Dataset: {}", report.directory);
    println!("═════════════════════════════════");
    match serde_json::to_string_pretty(&report.summary) {
        Ok(text) => println!("{}", text),
        Err(e) => println!("(summary not printable: {})", e),
    }
    println!();

    println!("Files: {}", report.files);
    println!("Images: {}", report.images);
    match report.last_frame {
        Some(frame) => println!("Last frame: {}", frame),
        None => println!("Last frame: (none)"),
    }
    println!("Size: {} bytes", report.size_bytes);

    if let Some(labels) = &report.labels {
        println!();
        for label in labels {
            println!("  {}", label);
        }
    }
}
