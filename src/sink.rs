//! Background writer thread.
//!
//! Producers push images into a bounded queue; a single worker drains it
//! into a [`TaggedImageStorage`] and calls `finished()` once a poison item
//! arrives, the producer side hangs up, or the sink is stopped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{IoError, StorageError};
use crate::image::TaggedImage;
use crate::storage::TaggedImageStorage;

/// How long the worker blocks before re-checking the stop flag.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// One entry of the sink queue.
#[derive(Debug)]
pub enum QueueItem {
    Image(TaggedImage),
    /// End of stream
    Poison,
}

/// What the worker did before it exited.
#[derive(Debug, Clone)]
pub struct SinkReport {
    pub images_stored: usize,
    pub images_rejected: usize,
    pub elapsed: Duration,
    /// Error returned by `finished()`, if any
    pub finish_error: Option<StorageError>,
}

// =============================================================================
// ImageSink
// =============================================================================

/// Owns the worker thread feeding one storage backend.
pub struct ImageSink<S> {
    storage: Arc<Mutex<S>>,
    sender: Option<SyncSender<QueueItem>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<SinkReport>>,
}

impl<S> std::fmt::Debug for ImageSink<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageSink")
            .field("running", &self.worker.is_some())
            .field("stopped", &self.stop.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S: TaggedImageStorage + 'static> ImageSink<S> {
    /// Spawn the worker with a queue of `capacity` images.
    pub fn start(storage: S, capacity: usize) -> Result<Self, StorageError> {
        let storage = Arc::new(Mutex::new(storage));
        let stop = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));

        let worker_storage = Arc::clone(&storage);
        let worker_stop = Arc::clone(&stop);
        let worker = thread::Builder::new()
            .name("mmstack-sink".into())
            .spawn(move || run_worker(worker_storage, receiver, worker_stop))
            .map_err(IoError::from)?;

        Ok(Self {
            storage,
            sender: Some(sender),
            stop,
            worker: Some(worker),
        })
    }

    /// Shared handle to the storage, for reads while the sink runs.
    pub fn storage(&self) -> Arc<Mutex<S>> {
        Arc::clone(&self.storage)
    }

    /// Queue an image, blocking while the queue is full.
    pub fn push(&self, image: TaggedImage) -> Result<(), StorageError> {
        let sender = self.sender.as_ref().ok_or(StorageError::WorkerClosed)?;
        sender
            .send(QueueItem::Image(image))
            .map_err(|_| StorageError::WorkerClosed)
    }

    /// Ask the worker to stop after the image it is writing.
    ///
    /// Queued images are dropped; the dataset is still finished.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Send the poison item and wait for the worker to finish the dataset.
    pub fn finish(mut self) -> Result<SinkReport, StorageError> {
        self.shutdown().ok_or(StorageError::WorkerClosed)
    }

    fn shutdown(&mut self) -> Option<SinkReport> {
        if let Some(sender) = self.sender.take() {
            // The worker may already be gone after a stop
            let _ = sender.send(QueueItem::Poison);
        }
        let worker = self.worker.take()?;
        match worker.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!("Sink worker panicked");
                None
            }
        }
    }
}

impl<S> Drop for ImageSink<S> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(QueueItem::Poison);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker<S: TaggedImageStorage>(
    storage: Arc<Mutex<S>>,
    receiver: mpsc::Receiver<QueueItem>,
    stop: Arc<AtomicBool>,
) -> SinkReport {
    let started = Instant::now();
    let mut stored = 0;
    let mut rejected = 0;

    loop {
        if stop.load(Ordering::SeqCst) {
            info!("Sink stopped; finishing dataset");
            break;
        }
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(QueueItem::Image(image)) => match storage.lock().put_image(image) {
                Ok(()) => stored += 1,
                Err(StorageError::Image(e)) => {
                    rejected += 1;
                    warn!(error = %e, "Image rejected");
                }
                Err(e) => {
                    rejected += 1;
                    error!(error = %e, "Failed to store image");
                }
            },
            Ok(QueueItem::Poison) => {
                debug!("End of image stream");
                break;
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Image producer hung up");
                break;
            }
        }
    }

    let finish_error = storage.lock().finished().err();
    if let Some(e) = &finish_error {
        error!(error = %e, "Failed to finish dataset");
    }
    let elapsed = started.elapsed();
    info!(
        images = stored,
        rejected,
        elapsed_ms = elapsed.as_millis() as u64,
        "{} images stored in {} ms",
        stored,
        elapsed.as_millis()
    );

    SinkReport {
        images_stored: stored,
        images_rejected: rejected,
        elapsed,
        finish_error,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PixelBuffer;
    use crate::storage::RamStorage;
    use bytes::Bytes;
    use serde_json::json;

    fn storage() -> RamStorage {
        let summary = json!({"Width": 1, "Height": 1, "PixelType": "GRAY8", "Frames": 10});
        RamStorage::new(summary.as_object().unwrap().clone()).unwrap()
    }

    fn image(frame: u32, width: u32) -> TaggedImage {
        let tags = json!({
            "ChannelIndex": 0, "SliceIndex": 0, "FrameIndex": frame,
            "Width": width, "Height": 1, "PixelType": "GRAY8",
        });
        TaggedImage::new(
            PixelBuffer::Bytes(Bytes::from(vec![frame as u8; width as usize])),
            tags.as_object().unwrap().clone(),
        )
    }

    #[test]
    fn test_poison_finishes_storage() {
        let sink = ImageSink::start(storage(), 2).unwrap();
        for frame in 0..5 {
            sink.push(image(frame, 1)).unwrap();
        }
        let handle = sink.storage();
        let report = sink.finish().unwrap();

        assert_eq!(report.images_stored, 5);
        assert_eq!(report.images_rejected, 0);
        assert!(report.finish_error.is_none());
        let storage = handle.lock();
        assert!(storage.is_finished());
        assert_eq!(storage.last_acquired_frame(), Some(4));
    }

    #[test]
    fn test_bad_image_does_not_stop_stream() {
        let sink = ImageSink::start(storage(), 4).unwrap();
        sink.push(image(0, 1)).unwrap();
        sink.push(image(1, 2)).unwrap();
        sink.push(image(2, 1)).unwrap();
        let report = sink.finish().unwrap();
        assert_eq!(report.images_stored, 2);
        assert_eq!(report.images_rejected, 1);
    }

    #[test]
    fn test_stop_still_finishes() {
        let sink = ImageSink::start(storage(), 1).unwrap();
        sink.stop();
        let handle = sink.storage();
        let report = sink.finish().unwrap();
        assert_eq!(report.images_stored, 0);
        assert!(handle.lock().is_finished());
    }

    #[test]
    fn test_drop_joins_worker() {
        let sink = ImageSink::start(storage(), 1).unwrap();
        sink.push(image(0, 1)).unwrap();
        let handle = sink.storage();
        drop(sink);
        assert!(handle.lock().is_finished());
        assert_eq!(handle.lock().len(), 1);
    }
}
