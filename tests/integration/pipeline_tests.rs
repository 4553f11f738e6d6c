//! Producer to storage hand-off and backend substitution.
//!
//! Tests verify:
//! - Images pushed through the sink land on disk and the dataset is finished
//! - An early end of stream still yields a complete last frame
//! - Both backends behave the same behind the storage trait

use std::thread;

use tempfile::TempDir;

use mmstack::{
    ImageLabel, ImageSink, MultipageTiffStorage, PixelType, RamStorage, StorageBackend,
    StorageError, StorageOptions, TaggedImageStorage,
};

use super::test_utils::{acquisition_order, image, tiff_file_names, SummaryBuilder};

// =============================================================================
// Sink
// =============================================================================

#[test]
fn test_sink_writes_full_acquisition() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray16).dims(2, 2, 3, 1).build();
    let storage =
        MultipageTiffStorage::create(dir.path(), summary, StorageOptions::default()).unwrap();

    let sink = ImageSink::start(storage, 2).unwrap();
    let labels = acquisition_order(2, 2, 3, 1, true);
    for &label in &labels {
        sink.push(image(PixelType::Gray16, label)).unwrap();
    }
    let handle = sink.storage();
    let report = sink.finish().unwrap();

    assert_eq!(report.images_stored, labels.len());
    assert_eq!(report.images_rejected, 0);
    assert!(report.finish_error.is_none());

    let storage = handle.lock();
    assert!(storage.is_finished());
    assert_eq!(storage.image_keys().len(), labels.len());
    assert_eq!(tiff_file_names(dir.path()), ["run_MMStack.ome.tif"]);
    drop(storage);

    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    assert_eq!(reopened.last_acquired_frame(), Some(2));
    assert_eq!(
        reopened.get_image(1, 1, 2, 0).unwrap().pixels,
        image(PixelType::Gray16, ImageLabel::new(1, 1, 2, 0)).pixels
    );
}

#[test]
fn test_sink_from_producer_thread() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 3, 10, 1).build();
    let storage = MultipageTiffStorage::create(
        dir.path(),
        summary,
        StorageOptions {
            fast_storage_mode: true,
            ..StorageOptions::default()
        },
    )
    .unwrap();
    let sink = ImageSink::start(storage, 1).unwrap();
    let handle = sink.storage();

    // Abort after four images: frame 1 is left with one slice
    let producer = thread::spawn(move || {
        for label in acquisition_order(1, 3, 10, 1, true).into_iter().take(4) {
            sink.push(image(PixelType::Gray8, label)).unwrap();
        }
        sink.finish().unwrap()
    });
    let report = producer.join().unwrap();
    assert_eq!(report.images_stored, 4);

    let storage = handle.lock();
    assert!(storage.is_finished());
    for slice in 0..3 {
        assert!(storage.get_image(0, slice, 1, 0).is_some(), "slice {}", slice);
    }
    assert_eq!(storage.image_keys().len(), 6);
}

#[test]
fn test_sink_counts_rejected_images() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray16).dims(1, 1, 2, 1).build();
    let storage =
        MultipageTiffStorage::create(dir.path(), summary, StorageOptions::default()).unwrap();
    let sink = ImageSink::start(storage, 4).unwrap();

    sink.push(image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0)))
        .unwrap();
    sink.push(image(PixelType::Gray16, ImageLabel::new(0, 0, 1, 0)))
        .unwrap();
    let report = sink.finish().unwrap();
    assert_eq!(report.images_stored, 1);
    assert_eq!(report.images_rejected, 1);
}

// =============================================================================
// Backends
// =============================================================================

fn exercise(backend: &mut StorageBackend) -> Result<(), StorageError> {
    for label in acquisition_order(2, 1, 2, 1, true) {
        backend.put_image(image(PixelType::Gray8, label))?;
    }
    backend.finished()?;
    backend.finished()?;
    Ok(())
}

#[test]
fn test_backends_are_interchangeable() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(2, 1, 2, 1).build();

    let mut backends = vec![
        StorageBackend::MultipageTiff(
            MultipageTiffStorage::create(dir.path(), summary.clone(), StorageOptions::default())
                .unwrap(),
        ),
        StorageBackend::Ram(RamStorage::new(summary).unwrap()),
    ];

    for backend in &mut backends {
        exercise(backend).unwrap();
        assert!(backend.is_finished());
        assert_eq!(backend.image_keys().len(), 4);
        assert_eq!(backend.last_acquired_frame(), Some(1));
        assert_eq!(backend.summary_metadata()["Channels"], 2);

        let read = backend.get_image(1, 0, 1, 0).unwrap();
        assert_eq!(
            read.pixels,
            image(PixelType::Gray8, ImageLabel::new(1, 0, 1, 0)).pixels
        );
        assert!(backend.get_image(0, 0, 5, 0).is_none());
        assert!(matches!(
            backend.put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0))),
            Err(StorageError::ReadOnly)
        ));
        backend.close();
    }

    assert_eq!(backends[0].disk_location(), Some(dir.path()));
    assert_eq!(backends[1].disk_location(), None);
    assert!(backends[0].data_set_size() > backends[1].data_set_size());
}
