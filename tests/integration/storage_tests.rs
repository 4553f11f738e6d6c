//! End-to-end tests of the multipage storage engine.
//!
//! Tests verify:
//! - Images written and finished read back unchanged, before and after reopening
//! - Index maps list every image a file holds, blanks included
//! - Interrupted acquisitions get a complete last frame
//! - Finishing twice leaves the files untouched
//! - Label iteration follows the declared acquisition order
//! - A second image with stored coordinates is refused

use std::fs;

use serde_json::json;
use tempfile::TempDir;

use mmstack::{
    ImageError, ImageLabel, MultipageTiffStorage, PixelBuffer, PixelType, StorageError,
    StorageOptions, StorageState, TaggedImageStorage,
};

use super::test_utils::{
    acquisition_order, image, index_map_entry_count, is_big_endian_tiff, object, tags_preserved,
    tiff_file_names, tiff_files, SummaryBuilder, HEIGHT, WIDTH,
};

fn fast_options() -> StorageOptions {
    StorageOptions {
        fast_storage_mode: true,
        ..StorageOptions::default()
    }
}

// =============================================================================
// Round Trip
// =============================================================================

#[test]
fn test_round_trip_multi_position() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray16).dims(2, 2, 2, 2).build();
    let labels = acquisition_order(2, 2, 2, 2, true);

    let mut storage =
        MultipageTiffStorage::create(dir.path(), summary, StorageOptions::default()).unwrap();
    for &label in &labels {
        storage.put_image(image(PixelType::Gray16, label)).unwrap();
    }
    storage.finished().unwrap();
    assert_eq!(storage.state(), StorageState::Finished);
    assert_eq!(storage.file_set_count(), 2);

    // Reads served by the writing instance
    for &label in &labels {
        let original = image(PixelType::Gray16, label);
        let read = storage
            .get_image(label.channel, label.slice, label.frame, label.position)
            .unwrap();
        assert_eq!(read.pixels, original.pixels, "pixels of {}", label);
    }
    storage.close();

    assert_eq!(
        tiff_file_names(dir.path()),
        ["run_MMStack_Pos0.ome.tif", "run_MMStack_Pos1.ome.tif"]
    );

    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    assert_eq!(reopened.state(), StorageState::Finished);
    assert!(reopened.is_finished());
    assert_eq!(reopened.image_keys().len(), labels.len());
    assert_eq!(reopened.last_acquired_frame(), Some(1));

    for &label in &labels {
        let original = image(PixelType::Gray16, label);
        let read = reopened
            .get_image(label.channel, label.slice, label.frame, label.position)
            .unwrap();
        assert_eq!(read.pixels, original.pixels, "pixels of {}", label);
        assert!(tags_preserved(&original.tags, &read.tags), "tags of {}", label);
        assert_eq!(
            read.tags["FileName"],
            json!(format!("run_MMStack_Pos{}.ome.tif", label.position))
        );
    }
}

#[test]
fn test_round_trip_pixel_types() {
    for pixel_type in [
        PixelType::Gray8,
        PixelType::Gray16,
        PixelType::Gray32,
        PixelType::Rgb32,
        PixelType::Rgb64,
    ] {
        let dir = TempDir::new().unwrap();
        let summary = SummaryBuilder::new(pixel_type).dims(1, 2, 1, 1).build();
        let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
        for slice in 0..2 {
            let label = ImageLabel::new(0, slice, 0, 0);
            storage.put_image(image(pixel_type, label)).unwrap();
        }
        storage.finished().unwrap();
        storage.close();

        let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
        for slice in 0..2 {
            let label = ImageLabel::new(0, slice, 0, 0);
            let read = reopened.get_image(0, slice, 0, 0).unwrap();
            let original = image(pixel_type, label);
            if pixel_type.is_rgb() {
                // The unused fourth component is not stored
                assert_eq!(read.pixels.len(), original.pixels.len(), "{}", pixel_type);
                let zeroed_alpha = match (&original.pixels, &read.pixels) {
                    (PixelBuffer::Bytes(a), PixelBuffer::Bytes(b)) => a
                        .chunks(4)
                        .zip(b.chunks(4))
                        .all(|(a, b)| a[..3] == b[..3] && b[3] == 0),
                    (PixelBuffer::Shorts(a), PixelBuffer::Shorts(b)) => a
                        .chunks(4)
                        .zip(b.chunks(4))
                        .all(|(a, b)| a[..3] == b[..3] && b[3] == 0),
                    _ => false,
                };
                assert!(zeroed_alpha, "{}", pixel_type);
            } else {
                assert_eq!(read.pixels, original.pixels, "{}", pixel_type);
            }
        }
    }
}

#[test]
fn test_missing_image_is_none() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 1, 3, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    storage
        .put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0)))
        .unwrap();

    assert!(storage.get_image(0, 0, 0, 0).is_some());
    assert!(storage.get_image(0, 0, 2, 0).is_none());
    assert!(storage.get_image_tags(4, 0, 0, 0).is_none());
}

// =============================================================================
// Index Map
// =============================================================================

#[test]
fn test_index_map_counts_every_image() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(2, 3, 4, 2).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();

    // Position 0 stops halfway through frame 1
    for label in acquisition_order(2, 3, 2, 2, true)
        .into_iter()
        .filter(|l| !(l.frame == 1 && l.position == 0 && l.channel == 1))
    {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage.finished().unwrap();

    let keys = storage.image_keys();
    assert_eq!(keys.len(), 24);
    for position in 0..2 {
        let path = dir.path().join(format!("run_MMStack_Pos{}.ome.tif", position));
        let expected = keys.iter().filter(|l| l.position == position).count() as u32;
        assert_eq!(index_map_entry_count(&path), expected);
        assert_eq!(expected, 12);
    }
}

// =============================================================================
// Gap Filling
// =============================================================================

#[test]
fn test_aborted_acquisition_gets_complete_last_frame() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray16).dims(2, 3, 5, 1).build();
    let mut storage =
        MultipageTiffStorage::create(dir.path(), summary, StorageOptions::default()).unwrap();

    let written: Vec<ImageLabel> = acquisition_order(2, 3, 2, 1, true)
        .into_iter()
        .take(6 + 2)
        .collect();
    for &label in &written {
        storage.put_image(image(PixelType::Gray16, label)).unwrap();
    }
    storage.finished().unwrap();

    for channel in 0..2 {
        for slice in 0..3 {
            let read = storage.get_image(channel, slice, 1, 0);
            assert!(read.is_some(), "missing {}_{}_1_0", channel, slice);
        }
    }
    assert!(storage.get_image(0, 0, 2, 0).is_none());

    let blank = storage.get_image(1, 2, 1, 0).unwrap();
    assert_eq!(blank.pixels, PixelBuffer::zeroed(PixelType::Gray16, 16, 8));
    let real = storage.get_image(0, 1, 1, 0).unwrap();
    assert_eq!(real.pixels, image(PixelType::Gray16, ImageLabel::new(0, 1, 1, 0)).pixels);

    let path = &tiff_files(dir.path())[0];
    assert_eq!(index_map_entry_count(path), 12);

    storage.close();
    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    assert_eq!(reopened.image_keys().len(), 12);
    assert!(reopened.get_image(1, 2, 1, 0).is_some());
}

#[test]
fn test_out_of_order_acquisition_is_not_filled() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(2, 2, 5, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();

    // Channel-major order although the summary declares slices first
    for label in acquisition_order(2, 2, 1, 1, false) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage
        .put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 1, 0)))
        .unwrap();
    storage.finished().unwrap();

    assert_eq!(storage.image_keys().len(), 5);
    assert!(storage.get_image(1, 1, 1, 0).is_none());
}

// =============================================================================
// Finishing
// =============================================================================

#[test]
fn test_finished_twice_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(2, 1, 3, 1).build();
    let mut storage =
        MultipageTiffStorage::create(dir.path(), summary, StorageOptions::default()).unwrap();
    for label in acquisition_order(2, 1, 2, 1, true).into_iter().take(3) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage.finished().unwrap();

    let path = tiff_files(dir.path()).remove(0);
    let once = fs::read(&path).unwrap();
    assert!(is_big_endian_tiff(&once));

    storage.finished().unwrap();
    storage.close();
    let twice = fs::read(&path).unwrap();
    assert_eq!(once, twice);
    assert_eq!(index_map_entry_count(&path), 4);
}

#[test]
fn test_put_after_finish_is_read_only() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 1, 2, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    storage
        .put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0)))
        .unwrap();
    storage.finished().unwrap();

    let result = storage.put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 1, 0)));
    assert!(matches!(result, Err(StorageError::ReadOnly)));

    let mut reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    let result = reopened.put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 1, 0)));
    assert!(matches!(result, Err(StorageError::ReadOnly)));
}

#[test]
fn test_close_finishes_open_dataset() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 2, 1, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    for label in acquisition_order(1, 2, 1, 1, true) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage.close();
    assert!(storage.is_finished());

    let path = tiff_files(dir.path()).remove(0);
    assert_eq!(index_map_entry_count(&path), 2);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_mismatched_image_is_rejected_without_writing() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray16).dims(1, 1, 2, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();

    let wrong_type = image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0));
    assert!(matches!(storage.put_image(wrong_type), Err(StorageError::Image(_))));
    assert!(tiff_files(dir.path()).is_empty());

    storage
        .put_image(image(PixelType::Gray16, ImageLabel::new(0, 0, 0, 0)))
        .unwrap();
    let mut wrong_size = image(PixelType::Gray16, ImageLabel::new(0, 0, 1, 0));
    wrong_size.tags.insert("Width".into(), json!(17));
    assert!(matches!(storage.put_image(wrong_size), Err(StorageError::Image(_))));
    assert_eq!(storage.image_keys().len(), 1);
}

#[test]
fn test_duplicate_label_is_rejected() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 1, 2, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();

    let first = image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0));
    storage.put_image(first.clone()).unwrap();
    let mut again = image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0));
    again.pixels = PixelBuffer::Bytes(vec![0xABu8; (WIDTH * HEIGHT) as usize].into());
    assert!(matches!(
        storage.put_image(again),
        Err(StorageError::Image(ImageError::DuplicateLabel(label))) if label == "0_0_0_0"
    ));
    storage
        .put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 1, 0)))
        .unwrap();
    storage.finished().unwrap();

    let path = tiff_files(dir.path()).remove(0);
    assert_eq!(index_map_entry_count(&path), 2);
    let bytes = fs::read(&path).unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert_eq!(text.matches("FirstC=\"0\" FirstZ=\"0\" FirstT=\"0\"").count(), 1);
    assert_eq!(text.matches("<TiffData ").count(), 2);

    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    assert_eq!(reopened.get_image(0, 0, 0, 0).unwrap().pixels, first.pixels);
}

// =============================================================================
// Label Ordering
// =============================================================================

#[test]
fn test_label_order_follows_summary() {
    let labels = acquisition_order(2, 2, 2, 1, true);
    let mut orders = Vec::new();

    for (slices_first, time_first) in [(true, false), (false, true)] {
        let dir = TempDir::new().unwrap();
        let summary = SummaryBuilder::new(PixelType::Gray8)
            .dims(2, 2, 2, 1)
            .order(slices_first, time_first)
            .build();
        let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
        // Reverse insertion so ordering cannot come from arrival order
        for &label in labels.iter().rev() {
            storage.put_image(image(PixelType::Gray8, label)).unwrap();
        }
        let keys: Vec<String> = storage.image_keys().iter().map(|l| l.to_string()).collect();
        storage.finished().unwrap();
        orders.push(keys);
    }

    assert_eq!(
        orders[0],
        [
            "0_0_0_0", "0_1_0_0", "1_0_0_0", "1_1_0_0", "0_0_1_0", "0_1_1_0", "1_0_1_0",
            "1_1_1_0"
        ]
    );
    assert_eq!(
        orders[1],
        [
            "0_0_0_0", "1_0_0_0", "0_1_0_0", "1_1_0_0", "0_0_1_0", "1_0_1_0", "0_1_1_0",
            "1_1_1_0"
        ]
    );
    assert_ne!(orders[0], orders[1]);
}

// =============================================================================
// Scenario
// =============================================================================

#[test]
fn test_two_channels_three_slices_two_frames() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(2, 3, 2, 1).build();
    let mut storage =
        MultipageTiffStorage::create(dir.path(), summary, StorageOptions::default()).unwrap();

    let mut supplied = Vec::new();
    for frame in 0..2 {
        for channel in 0..2 {
            for slice in 0..3 {
                let img = image(PixelType::Gray8, ImageLabel::new(channel, slice, frame, 0));
                supplied.push(img.clone());
                storage.put_image(img).unwrap();
            }
        }
    }
    storage.finished().unwrap();

    assert_eq!(tiff_file_names(dir.path()), ["run_MMStack.ome.tif"]);
    assert_eq!(storage.file_count(), 1);
    assert_eq!(storage.image_keys().len(), 12);

    let read = storage.get_image(1, 2, 1, 0).unwrap();
    let expected = supplied
        .iter()
        .find(|img| img.label().unwrap() == ImageLabel::new(1, 2, 1, 0))
        .unwrap();
    assert_eq!(read.pixels, expected.pixels);

    let summary = storage.summary_metadata();
    assert_eq!(summary["Channels"], 2);
    assert_eq!(summary["Slices"], 3);
    assert_eq!(summary["Frames"], 2);
    storage.close();

    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    let summary = reopened.summary_metadata();
    assert_eq!(summary["Channels"], 2);
    assert_eq!(summary["Slices"], 3);
    assert_eq!(summary["Frames"], 2);
    assert!(summary.get("Comment").is_none());
    assert_eq!(reopened.last_acquired_frame(), Some(1));
}

// =============================================================================
// Layout Options
// =============================================================================

#[test]
fn test_unsplit_dataset_uses_one_file_set() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 1, 2, 3).build();
    let options = StorageOptions {
        split_by_position: false,
        ome_tiff: false,
        ..fast_options()
    };
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, options).unwrap();
    for label in acquisition_order(1, 1, 2, 3, true) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage.finished().unwrap();

    assert_eq!(storage.file_set_count(), 1);
    assert_eq!(tiff_file_names(dir.path()), ["run_MMStack.tif"]);
    assert!(storage.get_image(0, 0, 1, 2).is_some());
}

#[test]
fn test_sidecar_metadata_file() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 2, 1, 1).build();
    let options = StorageOptions {
        separate_metadata_file: true,
        ..fast_options()
    };
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, options).unwrap();
    for label in acquisition_order(1, 2, 1, 1, true) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage.finished().unwrap();

    let text = fs::read_to_string(dir.path().join("run_MMStack_metadata.txt")).unwrap();
    assert!(text.starts_with("{\r\n\"Summary\": {"));
    let parsed = object(serde_json::from_str(&text).unwrap());
    let keys: Vec<&str> = parsed.keys().map(String::as_str).collect();
    assert_eq!(keys, ["Summary", "FrameKey-0-0-0", "FrameKey-0-0-1"]);
    assert_eq!(parsed["FrameKey-0-0-1"]["SliceIndex"], 1);
    assert_eq!(parsed["FrameKey-0-0-1"]["FileName"], "run_MMStack.ome.tif");
}

#[test]
fn test_empty_prefix_names_files_mmstack() {
    let dir = TempDir::new().unwrap();
    let mut summary = SummaryBuilder::new(PixelType::Gray8).build();
    summary.insert("Prefix".into(), json!(""));
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    storage
        .put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, 0, 0)))
        .unwrap();
    storage.finished().unwrap();
    assert_eq!(tiff_file_names(dir.path()), ["MMStack.ome.tif"]);
}

// =============================================================================
// Metadata Updates
// =============================================================================

#[test]
fn test_display_settings_rewrite_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray16).dims(2, 1, 1, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    for label in acquisition_order(2, 1, 1, 1, true) {
        storage.put_image(image(PixelType::Gray16, label)).unwrap();
    }
    storage.finished().unwrap();

    let initial = storage.display_and_comments();
    assert_eq!(initial["Channels"][1]["Name"], "Ch1");
    assert_eq!(initial["Comments"]["Summary"], "synthetic test data");

    let updated = object(json!({
        "Channels": [
            {"Name": "DAPI", "Color": 255, "Min": 10, "Max": 900, "Gamma": 1.0},
            {"Name": "GFP", "Color": 65280, "Min": 0, "Max": 4000, "Gamma": 0.8},
        ],
        "Comments": {"Summary": "checked by hand", "0_0_0_0": "focus drift"},
    }));
    storage.set_display_and_comments(updated.clone());
    storage.write_display_settings().unwrap();
    storage.close();

    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    let read = reopened.display_and_comments();
    assert_eq!(read["Channels"], updated["Channels"]);
    assert_eq!(read["Comments"], updated["Comments"]);
}

#[test]
fn test_overwrite_pixels_in_place() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 2, 1, 1).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    for label in acquisition_order(1, 2, 1, 1, true) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }

    let replacement = PixelBuffer::Bytes(vec![7u8; 16 * 8].into());
    storage.overwrite_pixels(&replacement, 0, 0, 0).unwrap();
    storage.finished().unwrap();

    assert_eq!(storage.get_image(0, 0, 0, 0).unwrap().pixels, replacement);
    assert_eq!(
        storage.get_image(0, 1, 0, 0).unwrap().pixels,
        image(PixelType::Gray8, ImageLabel::new(0, 1, 0, 0)).pixels
    );
    assert!(matches!(
        storage.overwrite_pixels(&replacement, 0, 0, 0),
        Err(StorageError::ReadOnly)
    ));
}

#[test]
fn test_data_set_size_matches_files() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8).dims(1, 1, 2, 2).build();
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, fast_options()).unwrap();
    for label in acquisition_order(1, 1, 2, 2, true) {
        storage.put_image(image(PixelType::Gray8, label)).unwrap();
    }
    storage.finished().unwrap();

    let expected: u64 = tiff_files(dir.path())
        .iter()
        .map(|p| fs::metadata(p).unwrap().len())
        .sum();
    assert_eq!(storage.data_set_size(), expected);
    assert_eq!(storage.disk_location(), Some(dir.path()));
}

#[test]
fn test_open_empty_directory_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("notes.txt"), "not a stack").unwrap();
    assert!(MultipageTiffStorage::open(dir.path()).is_err());
}
