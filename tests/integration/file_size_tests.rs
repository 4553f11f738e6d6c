//! File size cap and roll-over.
//!
//! Tests verify:
//! - A writer refuses images once the limit is near
//! - The storage rolls over to a new file instead of crossing the limit
//! - Every rolled-over file is indexed and readable after reopening
//! - Long file names are accounted for in the OME-XML reservation
//! - An image too large for any file is refused without growing the dataset

use std::fs;

use tempfile::TempDir;

use mmstack::{
    FileLimits, ImageError, ImageLabel, MultipageTiffStorage, MultipageTiffWriter, PixelType,
    StorageError, StorageOptions, TaggedImageStorage, WriterOptions,
};

use super::test_utils::{
    image, index_map_entry_count, sized_image, tiff_file_names, tiff_files, SummaryBuilder,
};

const LIMIT: u64 = 64 * 1024;
const SIDE: u32 = 32;

#[test]
fn test_writer_reports_full_before_limit() {
    let dir = TempDir::new().unwrap();
    let summary = SummaryBuilder::new(PixelType::Gray8)
        .dims(1, 1, 1000, 1)
        .size(SIDE, SIDE)
        .build();
    let options = WriterOptions {
        limits: FileLimits::with_max_file_size(LIMIT),
        ..WriterOptions::default()
    };
    let mut writer = MultipageTiffWriter::open(dir.path(), "cap.tif", &summary, options).unwrap();

    let mut frame = 0;
    loop {
        let img = sized_image(PixelType::Gray8, ImageLabel::new(0, 0, frame, 0), SIDE, SIDE);
        if !writer.has_space_to_write(&img, 0) {
            break;
        }
        writer.write_image(img).unwrap();
        frame += 1;
        assert!(frame < 1000, "writer never reported a full file");
    }
    assert!(frame > 10);
    assert!(writer.file_position() < LIMIT);

    writer.finish().unwrap();
    writer.close(None).unwrap();
    let len = fs::metadata(dir.path().join("cap.tif")).unwrap().len();
    assert!(len <= LIMIT, "file is {} bytes", len);
    assert_eq!(index_map_entry_count(&dir.path().join("cap.tif")), frame);
}

#[test]
fn test_storage_rolls_over_below_limit() {
    let dir = TempDir::new().unwrap();
    let frames = 150;
    let summary = SummaryBuilder::new(PixelType::Gray8)
        .dims(1, 1, frames, 1)
        .size(SIDE, SIDE)
        .build();
    let options = StorageOptions {
        ome_tiff: false,
        limits: FileLimits::with_max_file_size(LIMIT),
        ..StorageOptions::default()
    };
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, options).unwrap();

    let mut first_roll_over = None;
    for frame in 0..frames {
        let img = sized_image(PixelType::Gray8, ImageLabel::new(0, 0, frame, 0), SIDE, SIDE);
        storage.put_image(img).unwrap();
        if first_roll_over.is_none() && tiff_files(dir.path()).len() > 1 {
            first_roll_over = Some(frame);
        }
        for path in tiff_files(dir.path()) {
            assert!(fs::metadata(&path).unwrap().len() <= LIMIT);
        }
    }
    storage.finished().unwrap();

    assert!(first_roll_over.is_some(), "no second file was created");
    let names = tiff_file_names(dir.path());
    assert!(names.len() >= 3, "files: {:?}", names);
    assert_eq!(names[0], "run_MMStack.tif");
    assert_eq!(names[1], "run_MMStack_1.tif");
    assert_eq!(names[2], "run_MMStack_2.tif");

    let mut indexed = 0;
    for path in tiff_files(dir.path()) {
        assert!(fs::metadata(&path).unwrap().len() <= LIMIT);
        indexed += index_map_entry_count(&path);
    }
    assert_eq!(indexed, frames);
    assert_eq!(storage.file_count(), names.len());

    storage.close();
    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    assert_eq!(reopened.image_keys().len(), frames as usize);
    for frame in [0, first_roll_over.unwrap_or(0), frames - 1] {
        let expected = sized_image(PixelType::Gray8, ImageLabel::new(0, 0, frame, 0), SIDE, SIDE);
        let read = reopened.get_image(0, 0, frame, 0).unwrap();
        assert_eq!(read.pixels, expected.pixels, "frame {}", frame);
    }
}

#[test]
fn test_roll_over_keeps_ome_consistent() {
    let dir = TempDir::new().unwrap();
    let frames = 40;
    let summary = SummaryBuilder::new(PixelType::Gray8)
        .dims(1, 1, frames, 1)
        .size(SIDE, SIDE)
        .build();
    let options = StorageOptions {
        limits: FileLimits::with_max_file_size(LIMIT),
        fast_storage_mode: true,
        ..StorageOptions::default()
    };
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, options).unwrap();
    for frame in 0..frames {
        let img = sized_image(PixelType::Gray8, ImageLabel::new(0, 0, frame, 0), SIDE, SIDE);
        storage.put_image(img).unwrap();
    }
    storage.finished().unwrap();

    let files = tiff_files(dir.path());
    assert!(files.len() > 1);
    let mut descriptions = Vec::new();
    for path in &files {
        assert!(fs::metadata(path).unwrap().len() <= LIMIT);
        let bytes = fs::read(path).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let start = text.find("<OME").unwrap();
        let end = text[start..].find("</OME>").unwrap() + start;
        descriptions.push(text[start..end].to_string());
    }
    assert!(descriptions.windows(2).all(|w| w[0] == w[1]));
    assert!(descriptions[0].contains("run_MMStack_1.ome.tif"));
    assert!(descriptions[0].contains("SizeT=\"40\""));
}

#[test]
fn test_long_prefix_stays_below_limit() {
    let dir = TempDir::new().unwrap();
    let prefix = "p".repeat(200);
    let frames = 100;
    let summary = SummaryBuilder::new(PixelType::Gray8)
        .prefix(&prefix)
        .dims(1, 1, frames, 1)
        .build();
    let options = StorageOptions {
        limits: FileLimits::with_max_file_size(LIMIT),
        fast_storage_mode: true,
        ..StorageOptions::default()
    };
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, options).unwrap();
    for frame in 0..frames {
        storage
            .put_image(image(PixelType::Gray8, ImageLabel::new(0, 0, frame, 0)))
            .unwrap();
    }
    storage.finished().unwrap();

    let files = tiff_files(dir.path());
    assert!(files.len() > 1, "expected a roll-over");
    for path in &files {
        let len = fs::metadata(path).unwrap().len();
        assert!(len <= LIMIT, "{} is {} bytes", path.display(), len);
    }
    let text = String::from_utf8_lossy(&fs::read(&files[1]).unwrap()).into_owned();
    assert!(text.contains(&format!("{}_MMStack_1.ome.tif", prefix)));

    storage.close();
    let reopened = MultipageTiffStorage::open(dir.path()).unwrap();
    assert_eq!(reopened.image_keys().len(), frames as usize);
}

#[test]
fn test_image_larger_than_limit_is_refused() {
    let dir = TempDir::new().unwrap();
    let limit = 4096;
    let summary = SummaryBuilder::new(PixelType::Gray8)
        .dims(1, 1, 3, 1)
        .size(64, 64)
        .build();
    let options = StorageOptions {
        limits: FileLimits::with_max_file_size(limit),
        fast_storage_mode: true,
        ..StorageOptions::default()
    };
    let mut storage = MultipageTiffStorage::create(dir.path(), summary, options).unwrap();

    for frame in 0..3 {
        let img = sized_image(PixelType::Gray8, ImageLabel::new(0, 0, frame, 0), 64, 64);
        assert!(matches!(
            storage.put_image(img),
            Err(StorageError::Image(ImageError::TooLarge { max_file_size: 4096, .. }))
        ));
    }
    assert!(storage.image_keys().is_empty());
    storage.finished().unwrap();

    // Only the first, empty file was ever opened
    let files = tiff_files(dir.path());
    assert_eq!(files.len(), 1);
    assert!(fs::metadata(&files[0]).unwrap().len() <= limit);
}
