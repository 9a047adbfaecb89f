// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the FITS-backed typed store

use astrophoto_stack::bitmap::{Bitmap, Channels, Depth};
use astrophoto_stack::fits::{HduRef, Store};
use astrophoto_stack::stars::{Point, Star};
use astrophoto_stack::transform::Transformation;

#[test]
fn a_bitmap_survives_a_write_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.fits");

    let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, 4, 3);
    for y in 0..3 {
        for x in 0..4 {
            bmp.set_raw(x, y, 0, (x + y * 4) as f64);
        }
    }

    let mut store = Store::create(&path).unwrap();
    store.write_bitmap(&bmp, Some("IMAGE")).unwrap();
    drop(store);

    let mut store = Store::open(&path, true).unwrap();
    let read_back = store.read_bitmap(HduRef::Index(1)).unwrap();

    assert_eq!(read_back.width(), 4);
    assert_eq!(read_back.height(), 3);
    for y in 0..3 {
        for x in 0..4 {
            assert_eq!(read_back.get_raw(x, y, 0), (x + y * 4) as f64);
        }
    }
}

#[test]
fn stars_survive_a_write_and_read_back_with_distinct_quality_and_radius() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stars.fits");

    let stars = vec![
        Star::new(Point::new(10.5, 20.25), 500.0, 0.9, 2.4),
        Star::new(Point::new(100.0, 50.0), 300.0, 0.6, 3.1),
    ];

    let mut store = Store::create(&path).unwrap();
    store.write_stars(&stars, (640, 480), Some(30.0), "STARS").unwrap();
    drop(store);

    let mut store = Store::open(&path, true).unwrap();
    let (read_back, image_size) = store.read_stars(HduRef::Name("STARS")).unwrap();

    assert_eq!(image_size, (640, 480));
    assert_eq!(read_back.len(), stars.len());
    for (original, read) in stars.iter().zip(read_back.iter()) {
        assert!((read.quality - original.quality).abs() < 1e-9);
        assert!((read.mean_radius - original.mean_radius).abs() < 1e-9);
        // Quality and mean radius must not collapse onto each other.
        assert!((read.quality - read.mean_radius).abs() > 1e-6);
    }
}

#[test]
fn a_transformation_survives_a_write_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("transform.fits");

    let t = Transformation { a0: 1.0, a1: 0.01, a2: -0.02, a3: 0.5, b0: 2.0, b1: 0.02, b2: 0.01, b3: -0.3, x_width: 640.0, y_width: 480.0 };

    let mut store = Store::create(&path).unwrap();
    store.write_transformation(&t, "TRANSFORM").unwrap();
    drop(store);

    let mut store = Store::open(&path, true).unwrap();
    let read_back = store.read_transformation(HduRef::Name("TRANSFORM")).unwrap();

    let p = Point::new(100.0, 100.0);
    let expected = t.transform(p);
    let actual = read_back.transform(p);
    assert!((expected.x - actual.x).abs() < 1e-9);
    assert!((expected.y - actual.y).abs() < 1e-9);
}

#[test]
fn is_fits_rejects_a_plain_text_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("not_a_fits_file.txt");
    std::fs::write(&path, b"hello world").unwrap();
    assert!(!Store::is_fits(&path));
}
