// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for bitmap range/space conversion

use astrophoto_stack::bitmap::{Bitmap, Channels, Depth, Range, RangePolicy, Space, SpacePolicy};

#[test]
fn srgb_to_linear_round_trips_through_set_space() {
    let mut src = Bitmap::with_size(Depth::F64, Channels::One, 2, 2);
    src.set_raw(0, 0, 0, 0.5);
    src.set_raw(1, 0, 0, 0.1);

    assert!(src.set_space(Space::SRgb, true));
    assert_eq!(src.space(), Space::SRgb);

    let encoded = src.get_raw(0, 0, 0);
    assert!(src.set_space(Space::Linear, true));
    let decoded_back = src.get_raw(0, 0, 0);

    assert!((decoded_back - 0.5).abs() < 1e-6, "got {decoded_back}, encoded was {encoded}");
}

#[test]
fn byte_depth_clamps_into_the_0_255_range() {
    let mut src = Bitmap::with_size(Depth::F64, Channels::One, 1, 1);
    src.set_raw(0, 0, 0, 1.0);

    let mut dst = Bitmap::with_size(Depth::U8, Channels::One, 1, 1);
    assert!(dst.set_from_bitmap(&src, RangePolicy::Explicit(Range::Byte), SpacePolicy::Dest));
    assert_eq!(dst.range(), Range::Byte);
    assert!((dst.get_raw(0, 0, 0) - 255.0).abs() < 1e-6);
}

#[test]
fn extracting_a_channel_from_an_rgb_bitmap_preserves_its_values() {
    let mut rgb = Bitmap::with_size(Depth::F64, Channels::Three, 2, 2);
    rgb.set_raw(1, 1, 1, 0.75);

    let green = rgb.channel(1);
    assert_eq!(green.channels(), Channels::One);
    assert!((green.get_raw(1, 1, 0) - 0.75).abs() < 1e-9);
}
