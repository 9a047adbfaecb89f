// SPDX-License-Identifier: GPL-3.0-only

//! Master-dark computation: the per-pixel median of a set of dark frames, plus the
//! hot-pixel list derived from it (spec §2 data flow, GLOSSARY "Master dark").
//!
//! Grounding note (see `DESIGN.md`): the original project's `removeHotPixels()` /
//! master-dark thread (`threads/masterdark.h`) were not retrieved into
//! `original_source/` — only its effects are described (`tools/raw2img.cpp`,
//! `tools/background-calibration.cpp` call `removeHotPixels(bitmap)` as an opaque
//! helper, and `tests/stacking/stacking.cpp` asserts a 274-entry hot-pixel list read
//! back from FITS). The median-stack and sigma-outlier hot-pixel rule below are an
//! original design filling that gap, built the way the surrounding modules are:
//! pixel-by-pixel, depth-agnostic via `Bitmap::get_raw`/`set_raw`.

use crate::bitmap::Bitmap;
use crate::error::{StackError, StackResult};
use crate::stars::Point;

/// A hot pixel is flagged when a dark frame's per-pixel median deviates from the
/// frame-wide median by more than this many standard deviations.
pub const HOT_PIXEL_SIGMA: f64 = 5.0;

/// The result of stacking a set of dark frames: the master dark bitmap itself, plus
/// the list of pixels flagged as defective (used by calibration to correct lights).
pub struct MasterDark {
    pub bitmap: Bitmap,
    pub hot_pixels: Vec<Point>,
}

/// Computes the per-pixel median of `frames` (which must all share dimensions, depth
/// and channel count) and derives its hot-pixel list.
///
/// `cancel` is polled once per output row, matching the stacking engine's
/// interruption granularity (spec §4.7 "interruption points").
pub fn compute_master_dark(
    frames: &[Bitmap],
    cancel: &std::sync::atomic::AtomicBool,
) -> StackResult<MasterDark> {
    use std::sync::atomic::Ordering;

    let Some(first) = frames.first() else {
        return Err(StackError::InsufficientData("no dark frames supplied".into()));
    };

    let width = first.width();
    let height = first.height();
    let depth = first.depth();
    let channels = first.channels();

    for frame in frames {
        if frame.width() != width || frame.height() != height || frame.channels() != channels {
            return Err(StackError::Format("dark frames have mismatched dimensions".into()));
        }
    }

    let mut median = Bitmap::with_size(depth, channels, width, height);
    let n = channels.count();
    let mut samples = vec![0.0_f64; frames.len()];

    for y in 0..height {
        if cancel.load(Ordering::Relaxed) {
            return Err(StackError::Cancelled);
        }
        for x in 0..width {
            for c in 0..n {
                for (i, frame) in frames.iter().enumerate() {
                    samples[i] = frame.get_raw(x, y, c);
                }
                median.set_raw(x, y, c, median_of(&mut samples));
            }
        }
    }

    let hot_pixels = find_hot_pixels(&median);

    Ok(MasterDark { bitmap: median, hot_pixels })
}

/// Flags pixels whose luminance deviates from the frame-wide mean by more than
/// [`HOT_PIXEL_SIGMA`] standard deviations.
fn find_hot_pixels(dark: &Bitmap) -> Vec<Point> {
    let width = dark.width();
    let height = dark.height();
    let n = dark.channels().count();

    let mut sum = 0.0;
    let mut sum_sq = 0.0;
    let mut count = 0.0;
    for y in 0..height {
        for x in 0..width {
            let mut value = 0.0;
            for c in 0..n {
                value += dark.get_raw(x, y, c);
            }
            value /= n as f64;
            sum += value;
            sum_sq += value * value;
            count += 1.0;
        }
    }

    if count == 0.0 {
        return Vec::new();
    }

    let mean = sum / count;
    let variance = (sum_sq / count - mean * mean).max(0.0);
    let sigma = variance.sqrt();
    if sigma <= 0.0 {
        return Vec::new();
    }

    let mut hot_pixels = Vec::new();
    for y in 0..height {
        for x in 0..width {
            let mut value = 0.0;
            for c in 0..n {
                value += dark.get_raw(x, y, c);
            }
            value /= n as f64;
            if (value - mean).abs() > HOT_PIXEL_SIGMA * sigma {
                hot_pixels.push(Point::new(x as f64, y as f64));
            }
        }
    }
    hot_pixels
}

/// In-place median of `samples` (reordered; callers must treat the slice as consumed).
fn median_of(samples: &mut [f64]) -> f64 {
    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = samples.len() / 2;
    if samples.len() % 2 == 0 {
        (samples[mid - 1] + samples[mid]) / 2.0
    } else {
        samples[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{Channels, Depth};

    fn flat(value: f64, width: u32, height: u32) -> Bitmap {
        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, width, height);
        for y in 0..height {
            for x in 0..width {
                bmp.set_raw(x, y, 0, value);
            }
        }
        bmp
    }

    #[test]
    fn master_dark_is_the_per_pixel_median() {
        let frames = vec![flat(10.0, 4, 4), flat(12.0, 4, 4), flat(100.0, 4, 4)];
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let result = compute_master_dark(&frames, &cancel).unwrap();
        assert_eq!(result.bitmap.get_raw(0, 0, 0), 12.0);
    }

    #[test]
    fn computing_twice_from_the_same_set_is_idempotent() {
        let frames = vec![flat(10.0, 3, 3), flat(20.0, 3, 3), flat(30.0, 3, 3)];
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let a = compute_master_dark(&frames, &cancel).unwrap();
        let b = compute_master_dark(&frames, &cancel).unwrap();
        for y in 0..3 {
            for x in 0..3 {
                assert_eq!(a.bitmap.get_raw(x, y, 0), b.bitmap.get_raw(x, y, 0));
            }
        }
    }

    #[test]
    fn a_single_spiking_pixel_across_all_frames_is_flagged_hot() {
        let mut a = flat(10.0, 4, 4);
        let mut b = flat(10.0, 4, 4);
        let mut c = flat(10.0, 4, 4);
        for frame in [&mut a, &mut b, &mut c] {
            frame.set_raw(2, 2, 0, 5000.0);
        }
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let result = compute_master_dark(&[a, b, c], &cancel).unwrap();
        assert!(result.hot_pixels.contains(&Point::new(2.0, 2.0)));
    }

    #[test]
    fn empty_frame_list_is_insufficient_data() {
        let cancel = std::sync::atomic::AtomicBool::new(false);
        let result = compute_master_dark(&[], &cancel);
        assert!(matches!(result, Err(StackError::InsufficientData(_))));
    }
}
