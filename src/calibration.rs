// SPDX-License-Identifier: GPL-3.0-only

//! Light-frame calibration: subtracting the master dark and its hot-pixel list so a
//! raw light frame shares the reference's photometric baseline before registration
//! (spec §2 data flow, GLOSSARY "Calibration").

use crate::background::BackgroundCalibrationParameters;
use crate::bitmap::Bitmap;
use crate::error::{StackError, StackResult};
use crate::stars::Point;

/// Subtracts `master_dark` from `light` channel-by-channel (clamped at zero) and
/// replaces each listed hot pixel with the mean of its in-bounds 4-neighbors.
pub fn calibrate(light: &Bitmap, master_dark: &Bitmap, hot_pixels: &[Point]) -> StackResult<Bitmap> {
    if light.width() != master_dark.width()
        || light.height() != master_dark.height()
        || light.channels() != master_dark.channels()
    {
        return Err(StackError::Format(
            "light frame and master dark have mismatched dimensions".into(),
        ));
    }

    let mut result = Bitmap::with_range_space(light.depth(), light.channels(), light.range(), light.space());
    result.resize(light.width(), light.height(), None);

    let n = light.channels().count();
    for y in 0..light.height() {
        for x in 0..light.width() {
            for c in 0..n {
                let corrected = (light.get_raw(x, y, c) - master_dark.get_raw(x, y, c)).max(0.0);
                result.set_raw(x, y, c, corrected);
            }
        }
    }

    for hot in hot_pixels {
        let x = hot.x.round() as i64;
        let y = hot.y.round() as i64;
        if x < 0 || y < 0 || x as u32 >= light.width() || y as u32 >= light.height() {
            continue;
        }
        for c in 0..n {
            let mut sum = 0.0;
            let mut count = 0.0;
            for (dx, dy) in [(-1i64, 0i64), (1, 0), (0, -1), (0, 1)] {
                let nx = x + dx;
                let ny = y + dy;
                if nx < 0 || ny < 0 || nx as u32 >= light.width() || ny as u32 >= light.height() {
                    continue;
                }
                sum += result.get_raw(nx as u32, ny as u32, c);
                count += 1.0;
            }
            if count > 0.0 {
                result.set_raw(x as u32, y as u32, c, sum / count);
            }
        }
    }

    Ok(result)
}

/// Captures per-channel background median and max from `bitmap`, the form
/// [`crate::stacking::Stacker::accumulate`] consumes to align a frame's photometric
/// baseline onto the reference's.
pub fn measure_background(bitmap: &Bitmap) -> BackgroundCalibrationParameters {
    let n = bitmap.channels().count();
    let mut background = [0.0; 3];
    let mut max = [0.0; 3];

    for c in 0..n {
        let mut values: Vec<f64> = Vec::with_capacity((bitmap.width() * bitmap.height()) as usize);
        let mut peak = f64::MIN;
        for y in 0..bitmap.height() {
            for x in 0..bitmap.width() {
                let v = bitmap.get_raw(x, y, c);
                values.push(v);
                if v > peak {
                    peak = v;
                }
            }
        }
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if values.is_empty() {
            0.0
        } else {
            let mid = values.len() / 2;
            if values.len() % 2 == 0 {
                (values[mid - 1] + values[mid]) / 2.0
            } else {
                values[mid]
            }
        };
        background[c as usize] = median;
        max[c as usize] = if peak == f64::MIN { 0.0 } else { peak };
    }

    BackgroundCalibrationParameters::new(background, max)
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
    fn subtracts_the_master_dark_pixel_for_pixel() {
        let light = flat(100.0, 3, 3);
        let dark = flat(8.0, 3, 3);
        let result = calibrate(&light, &dark, &[]).unwrap();
        assert_eq!(result.get_raw(1, 1, 0), 92.0);
    }

    #[test]
    fn clamps_at_zero_when_the_dark_overshoots() {
        let light = flat(5.0, 3, 3);
        let dark = flat(8.0, 3, 3);
        let result = calibrate(&light, &dark, &[]).unwrap();
        assert_eq!(result.get_raw(0, 0, 0), 0.0);
    }

    #[test]
    fn hot_pixels_are_replaced_by_their_neighbor_mean() {
        let mut light = flat(100.0, 3, 3);
        light.set_raw(1, 1, 0, 60000.0);
        let dark = flat(0.0, 3, 3);
        let result = calibrate(&light, &dark, &[Point::new(1.0, 1.0)]).unwrap();
        assert_eq!(result.get_raw(1, 1, 0), 100.0);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let light = flat(1.0, 3, 3);
        let dark = flat(1.0, 4, 4);
        assert!(matches!(calibrate(&light, &dark, &[]), Err(StackError::Format(_))));
    }

    #[test]
    fn background_median_and_max_are_measured_per_channel() {
        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, 3, 1);
        bmp.set_raw(0, 0, 0, 1.0);
        bmp.set_raw(1, 0, 0, 5.0);
        bmp.set_raw(2, 0, 0, 9.0);
        let params = measure_background(&bmp);
        assert_eq!(params.background[0], 5.0);
        assert_eq!(params.max[0], 9.0);
    }
}
