// SPDX-License-Identifier: GPL-3.0-only

//! Running-mean stacking engine (spec §4.4): background-calibrates each registered
//! frame against the reference, warps it through the inverse of its transformation,
//! and folds it into the output image with a numerically stable running mean.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::background::BackgroundCalibrationParameters;
use crate::bitmap::{Bitmap, Channels, Depth};
use crate::error::{StackError, StackResult};
use crate::stars::Point;
use crate::transform::Transformation;

/// Accumulates registered frames into a running-mean output image.
pub struct Stacker {
    output: Bitmap,
    count: u32,
}

impl Stacker {
    pub fn new(depth: Depth, channels: Channels, width: u32, height: u32) -> Self {
        Stacker {
            output: Bitmap::with_size(depth, channels, width, height),
            count: 0,
        }
    }

    pub fn output(&self) -> &Bitmap {
        &self.output
    }

    /// Number of frames folded into [`Self::output`] so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Folds `frame` into the running mean using `transform` (identity for the
    /// reference frame itself) and background-calibration coefficients mapping
    /// `frame_calibration` onto `reference_calibration`. `cancel` is polled once per
    /// output row so a stacking pass can be interrupted between rows.
    pub fn accumulate(
        &mut self,
        frame: &Bitmap,
        transform: &Transformation,
        frame_calibration: &BackgroundCalibrationParameters,
        reference_calibration: &BackgroundCalibrationParameters,
        cancel: &AtomicBool,
    ) -> StackResult<()> {
        let width = self.output.width();
        let height = self.output.height();
        let channels = self.output.channels().count();

        let coefficients: Vec<(f64, f64)> = (0..3)
            .map(|c| frame_calibration.affine_coefficients(reference_calibration, c))
            .collect();

        let new_count = self.count + 1;

        for y in 0..height {
            if cancel.load(Ordering::Relaxed) {
                return Err(StackError::Cancelled);
            }

            for x in 0..width {
                let source = transform.inverse_transform(Point::new(x as f64, y as f64));

                for c in 0..channels {
                    let sample = source
                        .and_then(|p| bilinear_sample(frame, p.x, p.y, c))
                        .map(|v| {
                            let (a, b) = coefficients[c as usize];
                            a * v + b
                        })
                        .unwrap_or(0.0);

                    let previous = self.output.get_raw(x, y, c);
                    let updated = (previous * self.count as f64 + sample) / new_count as f64;
                    self.output.set_raw(x, y, c, updated);
                }
            }
        }

        self.count = new_count;
        Ok(())
    }
}

/// Bilinear sample of `frame` at fractional pixel `(x, y)`, `None` ("black") when the
/// sample falls outside `frame`'s bounds.
fn bilinear_sample(frame: &Bitmap, x: f64, y: f64, channel: u32) -> Option<f64> {
    if x < 0.0 || y < 0.0 {
        return None;
    }

    let x0 = x.floor();
    let y0 = y.floor();
    let x0i = x0 as u32;
    let y0i = y0 as u32;

    if x0i + 1 >= frame.width() || y0i + 1 >= frame.height() {
        return None;
    }

    let fx = x - x0;
    let fy = y - y0;

    let v00 = frame.get_raw(x0i, y0i, channel);
    let v10 = frame.get_raw(x0i + 1, y0i, channel);
    let v01 = frame.get_raw(x0i, y0i + 1, channel);
    let v11 = frame.get_raw(x0i + 1, y0i + 1, channel);

    Some(
        v00 * (1.0 - fx) * (1.0 - fy)
            + v10 * fx * (1.0 - fy)
            + v01 * (1.0 - fx) * fy
            + v11 * fx * fy,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_bitmap(value: f64, width: u32, height: u32) -> Bitmap {
        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, width, height);
        for y in 0..height {
            for x in 0..width {
                bmp.set_raw(x, y, 0, value);
            }
        }
        bmp
    }

    #[test]
    fn running_mean_matches_arithmetic_mean_after_n_frames() {
        let mut stacker = Stacker::new(Depth::F64, Channels::One, 4, 4);
        let identity = Transformation::identity(4.0, 4.0);
        let calibration = BackgroundCalibrationParameters::new([0.0; 3], [1.0; 3]);

        let samples = [10.0, 20.0, 30.0];
        let cancel = AtomicBool::new(false);
        for &v in &samples {
            let frame = flat_bitmap(v, 4, 4);
            stacker
                .accumulate(&frame, &identity, &calibration, &calibration, &cancel)
                .unwrap();
        }

        let expected = samples.iter().sum::<f64>() / samples.len() as f64;
        assert!((stacker.output().get_raw(1, 1, 0) - expected).abs() < 1e-9);
        assert_eq!(stacker.count(), samples.len() as u32);
    }

    #[test]
    fn cancellation_is_observed_between_rows() {
        let mut stacker = Stacker::new(Depth::F64, Channels::One, 4, 4);
        let identity = Transformation::identity(4.0, 4.0);
        let calibration = BackgroundCalibrationParameters::new([0.0; 3], [1.0; 3]);
        let frame = flat_bitmap(5.0, 4, 4);

        let cancel = AtomicBool::new(true);
        let result = stacker.accumulate(&frame, &identity, &calibration, &calibration, &cancel);
        assert!(matches!(result, Err(StackError::Cancelled)));
    }

    #[test]
    fn sample_outside_frame_bounds_contributes_black() {
        let mut stacker = Stacker::new(Depth::F64, Channels::One, 4, 4);
        let mut shifted = Transformation::identity(4.0, 4.0);
        shifted.a0 = 100.0; // shifts every source sample far outside the frame
        let calibration = BackgroundCalibrationParameters::new([0.0; 3], [1.0; 3]);
        let frame = flat_bitmap(5.0, 4, 4);

        let cancel = AtomicBool::new(false);
        stacker
            .accumulate(&frame, &shifted, &calibration, &calibration, &cancel)
            .unwrap();

        assert_eq!(stacker.output().get_raw(0, 0, 0), 0.0);
    }
}
