// SPDX-License-Identifier: GPL-3.0-only

use super::Point;
use std::cmp::Ordering;

/// A detected star: sub-pixel position, intensity, quality score and mean radius.
///
/// Intensity comparison defines the total order used to sort star lists everywhere
/// they're produced or consumed (detector output, registration's top-N truncation).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub position: Point,
    pub intensity: f64,
    pub quality: f64,
    pub mean_radius: f64,
}

impl Star {
    pub fn new(position: Point, intensity: f64, quality: f64, mean_radius: f64) -> Self {
        Star {
            position,
            intensity,
            quality,
            mean_radius,
        }
    }

    /// Total order by intensity, descending-friendly (`cmp_intensity` sorts ascending;
    /// callers wanting descending order reverse it, matching every call site's habit
    /// of `sort_by(|a, b| b.cmp_intensity(a))`).
    pub fn cmp_intensity(&self, other: &Star) -> Ordering {
        self.intensity.partial_cmp(&other.intensity).unwrap_or(Ordering::Equal)
    }
}

/// Sorts `stars` by intensity, descending.
pub fn sort_by_intensity_desc(stars: &mut [Star]) {
    stars.sort_by(|a, b| b.cmp_intensity(a));
}
