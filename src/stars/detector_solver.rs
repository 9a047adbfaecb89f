// SPDX-License-Identifier: GPL-3.0-only

//! Solver-tuned star detector (spec §4.2b): a simplexy-style peak extractor that
//! works on a single-channel byte-range image and produces flux/background
//! estimates per peak, then interleaves two rankings of that same peak set for
//! the plate solver's uniformization stage.

use std::collections::VecDeque;

use super::{Point, Star};
use crate::bitmap::Bitmap;

const NEIGHBORS: [(i32, i32); 8] = [
    (-1, 0),
    (1, 0),
    (0, -1),
    (0, 1),
    (-1, -1),
    (-1, 1),
    (1, -1),
    (1, 1),
];

/// A raw peak found by the solver detector, before it's turned into a [`Star`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverPeak {
    pub position: Point,
    pub flux: f64,
    pub background: f64,
}

impl SolverPeak {
    /// The value the flux-ranked ordering sorts on.
    fn flux_rank(&self) -> f64 {
        self.flux
    }

    /// The value the flux+background ranked ordering sorts on; favors peaks sitting
    /// on brighter backgrounds (crowded fields, nebulosity) over pure flux.
    fn flux_plus_background_rank(&self) -> f64 {
        self.flux + self.background
    }
}

/// Detects peaks in `bitmap` (expected single-channel) for plate solving, and
/// returns them as [`Star`]s ordered by interleaving the descending-flux and
/// descending-(flux+background) permutations of the same peak set, skipping
/// indices already emitted by the other ranking.
pub fn detect_stars_for_solver(bitmap: &Bitmap) -> Vec<Star> {
    let peaks = extract_peaks(bitmap);
    let stars: Vec<Star> = peaks
        .iter()
        .map(|p| Star::new(p.position, p.flux, p.flux_plus_background_rank(), 0.0))
        .collect();

    interleave(&peaks, &stars)
}

fn extract_peaks(bitmap: &Bitmap) -> Vec<SolverPeak> {
    let width = bitmap.width();
    let height = bitmap.height();

    let mut grid = vec![0.0f64; (width * height) as usize];
    for y in 0..height {
        for x in 0..width {
            grid[(y * width + x) as usize] = bitmap.luminance_normalized(x, y);
        }
    }

    let background = median(&grid);
    let sigma = mad_sigma(&grid, background);
    let threshold = background + 3.0 * sigma;

    let mut visited = vec![false; grid.len()];
    let mut peaks = Vec::new();

    for y in 0..height {
        for x in 0..width {
            let idx = (y * width + x) as usize;
            if visited[idx] || grid[idx] <= threshold {
                continue;
            }

            let mut queue = VecDeque::new();
            let mut component = Vec::new();
            queue.push_back((x, y));
            visited[idx] = true;

            while let Some((cx, cy)) = queue.pop_front() {
                component.push((cx, cy));
                for (dx, dy) in NEIGHBORS {
                    let nx = cx as i64 + dx as i64;
                    let ny = cy as i64 + dy as i64;
                    if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                        continue;
                    }
                    let (nx, ny) = (nx as u32, ny as u32);
                    let nidx = (ny * width + nx) as usize;
                    if !visited[nidx] && grid[nidx] > threshold {
                        visited[nidx] = true;
                        queue.push_back((nx, ny));
                    }
                }
            }

            if component.len() < 3 || component.len() > 5000 {
                continue;
            }

            let mut flux = 0.0;
            let mut sum_x = 0.0;
            let mut sum_y = 0.0;
            for &(px, py) in &component {
                let above = (grid[(py * width + px) as usize] - background).max(0.0);
                flux += above;
                sum_x += above * px as f64;
                sum_y += above * py as f64;
            }

            if flux <= 0.0 {
                continue;
            }

            peaks.push(SolverPeak {
                position: Point::new(sum_x / flux, sum_y / flux),
                flux,
                background,
            });
        }
    }

    peaks
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.is_empty() {
        return 0.0;
    }
    sorted[sorted.len() / 2]
}

fn mad_sigma(values: &[f64], median_value: f64) -> f64 {
    let mut deviations: Vec<f64> = values.iter().map(|v| (v - median_value).abs()).collect();
    deviations.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mad = if deviations.is_empty() {
        0.0
    } else {
        deviations[deviations.len() / 2]
    };
    (mad * 1.4826).max(1e-9)
}

/// Interleaves two descending rankings of the same peak set (by flux, and by
/// flux+background), skipping peaks already emitted by the other ranking, so
/// that both strong point sources and sources sitting on bright backgrounds get
/// early representation in a cut-to-N list.
fn interleave(peaks: &[SolverPeak], stars: &[Star]) -> Vec<Star> {
    let mut by_flux: Vec<usize> = (0..peaks.len()).collect();
    by_flux.sort_by(|&a, &b| peaks[b].flux_rank().partial_cmp(&peaks[a].flux_rank()).unwrap());

    let mut by_combined: Vec<usize> = (0..peaks.len()).collect();
    by_combined.sort_by(|&a, &b| {
        peaks[b]
            .flux_plus_background_rank()
            .partial_cmp(&peaks[a].flux_plus_background_rank())
            .unwrap()
    });

    let mut used = vec![false; peaks.len()];
    let mut out = Vec::with_capacity(peaks.len());
    let (mut i, mut j) = (0, 0);

    loop {
        while i < by_flux.len() && used[by_flux[i]] {
            i += 1;
        }
        if i < by_flux.len() {
            let idx = by_flux[i];
            used[idx] = true;
            out.push(stars[idx]);
            i += 1;
        }

        while j < by_combined.len() && used[by_combined[j]] {
            j += 1;
        }
        if j < by_combined.len() {
            let idx = by_combined[j];
            used[idx] = true;
            out.push(stars[idx]);
            j += 1;
        }

        if out.len() >= peaks.len() {
            break;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{Channels, Depth};

    #[test]
    fn finds_a_single_isolated_peak() {
        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, 40, 40);
        for y in 0..40 {
            for x in 0..40 {
                let dx = x as f64 - 20.0;
                let dy = y as f64 - 20.0;
                let v = 10.0 + 200.0 * (-(dx * dx + dy * dy) / (2.0 * 3.0 * 3.0)).exp();
                bmp.set_raw(x, y, 0, v);
            }
        }

        let stars = detect_stars_for_solver(&bmp);
        assert_eq!(stars.len(), 1);
        assert!((stars[0].position.x - 20.0).abs() < 0.5);
        assert!((stars[0].position.y - 20.0).abs() < 0.5);
    }

    #[test]
    fn empty_field_yields_no_peaks() {
        let bmp = Bitmap::with_size(Depth::F64, Channels::One, 20, 20);
        let stars = detect_stars_for_solver(&bmp);
        assert!(stars.is_empty());
    }
}
