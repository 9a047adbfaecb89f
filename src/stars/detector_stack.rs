// SPDX-License-Identifier: GPL-3.0-only

//! Stacking-tuned star detector (spec §4.2a): median background estimate, an
//! optional binary search for the luminance threshold, rectangle-tiled candidate
//! scanning, an 8-direction radial walk per candidate, sub-pixel centroiding and
//! dedup against already-accepted stars.

use super::{sort_by_intensity_desc, Point, Star};
use crate::bitmap::Bitmap;
use crate::constants::{DETECTOR_MAX_STARS, DETECTOR_MIN_STARS, ROUNDNESS_TOLERANCE, STARMAXSIZE};

const DIRECTIONS: [(i32, i32); 8] = [
    (0, -1),
    (1, 0),
    (0, 1),
    (-1, 0),
    (1, -1),
    (-1, -1),
    (1, 1),
    (-1, 1),
];

struct LuminanceGrid {
    width: u32,
    height: u32,
    values: Vec<f64>,
}

impl LuminanceGrid {
    fn from_bitmap(bmp: &Bitmap) -> Self {
        let width = bmp.width();
        let height = bmp.height();
        let mut values = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                values.push(bmp.luminance_normalized(x, y));
            }
        }
        LuminanceGrid { width, height, values }
    }

    fn at(&self, x: i64, y: i64) -> Option<f64> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(self.values[(y as u32 * self.width + x as u32) as usize])
    }

    fn median(&self) -> f64 {
        let mut sorted = self.values.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let n = sorted.len();
        if n == 0 {
            return 0.0;
        }
        if n % 2 == 1 {
            sorted[n / 2]
        } else {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        }
    }
}

/// Detects stars in `bitmap` for stacking purposes. `luminancy_threshold`, if given,
/// is a percentage in `[0, 100]`; otherwise a threshold is searched for that yields
/// between [`DETECTOR_MIN_STARS`] and [`DETECTOR_MAX_STARS`] stars.
pub fn detect_stars_for_stacking(bitmap: &Bitmap, luminancy_threshold: Option<f64>) -> Vec<Star> {
    let grid = LuminanceGrid::from_bitmap(bitmap);
    let background = grid.median();

    let stars = match luminancy_threshold {
        Some(t) => detect_at_threshold(&grid, background, t.clamp(0.0, 100.0) / 100.0),
        None => search_threshold(&grid, background),
    };

    let mut stars = stars;
    sort_by_intensity_desc(&mut stars);
    stars
}

/// Binary search over `T in [0, 100]` for a threshold yielding an accepted star
/// count. Probes the midpoint first; too few stars (threshold too strict) pushes the
/// search toward lower `T`, too many pushes it toward higher `T`.
fn search_threshold(grid: &LuminanceGrid, background: f64) -> Vec<Star> {
    let mut lo = 0u32;
    let mut hi = 100u32;
    let mut best: Vec<Star> = Vec::new();

    for _ in 0..8 {
        let mid = (lo + hi) / 2;
        let stars = detect_at_threshold(grid, background, mid as f64 / 100.0);
        let count = stars.len();

        if (DETECTOR_MIN_STARS..=DETECTOR_MAX_STARS).contains(&count) {
            return stars;
        }

        best = stars;

        if count < DETECTOR_MIN_STARS {
            if mid == 0 {
                break;
            }
            hi = mid.saturating_sub(1);
        } else {
            if mid == 100 {
                break;
            }
            lo = mid + 1;
        }

        if lo > hi {
            break;
        }
    }

    best
}

struct Candidate {
    x: u32,
    y: u32,
}

fn candidates(grid: &LuminanceGrid, background: f64, threshold: f64) -> Vec<Candidate> {
    let border = STARMAXSIZE as i64;
    let side = (5.0 * STARMAXSIZE) as i64;
    let stride = (2.5 * STARMAXSIZE) as i64;

    let min_x = border;
    let max_x = (grid.width as i64 - border).max(min_x);
    let min_y = border;
    let max_y = (grid.height as i64 - border).max(min_y);

    let mut seen = vec![false; (grid.width * grid.height) as usize];
    let mut out = Vec::new();

    let mut ry = min_y;
    loop {
        let rect_y1 = (ry + side).min(max_y);
        let mut rx = min_x;
        loop {
            let rect_x1 = (rx + side).min(max_x);

            for y in ry..rect_y1 {
                for x in rx..rect_x1 {
                    let idx = (y as u32 * grid.width + x as u32) as usize;
                    if seen[idx] {
                        continue;
                    }
                    if let Some(lum) = grid.at(x, y) {
                        if lum > background + threshold {
                            seen[idx] = true;
                            out.push(Candidate { x: x as u32, y: y as u32 });
                        }
                    }
                }
            }

            if rect_x1 >= max_x {
                break;
            }
            rx += stride;
        }

        if rect_y1 >= max_y {
            break;
        }
        ry += stride;
    }

    out
}

struct Walk {
    radii: [f64; 8],
    max_radius: f64,
    saw_too_bright: bool,
    brighter_neighbor_directions: usize,
}

fn radial_walk(grid: &LuminanceGrid, cx: u32, cy: u32, background: f64) -> Walk {
    let center = grid.at(cx as i64, cy as i64).unwrap_or(0.0);
    let above = (center - background).max(0.0);
    let stop_below = above * 0.25;

    let mut radii = [0.0f64; 8];
    let mut saw_too_bright = false;
    let mut brighter_neighbor_directions = 0usize;

    for (i, (dx, dy)) in DIRECTIONS.iter().enumerate() {
        let mut r = 0i64;
        let mut saw_brighter = false;
        loop {
            let nx = cx as i64 + dx * (r + 1);
            let ny = cy as i64 + dy * (r + 1);
            match grid.at(nx, ny) {
                Some(lum) => {
                    if lum > 1.05 * center {
                        saw_too_bright = true;
                    }
                    if lum > center {
                        saw_brighter = true;
                    }
                    if (lum - background) < stop_below {
                        break;
                    }
                    r += 1;
                }
                None => break,
            }
        }
        radii[i] = r as f64;
        if saw_brighter {
            brighter_neighbor_directions += 1;
        }
    }

    let max_radius = radii.iter().cloned().fold(0.0, f64::max);

    Walk {
        radii,
        max_radius,
        saw_too_bright,
        brighter_neighbor_directions,
    }
}

fn detect_at_threshold(grid: &LuminanceGrid, background: f64, threshold: f64) -> Vec<Star> {
    let mut accepted: Vec<Star> = Vec::new();

    for pass in 0..4u32 {
        let delta = pass as f64; // grows 0 -> 3 across four passes
        let cands = candidates(grid, background, threshold);

        for cand in cands {
            if accepted
                .iter()
                .any(|s| s.position.x.round() as i64 == cand.x as i64 && s.position.y.round() as i64 == cand.y as i64)
            {
                continue;
            }

            let walk = radial_walk(grid, cand.x, cand.y, background);

            if walk.saw_too_bright || walk.brighter_neighbor_directions > 2 || walk.max_radius <= 2.0 {
                continue;
            }

            let cardinal = walk.radii[0].max(walk.radii[1]).max(walk.radii[2]).max(walk.radii[3]);
            let diagonal = walk.radii[4].max(walk.radii[5]).max(walk.radii[6]).max(walk.radii[7]);
            if (cardinal - diagonal).abs() > delta {
                continue;
            }

            if let Some(star) = centroid(grid, cand.x, cand.y, background, walk.max_radius as i64) {
                if !overlaps_existing(&accepted, &star) {
                    accepted.push(star);
                }
            }
        }

        if !accepted.is_empty() {
            break;
        }
    }

    accepted
}

fn centroid(grid: &LuminanceGrid, cx: u32, cy: u32, background: f64, r: i64) -> Option<Star> {
    let r = r.max(1);
    let mut sum_w = 0.0;
    let mut sum_x = 0.0;
    let mut sum_y = 0.0;

    for dy in -r..=r {
        for dx in -r..=r {
            if let Some(lum) = grid.at(cx as i64 + dx, cy as i64 + dy) {
                let above = (lum - background).max(0.0);
                sum_w += above;
                sum_x += above * (cx as i64 + dx) as f64;
                sum_y += above * (cy as i64 + dy) as f64;
            }
        }
    }

    if sum_w <= 0.0 {
        return None;
    }

    let mean_x = sum_x / sum_w;
    let mean_y = sum_y / sum_w;

    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for dy in -r..=r {
        for dx in -r..=r {
            if let Some(lum) = grid.at(cx as i64 + dx, cy as i64 + dy) {
                let above = (lum - background).max(0.0);
                let px = (cx as i64 + dx) as f64;
                let py = (cy as i64 + dy) as f64;
                var_x += above * (px - mean_x).powi(2);
                var_y += above * (py - mean_y).powi(2);
            }
        }
    }
    let sigma_x = (var_x / sum_w).sqrt();
    let sigma_y = (var_y / sum_w).sqrt();

    if (sigma_x - sigma_y).abs() > ROUNDNESS_TOLERANCE {
        return None;
    }

    let mean_radius = 1.5 * (sigma_x + sigma_y) / 2.0;
    let peak_above = (grid.at(cx as i64, cy as i64).unwrap_or(background) - background).max(0.0);
    let sigma_avg = (sigma_x + sigma_y) / 2.0;
    let quality = peak_above / (sigma_avg + 1e-9);

    Some(Star::new(Point::new(mean_x, mean_y), peak_above, quality, mean_radius))
}

fn overlaps_existing(accepted: &[Star], candidate: &Star) -> bool {
    accepted.iter().any(|s| {
        let min_dist = (s.mean_radius + candidate.mean_radius) * 2.35 / 1.5;
        s.position.distance(&candidate.position) < min_dist
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::{Channels, Depth};

    fn gaussian_bitmap(width: u32, height: u32, blobs: &[(f64, f64, f64, f64)], background: f64) -> Bitmap {
        let mut bmp = Bitmap::with_size(Depth::F64, Channels::One, width, height);
        for y in 0..height {
            for x in 0..width {
                let mut v = background;
                for &(cx, cy, intensity, sigma) in blobs {
                    let dx = x as f64 - cx;
                    let dy = y as f64 - cy;
                    v += intensity * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                }
                bmp.set_raw(x, y, 0, v);
            }
        }
        bmp
    }

    #[test]
    fn dedup_invariant_holds_between_accepted_stars() {
        let bmp = gaussian_bitmap(
            200,
            200,
            &[
                (80.0, 80.0, 150.0, 3.0),
                (120.0, 120.0, 140.0, 3.0),
                (60.0, 160.0, 120.0, 3.0),
            ],
            10.0,
        );

        let stars = detect_stars_for_stacking(&bmp, Some(20.0));

        for i in 0..stars.len() {
            for j in (i + 1)..stars.len() {
                let min_dist = (stars[i].mean_radius + stars[j].mean_radius) * 2.35 / 1.5;
                assert!(stars[i].position.distance(&stars[j].position) >= min_dist);
            }
        }
    }

    #[test]
    fn stars_are_sorted_by_intensity_descending() {
        let bmp = gaussian_bitmap(
            200,
            200,
            &[(80.0, 80.0, 150.0, 3.0), (120.0, 120.0, 80.0, 3.0)],
            10.0,
        );
        let stars = detect_stars_for_stacking(&bmp, Some(20.0));
        for w in stars.windows(2) {
            assert!(w[0].intensity >= w[1].intensity);
        }
    }
}
