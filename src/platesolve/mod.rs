// SPDX-License-Identifier: GPL-3.0-only

//! Plate solver core (spec §4.5): pre-processes a star list for an opaque astrometry
//! solver — uniformization, truncation, index filtering by angular scale — and
//! extracts celestial coordinates and pixel scale from the solver's answer.
//!
//! The actual index-file format and solve loop are treated as opaque (spec.md §1
//! explicitly scopes them out); [`SolverEngine`] is the seam a real astrometry
//! backend plugs into.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::constants::DEFAULT_UNIFORMIZE_BOXES;
use crate::error::{StackError, StackResult};
use crate::stars::Star;

const ARCSEC_PER_DEGREE: f64 = 3600.0;

/// A celestial position in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub ra: f64,
    pub dec: f64,
}

/// A loaded index file's advertised angular-scale range, in degrees of field width.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexRange {
    pub min_width_deg: f64,
    pub max_width_deg: f64,
}

/// A solver's answer: the field center and the pixel scale it was found at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveResult {
    pub center: Coordinates,
    pub pixel_scale_arcsec_per_pixel: f64,
}

/// Shared cooperative-cancellation flag, read by a solver engine's timer callback.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// The seam a real astrometry backend plugs into, matching the split the original
/// draws between `PlateSolver` and astrometry.net's own `simplexy`/`index`/solve
/// engine: everything on this side of the trait is this crate's business
/// (uniformization, cutting, index filtering); everything behind it is opaque.
pub trait SolverEngine {
    /// Attempts a solve. `stars` is already uniformized and cut; `image_size` is
    /// (width, height) in pixels; `quadsize_min` is the minimum quad size in pixels
    /// (0.1 * min(w, h) per spec); `limit_seconds` bounds the attempt, polled via
    /// `cancel` once per (at most) second. Returns `None` on failure or expiry, never
    /// an error — running out of budget or matches is an ordinary outcome here.
    fn solve(
        &self,
        stars: &[Star],
        image_size: (u32, u32),
        quadsize_min: f64,
        limit_seconds: u64,
        cancel: &CancelToken,
    ) -> Option<SolveResult>;
}

/// A solver engine that always fails immediately; useful as a test double when a
/// test exercises uniformization/cutting/filtering but has no real index data.
pub struct NullSolverEngine;

impl SolverEngine for NullSolverEngine {
    fn solve(
        &self,
        _stars: &[Star],
        _image_size: (u32, u32),
        _quadsize_min: f64,
        _limit_seconds: u64,
        _cancel: &CancelToken,
    ) -> Option<SolveResult> {
        None
    }
}

/// Owns the star list + image size being prepared for a solve, the loaded indexes,
/// and the cancellation flag — the Rust counterpart of the original `PlateSolver`.
pub struct Solver<E: SolverEngine> {
    engine: E,
    stars: Vec<Star>,
    image_size: (u32, u32),
    indexes: Vec<IndexRange>,
    cancel: CancelToken,
    pixel_scale: f64,
}

impl<E: SolverEngine> Solver<E> {
    pub fn new(engine: E) -> Self {
        Solver {
            engine,
            stars: Vec::new(),
            image_size: (0, 0),
            indexes: Vec::new(),
            cancel: CancelToken::new(),
            pixel_scale: 0.0,
        }
    }

    pub fn set_stars(&mut self, stars: Vec<Star>, image_size: (u32, u32)) {
        self.stars = stars;
        self.image_size = image_size;
    }

    pub fn stars(&self) -> &[Star] {
        &self.stars
    }

    pub fn image_size(&self) -> (u32, u32) {
        self.image_size
    }

    pub fn pixel_scale(&self) -> f64 {
        self.pixel_scale
    }

    pub fn load_indexes(&mut self, indexes: Vec<IndexRange>) {
        self.indexes = indexes;
    }

    pub fn clear_indexes(&mut self) {
        self.indexes.clear();
    }

    /// Sets the shared cancellation flag; a concurrently running [`Self::solve`]
    /// observes it at its next per-second timer tick and stops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Partitions the image into an `nb_boxes`-ish grid (`nbX * nbY ~= nb_boxes`,
    /// proportioned to the image aspect ratio), bins stars by cell, and re-emits them
    /// in round-robin cell order: all first-ranked stars per cell, then all
    /// second-ranked, etc. Stars within a round are ordered by their original index
    /// ascending (spec.md's "lexicographic index tie-breaking").
    pub fn uniformize(&mut self, nb_boxes: usize) -> bool {
        let (w, h) = self.image_size;
        if w == 0 || h == 0 || self.stars.is_empty() {
            return false;
        }

        let aspect = w as f64 / h as f64;
        let nb_y = ((nb_boxes as f64 / aspect).sqrt().round().max(1.0)) as usize;
        let nb_x = ((nb_boxes as f64 / nb_y as f64).round().max(1.0)) as usize;

        let cell_w = (w as f64 / nb_x as f64).max(1.0);
        let cell_h = (h as f64 / nb_y as f64).max(1.0);

        let mut cells: Vec<Vec<usize>> = vec![Vec::new(); nb_x * nb_y];
        for (i, star) in self.stars.iter().enumerate() {
            let cx = ((star.position.x / cell_w) as usize).min(nb_x - 1);
            let cy = ((star.position.y / cell_h) as usize).min(nb_y - 1);
            cells[cy * nb_x + cx].push(i);
        }

        let max_round = cells.iter().map(|c| c.len()).max().unwrap_or(0);
        let mut order = Vec::with_capacity(self.stars.len());
        for round in 0..max_round {
            for cell in &cells {
                if let Some(&idx) = cell.get(round) {
                    order.push(idx);
                }
            }
        }

        self.stars = order.into_iter().map(|i| self.stars[i]).collect();
        true
    }

    /// Truncates the (already ordered) star list to its `nb` brightest entries.
    pub fn cut(&mut self, nb: usize) {
        self.stars.truncate(nb);
    }

    /// Keeps only indexes whose advertised scale range overlaps `[fmin, fmax]`,
    /// where `fmin = 0.1 * min(w, h) * deg2arcsec(min_width) / w` and
    /// `fmax = hypot(w, h) * deg2arcsec(max_width) / w`.
    pub fn filter_indexes(&self, min_width_deg: f64, max_width_deg: f64) -> Vec<IndexRange> {
        let (w, h) = self.image_size;
        if w == 0 {
            return Vec::new();
        }
        let (w, h) = (w as f64, h as f64);

        let fmin = 0.1 * w.min(h) * (min_width_deg * ARCSEC_PER_DEGREE) / w;
        let fmax = w.hypot(h) * (max_width_deg * ARCSEC_PER_DEGREE) / w;

        self.indexes
            .iter()
            .copied()
            .filter(|idx| {
                let idx_min = idx.min_width_deg * ARCSEC_PER_DEGREE;
                let idx_max = idx.max_width_deg * ARCSEC_PER_DEGREE;
                idx_max >= fmin && idx_min <= fmax
            })
            .collect()
    }

    /// Invokes the configured [`SolverEngine`] with the current (already
    /// uniformized/cut) star list, a `quadsize_min` of `0.1 * min(w, h)`, and the
    /// given time budget. Stores the resulting pixel scale and returns the
    /// coordinates, or `Err(StackError::Budget)` on failure/cancellation.
    pub fn solve(&mut self, _min_width_deg: f64, _max_width_deg: f64, limit_seconds: u64) -> StackResult<Coordinates> {
        let (w, h) = self.image_size;
        let quadsize_min = 0.1 * (w.min(h) as f64);

        match self.engine.solve(&self.stars, self.image_size, quadsize_min, limit_seconds, &self.cancel) {
            Some(result) => {
                self.pixel_scale = result.pixel_scale_arcsec_per_pixel;
                Ok(result.center)
            }
            None => Err(StackError::Budget),
        }
    }

    /// Chains `uniformize` (if `uniformize` is `true`) -> `cut` (if `cut` is `true`,
    /// to [`crate::constants::DEFAULT_SOLVER_CUT`]) -> [`Self::solve`], matching the
    /// original's convenience `run(stars, imageSize, ...)` overload.
    pub fn run(
        &mut self,
        stars: Vec<Star>,
        image_size: (u32, u32),
        uniformize: bool,
        cut: bool,
        min_width_deg: f64,
        max_width_deg: f64,
        limit_seconds: u64,
    ) -> StackResult<Coordinates> {
        self.set_stars(stars, image_size);
        if uniformize {
            self.uniformize(DEFAULT_UNIFORMIZE_BOXES);
        }
        if cut {
            self.cut(crate::constants::DEFAULT_SOLVER_CUT);
        }
        self.solve(min_width_deg, max_width_deg, limit_seconds)
    }
}
