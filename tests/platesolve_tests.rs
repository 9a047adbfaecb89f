// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for the plate-solver preprocessing pipeline

use std::thread;
use std::time::Duration;

use astrophoto_stack::platesolve::{CancelToken, Coordinates, IndexRange, SolveResult, Solver, SolverEngine};
use astrophoto_stack::stars::{Point, Star};

/// A solver double that "solves" immediately unless cancelled first, so tests can
/// exercise [`Solver::run`]'s full pipeline without a real astrometry backend.
struct ImmediateSolverEngine {
    answer: SolveResult,
}

impl SolverEngine for ImmediateSolverEngine {
    fn solve(
        &self,
        _stars: &[Star],
        _image_size: (u32, u32),
        _quadsize_min: f64,
        _limit_seconds: u64,
        cancel: &CancelToken,
    ) -> Option<SolveResult> {
        if cancel.is_cancelled() {
            None
        } else {
            Some(self.answer)
        }
    }
}

/// A solver double that blocks until cancelled, modeling a long-running solve
/// attempt that must be interruptible mid-flight.
struct BlockingSolverEngine;

impl SolverEngine for BlockingSolverEngine {
    fn solve(
        &self,
        _stars: &[Star],
        _image_size: (u32, u32),
        _quadsize_min: f64,
        _limit_seconds: u64,
        cancel: &CancelToken,
    ) -> Option<SolveResult> {
        while !cancel.is_cancelled() {
            thread::sleep(Duration::from_millis(5));
        }
        None
    }
}

fn star_field() -> Vec<Star> {
    (0..40)
        .map(|i| Star::new(Point::new((i % 8) as f64 * 100.0 + 10.0, (i / 8) as f64 * 100.0 + 10.0), 1000.0 - i as f64, 1.0, 2.0))
        .collect()
}

#[test]
fn run_uniformizes_cuts_and_solves_in_one_call() {
    let answer = SolveResult { center: Coordinates { ra: 83.8, dec: -5.4 }, pixel_scale_arcsec_per_pixel: 1.7 };
    let mut solver = Solver::new(ImmediateSolverEngine { answer });

    let result = solver.run(star_field(), (800, 800), true, true, 0.1, 180.0, 5).expect("solve succeeds");
    assert!((result.ra - 83.8).abs() < 1e-9);
    assert!((result.dec - (-5.4)).abs() < 1e-9);
    assert!((solver.pixel_scale() - 1.7).abs() < 1e-9);
}

#[test]
fn index_filtering_narrows_the_candidate_set_before_solving() {
    let mut solver = Solver::new(ImmediateSolverEngine {
        answer: SolveResult { center: Coordinates { ra: 0.0, dec: 0.0 }, pixel_scale_arcsec_per_pixel: 1.0 },
    });
    solver.set_stars(star_field(), (800, 800));
    // Far too narrow a field to ever overlap a 1-2 degree query, and a range that
    // sits squarely inside it.
    solver.load_indexes(vec![
        IndexRange { min_width_deg: 0.001, max_width_deg: 0.01 },
        IndexRange { min_width_deg: 1.5, max_width_deg: 1.8 },
    ]);

    let kept = solver.filter_indexes(1.0, 2.0);
    assert_eq!(kept.len(), 1);
    assert!((kept[0].min_width_deg - 1.5).abs() < 1e-9);
}

#[test]
fn cancelling_a_blocking_engine_makes_it_return_within_a_second() {
    let engine = BlockingSolverEngine;
    let cancel = CancelToken::new();

    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };

    let started = std::time::Instant::now();
    let result = engine.solve(&star_field(), (800, 800), 80.0, 30, &cancel);
    canceller.join().unwrap();

    assert!(result.is_none(), "a cancelled solve must report failure rather than a result");
    assert!(started.elapsed() < Duration::from_secs(1), "cancellation should be observed promptly");
}
