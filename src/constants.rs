// SPDX-License-Identifier: GPL-3.0-only

//! Tunables shared across the detection, registration and solving stages.
//!
//! These mirror the thresholds documented in the working-folder format and algorithm
//! description; callers needing different tuning should override them via
//! [`crate::orchestrator::StackingOptions`] rather than editing these constants.

/// Radial-walk cap (pixels) used by the stacking-tuned star detector.
pub const STARMAXSIZE: f64 = 50.0;

/// Maximum allowed `|sigma_x - sigma_y|` before a detected star is rejected as
/// non-round. The original documents this as `2 * bg_sigma`; callers that know their
/// background noise level may override it.
pub const ROUNDNESS_TOLERANCE: f64 = 2.0;

/// Maximum distance (pixels) between two candidate star-pair distances for the
/// registration engine to consider them a match.
pub const MAXSTARDISTANCE_DELTA: f64 = 2.0;

/// Default number of grid cells used by plate-solver uniformization.
pub const DEFAULT_UNIFORMIZE_BOXES: usize = 10;

/// Default truncation applied before invoking the plate solver.
pub const DEFAULT_SOLVER_CUT: usize = 1000;

/// Default number of frames accumulated in memory before a stacking flush.
pub const DEFAULT_STACKING_BATCH: usize = 100;

/// Minimum number of stars the stacking detector's threshold search accepts.
pub const DETECTOR_MIN_STARS: usize = 20;

/// Maximum number of stars the stacking detector's threshold search accepts.
pub const DETECTOR_MAX_STARS: usize = 100;

/// Maximum number of stars from each list considered by the registration engine.
pub const REGISTRATION_TOP_N: usize = 100;

/// Ratio below which a target triangle's two short sides must fall relative to its
/// long side to avoid degenerate "thin" triangles.
pub const TRIANGLE_DEGENERACY_RATIO: f64 = 0.9;

/// Maximum residual (pixels) accepted by the initial seed fit before sigma-clipping.
pub const FIT_RESIDUAL_LIMIT: f64 = 3.0;

/// Maximum residual (pixels) accepted while greedily re-adding pairs during refinement.
pub const REFINE_RESIDUAL_LIMIT: f64 = 2.0;

/// Number of active pairs used to seed each least-squares fit attempt.
pub const FIT_SEED_PAIRS: usize = 8;

/// Consecutive refinement rejections tolerated before giving up.
pub const REFINE_MAX_CONSECUTIVE_FAILURES: usize = 3;
