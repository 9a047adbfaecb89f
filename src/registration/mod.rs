// SPDX-License-Identifier: GPL-3.0-only

//! Large-triangle star matching + bilinear transform fit (spec §4.3).
//!
//! Ground truth for the control flow: `original_source/src/stacking/starmatcher.cpp`.
//! Two simplifications versus the original, both noted in DESIGN.md: distances are
//! looked up in a dense `N x N` matrix instead of a sorted vector + binary search
//! (fine since both lists are capped at 100 stars), and the vote-grid cut keeps every
//! candidate whose vote count meets the threshold rather than replicating the
//! original's off-by-one `resize(cut + 1)`.

use nalgebra::DMatrix;

use crate::constants::{
    FIT_RESIDUAL_LIMIT, FIT_SEED_PAIRS, MAXSTARDISTANCE_DELTA, REFINE_MAX_CONSECUTIVE_FAILURES,
    REFINE_RESIDUAL_LIMIT, REGISTRATION_TOP_N, TRIANGLE_DEGENERACY_RATIO,
};
use crate::error::{StackError, StackResult};
use crate::stars::{sort_by_intensity_desc, Point, Star};
use crate::transform::Transformation;

/// One (reference star index, target star index) candidate pair and the number of
/// triangle votes it received.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    reference_index: usize,
    target_index: usize,
    votes: u32,
    active: bool,
    used: bool,
}

/// Dense symmetric matrix of pairwise Euclidean distances between a star list's
/// positions; `distance(i, i) == 0.0`.
struct DistanceMatrix {
    n: usize,
    values: Vec<f64>,
}

impl DistanceMatrix {
    fn new(points: &[Point]) -> Self {
        let n = points.len();
        let mut values = vec![0.0; n * n];
        for i in 0..n {
            for j in (i + 1)..n {
                let d = points[i].distance(&points[j]);
                values[i * n + j] = d;
                values[j * n + i] = d;
            }
        }
        DistanceMatrix { n, values }
    }

    fn get(&self, i: usize, j: usize) -> f64 {
        self.values[i * self.n + j]
    }

    /// All `(i, j, distance)` triples with `i < j`, sorted by distance descending.
    fn pairs_by_distance_desc(&self) -> Vec<(usize, usize, f64)> {
        let mut pairs = Vec::with_capacity(self.n * self.n / 2);
        for i in 0..self.n {
            for j in (i + 1)..self.n {
                pairs.push((i, j, self.get(i, j)));
            }
        }
        pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());
        pairs
    }
}

/// Computes a [`Transformation`] mapping `target`'s pixel space onto `reference`'s,
/// such that `transform(target_i) ≈ reference_match_i` for the matched star pairs.
///
/// Fails (spec §4.3 "Failure semantics") when there are too few target stars, the
/// least-squares matrix is singular for every candidate seed, or fewer than
/// [`FIT_SEED_PAIRS`] active pairs ever survive.
pub fn register(
    reference: &[Star],
    target: &[Star],
    image_size: (u32, u32),
) -> StackResult<Transformation> {
    if target.len() <= 4 || (target.len() < reference.len() / 5 && target.len() < 30) {
        return Err(StackError::InsufficientData(format!(
            "only {} target stars (need > 4, and >= {} or >= 30)",
            target.len(),
            reference.len() / 5
        )));
    }

    let mut sorted_reference = reference.to_vec();
    let mut sorted_target = target.to_vec();
    sort_by_intensity_desc(&mut sorted_reference);
    sort_by_intensity_desc(&mut sorted_target);

    let references: Vec<Point> = sorted_reference
        .iter()
        .take(REGISTRATION_TOP_N)
        .map(|s| s.position)
        .collect();
    let targets: Vec<Point> = sorted_target
        .iter()
        .take(REGISTRATION_TOP_N)
        .map(|s| s.position)
        .collect();

    if references.len() < FIT_SEED_PAIRS || targets.len() < FIT_SEED_PAIRS {
        return Err(StackError::InsufficientData(
            "fewer than 8 usable stars in reference or target".into(),
        ));
    }

    let x_width = image_size.0 as f64;
    let y_width = image_size.1 as f64;

    let candidates = vote(&references, &targets);
    if candidates.is_empty() {
        return Err(StackError::InsufficientData("no triangle votes cast".into()));
    }

    fit_with_sigma_clipping(&candidates, &references, &targets, x_width, y_width)
}

/// Step 1-3: pairwise distances, large-triangle voting, and the vote-count cut.
fn vote(references: &[Point], targets: &[Point]) -> Vec<Candidate> {
    let reference_distances = DistanceMatrix::new(references);
    let target_distances = DistanceMatrix::new(targets);

    let reference_order = reference_distances.pairs_by_distance_desc();
    let target_order = target_distances.pairs_by_distance_desc();

    let mut votes = vec![0u32; references.len() * targets.len()];
    let mut cast = |r: usize, t: usize| votes[r * targets.len() + t] += 1;

    let (mut i, mut j) = (0usize, 0usize);
    while i < target_order.len() && j < reference_order.len() {
        let (t1, t2, target_d12) = target_order[i];
        let (r1, r2, reference_d12) = reference_order[j];

        if (target_d12 - reference_d12).abs() <= MAXSTARDISTANCE_DELTA {
            for t3 in 0..targets.len() {
                if t3 == t1 || t3 == t2 {
                    continue;
                }

                let target_d13 = target_distances.get(t1, t3);
                let target_d23 = target_distances.get(t2, t3);
                let ratio = target_d13.max(target_d23) / target_d12;
                if ratio >= TRIANGLE_DEGENERACY_RATIO {
                    continue;
                }

                for r3 in 0..references.len() {
                    if r3 == r1 || r3 == r2 {
                        continue;
                    }

                    let reference_d13 = reference_distances.get(r1, r3);
                    let reference_d23 = reference_distances.get(r2, r3);

                    if (reference_d13 - target_d13).abs() <= MAXSTARDISTANCE_DELTA
                        && (reference_d23 - target_d23).abs() <= MAXSTARDISTANCE_DELTA
                    {
                        cast(r1, t1);
                        cast(r2, t2);
                        cast(r3, t3);
                    } else if (reference_d23 - target_d13).abs() <= MAXSTARDISTANCE_DELTA
                        && (reference_d13 - target_d23).abs() <= MAXSTARDISTANCE_DELTA
                    {
                        cast(r1, t2);
                        cast(r2, t1);
                        cast(r3, t3);
                    }
                }
            }
        }

        if target_d12 < reference_d12 {
            j += 1;
        } else {
            i += 1;
        }
    }

    let mut candidates: Vec<Candidate> = votes
        .iter()
        .enumerate()
        .filter(|&(_, &v)| v > 0)
        .map(|(idx, &v)| Candidate {
            reference_index: idx / targets.len(),
            target_index: idx % targets.len(),
            votes: v,
            active: true,
            used: false,
        })
        .collect();

    candidates.sort_by(|a, b| b.votes.cmp(&a.votes));

    let cut_index = 2 * targets.len();
    let min_votes = candidates
        .get(cut_index.saturating_sub(1))
        .map(|c| c.votes)
        .unwrap_or(1)
        .max(1);
    candidates.retain(|c| c.votes >= min_votes);

    candidates
}

/// Steps 4-5: seed fit with sigma-clipping, then greedy refinement.
fn fit_with_sigma_clipping(
    candidates: &[Candidate],
    references: &[Point],
    targets: &[Point],
    x_width: f64,
    y_width: f64,
) -> StackResult<Transformation> {
    let mut pairs = candidates.to_vec();

    let (mut transformation, mut seed_indices) = loop {
        let active_indices: Vec<usize> = pairs
            .iter()
            .enumerate()
            .filter(|(_, c)| c.active)
            .map(|(i, _)| i)
            .take(FIT_SEED_PAIRS)
            .collect();

        if active_indices.len() < FIT_SEED_PAIRS {
            return Err(StackError::InsufficientData(
                "fewer than 8 active pairs remain for the transform seed".into(),
            ));
        }

        let seed: Vec<Candidate> = active_indices.iter().map(|&i| pairs[i]).collect();

        let transformation = match fit_transform(&seed, references, targets, x_width, y_width) {
            Some(t) => t,
            None => {
                // Singular system for this seed: drop its last pair and retry.
                pairs[*active_indices.last().unwrap()].active = false;
                continue;
            }
        };

        let distances: Vec<f64> = seed
            .iter()
            .map(|c| {
                let projected = transformation.transform(targets[c.target_index]);
                projected.distance(&references[c.reference_index])
            })
            .collect();

        let max_distance = distances.iter().cloned().fold(0.0, f64::max);
        if max_distance <= FIT_RESIDUAL_LIMIT {
            break (transformation, active_indices);
        }

        let mean = distances.iter().sum::<f64>() / distances.len() as f64;
        let variance = distances.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / distances.len() as f64;
        let sigma = variance.sqrt();

        let mut deactivated_any = false;
        for (k, &d) in distances.iter().enumerate() {
            if (d - mean).abs() > 2.0 * sigma {
                pairs[active_indices[k]].active = false;
                deactivated_any = true;
            }
        }
        if !deactivated_any {
            for (k, &d) in distances.iter().enumerate() {
                if (d - mean).abs() > sigma {
                    pairs[active_indices[k]].active = false;
                    deactivated_any = true;
                }
            }
        }
        if !deactivated_any {
            let worst = distances
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
                .map(|(k, _)| k)
                .unwrap();
            pairs[active_indices[worst]].active = false;
        }
    };

    for &idx in &seed_indices {
        pairs[idx].used = true;
    }

    let mut active_pairs: Vec<Candidate> = seed_indices.iter().map(|&i| pairs[i]).collect();
    let mut consecutive_failures = 0usize;

    loop {
        let next = pairs
            .iter()
            .position(|c| c.active && !c.used);
        let Some(next_idx) = next else { break };

        pairs[next_idx].used = true;
        let mut candidate_pairs = active_pairs.clone();
        candidate_pairs.push(pairs[next_idx]);

        match fit_transform(&candidate_pairs, references, targets, x_width, y_width) {
            Some(candidate_transform) => {
                let max_distance = candidate_pairs
                    .iter()
                    .map(|c| {
                        candidate_transform
                            .transform(targets[c.target_index])
                            .distance(&references[c.reference_index])
                    })
                    .fold(0.0, f64::max);

                if max_distance <= REFINE_RESIDUAL_LIMIT {
                    active_pairs = candidate_pairs;
                    transformation = candidate_transform;
                    seed_indices.push(next_idx);
                    consecutive_failures = 0;
                    continue;
                }
                pairs[next_idx].active = false;
            }
            None => {
                pairs[next_idx].active = false;
            }
        }

        consecutive_failures += 1;
        if consecutive_failures > REFINE_MAX_CONSECUTIVE_FAILURES {
            break;
        }
    }

    Ok(transformation)
}

/// Solves the bilinear system `M . A = X`, `M . B = Y` (normal equations,
/// `(M^T M) A = M^T X`) for the given active pairs. Returns `None` if `M^T M` is
/// singular.
fn fit_transform(
    pairs: &[Candidate],
    references: &[Point],
    targets: &[Point],
    x_width: f64,
    y_width: f64,
) -> Option<Transformation> {
    let n = pairs.len();
    let mut m = DMatrix::<f64>::zeros(n, 4);
    let mut x = DMatrix::<f64>::zeros(n, 1);
    let mut y = DMatrix::<f64>::zeros(n, 1);

    for (row, pair) in pairs.iter().enumerate() {
        let target = targets[pair.target_index];
        let reference = references[pair.reference_index];

        let tx = target.x / x_width;
        let ty = target.y / y_width;

        m[(row, 0)] = 1.0;
        m[(row, 1)] = tx;
        m[(row, 2)] = ty;
        m[(row, 3)] = tx * ty;

        x[(row, 0)] = reference.x / x_width;
        y[(row, 0)] = reference.y / y_width;
    }

    let mt = m.transpose();
    let tm = &mt * &m;
    let tm_inv = tm.try_inverse()?;

    let a = &tm_inv * &mt * &x;
    let b = &tm_inv * &mt * &y;

    Some(Transformation {
        a0: a[(0, 0)] * x_width,
        a1: a[(1, 0)] * x_width,
        a2: a[(2, 0)] * x_width,
        a3: a[(3, 0)] * x_width,
        b0: b[(0, 0)] * y_width,
        b1: b[(1, 0)] * y_width,
        b2: b[(2, 0)] * y_width,
        b3: b[(3, 0)] * y_width,
        x_width,
        y_width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stars::Star;

    fn grid_stars(rows: u32, cols: u32, spacing: f64) -> Vec<Star> {
        let mut stars = Vec::new();
        let mut intensity = 1000.0;
        for r in 0..rows {
            for c in 0..cols {
                stars.push(Star::new(
                    Point::new(c as f64 * spacing + 50.0, r as f64 * spacing + 50.0),
                    intensity,
                    1.0,
                    2.0,
                ));
                intensity -= 1.0;
            }
        }
        stars
    }

    #[test]
    fn identical_lists_register_to_the_identity_mapping() {
        let stars = grid_stars(5, 5, 60.0);
        let transformation = register(&stars, &stars, (400, 400)).expect("registration succeeds");

        let p = transformation.transform(Point::new(200.0, 100.0));
        assert!((p.x - 200.0).abs() < 1e-6, "x = {}", p.x);
        assert!((p.y - 100.0).abs() < 1e-6, "y = {}", p.y);
    }

    #[test]
    fn too_few_target_stars_fails() {
        let reference = grid_stars(5, 5, 60.0);
        let target = reference[..3].to_vec();
        assert!(register(&reference, &target, (400, 400)).is_err());
    }

    #[test]
    fn translated_list_registers_within_tolerance() {
        let reference = grid_stars(6, 6, 55.0);
        let target: Vec<Star> = reference
            .iter()
            .map(|s| Star::new(Point::new(s.position.x - 8.0, s.position.y + 5.0), s.intensity, s.quality, s.mean_radius))
            .collect();

        let transformation = register(&reference, &target, (400, 400)).expect("registration succeeds");

        for (r, t) in reference.iter().zip(target.iter()) {
            let projected = transformation.transform(t.position);
            assert!(projected.distance(&r.position) <= 2.0, "residual too large: {:?}", projected);
        }
    }
}
