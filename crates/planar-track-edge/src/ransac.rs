//! RANSAC projective refinement over the axis-split correspondences.
//!
//! Shares the correspondence machinery with the direct and list
//! strategies; only the scoring outer loop differs. Sampling is driven by
//! a seeded LCG so runs are reproducible.

use log::warn;
use nalgebra::{Matrix3, SMatrix, SVector};
use planar_track_core::{Arena, TrackResult};
use serde::{Deserialize, Serialize};

use crate::lists::{AllIndexLimits, EdgeLists};
use crate::tracker::{
    accumulate_x, accumulate_y, homography_from_solution, solve_normal_equations, Axis,
    Correspondence, EdgeTracker,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RansacParams {
    pub max_iterations: usize,
    /// Correspondences drawn from each edge category per iteration.
    pub num_samples_per_type: usize,
    /// Along-axis residual below which a correspondence counts as inlier.
    pub inlier_distance: f32,
    /// Correspondences collected per category before sampling.
    pub max_matches_per_type: usize,
    pub seed: u64,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            num_samples_per_type: 8,
            inlier_distance: 2.0,
            max_matches_per_type: 2000,
            seed: 12345,
        }
    }
}

struct Lcg(u64);

impl Lcg {
    fn next_index(&mut self, len: usize) -> usize {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((self.0 >> 33) as usize) % len
    }
}

#[inline]
fn residual(h: &Matrix3<f32>, c: &Correspondence, axis: Axis) -> f32 {
    let xc = c.template.x;
    let yc = c.template.y;
    let w = h[(2, 0)] * xc + h[(2, 1)] * yc + 1.0;
    if w.abs() < 1e-9 {
        return f32::INFINITY;
    }
    match axis {
        Axis::X => (h[(0, 0)] * xc + h[(0, 1)] * yc + h[(0, 2)]) / w - c.matched.x,
        Axis::Y => (h[(1, 0)] * xc + h[(1, 1)] * yc + h[(1, 2)]) / w - c.matched.y,
    }
}

pub(crate) fn refine_projective_ransac(
    tracker: &mut EdgeTracker,
    next_edges: &EdgeLists,
    limits: &AllIndexLimits<'_>,
    max_distance: i32,
    params: &RansacParams,
    scratch: &Arena,
) -> TrackResult<()> {
    let lists = tracker.correspondence_lists(
        next_edges,
        limits,
        max_distance,
        params.max_matches_per_type,
        scratch,
    )?;

    let total: usize = lists.iter().map(|(_, l)| l.len()).sum();
    if total < 8 {
        warn!("edge tracker: too few correspondences for RANSAC ({total}), keeping transform");
        return Ok(());
    }

    let mut rng = Lcg(params.seed);
    let mut best: Option<(usize, Matrix3<f32>)> = None;

    for _ in 0..params.max_iterations {
        let mut ata = SMatrix::<f32, 8, 8>::zeros();
        let mut atb = SVector::<f32, 8>::zeros();

        for (axis, list) in &lists {
            if list.is_empty() {
                continue;
            }
            for _ in 0..params.num_samples_per_type {
                let c = list[rng.next_index(list.len())];
                match axis {
                    Axis::X => accumulate_x(&mut ata, &mut atb, c.template.x, c.template.y, c.matched.x),
                    Axis::Y => accumulate_y(&mut ata, &mut atb, c.template.x, c.template.y, c.matched.y),
                }
            }
        }

        let Some(solution) = solve_normal_equations(ata, atb) else {
            continue;
        };
        let candidate = homography_from_solution(&solution);

        let mut inliers = 0usize;
        for (axis, list) in &lists {
            for c in list.iter() {
                if residual(&candidate, c, *axis).abs() <= params.inlier_distance {
                    inliers += 1;
                }
            }
        }

        if best.as_ref().is_none_or(|(count, _)| inliers > *count) {
            best = Some((inliers, candidate));
        }
    }

    let Some((best_count, best_h)) = best else {
        warn!("edge tracker: every RANSAC candidate failed to solve, keeping transform");
        return Ok(());
    };
    if best_count < 8 {
        warn!("edge tracker: best RANSAC candidate has {best_count} inliers, keeping transform");
        return Ok(());
    }

    // Refit on the inliers of the best candidate.
    let mut ata = SMatrix::<f32, 8, 8>::zeros();
    let mut atb = SVector::<f32, 8>::zeros();
    for (axis, list) in &lists {
        for c in list.iter() {
            if residual(&best_h, c, *axis).abs() > params.inlier_distance {
                continue;
            }
            match axis {
                Axis::X => accumulate_x(&mut ata, &mut atb, c.template.x, c.template.y, c.matched.x),
                Axis::Y => accumulate_y(&mut ata, &mut atb, c.template.x, c.template.y, c.matched.y),
            }
        }
    }
    tracker.install_solved_homography(ata, atb);
    Ok(())
}
