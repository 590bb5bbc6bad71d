//! Dense inverse-compositional Lucas-Kanade tracking on image pyramids.
//!
//! The template is resampled once at init into a binomial pyramid together
//! with its spatial gradients; each update walks the pyramid coarse to
//! fine, first refining translation, then the tracker's declared
//! transformation type. The inverse-compositional formulation keeps the
//! per-point Jacobian constant across iterations, so the per-frame cost is
//! dominated by warping and bilinear sampling.

use log::warn;
use nalgebra::{SMatrix, SVector};
use planar_track_core::{
    initial_image_scale, x_gradient, y_gradient, GrayImage, GrayImageView, ImageI16,
    PixelVerification, PlanarTransform, Quad, TrackError, TrackResult, TransformKind,
};
use serde::{Deserialize, Serialize};

use crate::common::{
    level_grid, sample_checked, CornerHistory, TemplateGrid, WarpParams, MIN_IN_BOUNDS_SAMPLES,
};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct DenseTrackerParams {
    /// Pyramid depth, including the base level.
    pub num_pyramid_levels: usize,
    /// Richest update the tracker will fit (translation refinement always
    /// runs first at each level).
    pub transform_kind: TransformKind,
    /// Scale applied to the quad bounding box to pick the template region.
    pub template_region_scale: f32,
}

impl Default for DenseTrackerParams {
    fn default() -> Self {
        Self {
            num_pyramid_levels: 4,
            transform_kind: TransformKind::Projective,
            template_region_scale: 1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LkUpdateParams {
    pub max_iterations: usize,
    /// Mean corner displacement below which a level counts as converged
    /// (scaled by the pyramid level's factor).
    pub convergence_tolerance: f32,
    pub verify_max_pixel_difference: u8,
}

impl Default for LkUpdateParams {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            convergence_tolerance: 0.05,
            verify_max_pixel_difference: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct LkTrackReport {
    /// Whether the finest level's refinement converged.
    pub converged: bool,
    pub pixel: PixelVerification,
}

struct TemplateLevel {
    image: GrayImage,
    x_gradient: ImageI16,
    y_gradient: ImageI16,
    grid: TemplateGrid,
}

pub struct DenseTracker {
    kind: TransformKind,
    levels: Vec<TemplateLevel>,
    transform: PlanarTransform,
    image_width: usize,
    image_height: usize,
    initial_scale: f32,
    valid: bool,
}

impl DenseTracker {
    pub fn new(
        template: &GrayImageView<'_>,
        quad: &Quad,
        params: &DenseTrackerParams,
    ) -> TrackResult<Self> {
        if template.width == 0 || template.height == 0 {
            return Err(TrackError::InvalidSize("template image is empty"));
        }
        if template.data.len() != template.width * template.height {
            return Err(TrackError::InvalidSize("template data length mismatch"));
        }
        if params.num_pyramid_levels == 0 || params.num_pyramid_levels > 8 {
            return Err(TrackError::InvalidParameters(
                "num_pyramid_levels must be in 1..=8",
            ));
        }
        let initial_scale = initial_image_scale(template.width)?;

        // Template region in tracking-resolution coordinates.
        let mut region = quad.bounding_rect().scaled(params.template_region_scale);
        region.left /= initial_scale;
        region.right /= initial_scale;
        region.top /= initial_scale;
        region.bottom /= initial_scale;
        let region_width = region.width() + 1.0;
        let region_height = region.height() + 1.0;

        let transform = PlanarTransform::new(params.transform_kind, *quad);

        let mut levels = Vec::with_capacity(params.num_pyramid_levels);
        let wp = WarpParams::new(&transform, initial_scale);
        for level in 0..params.num_pyramid_levels {
            let scale = (1u32 << level) as f32;
            let grid = level_grid(region_width, region_height, scale);
            if grid.xs.len < 3 || grid.ys.len < 3 {
                return Err(TrackError::InvalidParameters(
                    "template region too small for the requested pyramid depth",
                ));
            }
            let image = sample_template_grid(template, &grid, &wp);
            let x_gradient = x_gradient(&image.view());
            let y_gradient = y_gradient(&image.view());
            levels.push(TemplateLevel {
                image,
                x_gradient,
                y_gradient,
                grid,
            });
        }

        Ok(Self {
            kind: params.transform_kind,
            levels,
            transform,
            image_width: template.width,
            image_height: template.height,
            initial_scale,
            valid: true,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.transform.is_valid()
    }

    pub fn num_pyramid_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn transformation(&self) -> PlanarTransform {
        self.transform.clone()
    }

    pub fn set_transformation(&mut self, transform: &PlanarTransform) -> TrackResult<()> {
        if !transform.is_valid() {
            return Err(TrackError::InvalidObject("transformation is not valid"));
        }
        self.transform.set_from(transform);
        Ok(())
    }

    /// Refine the transformation against a new frame.
    pub fn update_track(
        &mut self,
        next: &GrayImageView<'_>,
        params: &LkUpdateParams,
    ) -> TrackResult<LkTrackReport> {
        if !self.is_valid() {
            return Err(TrackError::InvalidObject("tracker is not initialized"));
        }
        if next.width != self.image_width || next.height != self.image_height {
            return Err(TrackError::InvalidSize(
                "next image must match the template image size",
            ));
        }
        if params.max_iterations == 0 || params.max_iterations >= 1000 {
            return Err(TrackError::InvalidParameters(
                "max_iterations must be in 1..1000",
            ));
        }
        if !(params.convergence_tolerance > 0.0) {
            return Err(TrackError::InvalidParameters(
                "convergence_tolerance must be positive",
            ));
        }

        let mut converged = false;
        for level in (0..self.levels.len()).rev() {
            converged = self.refine_level(next, level, params, TransformKind::Translation)?;
            if self.kind != TransformKind::Translation {
                converged = self.refine_level(next, level, params, self.kind)?;
            }
        }

        let pixel = self.verify(next, params.verify_max_pixel_difference);
        Ok(LkTrackReport { converged, pixel })
    }

    fn refine_level(
        &mut self,
        next: &GrayImageView<'_>,
        level: usize,
        params: &LkUpdateParams,
        kind: TransformKind,
    ) -> TrackResult<bool> {
        match kind {
            TransformKind::Translation => self.refine_translation(next, level, params),
            TransformKind::Affine => self.refine_affine(next, level, params),
            TransformKind::Projective => self.refine_projective(next, level, params),
        }
    }

    /// Walk the level's grid, calling `visit(x, y, gx, gy, t)` for every
    /// in-bounds point with pre-scaled gradients and temporal difference.
    /// Returns the in-bounds count.
    fn accumulate_level(
        &self,
        next: &GrayImageView<'_>,
        level: usize,
        wp: &WarpParams,
        grad_scale: f32,
        mut visit: impl FnMut(f32, f32, f32, f32, f32),
    ) -> usize {
        const ONE_OVER_255: f32 = 1.0 / 255.0;
        let tpl = &self.levels[level];
        let nx = tpl.grid.xs.len;
        let mut in_bounds = 0usize;

        let mut y = tpl.grid.ys.start;
        for iy in 0..tpl.grid.ys.len {
            let row = &tpl.image.data[iy * nx..(iy + 1) * nx];
            let gx_row = &tpl.x_gradient.data[iy * nx..(iy + 1) * nx];
            let gy_row = &tpl.y_gradient.data[iy * nx..(iy + 1) * nx];

            let mut x = tpl.grid.xs.start;
            for ix in 0..nx {
                let (xt, yt) = wp.warp(x, y);
                if let Some(sampled) = sample_checked(next, xt, yt) {
                    in_bounds += 1;
                    let gx = grad_scale * gx_row[ix] as f32;
                    let gy = grad_scale * gy_row[ix] as f32;
                    let t = ONE_OVER_255 * (sampled - row[ix] as f32);
                    visit(x, y, gx, gy, t);
                }
                x += tpl.grid.xs.step;
            }
            y += tpl.grid.ys.step;
        }
        in_bounds
    }

    fn refine_translation(
        &mut self,
        next: &GrayImageView<'_>,
        level: usize,
        params: &LkUpdateParams,
    ) -> TrackResult<bool> {
        let scale = (1u32 << level) as f32;
        let grad_scale = scale / (2.0 * 255.0);
        let mut history = CornerHistory::new();

        for _ in 0..params.max_iterations {
            let wp = WarpParams::new(&self.transform, self.initial_scale);
            let mut ata = SMatrix::<f32, 2, 2>::zeros();
            let mut atb = SVector::<f32, 2>::zeros();

            let in_bounds = self.accumulate_level(next, level, &wp, grad_scale, |_, _, gx, gy, t| {
                let a = SVector::<f32, 2>::from([gx, gy]);
                ata += a * a.transpose();
                atb += a * t;
            });

            if in_bounds < MIN_IN_BOUNDS_SAMPLES {
                warn!("dense tracker: template drifted too far out of image");
                return Ok(false);
            }

            let Some(delta) = solve_spd2(ata, atb) else {
                warn!("dense tracker: translation solve failed numerically");
                return Ok(false);
            };

            self.transform
                .update(delta.as_slice(), self.initial_scale, Some(TransformKind::Translation))?;

            if history.update(&self.transform) < params.convergence_tolerance * scale {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn refine_affine(
        &mut self,
        next: &GrayImageView<'_>,
        level: usize,
        params: &LkUpdateParams,
    ) -> TrackResult<bool> {
        let scale = (1u32 << level) as f32;
        let grad_scale = scale / (2.0 * 255.0);
        let mut history = CornerHistory::new();

        for _ in 0..params.max_iterations {
            let wp = WarpParams::new(&self.transform, self.initial_scale);
            let mut ata = SMatrix::<f32, 6, 6>::zeros();
            let mut atb = SVector::<f32, 6>::zeros();

            let in_bounds = self.accumulate_level(next, level, &wp, grad_scale, |x, y, gx, gy, t| {
                let a = SVector::<f32, 6>::from([x * gx, y * gx, gx, x * gy, y * gy, gy]);
                ata += a * a.transpose();
                atb += a * t;
            });

            if in_bounds < MIN_IN_BOUNDS_SAMPLES {
                warn!("dense tracker: template drifted too far out of image");
                return Ok(false);
            }

            let Some(delta) = solve_spd6(ata, atb) else {
                warn!("dense tracker: affine solve failed numerically");
                return Ok(false);
            };

            self.transform
                .update(delta.as_slice(), self.initial_scale, Some(TransformKind::Affine))?;

            if history.update(&self.transform) < params.convergence_tolerance * scale {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn refine_projective(
        &mut self,
        next: &GrayImageView<'_>,
        level: usize,
        params: &LkUpdateParams,
    ) -> TrackResult<bool> {
        let scale = (1u32 << level) as f32;
        let grad_scale = scale / (2.0 * 255.0);
        let mut history = CornerHistory::new();

        for _ in 0..params.max_iterations {
            let wp = WarpParams::new(&self.transform, self.initial_scale);
            let mut ata = SMatrix::<f32, 8, 8>::zeros();
            let mut atb = SVector::<f32, 8>::zeros();

            let in_bounds = self.accumulate_level(next, level, &wp, grad_scale, |x, y, gx, gy, t| {
                let a = SVector::<f32, 8>::from([
                    x * gx,
                    y * gx,
                    gx,
                    x * gy,
                    y * gy,
                    gy,
                    -x * x * gx - x * y * gy,
                    -x * y * gx - y * y * gy,
                ]);
                ata += a * a.transpose();
                atb += a * t;
            });

            if in_bounds < MIN_IN_BOUNDS_SAMPLES {
                warn!("dense tracker: template drifted too far out of image");
                return Ok(false);
            }

            let Some(delta) = solve_spd8(ata, atb) else {
                warn!("dense tracker: projective solve failed numerically");
                return Ok(false);
            };

            self.transform
                .update(delta.as_slice(), self.initial_scale, Some(TransformKind::Projective))?;

            if history.update(&self.transform) < params.convergence_tolerance * scale {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Pixel-difference verification at the second-coarsest useful level.
    fn verify(&self, next: &GrayImageView<'_>, max_pixel_difference: u8) -> PixelVerification {
        let level = 1.min(self.levels.len() - 1);
        let tpl = &self.levels[level];
        let wp = WarpParams::new(&self.transform, self.initial_scale);

        let mut num_in_bounds = 0usize;
        let mut num_similar = 0usize;
        let mut total = 0i64;
        let nx = tpl.grid.xs.len;

        let mut y = tpl.grid.ys.start;
        for iy in 0..tpl.grid.ys.len {
            let mut x = tpl.grid.xs.start;
            for ix in 0..nx {
                let (xt, yt) = wp.warp(x, y);
                if let Some(sampled) = sample_checked(next, xt, yt) {
                    num_in_bounds += 1;
                    let difference =
                        (sampled.round() as i32 - tpl.image.data[iy * nx + ix] as i32).abs();
                    total += difference as i64;
                    if difference <= max_pixel_difference as i32 {
                        num_similar += 1;
                    }
                }
                x += tpl.grid.xs.step;
            }
            y += tpl.grid.ys.step;
        }

        PixelVerification {
            mean_absolute_difference: if num_in_bounds > 0 {
                (total / num_in_bounds as i64) as i32
            } else {
                i32::MAX
            },
            num_in_bounds,
            num_similar_pixels: num_similar,
        }
    }
}

/// Resample the template image over a zero-centered grid under a warp.
pub(crate) fn sample_template_grid(
    template: &GrayImageView<'_>,
    grid: &TemplateGrid,
    wp: &WarpParams,
) -> GrayImage {
    let mut out = GrayImage::new(grid.xs.len, grid.ys.len);
    let mut y = grid.ys.start;
    for iy in 0..grid.ys.len {
        let mut x = grid.xs.start;
        for ix in 0..grid.xs.len {
            let (xt, yt) = wp.warp(x, y);
            let v = sample_checked(template, xt, yt).unwrap_or(0.0);
            out.data[iy * grid.xs.len + ix] = v.clamp(0.0, 255.0).round() as u8;
            x += grid.xs.step;
        }
        y += grid.ys.step;
    }
    out
}

pub(crate) fn solve_spd2(
    ata: SMatrix<f32, 2, 2>,
    atb: SVector<f32, 2>,
) -> Option<SVector<f32, 2>> {
    let chol = nalgebra::linalg::Cholesky::new(ata)?;
    let s = chol.solve(&atb);
    s.iter().all(|v| v.is_finite()).then_some(s)
}

pub(crate) fn solve_spd6(
    ata: SMatrix<f32, 6, 6>,
    atb: SVector<f32, 6>,
) -> Option<SVector<f32, 6>> {
    let chol = nalgebra::linalg::Cholesky::new(ata)?;
    let s = chol.solve(&atb);
    s.iter().all(|v| v.is_finite()).then_some(s)
}

pub(crate) fn solve_spd8(
    ata: SMatrix<f32, 8, 8>,
    atb: SVector<f32, 8>,
) -> Option<SVector<f32, 8>> {
    let chol = nalgebra::linalg::Cholesky::new(ata)?;
    let s = chol.solve(&atb);
    s.iter().all(|v| v.is_finite()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

    /// Smooth pattern with gradients everywhere; `dx`/`dy` shift it.
    fn wavy_image(width: usize, height: usize, dx: f32, dy: f32) -> GrayImage {
        let mut img = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let fx = x as f32 - dx;
                let fy = y as f32 - dy;
                let v = 128.0 + 55.0 * (fx * 0.23).sin() * (fy * 0.19).cos()
                    + 40.0 * (fx * 0.07).cos();
                img.data[y * width + x] = v.clamp(0.0, 255.0) as u8;
            }
        }
        img
    }

    /// Quad in base-resolution coordinates for a box given at tracking
    /// resolution.
    fn base_quad(left: f32, top: f32, right: f32, bottom: f32, scale: f32) -> Quad {
        Quad::from_arrays([
            [left * scale, top * scale],
            [right * scale, top * scale],
            [right * scale, bottom * scale],
            [left * scale, bottom * scale],
        ])
    }

    #[test]
    fn init_builds_pyramid_levels() {
        let template = wavy_image(80, 60, 0.0, 0.0);
        let quad = base_quad(20.0, 14.0, 60.0, 46.0, 4.0);
        let params = DenseTrackerParams {
            num_pyramid_levels: 3,
            ..DenseTrackerParams::default()
        };
        let tracker = DenseTracker::new(&template.view(), &quad, &params).unwrap();
        assert!(tracker.is_valid());
        assert_eq!(tracker.num_pyramid_levels(), 3);
        assert_eq!(tracker.levels[0].grid.xs.len, 41);
        assert_eq!(tracker.levels[1].grid.xs.len, 20);
        assert_eq!(tracker.levels[2].grid.xs.len, 10);
    }

    #[test]
    fn rejects_non_base_aligned_widths() {
        let template = wavy_image(100, 60, 0.0, 0.0);
        let quad = base_quad(20.0, 14.0, 60.0, 46.0, 1.0);
        assert!(matches!(
            DenseTracker::new(&template.view(), &quad, &DenseTrackerParams::default()),
            Err(TrackError::InvalidSize(_))
        ));
    }

    #[test]
    fn translation_tracker_recovers_integer_shift() {
        let template = wavy_image(80, 60, 0.0, 0.0);
        let next = wavy_image(80, 60, 2.0, 1.0);
        let quad = base_quad(20.0, 14.0, 60.0, 46.0, 4.0);
        let params = DenseTrackerParams {
            num_pyramid_levels: 2,
            transform_kind: TransformKind::Translation,
            template_region_scale: 1.0,
        };
        let mut tracker = DenseTracker::new(&template.view(), &quad, &params).unwrap();

        let report = tracker
            .update_track(&next.view(), &LkUpdateParams::default())
            .unwrap();

        assert!(report.converged);
        // Tracking-resolution point (40, 30) should land on (42, 31).
        let p = tracker
            .transformation()
            .transform_point(Point2::new(40.0, 30.0), 4.0);
        assert!((p.x - 42.0).abs() < 0.25, "x = {}", p.x);
        assert!((p.y - 31.0).abs() < 0.25, "y = {}", p.y);
        assert!(report.pixel.num_in_bounds > 0);
        assert!(report.pixel.mean_absolute_difference <= 10);
    }

    #[test]
    fn projective_tracker_follows_translation_too() {
        let template = wavy_image(80, 60, 0.0, 0.0);
        let next = wavy_image(80, 60, 1.0, 2.0);
        let quad = base_quad(20.0, 14.0, 60.0, 46.0, 4.0);
        let params = DenseTrackerParams {
            num_pyramid_levels: 2,
            transform_kind: TransformKind::Projective,
            template_region_scale: 1.0,
        };
        let mut tracker = DenseTracker::new(&template.view(), &quad, &params).unwrap();

        let report = tracker
            .update_track(&next.view(), &LkUpdateParams::default())
            .unwrap();

        let p = tracker
            .transformation()
            .transform_point(Point2::new(40.0, 30.0), 4.0);
        assert!((p.x - 41.0).abs() < 0.35, "x = {}", p.x);
        assert!((p.y - 32.0).abs() < 0.35, "y = {}", p.y);
        assert!((tracker.transformation().homography()[(2, 2)] - 1.0).abs() < 1e-5);
        assert!(report.pixel.mean_absolute_difference <= 12);
    }

    #[test]
    fn far_drift_aborts_without_touching_the_transform() {
        let template = wavy_image(80, 60, 0.0, 0.0);
        let quad = base_quad(20.0, 14.0, 60.0, 46.0, 4.0);
        let mut tracker =
            DenseTracker::new(&template.view(), &quad, &DenseTrackerParams::default()).unwrap();

        let mut lost = tracker.transformation();
        lost.update(&[-5000.0, -5000.0], 1.0, Some(TransformKind::Translation))
            .unwrap();
        tracker.set_transformation(&lost).unwrap();
        let before = tracker.transformation().homography().clone_owned();

        let report = tracker
            .update_track(&template.view(), &LkUpdateParams::default())
            .unwrap();
        assert!(!report.converged);
        assert_eq!(tracker.transformation().homography(), &before);
        assert_eq!(report.pixel.num_similar_pixels, 0);
    }

    #[test]
    fn update_rejects_bad_parameters() {
        let template = wavy_image(80, 60, 0.0, 0.0);
        let quad = base_quad(20.0, 14.0, 60.0, 46.0, 4.0);
        let mut tracker =
            DenseTracker::new(&template.view(), &quad, &DenseTrackerParams::default()).unwrap();

        let mut params = LkUpdateParams::default();
        params.max_iterations = 0;
        assert!(tracker.update_track(&template.view(), &params).is_err());

        let smaller = wavy_image(40, 30, 0.0, 0.0);
        assert!(matches!(
            tracker.update_track(&smaller.view(), &LkUpdateParams::default()),
            Err(TrackError::InvalidSize(_))
        ));
    }
}
