//! Sampled Lucas-Kanade tracking: the template is reduced once at init to
//! its highest-gradient points, and only those samples are revisited per
//! frame.

use log::warn;
use nalgebra::{SMatrix, SVector};
use planar_track_core::{
    initial_image_scale, x_gradient_f32, y_gradient_f32, GrayImageView, ImageF32,
    PixelVerification, PlanarTransform, Quad, TrackError, TrackResult, TransformKind,
};
use serde::{Deserialize, Serialize};

use crate::common::{
    level_grid, sample_checked, CornerHistory, TemplateGrid, WarpParams, MIN_IN_BOUNDS_SAMPLES,
};
use crate::dense::{solve_spd2, solve_spd6, solve_spd8, LkTrackReport, LkUpdateParams};

/// One preselected template point with its appearance and gradients.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateSample {
    /// Zero-centered template x coordinate.
    pub x: f32,
    /// Zero-centered template y coordinate.
    pub y: f32,
    pub grayvalue: f32,
    pub x_gradient: f32,
    pub y_gradient: f32,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SampledTrackerParams {
    pub num_pyramid_levels: usize,
    pub transform_kind: TransformKind,
    pub template_region_scale: f32,
    /// Sample budget at the finest level; halves per level up.
    pub max_samples_at_base_level: usize,
    /// Bins for the approximate top-K threshold sweep.
    pub num_select_bins: usize,
}

impl Default for SampledTrackerParams {
    fn default() -> Self {
        Self {
            num_pyramid_levels: 3,
            transform_kind: TransformKind::Projective,
            template_region_scale: 1.0,
            max_samples_at_base_level: 500,
            num_select_bins: 20,
        }
    }
}

/// Approximate top-K selection by squared magnitude.
///
/// Sweeps `num_bins` evenly spaced thresholds from zero and keeps the
/// smallest one whose above-count fits the budget, then collects the
/// surviving indexes in scan order. O(num_bins * N), no sort; downstream
/// use is ordering-insensitive.
pub fn approximate_select(magnitudes: &[f32], num_bins: usize, num_to_select: usize) -> Vec<u32> {
    let max_magnitude = magnitudes.iter().cloned().fold(0.0f32, f32::max);
    if max_magnitude <= 0.0 || num_bins == 0 {
        return Vec::new();
    }

    let increment = max_magnitude / num_bins as f32;
    let mut found = None;
    let mut threshold = 0.0f32;
    while threshold < max_magnitude {
        let above = magnitudes.iter().filter(|&&m| m > threshold).count();
        if above <= num_to_select {
            found = Some(threshold);
            break;
        }
        threshold += increment;
    }

    let Some(threshold) = found else {
        warn!("approximate_select: no threshold fits the budget");
        return Vec::new();
    };

    magnitudes
        .iter()
        .enumerate()
        .filter(|(_, &m)| m > threshold)
        .map(|(i, _)| i as u32)
        .collect()
}

pub struct SampledTracker {
    kind: TransformKind,
    samples: Vec<Vec<TemplateSample>>,
    transform: PlanarTransform,
    image_width: usize,
    image_height: usize,
    initial_scale: f32,
    valid: bool,
}

impl SampledTracker {
    pub fn new(
        template: &GrayImageView<'_>,
        quad: &Quad,
        params: &SampledTrackerParams,
    ) -> TrackResult<Self> {
        if template.width == 0 || template.height == 0 {
            return Err(TrackError::InvalidSize("template image is empty"));
        }
        if params.num_pyramid_levels == 0 || params.num_pyramid_levels > 8 {
            return Err(TrackError::InvalidParameters(
                "num_pyramid_levels must be in 1..=8",
            ));
        }
        if params.max_samples_at_base_level == 0 {
            return Err(TrackError::InvalidParameters(
                "max_samples_at_base_level must be positive",
            ));
        }
        let initial_scale = initial_image_scale(template.width)?;

        let mut region = quad.bounding_rect().scaled(params.template_region_scale);
        region.left /= initial_scale;
        region.right /= initial_scale;
        region.top /= initial_scale;
        region.bottom /= initial_scale;
        let region_width = region.width() + 1.0;
        let region_height = region.height() + 1.0;

        let transform = PlanarTransform::new(params.transform_kind, *quad);
        let wp = WarpParams::new(&transform, initial_scale);

        let mut samples = Vec::with_capacity(params.num_pyramid_levels);
        for level in 0..params.num_pyramid_levels {
            let scale = (1u32 << level) as f32;
            let grid = level_grid(region_width, region_height, scale);
            let budget = (params.max_samples_at_base_level >> level)
                .min(grid.xs.len * grid.ys.len)
                .max(1);

            let level_samples = select_level_samples(
                template,
                &grid,
                |x, y| wp.warp(x, y),
                budget,
                params.num_select_bins,
            );
            if level_samples.is_empty() {
                return Err(TrackError::InvalidObject(
                    "no template samples selected; template has no gradient",
                ));
            }
            samples.push(level_samples);
        }

        Ok(Self {
            kind: params.transform_kind,
            samples,
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

    pub fn num_template_samples(&self, level: usize) -> usize {
        self.samples.get(level).map_or(0, Vec::len)
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

        let mut converged = false;
        for level in (0..self.samples.len()).rev() {
            converged = self.refine_level(next, level, params, TransformKind::Translation)?;
            if self.kind != TransformKind::Translation {
                converged = self.refine_level(next, level, params, self.kind)?;
            }
        }

        let pixel = self.verify(next, params.verify_max_pixel_difference);
        Ok(LkTrackReport { converged, pixel })
    }

    fn accumulate_samples(
        &self,
        next: &GrayImageView<'_>,
        level: usize,
        wp: &WarpParams,
        grad_scale: f32,
        mut visit: impl FnMut(f32, f32, f32, f32, f32),
    ) -> usize {
        const ONE_OVER_255: f32 = 1.0 / 255.0;
        let mut in_bounds = 0usize;
        for s in &self.samples[level] {
            let (xt, yt) = wp.warp(s.x, s.y);
            if let Some(sampled) = sample_checked(next, xt, yt) {
                in_bounds += 1;
                let gx = grad_scale * s.x_gradient;
                let gy = grad_scale * s.y_gradient;
                let t = ONE_OVER_255 * (sampled - s.grayvalue);
                visit(s.x, s.y, gx, gy, t);
            }
        }
        in_bounds
    }

    fn refine_level(
        &mut self,
        next: &GrayImageView<'_>,
        level: usize,
        params: &LkUpdateParams,
        kind: TransformKind,
    ) -> TrackResult<bool> {
        let scale = (1u32 << level) as f32;
        let grad_scale = scale / (2.0 * 255.0);
        let mut history = CornerHistory::new();

        for _ in 0..params.max_iterations {
            let wp = WarpParams::new(&self.transform, self.initial_scale);

            let delta: Vec<f32> = match kind {
                TransformKind::Translation => {
                    let mut ata = SMatrix::<f32, 2, 2>::zeros();
                    let mut atb = SVector::<f32, 2>::zeros();
                    let n = self.accumulate_samples(next, level, &wp, grad_scale, |_, _, gx, gy, t| {
                        let a = SVector::<f32, 2>::from([gx, gy]);
                        ata += a * a.transpose();
                        atb += a * t;
                    });
                    if n < MIN_IN_BOUNDS_SAMPLES {
                        warn!("sampled tracker: template drifted too far out of image");
                        return Ok(false);
                    }
                    match solve_spd2(ata, atb) {
                        Some(d) => d.as_slice().to_vec(),
                        None => {
                            warn!("sampled tracker: translation solve failed numerically");
                            return Ok(false);
                        }
                    }
                }
                TransformKind::Affine => {
                    let mut ata = SMatrix::<f32, 6, 6>::zeros();
                    let mut atb = SVector::<f32, 6>::zeros();
                    let n = self.accumulate_samples(next, level, &wp, grad_scale, |x, y, gx, gy, t| {
                        let a = SVector::<f32, 6>::from([x * gx, y * gx, gx, x * gy, y * gy, gy]);
                        ata += a * a.transpose();
                        atb += a * t;
                    });
                    if n < MIN_IN_BOUNDS_SAMPLES {
                        warn!("sampled tracker: template drifted too far out of image");
                        return Ok(false);
                    }
                    match solve_spd6(ata, atb) {
                        Some(d) => d.as_slice().to_vec(),
                        None => {
                            warn!("sampled tracker: affine solve failed numerically");
                            return Ok(false);
                        }
                    }
                }
                TransformKind::Projective => {
                    let mut ata = SMatrix::<f32, 8, 8>::zeros();
                    let mut atb = SVector::<f32, 8>::zeros();
                    let n = self.accumulate_samples(next, level, &wp, grad_scale, |x, y, gx, gy, t| {
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
                    if n < MIN_IN_BOUNDS_SAMPLES {
                        warn!("sampled tracker: template drifted too far out of image");
                        return Ok(false);
                    }
                    match solve_spd8(ata, atb) {
                        Some(d) => d.as_slice().to_vec(),
                        None => {
                            warn!("sampled tracker: projective solve failed numerically");
                            return Ok(false);
                        }
                    }
                }
            };

            self.transform
                .update(&delta, self.initial_scale, Some(kind))?;

            if history.update(&self.transform) < params.convergence_tolerance * scale {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn verify(&self, next: &GrayImageView<'_>, max_pixel_difference: u8) -> PixelVerification {
        let level = 1.min(self.samples.len() - 1);
        let wp = WarpParams::new(&self.transform, self.initial_scale);

        let mut num_in_bounds = 0usize;
        let mut num_similar = 0usize;
        let mut total = 0i64;

        for s in &self.samples[level] {
            let (xt, yt) = wp.warp(s.x, s.y);
            if let Some(sampled) = sample_checked(next, xt, yt) {
                num_in_bounds += 1;
                let difference = (sampled.round() as i32 - s.grayvalue.round() as i32).abs();
                total += difference as i64;
                if difference <= max_pixel_difference as i32 {
                    num_similar += 1;
                }
            }
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

/// Sample one level's grid as floats, compute gradients and squared
/// magnitudes, and keep the strongest points.
pub(crate) fn select_level_samples(
    template: &GrayImageView<'_>,
    grid: &TemplateGrid,
    warp: impl Fn(f32, f32) -> (f32, f32),
    budget: usize,
    num_bins: usize,
) -> Vec<TemplateSample> {
    let nx = grid.xs.len;
    let ny = grid.ys.len;

    let mut level_image = ImageF32::new(nx, ny);
    let mut y = grid.ys.start;
    for iy in 0..ny {
        let mut x = grid.xs.start;
        for ix in 0..nx {
            let (xt, yt) = warp(x, y);
            level_image.data[iy * nx + ix] = planar_track_core::sample_bilinear(template, xt, yt);
            x += grid.xs.step;
        }
        y += grid.ys.step;
    }

    let gx = x_gradient_f32(&level_image);
    let gy = y_gradient_f32(&level_image);

    let magnitudes: Vec<f32> = gx
        .data
        .iter()
        .zip(gy.data.iter())
        .map(|(&a, &b)| a * a + b * b)
        .collect();

    let indexes = approximate_select(&magnitudes, num_bins, budget);

    indexes
        .into_iter()
        .map(|idx| {
            let idx = idx as usize;
            let ix = idx % nx;
            let iy = idx / nx;
            TemplateSample {
                x: grid.xs.start + grid.xs.step * ix as f32,
                y: grid.ys.start + grid.ys.step * iy as f32,
                grayvalue: level_image.data[idx],
                x_gradient: gx.data[idx],
                y_gradient: gy.data[idx],
            }
        })
        .collect()
}
