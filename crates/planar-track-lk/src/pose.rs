//! Planar 6-DoF pose tracking.
//!
//! A sampled tracker whose updates live in pose space (three rotations,
//! three translations) instead of the 8-parameter homography space. The
//! pose is bootstrapped from the marker's known metric width and the
//! camera intrinsics; per-frame fits subtract a solved 6-vector delta from
//! the pose and rebuild the homography from the new rotation and
//! translation. The transformation's center offset is the camera
//! calibration center, and the initial (model) points are already
//! zero-centered, so no re-centering is applied to them.

use log::warn;
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use planar_track_core::{
    homography_from_4pt, initial_image_scale, GrayImageView, PixelVerification, PlanarTransform,
    Quad, TrackError, TrackResult, TransformKind,
};
use serde::{Deserialize, Serialize};

use crate::common::{level_grid, sample_checked, CornerHistory, MIN_IN_BOUNDS_SAMPLES};
use crate::dense::{solve_spd2, solve_spd6, LkTrackReport, LkUpdateParams};
use crate::sampled::{select_level_samples, TemplateSample};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    pub focal_x: f32,
    pub focal_y: f32,
    pub center_x: f32,
    pub center_y: f32,
}

/// Euler angles plus translation, millimeters and radians.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanarPose {
    pub angle_x: f32,
    pub angle_y: f32,
    pub angle_z: f32,
    pub translation: Vector3<f32>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Planar6dofParams {
    pub num_pyramid_levels: usize,
    pub template_region_scale: f32,
    pub max_samples_at_base_level: usize,
    pub num_select_bins: usize,
    /// Physical side length of the tracked marker.
    pub template_width_mm: f32,
}

impl Default for Planar6dofParams {
    fn default() -> Self {
        Self {
            num_pyramid_levels: 3,
            template_region_scale: 0.9,
            max_samples_at_base_level: 500,
            num_select_bins: 20,
            template_width_mm: 25.0,
        }
    }
}

/// Rotation matrix for the tracker's Euler convention (`r31 = sin(ay)`).
pub(crate) fn rotation_from_euler(ax: f32, ay: f32, az: f32) -> Matrix3<f32> {
    let (sx, cx) = ax.sin_cos();
    let (sy, cy) = ay.sin_cos();
    let (sz, cz) = az.sin_cos();
    Matrix3::new(
        cy * cz,
        cx * sz + sx * sy * cz,
        sx * sz - cx * sy * cz,
        -cy * sz,
        cx * cz - sx * sy * sz,
        sx * cz + cx * sy * sz,
        sy,
        -sx * cy,
        cx * cy,
    )
}

/// Extract Euler angles from a rotation matrix, guarding the gimbal case.
pub(crate) fn euler_from_rotation(r: &Matrix3<f32>) -> (f32, f32, f32) {
    if (1.0 - r[(2, 0)].abs()) < 1e-6 {
        let angle_z = 0.0;
        if r[(2, 0)] > 0.0 {
            let angle_y = std::f32::consts::FRAC_PI_2;
            let angle_x = r[(0, 1)].atan2(r[(1, 1)]);
            (angle_x, angle_y, angle_z)
        } else {
            let angle_y = -std::f32::consts::FRAC_PI_2;
            let angle_x = (-r[(0, 1)]).atan2(r[(1, 1)]);
            (angle_x, angle_y, angle_z)
        }
    } else {
        let angle_y = r[(2, 0)].asin();
        let inv_cy = 1.0 / angle_y.cos();
        let angle_x = (-r[(2, 1)] * inv_cy).atan2(r[(2, 2)] * inv_cy);
        let angle_z = (-r[(1, 0)] * inv_cy).atan2(r[(0, 0)] * inv_cy);
        (angle_x, angle_y, angle_z)
    }
}

/// Homography induced by a planar pose under pinhole intrinsics. Not
/// normalized: the bottom-right entry is the z translation.
pub(crate) fn homography_from_pose(
    r: &Matrix3<f32>,
    t: &Vector3<f32>,
    k: &CameraIntrinsics,
) -> Matrix3<f32> {
    Matrix3::new(
        k.focal_x * r[(0, 0)],
        k.focal_x * r[(0, 1)],
        k.focal_x * t.x,
        k.focal_y * r[(1, 0)],
        k.focal_y * r[(1, 1)],
        k.focal_y * t.y,
        r[(2, 0)],
        r[(2, 1)],
        t.z,
    )
}

/// Recover the pose of a planar square of half width `half_width_mm` from
/// its image quadrilateral.
///
/// The metric-plane homography is factored through the inverse intrinsics;
/// the first two columns give the rotation (orthonormalized through an
/// SVD), the third the translation, with the sign fixed so the marker lies
/// in front of the camera.
pub fn pose_from_quad(
    quad: &Quad,
    half_width_mm: f32,
    k: &CameraIntrinsics,
) -> TrackResult<(Matrix3<f32>, Vector3<f32>)> {
    if !(half_width_mm > 0.0) {
        return Err(TrackError::InvalidParameters("half width must be positive"));
    }
    let h = half_width_mm;
    let metric = [
        Point2::new(-h, -h),
        Point2::new(h, -h),
        Point2::new(h, h),
        Point2::new(-h, h),
    ];
    let centered = quad
        .corners
        .map(|c| Point2::new(c.x - k.center_x, c.y - k.center_y));

    let Some(hom) = homography_from_4pt(&metric, &centered) else {
        return Err(TrackError::InvalidParameters(
            "degenerate quadrilateral for pose recovery",
        ));
    };

    // Remove the intrinsics: Hm = K^-1 * H.
    let mut hm = hom;
    for col in 0..3 {
        hm[(0, col)] /= k.focal_x;
        hm[(1, col)] /= k.focal_y;
    }

    let h1 = hm.column(0).into_owned();
    let h2 = hm.column(1).into_owned();
    let h3 = hm.column(2).into_owned();

    let norm_sum = h1.norm() + h2.norm();
    if norm_sum < 1e-12 {
        return Err(TrackError::InvalidParameters(
            "degenerate quadrilateral for pose recovery",
        ));
    }
    let mut lambda = 2.0 / norm_sum;
    if h3.z * lambda < 0.0 {
        lambda = -lambda;
    }

    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let t = h3 * lambda;
    let r3 = r1.cross(&r2);

    let raw = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = raw.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(TrackError::InvalidParameters(
            "rotation orthonormalization failed",
        ));
    };
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        r = u * Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, -1.0)) * v_t;
    }

    Ok((r, t))
}

/// A template sample with its pose-space Jacobian folded in at init.
#[derive(Clone, Copy, Debug)]
struct PoseSample {
    base: TemplateSample,
    /// Gradient-weighted warp partials wrt (ax, ay, az, tx, ty, tz),
    /// evaluated at the initial pose.
    jacobian: [f32; 6],
}

pub struct Planar6dofTracker {
    samples: Vec<Vec<PoseSample>>,
    transform: PlanarTransform,
    intrinsics: CameraIntrinsics,
    pose: PlanarPose,
    image_width: usize,
    image_height: usize,
    initial_scale: f32,
    valid: bool,
}

impl Planar6dofTracker {
    pub fn new(
        template: &GrayImageView<'_>,
        quad: &Quad,
        intrinsics: &CameraIntrinsics,
        params: &Planar6dofParams,
    ) -> TrackResult<Self> {
        if template.width == 0 || template.height == 0 {
            return Err(TrackError::InvalidSize("template image is empty"));
        }
        if params.num_pyramid_levels == 0 || params.num_pyramid_levels > 8 {
            return Err(TrackError::InvalidParameters(
                "num_pyramid_levels must be in 1..=8",
            ));
        }
        if !(params.template_width_mm > 0.0) {
            return Err(TrackError::InvalidParameters(
                "template_width_mm must be positive",
            ));
        }
        let initial_scale = initial_image_scale(template.width)?;

        let half_width = params.template_width_mm * 0.5;
        let (r, t) = pose_from_quad(quad, half_width, intrinsics)?;
        let (angle_x, angle_y, angle_z) = euler_from_rotation(&r);
        let pose = PlanarPose {
            angle_x,
            angle_y,
            angle_z,
            translation: t,
        };

        let pose_h = homography_from_pose(&r, &t, intrinsics);
        if pose_h[(2, 2)].abs() < 1e-9 {
            return Err(TrackError::InvalidParameters(
                "recovered pose has zero depth",
            ));
        }

        // The initial corners are the 3D plane corners; the transformation
        // maps them straight into the image around the calibration center.
        let model_quad = Quad::from_arrays([
            [-half_width, -half_width],
            [half_width, -half_width],
            [half_width, half_width],
            [-half_width, half_width],
        ]);
        let mut transform = PlanarTransform::with_homography(
            TransformKind::Projective,
            model_quad,
            pose_h / pose_h[(2, 2)],
            Point2::new(intrinsics.center_x, intrinsics.center_y),
        )?;
        transform.set_initial_points_zero_centered(true);

        // Rotation partials at the initial angles, evaluated once.
        let partials = RotationPartials::at(angle_x, angle_y, angle_z);

        // Region extent in tracking pixels picks the sample density; the
        // sample coordinates themselves stay in the metric plane.
        let mut region = quad.bounding_rect().scaled(params.template_region_scale);
        region.left /= initial_scale;
        region.right /= initial_scale;
        region.top /= initial_scale;
        region.bottom /= initial_scale;
        let region_width = region.width() + 1.0;
        let region_height = region.height() + 1.0;
        let model_half = params.template_region_scale * half_width;

        let mut samples = Vec::with_capacity(params.num_pyramid_levels);
        for level in 0..params.num_pyramid_levels {
            let scale = (1u32 << level) as f32;
            let pixel_grid = level_grid(region_width, region_height, scale);
            let mut grid = pixel_grid;
            grid.xs = crate::common::linspace(-model_half, model_half, pixel_grid.xs.len);
            grid.ys = crate::common::linspace(-model_half, model_half, pixel_grid.ys.len);

            let budget = (params.max_samples_at_base_level >> level)
                .min(grid.xs.len * grid.ys.len)
                .max(1);

            let warp = model_warp(&pose_h, intrinsics, initial_scale);
            let base_samples =
                select_level_samples(template, &grid, warp, budget, params.num_select_bins);
            if base_samples.is_empty() {
                return Err(TrackError::InvalidObject(
                    "no template samples selected; template has no gradient",
                ));
            }

            let level_samples = base_samples
                .into_iter()
                .map(|s| PoseSample {
                    jacobian: pose_jacobian(&s, &pose_h, intrinsics, &partials),
                    base: s,
                })
                .collect();
            samples.push(level_samples);
        }

        Ok(Self {
            samples,
            transform,
            intrinsics: *intrinsics,
            pose,
            image_width: template.width,
            image_height: template.height,
            initial_scale,
            valid: true,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.transform.is_valid()
    }

    pub fn pose(&self) -> PlanarPose {
        self.pose
    }

    pub fn transformation(&self) -> PlanarTransform {
        self.transform.clone()
    }

    pub fn num_template_samples(&self, level: usize) -> usize {
        self.samples.get(level).map_or(0, Vec::len)
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
            converged = self.refine_translation(next, level, params)?;
            converged = self.refine_pose(next, level, params)?;
        }

        let pixel = self.verify(next, params.verify_max_pixel_difference);
        Ok(LkTrackReport { converged, pixel })
    }

    /// The affine parameterization has no sensible meaning in pose space.
    pub fn refine_affine(&mut self) -> TrackResult<()> {
        Err(TrackError::InvalidParameters(
            "affine refinement is unsupported for the planar 6-DoF tracker",
        ))
    }

    fn current_warp(&self, scale_inv: f32) -> impl Fn(f32, f32) -> (f32, f32) {
        let h = *self.transform.homography();
        let cx = self.intrinsics.center_x;
        let cy = self.intrinsics.center_y;
        move |x: f32, y: f32| {
            let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
            let u = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w + cx;
            let v = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w + cy;
            (u * scale_inv, v * scale_inv)
        }
    }

    /// Fold the transform's translation column back into the pose.
    ///
    /// The translation refinement adjusts the homography directly; the
    /// pose refinement rebuilds the homography from `self.pose`, so the
    /// two must agree or the rebuild would revert the coarse alignment.
    /// With the normalized homography, `h02 = fx * tx / tz` (and the y
    /// analogue), which inverts exactly.
    fn sync_pose_translation(&mut self) {
        let h = self.transform.homography();
        let tz = self.pose.translation.z;
        self.pose.translation.x = h[(0, 2)] * tz / self.intrinsics.focal_x;
        self.pose.translation.y = h[(1, 2)] * tz / self.intrinsics.focal_y;
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
            let warp = self.current_warp(1.0 / self.initial_scale);
            let mut ata = SMatrix::<f32, 2, 2>::zeros();
            let mut atb = SVector::<f32, 2>::zeros();
            let mut in_bounds = 0usize;

            for s in &self.samples[level] {
                let (xt, yt) = warp(s.base.x, s.base.y);
                if let Some(sampled) = sample_checked(next, xt, yt) {
                    in_bounds += 1;
                    let gx = grad_scale * s.base.x_gradient;
                    let gy = grad_scale * s.base.y_gradient;
                    let t = (sampled - s.base.grayvalue) / 255.0;
                    let a = SVector::<f32, 2>::from([gx, gy]);
                    ata += a * a.transpose();
                    atb += a * t;
                }
            }

            if in_bounds < MIN_IN_BOUNDS_SAMPLES {
                warn!("planar 6dof tracker: template drifted too far out of image");
                return Ok(false);
            }

            let Some(delta) = solve_spd2(ata, atb) else {
                warn!("planar 6dof tracker: translation solve failed numerically");
                return Ok(false);
            };

            self.transform.update(
                delta.as_slice(),
                self.initial_scale,
                Some(TransformKind::Translation),
            )?;
            self.sync_pose_translation();

            if history.update(&self.transform) < params.convergence_tolerance * scale {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn refine_pose(
        &mut self,
        next: &GrayImageView<'_>,
        level: usize,
        params: &LkUpdateParams,
    ) -> TrackResult<bool> {
        let scale = (1u32 << level) as f32;
        let level_gain = scale / (2.0 * 255.0 * self.initial_scale);
        let mut history = CornerHistory::new();

        for _ in 0..params.max_iterations {
            let warp = self.current_warp(1.0 / self.initial_scale);
            let mut ata = SMatrix::<f32, 6, 6>::zeros();
            let mut atb = SVector::<f32, 6>::zeros();
            let mut in_bounds = 0usize;

            for s in &self.samples[level] {
                let (xt, yt) = warp(s.base.x, s.base.y);
                if let Some(sampled) = sample_checked(next, xt, yt) {
                    in_bounds += 1;
                    let t = (sampled - s.base.grayvalue) / 255.0;
                    let a = SVector::<f32, 6>::from(s.jacobian) * level_gain;
                    ata += a * a.transpose();
                    atb += a * t;
                }
            }

            if in_bounds < MIN_IN_BOUNDS_SAMPLES {
                warn!("planar 6dof tracker: template drifted too far out of image");
                return Ok(false);
            }

            let Some(delta) = solve_spd6(ata, atb) else {
                warn!("planar 6dof tracker: pose solve failed numerically");
                return Ok(false);
            };

            // Inverse compositional: subtract the solved delta.
            self.pose.angle_x -= delta[0];
            self.pose.angle_y -= delta[1];
            self.pose.angle_z -= delta[2];
            self.pose.translation.x -= delta[3];
            self.pose.translation.y -= delta[4];
            self.pose.translation.z -= delta[5];

            let r = rotation_from_euler(self.pose.angle_x, self.pose.angle_y, self.pose.angle_z);
            let pose_h = homography_from_pose(&r, &self.pose.translation, &self.intrinsics);
            if pose_h[(2, 2)].abs() < 1e-9 || !pose_h.iter().all(|v| v.is_finite()) {
                warn!("planar 6dof tracker: updated pose is degenerate, keeping transform");
                return Ok(false);
            }
            self.transform.set_homography(&(pose_h / pose_h[(2, 2)]))?;

            if history.update(&self.transform) < params.convergence_tolerance * scale {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn verify(&self, next: &GrayImageView<'_>, max_pixel_difference: u8) -> PixelVerification {
        let level = 1.min(self.samples.len() - 1);
        let warp = self.current_warp(1.0 / self.initial_scale);

        let mut num_in_bounds = 0usize;
        let mut num_similar = 0usize;
        let mut total = 0i64;

        for s in &self.samples[level] {
            let (xt, yt) = warp(s.base.x, s.base.y);
            if let Some(sampled) = sample_checked(next, xt, yt) {
                num_in_bounds += 1;
                let difference = (sampled.round() as i32 - s.base.grayvalue.round() as i32).abs();
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

/// Warp metric-plane coordinates into tracking-resolution pixels through
/// an (unnormalized) pose homography.
fn model_warp(
    pose_h: &Matrix3<f32>,
    k: &CameraIntrinsics,
    initial_scale: f32,
) -> impl Fn(f32, f32) -> (f32, f32) {
    let h = *pose_h;
    let cx = k.center_x;
    let cy = k.center_y;
    let inv_s = 1.0 / initial_scale;
    move |x: f32, y: f32| {
        let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
        let u = (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w + cx;
        let v = (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w + cy;
        (u * inv_s, v * inv_s)
    }
}

/// Partial derivatives of the rotation entries wrt each Euler angle,
/// matching [`rotation_from_euler`].
struct RotationPartials {
    dr11: [f32; 3],
    dr12: [f32; 3],
    dr21: [f32; 3],
    dr22: [f32; 3],
    dr31: [f32; 3],
    dr32: [f32; 3],
}

impl RotationPartials {
    fn at(ax: f32, ay: f32, az: f32) -> Self {
        let (sx, cx) = ax.sin_cos();
        let (sy, cy) = ay.sin_cos();
        let (sz, cz) = az.sin_cos();
        Self {
            dr11: [0.0, -sy * cz, -cy * sz],
            dr12: [
                -sx * sz + cx * sy * cz,
                sx * cy * cz,
                cx * cz - sx * sy * sz,
            ],
            dr21: [0.0, sy * sz, -cy * cz],
            dr22: [
                -sx * cz - cx * sy * sz,
                -sx * cy * sz,
                -cx * sz - sx * sy * cz,
            ],
            dr31: [0.0, cy, 0.0],
            dr32: [-cx * cy, sx * sy, 0.0],
        }
    }
}

/// Gradient-weighted warp partials for one sample at the initial pose.
fn pose_jacobian(
    s: &TemplateSample,
    pose_h: &Matrix3<f32>,
    k: &CameraIntrinsics,
    p: &RotationPartials,
) -> [f32; 6] {
    let x = s.x;
    let y = s.y;

    let raw_u = pose_h[(0, 0)] * x + pose_h[(0, 1)] * y + pose_h[(0, 2)];
    let raw_v = pose_h[(1, 0)] * x + pose_h[(1, 1)] * y + pose_h[(1, 2)];
    let norm = pose_h[(2, 0)] * x + pose_h[(2, 1)] * y + pose_h[(2, 2)];
    let inv_norm = 1.0 / norm;
    let inv_norm_sq = inv_norm * inv_norm;

    let du_dtx = k.focal_x * inv_norm;
    let dv_dty = k.focal_y * inv_norm;
    let du_dtz = -raw_u * inv_norm_sq;
    let dv_dtz = -raw_v * inv_norm_sq;

    let mut jacobian = [0.0f32; 6];
    for angle in 0..3 {
        let du = (k.focal_x * norm * (p.dr11[angle] * x + p.dr12[angle] * y)
            - (p.dr31[angle] * x + p.dr32[angle] * y) * raw_u)
            * inv_norm_sq;
        let dv = (k.focal_y * norm * (p.dr21[angle] * x + p.dr22[angle] * y)
            - (p.dr31[angle] * x + p.dr32[angle] * y) * raw_v)
            * inv_norm_sq;
        jacobian[angle] = s.x_gradient * du + s.y_gradient * dv;
    }
    jacobian[3] = s.x_gradient * du_dtx;
    jacobian[4] = s.y_gradient * dv_dty;
    jacobian[5] = s.x_gradient * du_dtz + s.y_gradient * dv_dtz;

    jacobian
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use planar_track_core::GrayImage;

    fn test_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            focal_x: 290.0,
            focal_y: 290.0,
            center_x: 160.0,
            center_y: 120.0,
        }
    }

    #[test]
    fn euler_round_trips_through_rotation() {
        let (ax, ay, az) = (0.12f32, -0.08, 0.3);
        let r = rotation_from_euler(ax, ay, az);
        assert_relative_eq!(r.determinant(), 1.0, epsilon = 1e-5);
        let (bx, by, bz) = euler_from_rotation(&r);
        assert_relative_eq!(ax, bx, epsilon = 1e-5);
        assert_relative_eq!(ay, by, epsilon = 1e-5);
        assert_relative_eq!(az, bz, epsilon = 1e-5);
    }

    #[test]
    fn pose_recovery_from_projected_quad() {
        let k = test_intrinsics();
        let truth_r = rotation_from_euler(0.1, -0.05, 0.2);
        let truth_t = Vector3::new(4.0, -2.0, 180.0);
        let h = homography_from_pose(&truth_r, &truth_t, &k);

        let half = 12.5f32;
        let metric = [[-half, -half], [half, -half], [half, half], [-half, half]];
        let corners = metric.map(|m| {
            let w = h[(2, 0)] * m[0] + h[(2, 1)] * m[1] + h[(2, 2)];
            [
                (h[(0, 0)] * m[0] + h[(0, 1)] * m[1] + h[(0, 2)]) / w + k.center_x,
                (h[(1, 0)] * m[0] + h[(1, 1)] * m[1] + h[(1, 2)]) / w + k.center_y,
            ]
        });
        let quad = Quad::from_arrays(corners);

        let (r, t) = pose_from_quad(&quad, half, &k).unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(r[(i, j)], truth_r[(i, j)], epsilon = 1e-2);
            }
        }
        assert_relative_eq!(t.x, truth_t.x, epsilon = 0.5);
        assert_relative_eq!(t.y, truth_t.y, epsilon = 0.5);
        assert_relative_eq!(t.z, truth_t.z, epsilon = 1.0);
    }

    /// Smooth textured scene; `dx`/`dy` shift it.
    fn textured_image(dx: f32, dy: f32) -> GrayImage {
        let mut img = GrayImage::new(320, 240);
        for y in 0..240 {
            for x in 0..320 {
                let fx = x as f32 - dx;
                let fy = y as f32 - dy;
                let v = 128.0 + 50.0 * (fx * 0.11).sin() * (fy * 0.13).cos()
                    + 30.0 * (fx * 0.031).cos();
                img.data[y * 320 + x] = v.clamp(0.0, 255.0) as u8;
            }
        }
        img
    }

    fn frontal_quad() -> Quad {
        // A frontal marker centered slightly off the principal point.
        Quad::from_arrays([
            [130.0, 90.0],
            [200.0, 90.0],
            [200.0, 160.0],
            [130.0, 160.0],
        ])
    }

    #[test]
    fn tracker_initializes_with_plausible_depth() {
        let img = textured_image(0.0, 0.0);
        let tracker = Planar6dofTracker::new(
            &img.view(),
            &frontal_quad(),
            &test_intrinsics(),
            &Planar6dofParams::default(),
        )
        .unwrap();
        assert!(tracker.is_valid());
        // 25mm marker spanning ~70px at f=290 sits around 100mm away.
        let depth = tracker.pose().translation.z;
        assert!(depth > 60.0 && depth < 160.0, "depth = {depth}");
        assert!((tracker.transformation().homography()[(2, 2)] - 1.0).abs() < 1e-5);
        assert!(tracker.transformation().initial_points_zero_centered());
        assert!(tracker.num_template_samples(0) > 0);
    }

    #[test]
    fn update_on_same_frame_keeps_the_pose() {
        let img = textured_image(0.0, 0.0);
        let mut tracker = Planar6dofTracker::new(
            &img.view(),
            &frontal_quad(),
            &test_intrinsics(),
            &Planar6dofParams::default(),
        )
        .unwrap();
        let pose_before = tracker.pose();

        let report = tracker
            .update_track(&img.view(), &LkUpdateParams::default())
            .unwrap();

        let pose_after = tracker.pose();
        assert_relative_eq!(pose_before.angle_x, pose_after.angle_x, epsilon = 1e-2);
        assert_relative_eq!(pose_before.angle_y, pose_after.angle_y, epsilon = 1e-2);
        assert_relative_eq!(
            pose_before.translation.z,
            pose_after.translation.z,
            epsilon = 2.0
        );
        assert!(report.pixel.mean_absolute_difference <= 10);
    }

    #[test]
    fn update_follows_a_translated_frame() {
        let seed = textured_image(0.0, 0.0);
        // Same scene shifted right 3, down 2: the coarse translation pass
        // and the pose refit must compose instead of undoing each other.
        let next = textured_image(3.0, 2.0);
        let mut tracker = Planar6dofTracker::new(
            &seed.view(),
            &frontal_quad(),
            &test_intrinsics(),
            &Planar6dofParams::default(),
        )
        .unwrap();
        let depth_before = tracker.pose().translation.z;

        // Projected marker center (the model origin) before and after.
        let before = tracker
            .transformation()
            .transform_point(Point2::new(0.0, 0.0), 1.0);
        let report = tracker
            .update_track(&next.view(), &LkUpdateParams::default())
            .unwrap();
        let after = tracker
            .transformation()
            .transform_point(Point2::new(0.0, 0.0), 1.0);

        assert!(
            (after.x - before.x - 3.0).abs() < 0.7,
            "center shift x = {}",
            after.x - before.x
        );
        assert!(
            (after.y - before.y - 2.0).abs() < 0.7,
            "center shift y = {}",
            after.y - before.y
        );
        // The aligned texture verifies, and the depth stays plausible.
        assert!(report.pixel.mean_absolute_difference <= 12);
        assert!((tracker.pose().translation.z - depth_before).abs() < 15.0);
        // The rebuilt homography agrees with the pose's translation.
        let h = tracker.transformation().homography().clone_owned();
        let pose = tracker.pose();
        assert_relative_eq!(
            h[(0, 2)],
            test_intrinsics().focal_x * pose.translation.x / pose.translation.z,
            epsilon = 1e-3
        );
    }

    #[test]
    fn affine_refinement_is_unsupported() {
        let img = textured_image(0.0, 0.0);
        let mut tracker = Planar6dofTracker::new(
            &img.view(),
            &frontal_quad(),
            &test_intrinsics(),
            &Planar6dofParams::default(),
        )
        .unwrap();
        assert!(matches!(
            tracker.refine_affine(),
            Err(TrackError::InvalidParameters(_))
        ));
    }
}
