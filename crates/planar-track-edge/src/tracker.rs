//! The edge-based planar template tracker.
//!
//! Tracks a quadrilateral template using sparse signed edge-crossing
//! points. Per frame: detect edges in the new image, build range indexes,
//! refine translation (one iteration, mean signed offset), refine the full
//! projective fit, verify. The axis-split correspondence search is the
//! structural core: a template point's candidates live on a single row or
//! column of the new image, found in constant per-query work through
//! [`AllIndexLimits`].

use log::warn;
use nalgebra::{Matrix3, Point2, SMatrix, SVector};
use planar_track_core::{
    grayvalue_threshold, round_half_down, verify_projective_pixels, Arena, GrayImage,
    GrayImageView, PixelVerification, PlanarTransform, Quad, Rect, TrackError, TrackResult,
    TransformKind,
};
use serde::{Deserialize, Serialize};

use crate::ransac::{refine_projective_ransac, RansacParams};
use crate::{detect_edges, AllIndexLimits, EdgeDetectionParams, EdgeLists, EdgePoint};

/// Percentile-window grayvalue threshold derivation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ThresholdParams {
    /// Histogram row subsampling.
    pub y_increment: usize,
    /// Histogram column subsampling.
    pub x_increment: usize,
    /// Percentile of histogram energy considered black.
    pub black_percentile: f32,
    /// Percentile of histogram energy considered white.
    pub white_percentile: f32,
    /// Scale applied to the quad bounding box before histogramming.
    pub region_scale: f32,
}

impl Default for ThresholdParams {
    fn default() -> Self {
        Self {
            y_increment: 4,
            x_increment: 4,
            black_percentile: 0.1,
            white_percentile: 0.9,
            region_scale: 0.8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeTrackerParams {
    pub edge: EdgeDetectionParams,
    pub threshold: ThresholdParams,
    /// Scale applied to the quad bounding box to pick the template region.
    pub template_region_scale: f32,
}

impl Default for EdgeTrackerParams {
    fn default() -> Self {
        Self {
            edge: EdgeDetectionParams::default(),
            threshold: ThresholdParams::default(),
            template_region_scale: 1.0,
        }
    }
}

/// Projective refinement strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RefineStrategy {
    /// Accumulate the normal equations directly during the search.
    Direct,
    /// Collect correspondences first, then accumulate. Slower, but gives a
    /// place to pre-filter.
    List { max_matches_per_type: usize },
    /// Robust sampling over the collected correspondences.
    Ransac(RansacParams),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeTrackerUpdateParams {
    /// Edge detection for the new frame; capacities are usually twice the
    /// template's because clutter is larger in a full frame.
    pub edge: EdgeDetectionParams,
    pub threshold: ThresholdParams,
    pub max_translation_distance: i32,
    pub max_projective_distance: i32,
    pub verification_distance: i32,
    pub strategy: RefineStrategy,
    pub verify_max_pixel_difference: u8,
    pub verify_coordinate_increment: usize,
}

impl Default for EdgeTrackerUpdateParams {
    fn default() -> Self {
        let mut edge = EdgeDetectionParams::default();
        edge.max_detections_per_type *= 2;
        Self {
            edge,
            threshold: ThresholdParams::default(),
            max_translation_distance: 7,
            max_projective_distance: 7,
            verification_distance: 2,
            strategy: RefineStrategy::Direct,
            verify_max_pixel_difference: 30,
            verify_coordinate_increment: 2,
        }
    }
}

/// Per-frame tracking report.
#[derive(Clone, Copy, Debug, Default)]
pub struct EdgeTrackReport {
    /// Template points with at least one matching new-image point within
    /// the verification distance.
    pub num_matched_points: usize,
    pub num_template_points: usize,
    /// Pixel-difference verification; absent when the tracker has no
    /// template image (for example after deserialization).
    pub pixel: Option<PixelVerification>,
}

/// A matched template/new-image point pair in the zero-centered frame.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Correspondence {
    pub template: Point2<f32>,
    pub matched: Point2<f32>,
}

/// Which image axis a correspondence list constrains.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Axis {
    X,
    Y,
}

pub struct EdgeTracker {
    template_edges: EdgeLists,
    template_image: Option<GrayImage>,
    template_region: Rect,
    transform: PlanarTransform,
    last_grayvalue_threshold: u8,
    last_used_grayvalue_threshold: u8,
    valid: bool,
}

impl EdgeTracker {
    /// Initialize from a template image and its reference quadrilateral.
    pub fn new(
        template: &GrayImageView<'_>,
        quad: &Quad,
        params: &EdgeTrackerParams,
    ) -> TrackResult<Self> {
        if template.width == 0 || template.height == 0 {
            return Err(TrackError::InvalidSize("template image is empty"));
        }
        if template.data.len() != template.width * template.height {
            return Err(TrackError::InvalidSize("template data length mismatch"));
        }

        let threshold_region = quad.bounding_rect().scaled(params.threshold.region_scale);
        let last_grayvalue_threshold = grayvalue_threshold(
            template,
            &threshold_region,
            params.threshold.y_increment,
            params.threshold.x_increment,
            params.threshold.black_percentile,
            params.threshold.white_percentile,
        );

        let template_region = quad
            .bounding_rect()
            .scaled(params.template_region_scale.max(0.01));
        let template_edges = detect_edges(
            template,
            Some(&template_region),
            last_grayvalue_threshold,
            &params.edge,
        );
        if template_edges.total_points() == 0 {
            warn!("edge tracker: template region produced no edge points");
        }

        let transform = PlanarTransform::new(TransformKind::Projective, *quad);

        Ok(Self {
            template_edges,
            template_image: Some(GrayImage {
                width: template.width,
                height: template.height,
                data: template.data.to_vec(),
            }),
            template_region,
            transform,
            last_grayvalue_threshold,
            last_used_grayvalue_threshold: last_grayvalue_threshold,
            valid: true,
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.transform.is_valid()
    }

    pub fn num_template_pixels(&self) -> usize {
        self.template_edges.total_points()
    }

    /// Threshold that binarized the most recent image.
    pub fn last_used_grayvalue_threshold(&self) -> u8 {
        self.last_used_grayvalue_threshold
    }

    /// Threshold computed on the most recent image, used for the next one.
    pub fn last_grayvalue_threshold(&self) -> u8 {
        self.last_grayvalue_threshold
    }

    /// Value copy of the current transformation.
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

    /// Compose an external update into the transformation.
    pub fn update_transformation(
        &mut self,
        delta: &[f32],
        scale: f32,
        kind: Option<TransformKind>,
    ) -> TrackResult<()> {
        self.transform.update(delta, scale, kind)
    }

    /// Run one tracking iteration against a new frame.
    pub fn update_track(
        &mut self,
        next: &GrayImageView<'_>,
        params: &EdgeTrackerUpdateParams,
        scratch: &Arena,
    ) -> TrackResult<EdgeTrackReport> {
        if !self.is_valid() {
            return Err(TrackError::InvalidObject("tracker is not initialized"));
        }
        if next.data.len() != next.width * next.height {
            return Err(TrackError::InvalidSize("next image data length mismatch"));
        }

        let next_edges = detect_edges(next, None, self.last_grayvalue_threshold, &params.edge);
        self.last_used_grayvalue_threshold = self.last_grayvalue_threshold;

        let limits = AllIndexLimits::compute(&next_edges, scratch)?;

        self.refine_translation(&next_edges, &limits, params.max_translation_distance);

        match &params.strategy {
            RefineStrategy::Direct => {
                self.refine_projective(&next_edges, &limits, params.max_projective_distance);
            }
            RefineStrategy::List {
                max_matches_per_type,
            } => {
                self.refine_projective_list(
                    &next_edges,
                    &limits,
                    params.max_projective_distance,
                    *max_matches_per_type,
                    scratch,
                )?;
            }
            RefineStrategy::Ransac(ransac) => {
                refine_projective_ransac(
                    self,
                    &next_edges,
                    &limits,
                    params.max_projective_distance,
                    ransac,
                    scratch,
                )?;
            }
        }

        let num_matched_points =
            self.verify_track(&next_edges, &limits, params.verification_distance);

        let pixel = self.template_image.as_ref().map(|template| {
            verify_projective_pixels(
                &self.transform,
                &template.view(),
                &self.template_region,
                next,
                params.verify_coordinate_increment,
                params.verify_max_pixel_difference,
            )
        });

        // Refresh the grayvalue threshold from the warped quad for the
        // next frame.
        let warped = self.transform.transformed_corners();
        let threshold_region = warped
            .bounding_rect()
            .scaled(params.threshold.region_scale);
        self.last_grayvalue_threshold = grayvalue_threshold(
            next,
            &threshold_region,
            params.threshold.y_increment,
            params.threshold.x_increment,
            params.threshold.black_percentile,
            params.threshold.white_percentile,
        );

        Ok(EdgeTrackReport {
            num_matched_points,
            num_template_points: self.template_edges.total_points(),
            pixel,
        })
    }

    fn refine_translation(
        &mut self,
        next_edges: &EdgeLists,
        limits: &AllIndexLimits<'_>,
        max_distance: i32,
    ) {
        let mut sum_x = 0i64;
        let mut num_x = 0usize;
        let mut sum_y = 0i64;
        let mut num_y = 0usize;

        scan_matches_along_x(
            max_distance,
            &self.transform,
            &self.template_edges.x_decreasing,
            &next_edges.x_decreasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.x_decreasing_rows,
            |_, _, _, _, offset| {
                sum_x += offset as i64;
                num_x += 1;
            },
        );
        scan_matches_along_x(
            max_distance,
            &self.transform,
            &self.template_edges.x_increasing,
            &next_edges.x_increasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.x_increasing_rows,
            |_, _, _, _, offset| {
                sum_x += offset as i64;
                num_x += 1;
            },
        );
        scan_matches_along_y(
            max_distance,
            &self.transform,
            &self.template_edges.y_decreasing,
            &next_edges.y_decreasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.y_decreasing_cols,
            |_, _, _, _, offset| {
                sum_y += offset as i64;
                num_y += 1;
            },
        );
        scan_matches_along_y(
            max_distance,
            &self.transform,
            &self.template_edges.y_increasing,
            &next_edges.y_increasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.y_increasing_cols,
            |_, _, _, _, offset| {
                sum_y += offset as i64;
                num_y += 1;
            },
        );

        if num_x < 1 || num_y < 1 {
            warn!("edge tracker: no translation correspondences, keeping transform");
            return;
        }

        let delta = [
            -(sum_x as f32) / num_x as f32,
            -(sum_y as f32) / num_y as f32,
        ];
        // Delta is finite by construction; failures here would be a bug.
        let _ = self
            .transform
            .update(&delta, 1.0, Some(TransformKind::Translation));
    }

    fn refine_projective(
        &mut self,
        next_edges: &EdgeLists,
        limits: &AllIndexLimits<'_>,
        max_distance: i32,
    ) {
        let mut ata = SMatrix::<f32, 8, 8>::zeros();
        let mut atb = SVector::<f32, 8>::zeros();

        scan_matches_along_x(
            max_distance,
            &self.transform,
            &self.template_edges.x_decreasing,
            &next_edges.x_decreasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.x_decreasing_rows,
            |xc, yc, wx, _, offset| {
                accumulate_x(&mut ata, &mut atb, xc, yc, wx + offset as f32)
            },
        );
        scan_matches_along_x(
            max_distance,
            &self.transform,
            &self.template_edges.x_increasing,
            &next_edges.x_increasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.x_increasing_rows,
            |xc, yc, wx, _, offset| {
                accumulate_x(&mut ata, &mut atb, xc, yc, wx + offset as f32)
            },
        );
        scan_matches_along_y(
            max_distance,
            &self.transform,
            &self.template_edges.y_decreasing,
            &next_edges.y_decreasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.y_decreasing_cols,
            |xc, yc, _, wy, offset| {
                accumulate_y(&mut ata, &mut atb, xc, yc, wy + offset as f32)
            },
        );
        scan_matches_along_y(
            max_distance,
            &self.transform,
            &self.template_edges.y_increasing,
            &next_edges.y_increasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.y_increasing_cols,
            |xc, yc, _, wy, offset| {
                accumulate_y(&mut ata, &mut atb, xc, yc, wy + offset as f32)
            },
        );

        self.install_solved_homography(ata, atb);
    }

    fn refine_projective_list(
        &mut self,
        next_edges: &EdgeLists,
        limits: &AllIndexLimits<'_>,
        max_distance: i32,
        max_matches_per_type: usize,
        scratch: &Arena,
    ) -> TrackResult<()> {
        let mut ata = SMatrix::<f32, 8, 8>::zeros();
        let mut atb = SVector::<f32, 8>::zeros();

        for (axis, list) in self.correspondence_lists(next_edges, limits, max_distance, max_matches_per_type, scratch)? {
            for c in list.iter() {
                match axis {
                    Axis::X => accumulate_x(&mut ata, &mut atb, c.template.x, c.template.y, c.matched.x),
                    Axis::Y => accumulate_y(&mut ata, &mut atb, c.template.x, c.template.y, c.matched.y),
                }
            }
        }

        self.install_solved_homography(ata, atb);
        Ok(())
    }

    /// Collect the four per-type correspondence lists from the scratch
    /// arena. Shared by the list and RANSAC strategies.
    pub(crate) fn correspondence_lists<'a>(
        &self,
        next_edges: &EdgeLists,
        limits: &AllIndexLimits<'_>,
        max_distance: i32,
        max_matches_per_type: usize,
        scratch: &'a Arena,
    ) -> TrackResult<[(Axis, planar_track_core::ScratchBuf<'a, Correspondence>); 4]> {
        let mut x_dec = scratch.alloc_with_capacity::<Correspondence>(max_matches_per_type)?;
        let mut x_inc = scratch.alloc_with_capacity::<Correspondence>(max_matches_per_type)?;
        let mut y_dec = scratch.alloc_with_capacity::<Correspondence>(max_matches_per_type)?;
        let mut y_inc = scratch.alloc_with_capacity::<Correspondence>(max_matches_per_type)?;

        scan_matches_along_x(
            max_distance,
            &self.transform,
            &self.template_edges.x_decreasing,
            &next_edges.x_decreasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.x_decreasing_rows,
            |xc, yc, wx, wy, offset| {
                push_correspondence(&mut x_dec, max_matches_per_type, xc, yc, wx + offset as f32, wy)
            },
        );
        scan_matches_along_x(
            max_distance,
            &self.transform,
            &self.template_edges.x_increasing,
            &next_edges.x_increasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.x_increasing_rows,
            |xc, yc, wx, wy, offset| {
                push_correspondence(&mut x_inc, max_matches_per_type, xc, yc, wx + offset as f32, wy)
            },
        );
        scan_matches_along_y(
            max_distance,
            &self.transform,
            &self.template_edges.y_decreasing,
            &next_edges.y_decreasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.y_decreasing_cols,
            |xc, yc, wx, wy, offset| {
                push_correspondence(&mut y_dec, max_matches_per_type, xc, yc, wx, wy + offset as f32)
            },
        );
        scan_matches_along_y(
            max_distance,
            &self.transform,
            &self.template_edges.y_increasing,
            &next_edges.y_increasing,
            next_edges.image_width,
            next_edges.image_height,
            &limits.y_increasing_cols,
            |xc, yc, wx, wy, offset| {
                push_correspondence(&mut y_inc, max_matches_per_type, xc, yc, wx, wy + offset as f32)
            },
        );

        Ok([
            (Axis::X, x_dec),
            (Axis::X, x_inc),
            (Axis::Y, y_dec),
            (Axis::Y, y_inc),
        ])
    }

    /// Solve the accumulated normal equations and install the result as
    /// the new homography. Numerical failure keeps the previous one.
    pub(crate) fn install_solved_homography(
        &mut self,
        ata: SMatrix<f32, 8, 8>,
        atb: SVector<f32, 8>,
    ) {
        let Some(solution) = solve_normal_equations(ata, atb) else {
            warn!("edge tracker: projective solve failed numerically, keeping transform");
            return;
        };
        let h = homography_from_solution(&solution);
        if self.transform.set_homography(&h).is_err() {
            warn!("edge tracker: solved homography rejected, keeping transform");
        }
    }

    fn verify_track(
        &self,
        next_edges: &EdgeLists,
        limits: &AllIndexLimits<'_>,
        max_distance: i32,
    ) -> usize {
        count_matched_template_points(
            max_distance,
            &self.transform,
            &self.template_edges.x_decreasing,
            &next_edges.x_decreasing,
            Axis::X,
            &limits.x_decreasing_rows,
        ) + count_matched_template_points(
            max_distance,
            &self.transform,
            &self.template_edges.x_increasing,
            &next_edges.x_increasing,
            Axis::X,
            &limits.x_increasing_rows,
        ) + count_matched_template_points(
            max_distance,
            &self.transform,
            &self.template_edges.y_decreasing,
            &next_edges.y_decreasing,
            Axis::Y,
            &limits.y_decreasing_cols,
        ) + count_matched_template_points(
            max_distance,
            &self.transform,
            &self.template_edges.y_increasing,
            &next_edges.y_increasing,
            Axis::Y,
            &limits.y_increasing_cols,
        )
    }

    /// Serialize tracker state: transformation, template dimensions,
    /// thresholds, and the four template edge lists.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.transform.serialize(out);
        out.extend_from_slice(&(self.template_edges.image_width as u32).to_le_bytes());
        out.extend_from_slice(&(self.template_edges.image_height as u32).to_le_bytes());
        out.push(self.last_grayvalue_threshold);
        out.push(self.last_used_grayvalue_threshold);
        for list in [
            &self.template_edges.x_decreasing,
            &self.template_edges.x_increasing,
            &self.template_edges.y_decreasing,
            &self.template_edges.y_increasing,
        ] {
            out.extend_from_slice(&(list.len() as u32).to_le_bytes());
            for p in list {
                out.extend_from_slice(&p.x.to_le_bytes());
                out.extend_from_slice(&p.y.to_le_bytes());
            }
        }
    }

    /// Rebuild a tracker from [`Self::serialize`] output.
    ///
    /// The template image is not part of the stream, so the restored
    /// tracker skips pixel verification.
    pub fn deserialize(bytes: &[u8]) -> TrackResult<(Self, usize)> {
        let (transform, mut pos) = PlanarTransform::deserialize(bytes)?;

        let read_u32 = |bytes: &[u8], pos: &mut usize| -> TrackResult<u32> {
            if *pos + 4 > bytes.len() {
                return Err(TrackError::InvalidSize("serialized tracker truncated"));
            }
            let v = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            Ok(v)
        };

        let width = read_u32(bytes, &mut pos)? as usize;
        let height = read_u32(bytes, &mut pos)? as usize;
        if pos + 2 > bytes.len() {
            return Err(TrackError::InvalidSize("serialized tracker truncated"));
        }
        let last_grayvalue_threshold = bytes[pos];
        let last_used_grayvalue_threshold = bytes[pos + 1];
        pos += 2;

        let mut lists: [Vec<EdgePoint>; 4] = [vec![], vec![], vec![], vec![]];
        let mut max_per_type = 0usize;
        for list in &mut lists {
            let len = read_u32(bytes, &mut pos)? as usize;
            if pos + len * 4 > bytes.len() {
                return Err(TrackError::InvalidSize("serialized tracker truncated"));
            }
            list.reserve(len);
            for _ in 0..len {
                let x = i16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap());
                let y = i16::from_le_bytes(bytes[pos + 2..pos + 4].try_into().unwrap());
                list.push(EdgePoint { x, y });
                pos += 4;
            }
            max_per_type = max_per_type.max(len);
        }

        let [x_decreasing, x_increasing, y_decreasing, y_increasing] = lists;
        let template_edges = EdgeLists {
            image_width: width,
            image_height: height,
            max_per_type,
            x_decreasing,
            x_increasing,
            y_decreasing,
            y_increasing,
        };

        let template_region = transform.initial_corners().bounding_rect();

        Ok((
            Self {
                template_edges,
                template_image: None,
                template_region,
                transform,
                last_grayvalue_threshold,
                last_used_grayvalue_threshold,
                valid: true,
            },
            pos,
        ))
    }
}

/// Per-type correspondence search for the x (horizontal transition) lists.
///
/// Warps each template point, then visits every new-image point of the
/// same row within `max_distance` along x. The closure receives the
/// zero-centered template point, the zero-centered warped position, and
/// the integer offset of the matched point from the rounded warp.
pub(crate) fn scan_matches_along_x(
    max_distance: i32,
    transform: &PlanarTransform,
    template_points: &[EdgePoint],
    new_points: &[EdgePoint],
    _image_width: usize,
    image_height: usize,
    row_limits: &[u32],
    mut on_match: impl FnMut(f32, f32, f32, f32, i32),
) {
    let h = transform.homography();
    let offset = transform.center_offset(1.0);
    let (h00, h01, h02) = (h[(0, 0)], h[(0, 1)], h[(0, 2)]);
    let (h10, h11, h12) = (h[(1, 0)], h[(1, 1)], h[(1, 2)]);
    let (h20, h21) = (h[(2, 0)], h[(2, 1)]);

    for p in template_points {
        let xc = p.x as f32 - offset.x;
        let yc = p.y as f32 - offset.y;

        let wi = 1.0 / (h20 * xc + h21 * yc + 1.0);
        let wx = (h00 * xc + h01 * yc + h02) * wi;
        let wy = (h10 * xc + h11 * yc + h12) * wi;

        let rx = round_half_down(wx + offset.x);
        let ry = round_half_down(wy + offset.y);

        if ry < 0 || ry >= image_height as i32 {
            continue;
        }

        let min_x = rx - max_distance;
        let max_x = rx + max_distance;

        let mut cur = row_limits[ry as usize] as usize;
        let end = row_limits[ry as usize + 1] as usize;

        while cur < end && (new_points[cur].x as i32) < min_x {
            cur += 1;
        }
        while cur < end && (new_points[cur].x as i32) <= max_x {
            on_match(xc, yc, wx, wy, new_points[cur].x as i32 - rx);
            cur += 1;
        }
    }
}

/// Per-type correspondence search for the y (vertical transition) lists.
pub(crate) fn scan_matches_along_y(
    max_distance: i32,
    transform: &PlanarTransform,
    template_points: &[EdgePoint],
    new_points: &[EdgePoint],
    image_width: usize,
    _image_height: usize,
    col_limits: &[u32],
    mut on_match: impl FnMut(f32, f32, f32, f32, i32),
) {
    let h = transform.homography();
    let offset = transform.center_offset(1.0);
    let (h00, h01, h02) = (h[(0, 0)], h[(0, 1)], h[(0, 2)]);
    let (h10, h11, h12) = (h[(1, 0)], h[(1, 1)], h[(1, 2)]);
    let (h20, h21) = (h[(2, 0)], h[(2, 1)]);

    for p in template_points {
        let xc = p.x as f32 - offset.x;
        let yc = p.y as f32 - offset.y;

        let wi = 1.0 / (h20 * xc + h21 * yc + 1.0);
        let wx = (h00 * xc + h01 * yc + h02) * wi;
        let wy = (h10 * xc + h11 * yc + h12) * wi;

        let rx = round_half_down(wx + offset.x);
        let ry = round_half_down(wy + offset.y);

        if rx < 0 || rx >= image_width as i32 {
            continue;
        }

        let min_y = ry - max_distance;
        let max_y = ry + max_distance;

        let mut cur = col_limits[rx as usize] as usize;
        let end = col_limits[rx as usize + 1] as usize;

        while cur < end && (new_points[cur].y as i32) < min_y {
            cur += 1;
        }
        while cur < end && (new_points[cur].y as i32) <= max_y {
            on_match(xc, yc, wx, wy, new_points[cur].y as i32 - ry);
            cur += 1;
        }
    }
}

/// Count template points with at least one in-range match. Only the first
/// match per template point is checked.
fn count_matched_template_points(
    max_distance: i32,
    transform: &PlanarTransform,
    template_points: &[EdgePoint],
    new_points: &[EdgePoint],
    axis: Axis,
    limits: &[u32],
) -> usize {
    let h = transform.homography();
    let offset = transform.center_offset(1.0);
    let (h00, h01, h02) = (h[(0, 0)], h[(0, 1)], h[(0, 2)]);
    let (h10, h11, h12) = (h[(1, 0)], h[(1, 1)], h[(1, 2)]);
    let (h20, h21) = (h[(2, 0)], h[(2, 1)]);
    let extent = limits.len() as i32 - 1;

    let mut matched = 0usize;
    for p in template_points {
        let xc = p.x as f32 - offset.x;
        let yc = p.y as f32 - offset.y;

        let wi = 1.0 / (h20 * xc + h21 * yc + 1.0);
        let wx = (h00 * xc + h01 * yc + h02) * wi;
        let wy = (h10 * xc + h11 * yc + h12) * wi;

        let rx = round_half_down(wx + offset.x);
        let ry = round_half_down(wy + offset.y);

        let (bucket, along) = match axis {
            Axis::X => (ry, rx),
            Axis::Y => (rx, ry),
        };
        if bucket < 0 || bucket >= extent {
            continue;
        }

        let mut cur = limits[bucket as usize] as usize;
        let end = limits[bucket as usize + 1] as usize;
        let min = along - max_distance;
        let max = along + max_distance;

        let coord = |p: &EdgePoint| match axis {
            Axis::X => p.x as i32,
            Axis::Y => p.y as i32,
        };
        while cur < end && coord(&new_points[cur]) < min {
            cur += 1;
        }
        if cur < end && coord(&new_points[cur]) <= max {
            matched += 1;
        }
    }
    matched
}

fn push_correspondence(
    list: &mut Vec<Correspondence>,
    max: usize,
    xc: f32,
    yc: f32,
    mx: f32,
    my: f32,
) {
    if list.len() < max {
        list.push(Correspondence {
            template: Point2::new(xc, yc),
            matched: Point2::new(mx, my),
        });
    }
}

/// Row contribution of an x-axis correspondence: five of eight entries are
/// nonzero, so the horizontal and vertical sums populate disjoint blocks.
#[inline]
pub(crate) fn accumulate_x(
    ata: &mut SMatrix<f32, 8, 8>,
    atb: &mut SVector<f32, 8>,
    xc: f32,
    yc: f32,
    xp: f32,
) {
    let a = SVector::<f32, 8>::from([xc, yc, 1.0, 0.0, 0.0, 0.0, -xc * xp, -yc * xp]);
    *ata += a * a.transpose();
    *atb += a * xp;
}

/// Row contribution of a y-axis correspondence.
#[inline]
pub(crate) fn accumulate_y(
    ata: &mut SMatrix<f32, 8, 8>,
    atb: &mut SVector<f32, 8>,
    xc: f32,
    yc: f32,
    yp: f32,
) {
    let a = SVector::<f32, 8>::from([0.0, 0.0, 0.0, -xc, -yc, -1.0, xc * yp, yc * yp]);
    *ata += a * a.transpose();
    *atb += a * (-yp);
}

pub(crate) fn solve_normal_equations(
    ata: SMatrix<f32, 8, 8>,
    atb: SVector<f32, 8>,
) -> Option<SVector<f32, 8>> {
    let chol = nalgebra::linalg::Cholesky::new(ata)?;
    let solution = chol.solve(&atb);
    solution.iter().all(|v| v.is_finite()).then_some(solution)
}

pub(crate) fn homography_from_solution(x: &SVector<f32, 8>) -> Matrix3<f32> {
    Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use planar_track_core::GrayImage;

    /// Light background with a dark rectangle whose corners sit at `quad`.
    fn marker_image(width: usize, height: usize, left: usize, top: usize, w: usize, h: usize) -> GrayImage {
        let mut img = GrayImage::new(width, height);
        for v in &mut img.data {
            *v = 210;
        }
        for y in top..top + h {
            for x in left..left + w {
                img.data[y * width + x] = 40;
            }
        }
        img
    }

    fn tracker_on_square() -> (EdgeTracker, GrayImage) {
        let template = marker_image(64, 64, 20, 16, 20, 24);
        let quad = Quad::from_arrays([
            [20.0, 16.0],
            [40.0, 16.0],
            [40.0, 40.0],
            [20.0, 40.0],
        ]);
        let mut params = EdgeTrackerParams::default();
        params.template_region_scale = 1.4;
        let tracker = EdgeTracker::new(&template.view(), &quad, &params).unwrap();
        (tracker, template)
    }

    #[test]
    fn init_extracts_template_edges() {
        let (tracker, _) = tracker_on_square();
        assert!(tracker.is_valid());
        assert!(tracker.num_template_pixels() > 0);
        // Threshold lands between the two modes.
        assert!(tracker.last_grayvalue_threshold() > 40);
        assert!(tracker.last_grayvalue_threshold() < 210);
    }

    #[test]
    fn update_recovers_pure_translation() {
        let (mut tracker, _) = tracker_on_square();
        // Same scene shifted right 2, down 3.
        let next = marker_image(64, 64, 22, 19, 20, 24);
        let arena = Arena::new(1 << 20);

        let report = tracker
            .update_track(&next.view(), &EdgeTrackerUpdateParams::default(), &arena)
            .unwrap();

        let p = tracker
            .transformation()
            .transform_point(Point2::new(30.0, 28.0), 1.0);
        assert!((p.x - 32.0).abs() < 0.5, "x = {}", p.x);
        assert!((p.y - 31.0).abs() < 0.5, "y = {}", p.y);

        assert!(report.num_template_points > 0);
        assert!(report.num_matched_points * 10 >= report.num_template_points * 8);
        let pixel = report.pixel.expect("template image retained");
        assert!(pixel.num_similar_pixels * 10 >= pixel.num_in_bounds * 8);
    }

    #[test]
    fn list_strategy_matches_direct() {
        let (mut direct, _) = tracker_on_square();
        let (mut listed, _) = tracker_on_square();
        let next = marker_image(64, 64, 21, 18, 20, 24);
        let arena = Arena::new(1 << 20);

        direct
            .update_track(&next.view(), &EdgeTrackerUpdateParams::default(), &arena)
            .unwrap();

        let mut params = EdgeTrackerUpdateParams::default();
        params.strategy = RefineStrategy::List {
            max_matches_per_type: 2000,
        };
        listed.update_track(&next.view(), &params, &arena).unwrap();

        let hd = direct.transformation();
        let hl = listed.transformation();
        for (a, b) in hd.homography().iter().zip(hl.homography().iter()) {
            assert!((a - b).abs() < 1e-4);
        }
    }

    #[test]
    fn update_on_uninitialized_tracker_fails() {
        let next = marker_image(32, 32, 4, 4, 8, 8);
        let arena = Arena::new(1 << 16);
        let (mut tracker, _) = tracker_on_square();
        tracker.valid = false;
        assert!(matches!(
            tracker.update_track(&next.view(), &EdgeTrackerUpdateParams::default(), &arena),
            Err(TrackError::InvalidObject(_))
        ));
    }

    #[test]
    fn serialization_round_trips_lists_and_thresholds() {
        let (tracker, _) = tracker_on_square();
        let mut bytes = Vec::new();
        tracker.serialize(&mut bytes);
        let (back, consumed) = EdgeTracker::deserialize(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(back.num_template_pixels(), tracker.num_template_pixels());
        assert_eq!(
            back.last_grayvalue_threshold(),
            tracker.last_grayvalue_threshold()
        );
        assert_eq!(
            back.transformation().homography(),
            tracker.transformation().homography()
        );
        assert_eq!(
            back.template_edges.x_increasing,
            tracker.template_edges.x_increasing
        );
        assert!(back.template_image.is_none());
    }

    #[test]
    fn deserialization_rejects_truncated_input() {
        let (tracker, _) = tracker_on_square();
        let mut bytes = Vec::new();
        tracker.serialize(&mut bytes);
        assert!(EdgeTracker::deserialize(&bytes[..bytes.len() - 3]).is_err());
    }
}
