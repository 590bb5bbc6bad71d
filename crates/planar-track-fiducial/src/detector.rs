//! The fiducial detection pipeline: pyramid, binarization, components,
//! quad fitting, refinement, decoding.

use log::debug;
use nalgebra::Matrix3;
use planar_track_core::{
    build_pyramid, grayvalue_threshold, homography_from_quad, Arena, GrayImageView, Quad,
    TrackError, TrackResult,
};
use serde::{Deserialize, Serialize};

use crate::binarize::{binarize_adaptive, THRESHOLD_MULTIPLIER_ONE};
use crate::components::{extract_components, ExtractionParams};
use crate::decode::{decode_marker, FiducialDecisionTree};
use crate::quads::{
    extract_quad, refine_quad, validate_quad, QuadExtractionParams, QuadRefinementParams,
};
use crate::trace_exterior_boundary;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FiducialDetectorParams {
    /// Pyramid levels searched; detections from coarse levels are mapped
    /// back to full resolution.
    pub num_pyramid_levels: usize,
    /// Adaptive threshold multiplier, Q16 (65536 = 1.0).
    pub threshold_multiplier: u32,
    /// Box filter radius for the local mean.
    pub filter_window_radius: usize,
    /// Shortest 1-D run kept during component extraction.
    pub min_component_width: usize,
    /// In-row gap bridged during component extraction.
    pub max_skip_distance: usize,
    pub min_component_pixels: usize,
    pub max_component_pixels: usize,
    /// Q23.8 fill-ratio bounds, see the component filters.
    pub sparse_multiply_threshold: i64,
    pub solid_multiply_threshold: i64,
    pub min_hollow_ratio: f32,
    pub quad: QuadExtractionParams,
    pub refinement: QuadRefinementParams,
    /// Histogram percentiles for the decode threshold.
    pub decode_black_percentile: f32,
    pub decode_white_percentile: f32,
    pub decode_min_contrast_ratio: f32,
    pub max_markers: usize,
    pub max_connected_component_segments: usize,
}

impl Default for FiducialDetectorParams {
    fn default() -> Self {
        Self {
            num_pyramid_levels: 3,
            threshold_multiplier: THRESHOLD_MULTIPLIER_ONE,
            filter_window_radius: 8,
            min_component_width: 1,
            max_skip_distance: 0,
            min_component_pixels: 64,
            max_component_pixels: 20_000,
            sparse_multiply_threshold: 1000 << 5,
            solid_multiply_threshold: 2 << 5,
            min_hollow_ratio: 1.0,
            quad: QuadExtractionParams::default(),
            refinement: QuadRefinementParams::default(),
            decode_black_percentile: 0.1,
            decode_white_percentile: 0.9,
            decode_min_contrast_ratio: 1.25,
            max_markers: 100,
            max_connected_component_segments: 39_000,
        }
    }
}

/// One detected marker, in full-resolution image coordinates.
#[derive(Clone, Debug)]
pub struct DetectedMarker {
    pub quad: Quad,
    /// Decoded identity; `None` when no decision tree is attached or the
    /// contrast gate failed.
    pub marker_id: Option<u16>,
    /// Canonical marker square to image homography.
    pub homography: Matrix3<f32>,
    /// Set when the homography solve degenerated; the quad is still
    /// usable, the homography is identity.
    pub numerical_failure: bool,
}

pub struct FiducialDetector<'a> {
    params: FiducialDetectorParams,
    tree: Option<FiducialDecisionTree<'a>>,
}

impl<'a> FiducialDetector<'a> {
    pub fn new(params: FiducialDetectorParams) -> Self {
        Self { params, tree: None }
    }

    /// Attach a decision tree for marker identity decoding.
    pub fn with_decision_tree(mut self, tree: FiducialDecisionTree<'a>) -> Self {
        self.tree = Some(tree);
        self
    }

    pub fn params(&self) -> &FiducialDetectorParams {
        &self.params
    }

    /// Detect fiducial markers in a grayscale frame.
    pub fn detect(
        &self,
        img: &GrayImageView<'_>,
        scratch: &Arena,
    ) -> TrackResult<Vec<DetectedMarker>> {
        if img.width == 0 || img.height == 0 || img.data.len() != img.width * img.height {
            return Err(TrackError::InvalidSize("input image is empty or malformed"));
        }
        if self.params.num_pyramid_levels == 0 {
            return Err(TrackError::InvalidParameters(
                "num_pyramid_levels must be positive",
            ));
        }

        let pyramid = build_pyramid(img, self.params.num_pyramid_levels);
        let extraction = ExtractionParams {
            min_component_width: self.params.min_component_width,
            max_skip_distance: self.params.max_skip_distance,
            max_segments: self.params.max_connected_component_segments,
        };

        let mut detections: Vec<DetectedMarker> = Vec::new();

        for (level, level_image) in pyramid.iter().enumerate() {
            if level_image.width < 8 || level_image.height < 8 {
                break;
            }
            let level_scale = (1u32 << level) as f32;

            let binary = binarize_adaptive(
                &level_image.view(),
                self.params.filter_window_radius,
                self.params.threshold_multiplier,
            );

            let mut components = extract_components(&binary, &extraction, scratch)?;
            components.invalidate_small_or_large(
                self.params.min_component_pixels >> (2 * level),
                self.params.max_component_pixels >> (2 * level),
            );
            components.invalidate_solid_or_sparse(
                self.params.sparse_multiply_threshold,
                self.params.solid_multiply_threshold,
            );
            components.invalidate_filled_centers(self.params.min_hollow_ratio);
            components.compress_ids();
            debug!(
                "fiducial detect: level {level}: {} surviving components",
                components.maximum_id()
            );

            for id in 1..=components.maximum_id() {
                if detections.len() >= self.params.max_markers {
                    return Ok(detections);
                }

                let boundary = trace_exterior_boundary(&components, id);
                let Some(level_quad) = extract_quad(&boundary, &self.params.quad) else {
                    continue;
                };

                // Map back to full resolution before validation.
                let quad = Quad::new(
                    level_quad
                        .corners
                        .map(|c| nalgebra::Point2::new(c.x * level_scale, c.y * level_scale)),
                );
                if !validate_quad(&quad, &self.params.quad, img.width, img.height) {
                    continue;
                }

                let Some(refined) = refine_quad(img, &quad, &self.params.refinement) else {
                    continue;
                };
                if !validate_quad(&refined, &self.params.quad, img.width, img.height) {
                    continue;
                }
                if detections
                    .iter()
                    .any(|d| d.quad.centroid().coords.metric_distance(&refined.centroid().coords) < 5.0)
                {
                    continue;
                }

                let (homography, numerical_failure) = homography_from_quad(&refined);

                let marker_id = match &self.tree {
                    Some(tree) if !numerical_failure => {
                        let region = refined.bounding_rect();
                        let threshold = grayvalue_threshold(
                            img,
                            &region,
                            2,
                            2,
                            self.params.decode_black_percentile,
                            self.params.decode_white_percentile,
                        );
                        match decode_marker(
                            img,
                            &homography,
                            tree,
                            threshold as u32,
                            self.params.decode_min_contrast_ratio,
                        ) {
                            Ok(Some(decode)) => Some(decode.label),
                            Ok(None) => continue,
                            Err(_) => None,
                        }
                    }
                    _ => None,
                };

                detections.push(DetectedMarker {
                    quad: refined,
                    marker_id,
                    homography,
                    numerical_failure,
                });
            }
        }

        Ok(detections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planar_track_core::GrayImage;

    /// Hollow dark square ring with the given outer side and border width.
    fn render_ring(img: &mut GrayImage, x0: usize, y0: usize, side: usize, border: usize) {
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                let inner = x >= x0 + border
                    && x < x0 + side - border
                    && y >= y0 + border
                    && y < y0 + side - border;
                if !inner {
                    img.data[y * img.width + x] = 35;
                }
            }
        }
    }

    fn light_image(width: usize, height: usize) -> GrayImage {
        let mut img = GrayImage::new(width, height);
        for v in &mut img.data {
            *v = 205;
        }
        img
    }

    fn test_params() -> FiducialDetectorParams {
        FiducialDetectorParams {
            num_pyramid_levels: 1,
            min_component_pixels: 100,
            max_component_pixels: 10_000,
            ..FiducialDetectorParams::default()
        }
    }

    #[test]
    fn detects_a_single_ring_marker() {
        let mut img = light_image(160, 120);
        render_ring(&mut img, 40, 30, 48, 2);

        let arena = Arena::new(4 << 20);
        let detector = FiducialDetector::new(test_params());
        let detections = detector.detect(&img.view(), &arena).unwrap();

        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert!(!d.numerical_failure);
        assert!(d.marker_id.is_none());

        // Corners near the ring's outer edge.
        let expected = [
            (39.5, 29.5),
            (87.5, 29.5),
            (87.5, 77.5),
            (39.5, 77.5),
        ];
        for e in expected {
            let close = d
                .quad
                .corners
                .iter()
                .any(|c| (c.x - e.0).abs() < 2.0 && (c.y - e.1).abs() < 2.0);
            assert!(close, "no corner near {e:?}: {:?}", d.quad.corners);
        }
    }

    #[test]
    fn filled_squares_are_filtered_out() {
        let mut img = light_image(160, 120);
        for y in 30..78 {
            for x in 40..88 {
                img.data[y * 160 + x] = 35;
            }
        }

        let arena = Arena::new(4 << 20);
        let detector = FiducialDetector::new(test_params());
        let detections = detector.detect(&img.view(), &arena).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn detects_two_separate_markers() {
        let mut img = light_image(320, 240);
        render_ring(&mut img, 30, 40, 48, 2);
        render_ring(&mut img, 180, 120, 60, 3);

        let arena = Arena::new(8 << 20);
        let detector = FiducialDetector::new(test_params());
        let detections = detector.detect(&img.view(), &arena).unwrap();
        assert_eq!(detections.len(), 2);

        let mut centroids: Vec<(f32, f32)> = detections
            .iter()
            .map(|d| {
                let c = d.quad.centroid();
                (c.x, c.y)
            })
            .collect();
        centroids.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        assert!((centroids[0].0 - 53.5).abs() < 3.0);
        assert!((centroids[0].1 - 63.5).abs() < 3.0);
        assert!((centroids[1].0 - 209.5).abs() < 3.0);
        assert!((centroids[1].1 - 149.5).abs() < 3.0);
    }

    #[test]
    fn markers_touching_the_border_are_rejected() {
        let mut img = light_image(160, 120);
        render_ring(&mut img, 0, 0, 48, 2);

        let arena = Arena::new(4 << 20);
        let detector = FiducialDetector::new(test_params());
        let detections = detector.detect(&img.view(), &arena).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn empty_image_is_invalid() {
        let img = GrayImage::new(0, 0);
        let arena = Arena::new(1 << 16);
        let detector = FiducialDetector::new(test_params());
        assert!(detector.detect(&img.view(), &arena).is_err());
    }
}
