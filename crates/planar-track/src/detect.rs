//! End-to-end helpers: detect markers in the first frame, then hand the
//! winning quadrilateral to a tracker.

use nalgebra::Point2;
use planar_track_core::{initial_image_scale, Arena, GrayImageView, Quad, TrackError, TrackResult};
use planar_track_edge::{EdgeTracker, EdgeTrackerParams};
use planar_track_fiducial::{DetectedMarker, FiducialDetector};
use planar_track_lk::{DenseTracker, DenseTrackerParams, SampledTracker, SampledTrackerParams};

/// Errors produced by the high-level helpers.
#[derive(thiserror::Error, Debug)]
pub enum DetectAndTrackError {
    #[error("no fiducial markers detected in the seed frame")]
    NoMarkers,
    #[error(transparent)]
    Track(#[from] TrackError),
}

/// Pick the largest usable detection (markers with a degenerate homography
/// are skipped).
pub fn best_detection(detections: &[DetectedMarker]) -> Option<&DetectedMarker> {
    detections
        .iter()
        .filter(|d| !d.numerical_failure)
        .max_by(|a, b| {
            a.quad
                .area()
                .partial_cmp(&b.quad.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// Detect markers in `frame` and initialize an edge tracker on the best
/// one.
pub fn detect_and_init_edge_tracker(
    detector: &FiducialDetector<'_>,
    frame: &GrayImageView<'_>,
    params: &EdgeTrackerParams,
    scratch: &Arena,
) -> Result<(EdgeTracker, DetectedMarker), DetectAndTrackError> {
    let detections = detector.detect(frame, scratch)?;
    let best = best_detection(&detections).ok_or(DetectAndTrackError::NoMarkers)?;
    let tracker = EdgeTracker::new(frame, &best.quad, params)?;
    Ok((tracker, best.clone()))
}

/// Scale a frame-resolution quad into the base-resolution coordinates the
/// Lucas-Kanade trackers store.
pub fn quad_to_base_resolution(quad: &Quad, frame_width: usize) -> TrackResult<Quad> {
    let scale = initial_image_scale(frame_width)?;
    Ok(Quad::new(
        quad.corners.map(|c| Point2::new(c.x * scale, c.y * scale)),
    ))
}

/// Detect markers in `frame` and initialize a dense pyramid tracker on the
/// best one.
pub fn detect_and_init_dense_tracker(
    detector: &FiducialDetector<'_>,
    frame: &GrayImageView<'_>,
    params: &DenseTrackerParams,
    scratch: &Arena,
) -> Result<(DenseTracker, DetectedMarker), DetectAndTrackError> {
    let detections = detector.detect(frame, scratch)?;
    let best = best_detection(&detections).ok_or(DetectAndTrackError::NoMarkers)?;
    let quad = quad_to_base_resolution(&best.quad, frame.width)?;
    let tracker = DenseTracker::new(frame, &quad, params)?;
    Ok((tracker, best.clone()))
}

/// Detect markers in `frame` and initialize a sampled tracker on the best
/// one.
pub fn detect_and_init_sampled_tracker(
    detector: &FiducialDetector<'_>,
    frame: &GrayImageView<'_>,
    params: &SampledTrackerParams,
    scratch: &Arena,
) -> Result<(SampledTracker, DetectedMarker), DetectAndTrackError> {
    let detections = detector.detect(frame, scratch)?;
    let best = best_detection(&detections).ok_or(DetectAndTrackError::NoMarkers)?;
    let quad = quad_to_base_resolution(&best.quad, frame.width)?;
    let tracker = SampledTracker::new(frame, &quad, params)?;
    Ok((tracker, best.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix3;
    use planar_track_core::Quad;

    fn marker(area_side: f32, numerical_failure: bool) -> DetectedMarker {
        DetectedMarker {
            quad: Quad::from_arrays([
                [0.0, 0.0],
                [area_side, 0.0],
                [area_side, area_side],
                [0.0, area_side],
            ]),
            marker_id: None,
            homography: Matrix3::identity(),
            numerical_failure,
        }
    }

    #[test]
    fn best_detection_prefers_large_valid_quads() {
        let detections = vec![marker(10.0, false), marker(50.0, true), marker(30.0, false)];
        let best = best_detection(&detections).unwrap();
        assert_eq!(best.quad.area(), 900.0);
    }

    #[test]
    fn best_detection_of_empty_set_is_none() {
        assert!(best_detection(&[]).is_none());
    }
}
