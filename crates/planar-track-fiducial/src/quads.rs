//! Quadrilateral fitting: corner extraction from boundary polylines,
//! geometric validation, and gradient-guided corner refinement.

use nalgebra::{Point2, Vector2};
use planar_track_core::{GrayImageView, Quad};
use serde::{Deserialize, Serialize};

use crate::components::FIXED_POINT_SCALE;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CornerMethod {
    /// Peaks of the boundary's circular second derivative.
    LaplacianPeaks,
    /// Iterative least-squares line fits to boundary quarters.
    LineFits,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QuadExtractionParams {
    pub corner_method: CornerMethod,
    /// A Laplacian peak survives if its magnitude stays within this factor
    /// of the second-highest peak.
    pub min_laplacian_peak_ratio: i32,
    pub min_quad_area: f32,
    /// Longest/shortest side ratio limit, Q23.8 (384 = 1.5).
    pub quad_symmetry_threshold: i64,
    pub min_distance_from_image_edge: f32,
}

impl Default for QuadExtractionParams {
    fn default() -> Self {
        Self {
            corner_method: CornerMethod::LaplacianPeaks,
            min_laplacian_peak_ratio: 5,
            min_quad_area: 25.0,
            quad_symmetry_threshold: 384,
            min_distance_from_image_edge: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QuadRefinementParams {
    pub iterations: usize,
    /// Edge samples per side for the line refits.
    pub num_samples: usize,
    /// Converged below this corner motion.
    pub min_corner_change: f32,
    /// Diverged above this corner motion; the quad is dropped.
    pub max_corner_change: f32,
}

impl Default for QuadRefinementParams {
    fn default() -> Self {
        Self {
            iterations: 5,
            num_samples: 100,
            min_corner_change: 0.005,
            max_corner_change: 5.0,
        }
    }
}

/// Extract a quadrilateral from a closed boundary polyline.
pub fn extract_quad(boundary: &[(i32, i32)], params: &QuadExtractionParams) -> Option<Quad> {
    if boundary.len() < 8 {
        return None;
    }
    match params.corner_method {
        CornerMethod::LaplacianPeaks => {
            let corners = laplacian_peak_corners(boundary, params.min_laplacian_peak_ratio)?;
            Some(Quad::new(corners.map(|i| {
                let (x, y) = boundary[i];
                Point2::new(x as f32, y as f32)
            })))
        }
        CornerMethod::LineFits => line_fit_corners(boundary),
    }
}

/// Indices of the four strongest circular-Laplacian peaks, in boundary
/// order.
fn laplacian_peak_corners(boundary: &[(i32, i32)], min_peak_ratio: i32) -> Option<[usize; 4]> {
    let n = boundary.len();
    let k = (n / 16).max(1);

    let lap_sq = |i: usize| -> f32 {
        let prev = boundary[(i + n - k) % n];
        let next = boundary[(i + k) % n];
        let cur = boundary[i];
        let lx = (prev.0 + next.0 - 2 * cur.0) as f32;
        let ly = (prev.1 + next.1 - 2 * cur.1) as f32;
        lx * lx + ly * ly
    };

    // Local maxima over a +-k circular window.
    let magnitudes: Vec<f32> = (0..n).map(lap_sq).collect();
    let mut maxima: Vec<(usize, f32)> = Vec::new();
    for i in 0..n {
        let m = magnitudes[i];
        if m <= 0.0 {
            continue;
        }
        let mut is_peak = true;
        for d in 1..=k {
            let before = magnitudes[(i + n - d) % n];
            let after = magnitudes[(i + d) % n];
            // Ties break toward the later index.
            if before > m || after >= m {
                is_peak = false;
                break;
            }
        }
        if is_peak {
            maxima.push((i, m));
        }
    }

    if maxima.len() < 4 {
        return None;
    }
    maxima.sort_unstable_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let floor = maxima[1].1 / min_peak_ratio.max(1) as f32;
    if maxima[3].1 < floor {
        return None;
    }

    let mut corners = [maxima[0].0, maxima[1].0, maxima[2].0, maxima[3].0];
    corners.sort_unstable();
    Some(corners)
}

/// Total-least-squares line through a point set: centroid + direction.
fn fit_line(points: &[Point2<f32>]) -> Option<(Point2<f32>, Vector2<f32>)> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f32;
    let mut cx = 0.0;
    let mut cy = 0.0;
    for p in points {
        cx += p.x;
        cy += p.y;
    }
    cx /= n;
    cy /= n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    let mut syy = 0.0;
    for p in points {
        let dx = p.x - cx;
        let dy = p.y - cy;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }

    let theta = 0.5 * (2.0 * sxy).atan2(sxx - syy);
    Some((Point2::new(cx, cy), Vector2::new(theta.cos(), theta.sin())))
}

fn intersect_lines(
    a: (Point2<f32>, Vector2<f32>),
    b: (Point2<f32>, Vector2<f32>),
) -> Option<Point2<f32>> {
    let denominator = a.1.x * b.1.y - a.1.y * b.1.x;
    if denominator.abs() < 1e-9 {
        return None;
    }
    let dx = b.0.x - a.0.x;
    let dy = b.0.y - a.0.y;
    let t = (dx * b.1.y - dy * b.1.x) / denominator;
    Some(Point2::new(a.0.x + t * a.1.x, a.0.y + t * a.1.y))
}

/// Iteratively refit four lines to quarters of the boundary and intersect
/// them pairwise.
fn line_fit_corners(boundary: &[(i32, i32)]) -> Option<Quad> {
    let n = boundary.len();
    let points: Vec<Point2<f32>> = boundary
        .iter()
        .map(|&(x, y)| Point2::new(x as f32, y as f32))
        .collect();

    // Seed corner indices: Laplacian peaks if available, else quarters.
    let mut corner_idx = laplacian_peak_corners(boundary, i32::MAX)
        .unwrap_or([0, n / 4, n / 2, 3 * n / 4]);

    let mut result = None;
    for _ in 0..3 {
        let mut lines = [None; 4];
        for side in 0..4 {
            let from = corner_idx[side];
            let to = corner_idx[(side + 1) % 4];
            let len = (to + n - from) % n;
            if len < 4 {
                return result;
            }
            // Trim 15% margins so corner pixels do not bend the fit.
            let margin = (len * 15 / 100).max(1);
            let side_points: Vec<Point2<f32>> = (margin..len - margin + 1)
                .map(|o| points[(from + o) % n])
                .collect();
            lines[side] = fit_line(&side_points);
        }

        let mut corners = [Point2::new(0.0f32, 0.0); 4];
        for i in 0..4 {
            // Corner i sits between side i-1 and side i.
            let prev = lines[(i + 3) % 4]?;
            let cur = lines[i]?;
            corners[i] = intersect_lines(prev, cur)?;
        }
        if !corners.iter().all(|c| c.x.is_finite() && c.y.is_finite()) {
            return result;
        }
        result = Some(Quad::new(corners));

        // Snap indices back to the boundary for the next pass.
        for (slot, corner) in corner_idx.iter_mut().zip(corners.iter()) {
            *slot = nearest_boundary_index(&points, corner);
        }
        if corner_degenerate(&corner_idx) {
            break;
        }
    }

    result
}

fn corner_degenerate(corner_idx: &[usize; 4]) -> bool {
    for i in 0..4 {
        for j in i + 1..4 {
            if corner_idx[i] == corner_idx[j] {
                return true;
            }
        }
    }
    false
}

fn nearest_boundary_index(points: &[Point2<f32>], target: &Point2<f32>) -> usize {
    let mut best = 0usize;
    let mut best_d = f32::INFINITY;
    for (i, p) in points.iter().enumerate() {
        let d = (p.x - target.x).powi(2) + (p.y - target.y).powi(2);
        if d < best_d {
            best_d = d;
            best = i;
        }
    }
    best
}

/// Geometric validation: convexity, minimum area, side symmetry, and
/// distance from the image border.
pub fn validate_quad(
    quad: &Quad,
    params: &QuadExtractionParams,
    image_width: usize,
    image_height: usize,
) -> bool {
    if !quad.is_convex() {
        return false;
    }
    if quad.area() < params.min_quad_area {
        return false;
    }

    let ratio_q8 = (quad.side_length_ratio() * FIXED_POINT_SCALE as f32) as i64;
    if ratio_q8 > params.quad_symmetry_threshold {
        return false;
    }

    let margin = params.min_distance_from_image_edge;
    for c in &quad.corners {
        if c.x < margin
            || c.y < margin
            || c.x > image_width as f32 - 1.0 - margin
            || c.y > image_height as f32 - 1.0 - margin
        {
            return false;
        }
    }
    true
}

/// Refine a quad's corners against the grayscale image.
///
/// Each side is resampled at `num_samples` points; every sample slides
/// along the side normal to the strongest nearby gradient; the four lines
/// are refit and intersected. Stops early below `min_corner_change`,
/// drops the quad above `max_corner_change`.
pub fn refine_quad(
    img: &GrayImageView<'_>,
    quad: &Quad,
    params: &QuadRefinementParams,
) -> Option<Quad> {
    let mut current = *quad;

    for _ in 0..params.iterations {
        let mut lines = [None; 4];
        for side in 0..4 {
            let a = current.corners[side];
            let b = current.corners[(side + 1) % 4];
            let side_vec = b - a;
            let len = side_vec.norm();
            if len < 2.0 {
                return None;
            }
            let dir = side_vec / len;
            let normal = Vector2::new(-dir.y, dir.x);

            let mut edge_points = Vec::with_capacity(params.num_samples);
            for i in 0..params.num_samples {
                // Keep clear of the corners themselves.
                let t = 0.1 + 0.8 * (i as f32 + 0.5) / params.num_samples as f32;
                let p = a + side_vec * t;
                if let Some(adjusted) = snap_to_gradient(img, &p, &normal) {
                    edge_points.push(adjusted);
                }
            }
            if edge_points.len() < params.num_samples / 4 {
                return None;
            }
            lines[side] = fit_line(&edge_points);
        }

        let mut corners = [Point2::new(0.0f32, 0.0); 4];
        for i in 0..4 {
            let prev = lines[(i + 3) % 4]?;
            let cur = lines[i]?;
            corners[i] = intersect_lines(prev, cur)?;
        }
        let refined = Quad::new(corners);

        let mut max_change = 0.0f32;
        for i in 0..4 {
            let dx = refined.corners[i].x - current.corners[i].x;
            let dy = refined.corners[i].y - current.corners[i].y;
            max_change = max_change.max((dx * dx + dy * dy).sqrt());
        }

        if max_change > params.max_corner_change {
            return None;
        }
        current = refined;
        if max_change < params.min_corner_change {
            break;
        }
    }

    Some(current)
}

/// Slide a point up to two pixels along `normal` onto the strongest
/// gradient, with a parabolic sub-pixel peak fit.
fn snap_to_gradient(
    img: &GrayImageView<'_>,
    p: &Point2<f32>,
    normal: &Vector2<f32>,
) -> Option<Point2<f32>> {
    const SEARCH: i32 = 2;

    let magnitude_at = |offset: f32| -> f32 {
        let q = p + normal * offset;
        let ahead = planar_track_core::sample_bilinear(img, q.x + normal.x, q.y + normal.y);
        let behind = planar_track_core::sample_bilinear(img, q.x - normal.x, q.y - normal.y);
        (ahead - behind).abs()
    };

    let mut best_offset = 0i32;
    let mut best_mag = -1.0f32;
    for o in -SEARCH..=SEARCH {
        let m = magnitude_at(o as f32);
        if m > best_mag {
            best_mag = m;
            best_offset = o;
        }
    }
    if best_mag <= 1.0 {
        return None;
    }

    // Parabolic interpolation around the discrete peak.
    let m0 = magnitude_at((best_offset - 1) as f32);
    let m1 = best_mag;
    let m2 = magnitude_at((best_offset + 1) as f32);
    let denominator = m0 - 2.0 * m1 + m2;
    let sub = if denominator.abs() > 1e-6 {
        (0.5 * (m0 - m2) / denominator).clamp(-0.5, 0.5)
    } else {
        0.0
    };

    Some(p + normal * (best_offset as f32 + sub))
}

#[cfg(test)]
mod tests {
    use super::*;
    use planar_track_core::GrayImage;

    /// Closed rectangle boundary, counter-clockwise in image coords.
    fn rectangle_boundary(x0: i32, y0: i32, w: i32, h: i32) -> Vec<(i32, i32)> {
        let mut b = Vec::new();
        for x in x0..x0 + w {
            b.push((x, y0));
        }
        for y in y0..y0 + h {
            b.push((x0 + w, y));
        }
        for x in (x0 + 1..=x0 + w).rev() {
            b.push((x, y0 + h));
        }
        for y in (y0 + 1..=y0 + h).rev() {
            b.push((x0, y));
        }
        b
    }

    #[test]
    fn laplacian_peaks_find_rectangle_corners() {
        let boundary = rectangle_boundary(10, 20, 24, 16);
        let quad = extract_quad(&boundary, &QuadExtractionParams::default()).expect("quad");

        // Each extracted corner sits within the corner neighborhood.
        let expected = [
            (10.0, 20.0),
            (34.0, 20.0),
            (34.0, 36.0),
            (10.0, 36.0),
        ];
        for e in expected {
            let close = quad
                .corners
                .iter()
                .any(|c| (c.x - e.0).abs() <= 3.0 && (c.y - e.1).abs() <= 3.0);
            assert!(close, "no corner near {e:?} in {:?}", quad.corners);
        }
    }

    #[test]
    fn line_fits_recover_rectangle_sides() {
        let boundary = rectangle_boundary(8, 8, 30, 30);
        let params = QuadExtractionParams {
            corner_method: CornerMethod::LineFits,
            ..QuadExtractionParams::default()
        };
        let quad = extract_quad(&boundary, &params).expect("quad");
        assert!(quad.is_convex());
        assert!((quad.area() - 900.0).abs() < 90.0, "area = {}", quad.area());
    }

    #[test]
    fn too_short_boundary_is_rejected() {
        let boundary = vec![(0, 0), (1, 0), (1, 1)];
        assert!(extract_quad(&boundary, &QuadExtractionParams::default()).is_none());
    }

    #[test]
    fn validation_rejects_bad_geometry() {
        let params = QuadExtractionParams::default();

        let concave = Quad::from_arrays([[10.0, 10.0], [40.0, 10.0], [15.0, 15.0], [10.0, 40.0]]);
        assert!(!validate_quad(&concave, &params, 100, 100));

        let tiny = Quad::from_arrays([[10.0, 10.0], [13.0, 10.0], [13.0, 13.0], [10.0, 13.0]]);
        assert!(!validate_quad(&tiny, &params, 100, 100));

        let stretched =
            Quad::from_arrays([[10.0, 10.0], [90.0, 10.0], [90.0, 25.0], [10.0, 25.0]]);
        assert!(!validate_quad(&stretched, &params, 100, 100));

        let touching = Quad::from_arrays([[0.5, 10.0], [40.0, 10.0], [40.0, 40.0], [0.5, 40.0]]);
        assert!(!validate_quad(&touching, &params, 100, 100));

        let good = Quad::from_arrays([[10.0, 10.0], [40.0, 12.0], [42.0, 40.0], [11.0, 41.0]]);
        assert!(validate_quad(&good, &params, 100, 100));
    }

    fn render_dark_square(img: &mut GrayImage, x0: usize, y0: usize, side: usize) {
        for v in &mut img.data {
            *v = 200;
        }
        for y in y0..y0 + side {
            for x in x0..x0 + side {
                img.data[y * img.width + x] = 30;
            }
        }
    }

    #[test]
    fn refinement_pulls_corners_onto_the_edge() {
        let mut img = GrayImage::new(64, 64);
        render_dark_square(&mut img, 20, 20, 20);

        // Perturbed initial quad, off by about a pixel.
        let rough = Quad::from_arrays([
            [19.2, 20.6],
            [40.3, 19.4],
            [39.6, 40.6],
            [20.5, 39.5],
        ]);
        let refined = refine_quad(&img.view(), &rough, &QuadRefinementParams::default())
            .expect("refined quad");

        // The dark square's edges sit between pixel 19/20 and 39/40.
        let expected = [
            (19.5, 19.5),
            (39.5, 19.5),
            (39.5, 39.5),
            (19.5, 39.5),
        ];
        for (corner, e) in refined.corners.iter().zip(expected.iter()) {
            assert!(
                (corner.x - e.0).abs() < 1.0 && (corner.y - e.1).abs() < 1.0,
                "corner {corner:?} expected near {e:?}"
            );
        }
    }

    #[test]
    fn refinement_drops_diverging_quads() {
        let mut img = GrayImage::new(64, 64);
        render_dark_square(&mut img, 20, 20, 20);

        // A quad nowhere near the square: either too few edge samples or
        // a divergent first step.
        let lost = Quad::from_arrays([[2.0, 2.0], [12.0, 2.0], [12.0, 12.0], [2.0, 12.0]]);
        let params = QuadRefinementParams {
            max_corner_change: 1.0,
            ..QuadRefinementParams::default()
        };
        assert!(refine_quad(&img.view(), &lost, &params).is_none());
    }
}
