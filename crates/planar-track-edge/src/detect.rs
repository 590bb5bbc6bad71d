//! Edge extraction: grayvalue-threshold and derivative-comb modes.

use planar_track_core::{GrayImageView, Rect};
use serde::{Deserialize, Serialize};

use crate::{EdgeLists, EdgePoint};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeDetectionMode {
    /// Binarize at a grayvalue threshold, emit transition points.
    Grayvalue,
    /// First-difference comb; local extrema above a response threshold.
    Derivative,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeDetectionParams {
    pub mode: EdgeDetectionMode,
    /// Minimum run length before a transition counts (1..=4 typical).
    pub min_component_width: usize,
    /// Per-list capacity; points beyond it are silently dropped.
    pub max_detections_per_type: usize,
    /// Process every n-th scan line; 2 roughly halves the point count.
    pub every_n_lines: usize,
    /// Half width of the derivative comb (derivative mode only).
    pub comb_half_width: usize,
    /// Minimum absolute comb response (derivative mode only).
    pub comb_response_threshold: i16,
}

impl Default for EdgeDetectionParams {
    fn default() -> Self {
        Self {
            mode: EdgeDetectionMode::Grayvalue,
            min_component_width: 2,
            max_detections_per_type: 2000,
            every_n_lines: 1,
            comb_half_width: 1,
            comb_response_threshold: 20,
        }
    }
}

fn clip_bounds(roi: Option<&Rect>, width: usize, height: usize) -> (usize, usize, usize, usize) {
    match roi {
        Some(r) => {
            let c = r.clipped(width, height);
            (
                c.left.max(0.0) as usize,
                (c.right.max(0.0) as usize).min(width - 1),
                c.top.max(0.0) as usize,
                (c.bottom.max(0.0) as usize).min(height - 1),
            )
        }
        None => (0, width - 1, 0, height - 1),
    }
}

/// Detect edges with the mode selected in `params`.
///
/// `threshold` is only consulted in grayvalue mode. The output lists come
/// back in their declared sort orders (rows outer for the x lists, columns
/// outer for the y lists).
pub fn detect_edges(
    img: &GrayImageView<'_>,
    roi: Option<&Rect>,
    threshold: u8,
    params: &EdgeDetectionParams,
) -> EdgeLists {
    match params.mode {
        EdgeDetectionMode::Grayvalue => detect_edges_grayvalue(img, roi, threshold, params),
        EdgeDetectionMode::Derivative => detect_edges_derivative(img, roi, params),
    }
}

/// Grayvalue-threshold mode: scan-line binary transitions.
pub fn detect_edges_grayvalue(
    img: &GrayImageView<'_>,
    roi: Option<&Rect>,
    threshold: u8,
    params: &EdgeDetectionParams,
) -> EdgeLists {
    let mut out = EdgeLists::new(img.width, img.height, params.max_detections_per_type);
    if img.width < 2 || img.height < 2 {
        return out;
    }

    let (x0, x1, y0, y1) = clip_bounds(roi, img.width, img.height);
    let step = params.every_n_lines.max(1);
    let min_run = params.min_component_width.max(1);
    let max = params.max_detections_per_type;

    // Horizontal scan: dark->light is x_increasing, light->dark x_decreasing.
    let mut y = y0;
    while y <= y1 {
        let row = &img.data[y * img.width..(y + 1) * img.width];
        let mut prev = row[x0] > threshold;
        let mut run_len = 1usize;
        for x in (x0 + 1)..=x1 {
            let cur = row[x] > threshold;
            if cur != prev {
                if run_len >= min_run {
                    let list = if cur {
                        &mut out.x_increasing
                    } else {
                        &mut out.x_decreasing
                    };
                    EdgeLists::push_capped(list, max, x as i16, y as i16);
                }
                prev = cur;
                run_len = 1;
            } else {
                run_len += 1;
            }
        }
        y += step;
    }

    // Vertical scan, columns outer so the y lists sort by (x, y).
    let mut x = x0;
    while x <= x1 {
        let mut prev = img.data[y0 * img.width + x] > threshold;
        let mut run_len = 1usize;
        for yy in (y0 + 1)..=y1 {
            let cur = img.data[yy * img.width + x] > threshold;
            if cur != prev {
                if run_len >= min_run {
                    let list = if cur {
                        &mut out.y_increasing
                    } else {
                        &mut out.y_decreasing
                    };
                    EdgeLists::push_capped(list, max, x as i16, yy as i16);
                }
                prev = cur;
                run_len = 1;
            } else {
                run_len += 1;
            }
        }
        x += step;
    }

    out
}

/// Derivative-threshold mode: comb response extrema.
pub fn detect_edges_derivative(
    img: &GrayImageView<'_>,
    roi: Option<&Rect>,
    params: &EdgeDetectionParams,
) -> EdgeLists {
    let mut out = EdgeLists::new(img.width, img.height, params.max_detections_per_type);
    let c = params.comb_half_width.max(1);
    if img.width < 2 * c + 1 || img.height < 2 * c + 1 {
        return out;
    }

    let (x0, x1, y0, y1) = clip_bounds(roi, img.width, img.height);
    let step = params.every_n_lines.max(1);
    let thr = params.comb_response_threshold as i32;
    let max = params.max_detections_per_type;

    let response_x = |x: usize, y: usize| -> i32 {
        img.data[y * img.width + x + c] as i32 - img.data[y * img.width + x - c] as i32
    };
    let response_y = |x: usize, y: usize| -> i32 {
        img.data[(y + c) * img.width + x] as i32 - img.data[(y - c) * img.width + x] as i32
    };

    let lo_x = x0.max(c + 1);
    let hi_x = x1.min(img.width - c - 2);
    let lo_y = y0.max(c + 1);
    let hi_y = y1.min(img.height - c - 2);

    let mut y = y0.max(c);
    while y <= y1.min(img.height - 1 - c) {
        for x in lo_x..=hi_x {
            let r = response_x(x, y);
            if r.abs() < thr {
                continue;
            }
            let left = response_x(x - 1, y);
            let right = response_x(x + 1, y);
            if r.abs() >= left.abs() && r.abs() > right.abs() {
                let list = if r > 0 {
                    &mut out.x_increasing
                } else {
                    &mut out.x_decreasing
                };
                EdgeLists::push_capped(list, max, x as i16, y as i16);
            }
        }
        y += step;
    }

    let mut x = x0.max(c);
    while x <= x1.min(img.width - 1 - c) {
        for yy in lo_y..=hi_y {
            let r = response_y(x, yy);
            if r.abs() < thr {
                continue;
            }
            let up = response_y(x, yy - 1);
            let down = response_y(x, yy + 1);
            if r.abs() >= up.abs() && r.abs() > down.abs() {
                let list = if r > 0 {
                    &mut out.y_increasing
                } else {
                    &mut out.y_decreasing
                };
                EdgeLists::push_capped(list, max, x as i16, yy as i16);
            }
        }
        x += step;
    }

    out
}

pub(crate) fn assert_sorted(points: &[EdgePoint], row_major: bool) -> bool {
    points.windows(2).all(|w| {
        let (a, b) = (w[0], w[1]);
        if row_major {
            (a.y, a.x) <= (b.y, b.x)
        } else {
            (a.x, a.y) <= (b.x, b.y)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use planar_track_core::GrayImage;

    /// A dark square on a light background.
    fn square_image() -> GrayImage {
        let mut img = GrayImage::new(32, 32);
        for v in &mut img.data {
            *v = 220;
        }
        for y in 8..24 {
            for x in 10..20 {
                img.data[y * 32 + x] = 30;
            }
        }
        img
    }

    #[test]
    fn grayvalue_mode_finds_square_sides() {
        let img = square_image();
        let params = EdgeDetectionParams::default();
        let edges = detect_edges_grayvalue(&img.view(), None, 128, &params);

        // One light->dark and one dark->light crossing per interior row.
        assert_eq!(edges.x_decreasing.len(), 16);
        assert_eq!(edges.x_increasing.len(), 16);
        assert_eq!(edges.y_decreasing.len(), 10);
        assert_eq!(edges.y_increasing.len(), 10);

        assert!(edges.x_decreasing.iter().all(|p| p.x == 10));
        assert!(edges.x_increasing.iter().all(|p| p.x == 20));
        assert!(edges.y_decreasing.iter().all(|p| p.y == 8));
        assert!(edges.y_increasing.iter().all(|p| p.y == 24));
    }

    #[test]
    fn outputs_keep_their_sort_orders() {
        let img = square_image();
        let edges = detect_edges_grayvalue(&img.view(), None, 128, &EdgeDetectionParams::default());
        assert!(assert_sorted(&edges.x_decreasing, true));
        assert!(assert_sorted(&edges.x_increasing, true));
        assert!(assert_sorted(&edges.y_decreasing, false));
        assert!(assert_sorted(&edges.y_increasing, false));
    }

    #[test]
    fn line_stride_halves_the_row_count() {
        let img = square_image();
        let mut params = EdgeDetectionParams::default();
        params.every_n_lines = 2;
        let edges = detect_edges_grayvalue(&img.view(), None, 128, &params);
        assert_eq!(edges.x_decreasing.len(), 8);
    }

    #[test]
    fn capacity_cap_drops_overflow() {
        let img = square_image();
        let mut params = EdgeDetectionParams::default();
        params.max_detections_per_type = 5;
        let edges = detect_edges_grayvalue(&img.view(), None, 128, &params);
        assert_eq!(edges.x_decreasing.len(), 5);
        assert_eq!(edges.x_increasing.len(), 5);
    }

    #[test]
    fn derivative_mode_marks_the_same_sides() {
        let img = square_image();
        let mut params = EdgeDetectionParams::default();
        params.mode = EdgeDetectionMode::Derivative;
        let edges = detect_edges(&img.view(), None, 0, &params);

        assert!(!edges.x_decreasing.is_empty());
        assert!(!edges.x_increasing.is_empty());
        // Transitions sit next to the square's left and right sides.
        assert!(edges.x_decreasing.iter().all(|p| (p.x - 10).abs() <= 1));
        assert!(edges.x_increasing.iter().all(|p| (p.x - 19).abs() <= 1));
        assert!(assert_sorted(&edges.y_increasing, false));
    }

    #[test]
    fn roi_limits_detection() {
        let img = square_image();
        let roi = Rect::new(0.0, 31.0, 0.0, 15.0);
        let edges =
            detect_edges_grayvalue(&img.view(), Some(&roi), 128, &EdgeDetectionParams::default());
        assert!(edges.x_decreasing.iter().all(|p| p.y <= 15));
        // The bottom side of the square lies outside the ROI.
        assert!(edges.y_increasing.is_empty());
    }
}
