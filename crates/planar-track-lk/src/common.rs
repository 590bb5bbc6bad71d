//! Helpers shared by the Lucas-Kanade tracker variants: the zero-centered
//! template grids, per-iteration warp parameters, and the saved-corners
//! convergence test.

use nalgebra::Point2;
use planar_track_core::{
    GrayImageView, PlanarTransform, Quad, BASE_IMAGE_HEIGHT, BASE_IMAGE_WIDTH,
};

/// How many previous corner sets the convergence test compares against.
pub(crate) const NUM_PREVIOUS_QUADS_TO_COMPARE: usize = 2;

/// Fewer in-bounds samples than this aborts an iteration as track-lost.
pub(crate) const MIN_IN_BOUNDS_SAMPLES: usize = 16;

/// An evenly spaced coordinate sequence, evaluated lazily.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Linspace {
    pub start: f32,
    pub step: f32,
    pub len: usize,
}

pub(crate) fn linspace(min: f32, max: f32, len: usize) -> Linspace {
    let step = if len > 1 {
        (max - min) / (len - 1) as f32
    } else {
        0.0
    };
    Linspace {
        start: min,
        step,
        len,
    }
}

/// Zero-centered template coordinates for one pyramid level.
#[derive(Clone, Copy, Debug)]
pub(crate) struct TemplateGrid {
    pub xs: Linspace,
    pub ys: Linspace,
}

/// Grid for a template region at pyramid scale `2^level`: the coordinate
/// range stays the full region, the point count halves per level.
pub(crate) fn level_grid(region_width: f32, region_height: f32, scale: f32) -> TemplateGrid {
    let nx = (region_width / scale).floor().max(1.0) as usize;
    let ny = (region_height / scale).floor().max(1.0) as usize;
    TemplateGrid {
        xs: linspace(-region_width / 2.0, region_width / 2.0, nx),
        ys: linspace(-region_height / 2.0, region_height / 2.0, ny),
    }
}

/// Homography entries pre-scaled for warping zero-centered template
/// coordinates into a tracking-resolution image.
///
/// The translation column is divided by the initial image scale and the
/// projective row multiplied by it, so base-resolution homographies warp
/// down-sampled frames directly.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WarpParams {
    h00: f32,
    h01: f32,
    h02: f32,
    h10: f32,
    h11: f32,
    h12: f32,
    h20: f32,
    h21: f32,
    cx: f32,
    cy: f32,
}

impl WarpParams {
    pub fn new(transform: &PlanarTransform, initial_scale: f32) -> Self {
        let h = transform.homography();
        let offset = transform.center_offset(initial_scale);
        Self {
            h00: h[(0, 0)],
            h01: h[(0, 1)],
            h02: h[(0, 2)] / initial_scale,
            h10: h[(1, 0)],
            h11: h[(1, 1)],
            h12: h[(1, 2)] / initial_scale,
            h20: h[(2, 0)] * initial_scale,
            h21: h[(2, 1)] * initial_scale,
            cx: offset.x,
            cy: offset.y,
        }
    }

    #[inline]
    pub fn warp(&self, x: f32, y: f32) -> (f32, f32) {
        let w = self.h20 * x + self.h21 * y + 1.0;
        let xt = (self.h00 * x + self.h01 * y + self.h02) / w + self.cx;
        let yt = (self.h10 * x + self.h11 * y + self.h12) / w + self.cy;
        (xt, yt)
    }
}

/// Bilinear sample with an explicit floor/ceil in-bounds test.
#[inline]
pub(crate) fn sample_checked(img: &GrayImageView<'_>, x: f32, y: f32) -> Option<f32> {
    let x0 = x.floor();
    let y0 = y.floor();
    if x0 < 0.0 || y0 < 0.0 || x.ceil() > img.width as f32 - 1.0 || y.ceil() > img.height as f32 - 1.0
    {
        return None;
    }
    let x0i = x0 as usize;
    let y0i = y0 as usize;
    let x1i = (x0i + 1).min(img.width - 1);
    let y1i = (y0i + 1).min(img.height - 1);
    let fx = x - x0;
    let fy = y - y0;

    let p00 = img.data[y0i * img.width + x0i] as f32;
    let p10 = img.data[y0i * img.width + x1i] as f32;
    let p01 = img.data[y1i * img.width + x0i] as f32;
    let p11 = img.data[y1i * img.width + x1i] as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    Some(a + fy * (b - a))
}

/// Queue of recently produced corner sets for the convergence test.
///
/// Each call projects the base image's corner quad through the current
/// transformation, reports the minimum mean corner displacement against
/// the saved sets, and shifts the queue.
#[derive(Clone, Debug)]
pub(crate) struct CornerHistory {
    previous: [Quad; NUM_PREVIOUS_QUADS_TO_COMPARE],
}

impl CornerHistory {
    pub fn new() -> Self {
        let far = Point2::new(-1e10f32, -1e10f32);
        Self {
            previous: [Quad::new([far; 4]); NUM_PREVIOUS_QUADS_TO_COMPARE],
        }
    }

    pub fn update(&mut self, transform: &PlanarTransform) -> f32 {
        let hw = BASE_IMAGE_WIDTH as f32 / 2.0;
        let hh = BASE_IMAGE_HEIGHT as f32 / 2.0;
        let base = Quad::from_arrays([[-hw, -hh], [hw, -hh], [hw, hh], [-hw, hh]]);
        let current = transform.transform_quad(&base, 1.0);

        let mut min_change = f32::INFINITY;
        for prev in &self.previous {
            min_change = min_change.min(prev.mean_corner_distance(&current));
        }

        self.previous.rotate_left(1);
        self.previous[NUM_PREVIOUS_QUADS_TO_COMPARE - 1] = current;

        min_change
    }
}
