//! Adaptive binarization against a local box-filtered mean.

use planar_track_core::{GrayImage, GrayImageView};

/// Q16 fixed-point unit for the threshold multiplier (65536 = 1.0).
pub const THRESHOLD_MULTIPLIER_ONE: u32 = 1 << 16;

/// Binarize `img` against its local mean: a pixel is "on" (dark, marker
/// ink) where `pixel * 65536 < local_mean * threshold_multiplier`.
///
/// The local mean comes from a `(2 * window_radius + 1)^2` box filter
/// evaluated through an integral image, clamped at the borders.
pub fn binarize_adaptive(
    img: &GrayImageView<'_>,
    window_radius: usize,
    threshold_multiplier: u32,
) -> GrayImage {
    let w = img.width;
    let h = img.height;
    let mut out = GrayImage::new(w, h);
    if w == 0 || h == 0 {
        return out;
    }

    // Integral image with a zero row/column prefix.
    let iw = w + 1;
    let mut integral = vec![0u64; iw * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += img.data[y * w + x] as u64;
            integral[(y + 1) * iw + x + 1] = integral[y * iw + x + 1] + row_sum;
        }
    }

    let r = window_radius as i64;
    for y in 0..h {
        let y0 = (y as i64 - r).max(0) as usize;
        let y1 = (y as i64 + r + 1).min(h as i64) as usize;
        for x in 0..w {
            let x0 = (x as i64 - r).max(0) as usize;
            let x1 = (x as i64 + r + 1).min(w as i64) as usize;

            let area = ((y1 - y0) * (x1 - x0)) as u64;
            let sum = integral[y1 * iw + x1] + integral[y0 * iw + x0]
                - integral[y0 * iw + x1]
                - integral[y1 * iw + x0];

            let pixel = img.data[y * w + x] as u64;
            // pixel/mean < multiplier/2^16, cross-multiplied.
            let dark =
                pixel * area * (THRESHOLD_MULTIPLIER_ONE as u64) < sum * threshold_multiplier as u64;
            out.data[y * w + x] = dark as u8;
        }
    }
    out
}
