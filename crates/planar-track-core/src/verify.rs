use crate::{sample_bilinear, GrayImageView, PlanarTransform, Rect};

/// Result of a pixel-difference verification sweep.
///
/// A failed or drifted update reports `num_similar_pixels == 0`; callers
/// use these counters as the drift-detection signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PixelVerification {
    pub mean_absolute_difference: i32,
    pub num_in_bounds: usize,
    pub num_similar_pixels: usize,
}

/// Compare template pixels against the warped next image over a region.
///
/// Walks `region` of the template every `coordinate_increment` pixels,
/// projects each point with `transform`, bilinearly samples `next`, and
/// accumulates the absolute grayvalue differences. Points whose warp lands
/// outside `next` are skipped.
pub fn verify_projective_pixels(
    transform: &PlanarTransform,
    template: &GrayImageView<'_>,
    region: &Rect,
    next: &GrayImageView<'_>,
    coordinate_increment: usize,
    max_pixel_difference: u8,
) -> PixelVerification {
    let step = coordinate_increment.max(1);
    let clipped = region.clipped(template.width, template.height);
    let x0 = clipped.left as usize;
    let x1 = clipped.right as usize;
    let y0 = clipped.top as usize;
    let y1 = clipped.bottom as usize;

    let x_max = next.width as f32 - 1.0;
    let y_max = next.height as f32 - 1.0;

    let mut num_in_bounds = 0usize;
    let mut num_similar = 0usize;
    let mut total_difference = 0i64;

    let mut y = y0;
    while y <= y1 && y < template.height {
        let mut x = x0;
        while x <= x1 && x < template.width {
            let p = transform.transform_point(nalgebra::Point2::new(x as f32, y as f32), 1.0);

            if p.x.floor() >= 0.0 && p.x.ceil() <= x_max && p.y.floor() >= 0.0 && p.y.ceil() <= y_max
            {
                num_in_bounds += 1;

                let warped = sample_bilinear(next, p.x, p.y).round() as i32;
                let template_value = template.data[y * template.width + x] as i32;
                let difference = (warped - template_value).abs();
                total_difference += difference as i64;
                if difference <= max_pixel_difference as i32 {
                    num_similar += 1;
                }
            }
            x += step;
        }
        y += step;
    }

    let mean_absolute_difference = if num_in_bounds > 0 {
        (total_difference / num_in_bounds as i64) as i32
    } else {
        i32::MAX
    };

    PixelVerification {
        mean_absolute_difference,
        num_in_bounds,
        num_similar_pixels: num_similar,
    }
}
