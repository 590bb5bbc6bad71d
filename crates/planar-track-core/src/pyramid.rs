//! Binomial pyramids and centered-difference gradients.

use crate::{GrayImage, GrayImageView, ImageF32, ImageI16};

const BINOMIAL: [i32; 3] = [1, 2, 1];

#[inline]
fn clamp_coord(v: i32, max: usize) -> usize {
    v.clamp(0, max as i32 - 1) as usize
}

/// Downsample by two with a (1,2,1)^2 binomial kernel, borders clamped.
pub fn downsample_by_two(src: &GrayImageView<'_>) -> GrayImage {
    let out_w = src.width / 2;
    let out_h = src.height / 2;
    let mut out = GrayImage::new(out_w, out_h);

    for y in 0..out_h {
        for x in 0..out_w {
            let cx = (2 * x) as i32;
            let cy = (2 * y) as i32;
            let mut acc = 0i32;
            for (j, wy) in BINOMIAL.iter().enumerate() {
                let sy = clamp_coord(cy + j as i32 - 1, src.height);
                for (i, wx) in BINOMIAL.iter().enumerate() {
                    let sx = clamp_coord(cx + i as i32 - 1, src.width);
                    acc += wy * wx * src.data[sy * src.width + sx] as i32;
                }
            }
            out.data[y * out_w + x] = ((acc + 8) / 16) as u8;
        }
    }
    out
}

/// Float variant of [`downsample_by_two`], used by the sampled tracker.
pub fn downsample_by_two_f32(src: &ImageF32) -> ImageF32 {
    let out_w = src.width / 2;
    let out_h = src.height / 2;
    let mut out = ImageF32::new(out_w, out_h);

    for y in 0..out_h {
        for x in 0..out_w {
            let cx = (2 * x) as i32;
            let cy = (2 * y) as i32;
            let mut acc = 0.0f32;
            for (j, wy) in BINOMIAL.iter().enumerate() {
                let sy = clamp_coord(cy + j as i32 - 1, src.height);
                for (i, wx) in BINOMIAL.iter().enumerate() {
                    let sx = clamp_coord(cx + i as i32 - 1, src.width);
                    acc += (wy * wx) as f32 * src.data[sy * src.width + sx];
                }
            }
            out.data[y * out_w + x] = acc / 16.0;
        }
    }
    out
}

/// Repeated binomial downsampling; `levels` includes the base image.
pub fn build_pyramid(base: &GrayImageView<'_>, levels: usize) -> Vec<GrayImage> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(GrayImage {
        width: base.width,
        height: base.height,
        data: base.data.to_vec(),
    });
    for _ in 1..levels {
        let prev = pyramid.last().unwrap().view();
        pyramid.push(downsample_by_two(&prev));
    }
    pyramid
}

pub fn build_pyramid_f32(base: &ImageF32, levels: usize) -> Vec<ImageF32> {
    let mut pyramid = Vec::with_capacity(levels);
    pyramid.push(base.clone());
    for _ in 1..levels {
        let prev = pyramid.last().unwrap();
        pyramid.push(downsample_by_two_f32(prev));
    }
    pyramid
}

/// Horizontal difference `I(x+1) - I(x-1)`, borders zero.
///
/// The result is twice the true derivative; the tracker inner loops fold
/// the 1/2 into their gradient scaling.
pub fn x_gradient(src: &GrayImageView<'_>) -> ImageI16 {
    let mut out = ImageI16::new(src.width, src.height);
    if src.width < 3 {
        return out;
    }
    for y in 0..src.height {
        let row = &src.data[y * src.width..(y + 1) * src.width];
        let out_row = &mut out.data[y * src.width..(y + 1) * src.width];
        for x in 1..src.width - 1 {
            out_row[x] = row[x + 1] as i16 - row[x - 1] as i16;
        }
    }
    out
}

/// Vertical difference `I(y+1) - I(y-1)`, borders zero.
pub fn y_gradient(src: &GrayImageView<'_>) -> ImageI16 {
    let mut out = ImageI16::new(src.width, src.height);
    if src.height < 3 {
        return out;
    }
    for y in 1..src.height - 1 {
        for x in 0..src.width {
            let above = src.data[(y - 1) * src.width + x] as i16;
            let below = src.data[(y + 1) * src.width + x] as i16;
            out.data[y * src.width + x] = below - above;
        }
    }
    out
}

pub fn x_gradient_f32(src: &ImageF32) -> ImageF32 {
    let mut out = ImageF32::new(src.width, src.height);
    if src.width < 3 {
        return out;
    }
    for y in 0..src.height {
        for x in 1..src.width - 1 {
            out.data[y * src.width + x] =
                src.data[y * src.width + x + 1] - src.data[y * src.width + x - 1];
        }
    }
    out
}

pub fn y_gradient_f32(src: &ImageF32) -> ImageF32 {
    let mut out = ImageF32::new(src.width, src.height);
    if src.height < 3 {
        return out;
    }
    for y in 1..src.height - 1 {
        for x in 0..src.width {
            out.data[y * src.width + x] =
                src.data[(y + 1) * src.width + x] - src.data[(y - 1) * src.width + x];
        }
    }
    out
}
