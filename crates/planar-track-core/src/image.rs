use crate::{TrackError, TrackResult};

/// Reference image width the coordinate conventions are anchored to (QVGA).
pub const BASE_IMAGE_WIDTH: usize = 320;
pub const BASE_IMAGE_HEIGHT: usize = 240;

#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8], // row-major, len = w*h
}

#[derive(Clone, Debug)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0u8; width * height],
        }
    }

    pub fn from_vec(width: usize, height: usize, data: Vec<u8>) -> TrackResult<Self> {
        if data.len() != width * height {
            return Err(TrackError::InvalidSize("image data length != width*height"));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    #[inline]
    pub fn view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }
}

/// Floating-point image used by the sampled tracker pyramids.
#[derive(Clone, Debug)]
pub struct ImageF32 {
    pub width: usize,
    pub height: usize,
    pub data: Vec<f32>,
}

impl ImageF32 {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    pub fn from_gray(src: &GrayImageView<'_>) -> Self {
        Self {
            width: src.width,
            height: src.height,
            data: src.data.iter().map(|&v| v as f32).collect(),
        }
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> f32 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0.0;
        }
        self.data[y as usize * self.width + x as usize]
    }
}

/// Signed 16-bit image, the storage type of the dense tracker gradients.
#[derive(Clone, Debug)]
pub struct ImageI16 {
    pub width: usize,
    pub height: usize,
    pub data: Vec<i16>,
}

impl ImageI16 {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0i16; width * height],
        }
    }
}

#[inline]
fn get_gray(src: &GrayImageView<'_>, x: i32, y: i32) -> u8 {
    if x < 0 || y < 0 || x >= src.width as i32 || y >= src.height as i32 {
        return 0;
    }
    src.data[y as usize * src.width + x as usize]
}

#[inline]
pub fn sample_bilinear(src: &GrayImageView<'_>, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_gray(src, x0, y0) as f32;
    let p10 = get_gray(src, x0 + 1, y0) as f32;
    let p01 = get_gray(src, x0, y0 + 1) as f32;
    let p11 = get_gray(src, x0 + 1, y0 + 1) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

#[inline]
pub fn sample_bilinear_u8(src: &GrayImageView<'_>, x: f32, y: f32) -> u8 {
    sample_bilinear(src, x, y).clamp(0.0, 255.0) as u8
}

#[inline]
pub fn sample_bilinear_f32(src: &ImageF32, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = src.get(x0, y0);
    let p10 = src.get(x0 + 1, y0);
    let p01 = src.get(x0, y0 + 1);
    let p11 = src.get(x0 + 1, y0 + 1);

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

/// Power-of-two factor mapping `width` up to [`BASE_IMAGE_WIDTH`].
///
/// Trackers run on down-sampled frames but report coordinates in the base
/// resolution; this is the `scale` threaded through every warp.
pub fn initial_image_scale(width: usize) -> TrackResult<f32> {
    if width == 0 || BASE_IMAGE_WIDTH % width != 0 {
        return Err(TrackError::InvalidSize(
            "image width must divide the base width",
        ));
    }
    let factor = BASE_IMAGE_WIDTH / width;
    if !factor.is_power_of_two() {
        return Err(TrackError::InvalidSize(
            "image width must be a power-of-two fraction of the base width",
        ));
    }
    Ok(factor as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_sampling_interpolates_midpoints() {
        let img = GrayImage::from_vec(2, 2, vec![0, 100, 100, 200]).unwrap();
        let v = sample_bilinear(&img.view(), 0.5, 0.5);
        assert_eq!(v, 100.0);
        assert_eq!(sample_bilinear(&img.view(), 0.0, 0.0), 0.0);
    }

    #[test]
    fn out_of_bounds_reads_are_zero() {
        let img = GrayImage::from_vec(2, 2, vec![255; 4]).unwrap();
        assert_eq!(get_gray(&img.view(), -1, 0), 0);
        assert_eq!(get_gray(&img.view(), 0, 2), 0);
    }

    #[test]
    fn base_scale_accepts_power_of_two_widths() {
        assert_eq!(initial_image_scale(320).unwrap(), 1.0);
        assert_eq!(initial_image_scale(160).unwrap(), 2.0);
        assert_eq!(initial_image_scale(80).unwrap(), 4.0);
        assert!(initial_image_scale(100).is_err());
        assert!(initial_image_scale(0).is_err());
    }

    #[test]
    fn mismatched_data_length_is_rejected() {
        assert!(GrayImage::from_vec(3, 2, vec![0u8; 5]).is_err());
    }
}
