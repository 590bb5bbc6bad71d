//! Core types for planar template tracking.
//!
//! This crate holds everything the tracker crates share: grayscale image
//! containers with bilinear sampling, binomial pyramids and gradient maps,
//! the [`PlanarTransform`] homography abstraction, the region histogram used
//! for grayvalue thresholding, and the scratch-arena accounting that bounds
//! per-frame allocations.

mod error;
mod geometry;
mod histogram;
mod image;
pub mod logger;
mod pyramid;
mod scratch;
mod transform;
mod verify;

pub use error::{TrackError, TrackResult};
pub use geometry::{round_half_down, Quad, Rect};
pub use histogram::{grayvalue_threshold, IntegerCounts};
pub use image::{
    initial_image_scale, sample_bilinear, sample_bilinear_f32, sample_bilinear_u8, GrayImage,
    GrayImageView, ImageF32, ImageI16, BASE_IMAGE_HEIGHT, BASE_IMAGE_WIDTH,
};
pub use pyramid::{
    build_pyramid, build_pyramid_f32, downsample_by_two, downsample_by_two_f32, x_gradient,
    x_gradient_f32, y_gradient, y_gradient_f32,
};
pub use scratch::{Arena, ScratchBuf, DEFAULT_QUANTUM};
pub use transform::{
    homography_from_4pt, homography_from_quad, PlanarTransform, TransformKind, CANONICAL_CORNERS,
    SERIALIZATION_TAG,
};
pub use verify::{verify_projective_pixels, PixelVerification};
