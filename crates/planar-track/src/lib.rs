//! High-level facade crate for the `planar-track-*` workspace.
//!
//! This crate provides:
//! - stable, convenient re-exports of the underlying crates
//! - end-to-end helpers that run the fiducial detector on a frame and
//!   seed a tracker from the best detection.

pub use planar_track_core as core;
pub use planar_track_edge as edge;
pub use planar_track_fiducial as fiducial;
pub use planar_track_lk as lk;

pub use planar_track_core::{
    Arena, GrayImage, GrayImageView, PixelVerification, PlanarTransform, Quad, TrackError,
    TrackResult, TransformKind,
};
pub use planar_track_edge::{EdgeTracker, EdgeTrackerParams, EdgeTrackerUpdateParams};
pub use planar_track_fiducial::{DetectedMarker, FiducialDetector, FiducialDetectorParams};
pub use planar_track_lk::{
    DenseTracker, DenseTrackerParams, LkTrackReport, LkUpdateParams, SampledTracker,
    SampledTrackerParams,
};

pub mod detect;
