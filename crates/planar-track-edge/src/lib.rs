//! Edge-crossing extraction and the edge-based planar template tracker.
//!
//! The tracker follows a quadrilateral template using sparse, signed
//! edge-crossing points instead of raw pixels: fast and tolerant of
//! illumination shift, at the cost of some precision.

mod detect;
mod lists;
mod ransac;
mod tracker;

pub use detect::{
    detect_edges, detect_edges_derivative, detect_edges_grayvalue, EdgeDetectionMode,
    EdgeDetectionParams,
};
pub use lists::{AllIndexLimits, EdgeLists, EdgePoint};
pub use ransac::RansacParams;
pub use tracker::{
    EdgeTrackReport, EdgeTracker, EdgeTrackerParams, EdgeTrackerUpdateParams, RefineStrategy,
    ThresholdParams,
};
