//! Inverse-compositional Lucas-Kanade planar trackers.
//!
//! Three variants share the pyramid, warp, and convergence plumbing:
//!
//! - [`DenseTracker`] walks every template pixel per level. Most accurate,
//!   most work per frame.
//! - [`SampledTracker`] preselects the highest-gradient template points
//!   once and revisits only those.
//! - [`Planar6dofTracker`] fits updates in pose space (rotation +
//!   translation) using camera intrinsics and the marker's metric size.

mod common;
mod dense;
mod pose;
mod sampled;

pub use dense::{DenseTracker, DenseTrackerParams, LkTrackReport, LkUpdateParams};
pub use pose::{
    pose_from_quad, CameraIntrinsics, Planar6dofParams, Planar6dofTracker, PlanarPose,
};
pub use sampled::{approximate_select, SampledTracker, SampledTrackerParams, TemplateSample};
