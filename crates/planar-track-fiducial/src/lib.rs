//! Fiducial marker detection.
//!
//! Turns a raw grayscale frame into a list of marker detections: adaptive
//! binarization over a pyramid, segment-based connected components with
//! hollow-marker filtering, boundary tracing, quadrilateral fitting and
//! refinement, and decision-tree identity decoding. Each detection carries
//! the homography that maps the canonical marker square into the image,
//! ready to seed a tracker.

mod binarize;
mod boundary;
mod components;
mod decode;
mod detector;
mod quads;

pub use binarize::{binarize_adaptive, THRESHOLD_MULTIPLIER_ONE};
pub use boundary::trace_exterior_boundary;
pub use components::{
    extract_components, ComponentSegment, ConnectedComponents, ExtractionParams,
    FIXED_POINT_SCALE,
};
pub use decode::{
    decode_marker, DecisionTreeNode, FiducialDecisionTree, MarkerDecode, TreeClassification,
    LEAF_LABEL_BIT,
};
pub use detector::{DetectedMarker, FiducialDetector, FiducialDetectorParams};
pub use quads::{
    extract_quad, refine_quad, validate_quad, CornerMethod, QuadExtractionParams,
    QuadRefinementParams,
};
