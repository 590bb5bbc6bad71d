//! Marker identity decoding with a packed decision tree.
//!
//! Each node probes a point in the canonical marker frame (fixed-point
//! coordinates plus a small neighborhood of offsets, averaged), compares
//! against the current grayscale threshold, and descends. Leaves carry the
//! marker label in the low bits.

use nalgebra::Matrix3;
use planar_track_core::{GrayImageView, TrackError, TrackResult};

/// High bit of [`DecisionTreeNode::label`]: set on leaves.
pub const LEAF_LABEL_BIT: u16 = 0x8000;

/// One packed tree node.
///
/// Probe coordinates are fixed point with an out-of-band fractional bit
/// count; internal nodes descend to `left_child_index` on a dark probe and
/// `left_child_index + 1` on a light one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecisionTreeNode {
    pub probe_x_center: i16,
    pub probe_y_center: i16,
    pub left_child_index: u16,
    pub label: u16,
}

impl DecisionTreeNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.label & LEAF_LABEL_BIT != 0
    }

    #[inline]
    pub fn leaf_label(&self) -> u16 {
        self.label & !LEAF_LABEL_BIT
    }
}

/// A borrowed decision tree; the node and offset tables are not copied.
pub struct FiducialDecisionTree<'a> {
    nodes: &'a [DecisionTreeNode],
    probe_x_offsets: &'a [i16],
    probe_y_offsets: &'a [i16],
    num_fractional_bits: u8,
    max_depth: usize,
}

/// Result of a classification, with the probe statistics needed for the
/// contrast gate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TreeClassification {
    pub label: u16,
    /// Mean grayvalue over probes that read dark.
    pub dark_mean: Option<f32>,
    /// Mean grayvalue over probes that read light.
    pub light_mean: Option<f32>,
}

impl<'a> FiducialDecisionTree<'a> {
    pub fn new(
        nodes: &'a [DecisionTreeNode],
        probe_x_offsets: &'a [i16],
        probe_y_offsets: &'a [i16],
        num_fractional_bits: u8,
        max_depth: usize,
    ) -> TrackResult<Self> {
        if nodes.is_empty() {
            return Err(TrackError::InvalidParameters("decision tree has no nodes"));
        }
        if probe_x_offsets.len() != probe_y_offsets.len() || probe_x_offsets.is_empty() {
            return Err(TrackError::InvalidParameters(
                "probe offset tables must be non-empty and equal length",
            ));
        }
        Ok(Self {
            nodes,
            probe_x_offsets,
            probe_y_offsets,
            num_fractional_bits,
            max_depth,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Walk the tree over `image` under `homography` (canonical marker
    /// frame to image pixels) and return the leaf label plus the dark and
    /// light probe means.
    pub fn classify(
        &self,
        image: &GrayImageView<'_>,
        homography: &Matrix3<f32>,
        grayvalue_threshold: u32,
    ) -> TrackResult<TreeClassification> {
        let unit = (1i32 << self.num_fractional_bits) as f32;

        let mut dark_sum = 0.0f32;
        let mut dark_count = 0u32;
        let mut light_sum = 0.0f32;
        let mut light_count = 0u32;

        let mut node_index = 0usize;
        for _ in 0..=self.max_depth {
            let Some(node) = self.nodes.get(node_index) else {
                return Err(TrackError::InvalidObject(
                    "decision tree child index out of range",
                ));
            };
            if node.is_leaf() {
                return Ok(TreeClassification {
                    label: node.leaf_label(),
                    dark_mean: (dark_count > 0).then(|| dark_sum / dark_count as f32),
                    light_mean: (light_count > 0).then(|| light_sum / light_count as f32),
                });
            }

            let mut probe_sum = 0u32;
            for (ox, oy) in self.probe_x_offsets.iter().zip(self.probe_y_offsets) {
                let px = (node.probe_x_center + ox) as f32 / unit;
                let py = (node.probe_y_center + oy) as f32 / unit;

                let w = homography[(2, 0)] * px + homography[(2, 1)] * py + homography[(2, 2)];
                if w.abs() < 1e-9 {
                    return Err(TrackError::InvalidParameters(
                        "degenerate homography in tree classification",
                    ));
                }
                let u = (homography[(0, 0)] * px + homography[(0, 1)] * py + homography[(0, 2)]) / w;
                let v = (homography[(1, 0)] * px + homography[(1, 1)] * py + homography[(1, 2)]) / w;

                probe_sum += planar_track_core::sample_bilinear(image, u, v).round() as u32;
            }
            let mean = probe_sum as f32 / self.probe_x_offsets.len() as f32;

            if mean > grayvalue_threshold as f32 {
                light_sum += mean;
                light_count += 1;
                node_index = node.left_child_index as usize + 1;
            } else {
                dark_sum += mean;
                dark_count += 1;
                node_index = node.left_child_index as usize;
            }
        }

        Err(TrackError::InvalidObject(
            "decision tree walk exceeded the declared depth",
        ))
    }
}

/// A decoded marker identity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerDecode {
    pub label: u16,
    /// Light-probe mean over dark-probe mean.
    pub contrast_ratio: f32,
}

/// Classify and gate on probe contrast: the encoded-light probes must read
/// brighter than the encoded-dark ones by at least `min_contrast_ratio`.
pub fn decode_marker(
    image: &GrayImageView<'_>,
    homography: &Matrix3<f32>,
    tree: &FiducialDecisionTree<'_>,
    grayvalue_threshold: u32,
    min_contrast_ratio: f32,
) -> TrackResult<Option<MarkerDecode>> {
    let classification = tree.classify(image, homography, grayvalue_threshold)?;

    let (Some(dark), Some(light)) = (classification.dark_mean, classification.light_mean) else {
        // All probes on one side of the threshold carries no code contrast.
        return Ok(None);
    };
    let contrast_ratio = light / dark.max(1.0);
    if contrast_ratio < min_contrast_ratio {
        return Ok(None);
    }

    Ok(Some(MarkerDecode {
        label: classification.label,
        contrast_ratio,
    }))
}
