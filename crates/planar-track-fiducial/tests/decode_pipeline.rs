use planar_track_core::{Arena, GrayImage};
use planar_track_fiducial::{
    DecisionTreeNode, FiducialDecisionTree, FiducialDetector, FiducialDetectorParams,
    LEAF_LABEL_BIT,
};

const DARK: u8 = 35;
const LIGHT: u8 = 205;

/// A hollow ring marker with one dark code cell in its upper-left interior
/// quadrant.
fn coded_marker_frame() -> GrayImage {
    let mut img = GrayImage::new(160, 120);
    for v in &mut img.data {
        *v = LIGHT;
    }

    let (x0, y0, side, border) = (40usize, 30usize, 48usize, 2usize);
    for y in y0..y0 + side {
        for x in x0..x0 + side {
            let inner = x >= x0 + border
                && x < x0 + side - border
                && y >= y0 + border
                && y < y0 + side - border;
            if !inner {
                img.data[y * 160 + x] = DARK;
            }
        }
    }

    // Code cell centered on the quad's (-0.5, -0.5) canonical probe.
    for y in y0 + 6..y0 + 18 {
        for x in x0 + 6..x0 + 18 {
            img.data[y * 160 + x] = DARK;
        }
    }
    img
}

fn node(x: i16, y: i16, left: u16) -> DecisionTreeNode {
    DecisionTreeNode {
        probe_x_center: x,
        probe_y_center: y,
        left_child_index: left,
        label: 0,
    }
}

fn leaf(label: u16) -> DecisionTreeNode {
    DecisionTreeNode {
        probe_x_center: 0,
        probe_y_center: 0,
        left_child_index: 0,
        label: label | LEAF_LABEL_BIT,
    }
}

/// Root probes the coded cell (dark); its dark child probes the opposite
/// interior quadrant (light). Coordinates are Q8 over the canonical
/// [-1, 1] marker square.
fn code_tree() -> Vec<DecisionTreeNode> {
    vec![node(-128, -128, 1), node(128, 128, 2), leaf(5), leaf(7)]
}

fn detector_params() -> FiducialDetectorParams {
    FiducialDetectorParams {
        num_pyramid_levels: 1,
        min_component_pixels: 100,
        max_component_pixels: 10_000,
        ..FiducialDetectorParams::default()
    }
}

#[test]
fn detector_decodes_marker_identity_through_the_tree() {
    let img = coded_marker_frame();
    let nodes = code_tree();
    let offsets = [0i16];
    let tree = FiducialDecisionTree::new(&nodes, &offsets, &offsets, 8, 4).unwrap();

    let arena = Arena::new(4 << 20);
    let detector = FiducialDetector::new(detector_params()).with_decision_tree(tree);
    let detections = detector.detect(&img.view(), &arena).unwrap();

    assert_eq!(detections.len(), 1);
    let marker = &detections[0];
    assert_eq!(marker.marker_id, Some(7));
    assert!(!marker.numerical_failure);

    let centroid = marker.quad.centroid();
    assert!((centroid.x - 63.5).abs() < 2.0);
    assert!((centroid.y - 53.5).abs() < 2.0);
}

#[test]
fn flat_code_fails_the_contrast_gate() {
    // Same ring, but no code cell: the root probe reads light, so every
    // probe on the walk lands on one side and the decode is rejected.
    let mut img = GrayImage::new(160, 120);
    for v in &mut img.data {
        *v = LIGHT;
    }
    let (x0, y0, side, border) = (40usize, 30usize, 48usize, 2usize);
    for y in y0..y0 + side {
        for x in x0..x0 + side {
            let inner = x >= x0 + border
                && x < x0 + side - border
                && y >= y0 + border
                && y < y0 + side - border;
            if !inner {
                img.data[y * 160 + x] = DARK;
            }
        }
    }

    let nodes = code_tree();
    let offsets = [0i16];
    let tree = FiducialDecisionTree::new(&nodes, &offsets, &offsets, 8, 4).unwrap();

    let arena = Arena::new(4 << 20);
    let detector = FiducialDetector::new(detector_params()).with_decision_tree(tree);
    let detections = detector.detect(&img.view(), &arena).unwrap();

    // The quad is geometrically fine but the decode gate drops it.
    assert!(detections.is_empty());
}
