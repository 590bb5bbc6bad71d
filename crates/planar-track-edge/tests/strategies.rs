use nalgebra::Point2;
use planar_track_core::{Arena, GrayImage, Quad};
use planar_track_edge::{
    EdgeTracker, EdgeTrackerParams, EdgeTrackerUpdateParams, RansacParams, RefineStrategy,
};

fn marker_image(left: usize, top: usize) -> GrayImage {
    let mut img = GrayImage::new(96, 96);
    for v in &mut img.data {
        *v = 210;
    }
    for y in top..top + 30 {
        for x in left..left + 26 {
            img.data[y * 96 + x] = 40;
        }
    }
    img
}

fn init_tracker() -> EdgeTracker {
    let template = marker_image(30, 26);
    let quad = Quad::from_arrays([[30.0, 26.0], [56.0, 26.0], [56.0, 56.0], [30.0, 56.0]]);
    let mut params = EdgeTrackerParams::default();
    params.template_region_scale = 1.3;
    EdgeTracker::new(&template.view(), &quad, &params).unwrap()
}

fn assert_translation_recovered(tracker: &EdgeTracker, dx: f32, dy: f32) {
    let p = tracker
        .transformation()
        .transform_point(Point2::new(43.0, 41.0), 1.0);
    assert!((p.x - (43.0 + dx)).abs() < 0.6, "x = {}", p.x);
    assert!((p.y - (41.0 + dy)).abs() < 0.6, "y = {}", p.y);
}

#[test]
fn all_three_strategies_recover_the_same_motion() {
    let next = marker_image(33, 24); // +3, -2

    for strategy in [
        RefineStrategy::Direct,
        RefineStrategy::List {
            max_matches_per_type: 1000,
        },
        RefineStrategy::Ransac(RansacParams::default()),
    ] {
        let mut tracker = init_tracker();
        let mut params = EdgeTrackerUpdateParams::default();
        params.strategy = strategy;

        let arena = Arena::new(2 << 20);
        let report = tracker
            .update_track(&next.view(), &params, &arena)
            .expect("update");

        assert_translation_recovered(&tracker, 3.0, -2.0);
        assert!(report.num_matched_points * 10 >= report.num_template_points * 8);
        assert_eq!(arena.used(), 0, "scratch fully released");
    }
}

#[test]
fn repeated_updates_follow_slow_drift() {
    let mut tracker = init_tracker();
    let arena = Arena::new(2 << 20);
    let params = EdgeTrackerUpdateParams::default();

    // Drift one pixel right per frame for four frames.
    for step in 1..=4usize {
        let next = marker_image(30 + step, 26);
        tracker.update_track(&next.view(), &params, &arena).unwrap();
    }
    assert_translation_recovered(&tracker, 4.0, 0.0);
}
