//! Connected components as sorted lists of horizontal segments.
//!
//! A component is the set of segments sharing an id; id 0 marks an
//! invalidated segment. The representation keeps bounding boxes, pixel
//! counts, and hollow-row tests cheap, and ids compress in place after
//! filtering.

use planar_track_core::{Arena, GrayImage, TrackError, TrackResult};

/// Scale constant for the Q23.8 fixed-point filter thresholds.
pub const FIXED_POINT_SCALE: i64 = 256;

/// One horizontal run of a binary component; `x_end` is inclusive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ComponentSegment {
    pub x_start: u16,
    pub x_end: u16,
    pub y: u16,
    pub id: u16,
}

impl ComponentSegment {
    pub fn new(x_start: u16, x_end: u16, y: u16, id: u16) -> Self {
        Self {
            x_start,
            x_end,
            y,
            id,
        }
    }

    #[inline]
    pub fn num_pixels(&self) -> usize {
        (self.x_end - self.x_start) as usize + 1
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConnectedComponents {
    pub segments: Vec<ComponentSegment>,
    maximum_id: u16,
}

#[derive(Clone, Copy, Debug, Default)]
struct ComponentStats {
    num_pixels: usize,
    min_x: u16,
    max_x: u16,
    min_y: u16,
    max_y: u16,
    present: bool,
}

impl ConnectedComponents {
    pub fn from_segments(segments: Vec<ComponentSegment>) -> Self {
        let maximum_id = segments.iter().map(|s| s.id).max().unwrap_or(0);
        Self {
            segments,
            maximum_id,
        }
    }

    pub fn maximum_id(&self) -> u16 {
        self.maximum_id
    }

    fn stats(&self) -> Vec<ComponentStats> {
        let mut stats = vec![
            ComponentStats {
                min_x: u16::MAX,
                min_y: u16::MAX,
                ..ComponentStats::default()
            };
            self.maximum_id as usize + 1
        ];
        for s in &self.segments {
            if s.id == 0 {
                continue;
            }
            let st = &mut stats[s.id as usize];
            st.present = true;
            st.num_pixels += s.num_pixels();
            st.min_x = st.min_x.min(s.x_start);
            st.max_x = st.max_x.max(s.x_end);
            st.min_y = st.min_y.min(s.y);
            st.max_y = st.max_y.max(s.y);
        }
        stats
    }

    fn invalidate(&mut self, dead: &[bool]) {
        for s in &mut self.segments {
            if s.id != 0 && dead[s.id as usize] {
                s.id = 0;
            }
        }
    }

    /// Zero the ids of components whose pixel count lies outside
    /// `[min_pixels, max_pixels]`.
    pub fn invalidate_small_or_large(&mut self, min_pixels: usize, max_pixels: usize) {
        let stats = self.stats();
        let dead: Vec<bool> = stats
            .iter()
            .map(|st| st.present && (st.num_pixels < min_pixels || st.num_pixels > max_pixels))
            .collect();
        self.invalidate(&dead);
    }

    /// Zero the ids of components whose fill ratio (pixel count over
    /// bounding-box area) marks them as solid blobs or near-empty boxes.
    ///
    /// Thresholds are Q23.8: a component is too sparse when
    /// `pixels * sparse_threshold < area * 256` and too solid when
    /// `pixels * 256 > area * solid_threshold`.
    pub fn invalidate_solid_or_sparse(
        &mut self,
        sparse_multiply_threshold: i64,
        solid_multiply_threshold: i64,
    ) {
        let stats = self.stats();
        let dead: Vec<bool> = stats
            .iter()
            .map(|st| {
                if !st.present {
                    return false;
                }
                let width = (st.max_x - st.min_x) as i64 + 1;
                let height = (st.max_y - st.min_y) as i64 + 1;
                let area = width * height;
                let pixels = st.num_pixels as i64;
                let too_sparse = pixels * sparse_multiply_threshold < area * FIXED_POINT_SCALE;
                let too_solid = pixels * FIXED_POINT_SCALE > area * solid_multiply_threshold;
                too_sparse || too_solid
            })
            .collect();
        self.invalidate(&dead);
    }

    /// Keep only components with a hollow interior.
    ///
    /// Rows split into several segments are the candidates; such a row is
    /// hollow when its gap spans the bounding box's center column. A
    /// component survives when it has candidate rows at all and at least
    /// `min_hollow_ratio` of them are hollow. Solid border rows (one
    /// segment) do not count either way, so a closed marker ring passes
    /// with a ratio of 1.
    pub fn invalidate_filled_centers(&mut self, min_hollow_ratio: f32) {
        let stats = self.stats();
        let num_ids = stats.len();
        let mut rows_counted = vec![0u32; num_ids];
        let mut rows_hollow = vec![0u32; num_ids];

        // Segments are grouped by (id, y) after sort(); walk row runs.
        let mut i = 0usize;
        while i < self.segments.len() {
            let s = self.segments[i];
            let mut j = i + 1;
            while j < self.segments.len()
                && self.segments[j].id == s.id
                && self.segments[j].y == s.y
            {
                j += 1;
            }
            if s.id != 0 && j - i >= 2 {
                let id = s.id as usize;
                rows_counted[id] += 1;
                let st = &stats[id];
                let cx = ((st.min_x as u32 + st.max_x as u32) / 2) as u16;
                let covered = self.segments[i..j]
                    .iter()
                    .any(|seg| seg.x_start <= cx && cx <= seg.x_end);
                if !covered {
                    rows_hollow[id] += 1;
                }
            }
            i = j;
        }

        let dead: Vec<bool> = (0..num_ids)
            .map(|id| {
                if !stats[id].present {
                    return false;
                }
                if rows_counted[id] == 0 {
                    return true;
                }
                (rows_hollow[id] as f32) < min_hollow_ratio * rows_counted[id] as f32
            })
            .collect();
        self.invalidate(&dead);
    }

    /// Remap surviving ids onto dense `[1, maximum_id]`, ascending.
    pub fn compress_ids(&mut self) {
        let old_max = self.maximum_id as usize;
        let mut mapping = vec![0u16; old_max + 1];
        let mut next = 0u16;
        for s in &self.segments {
            if s.id != 0 && mapping[s.id as usize] == 0 {
                // First pass only marks presence; dense ids are assigned in
                // ascending old-id order below.
                mapping[s.id as usize] = u16::MAX;
            }
        }
        for slot in mapping.iter_mut() {
            if *slot == u16::MAX {
                next += 1;
                *slot = next;
            }
        }
        for s in &mut self.segments {
            if s.id != 0 {
                s.id = mapping[s.id as usize];
            }
        }
        self.maximum_id = next;
    }

    /// Segment indices of one component, in stored order.
    pub fn segments_of(&self, id: u16) -> impl Iterator<Item = &ComponentSegment> {
        self.segments.iter().filter(move |s| s.id == id)
    }

    /// Sort by (id, y, x_start); filters and tracing assume this order.
    pub fn sort(&mut self) {
        self.segments
            .sort_unstable_by_key(|s| (s.id, s.y, s.x_start));
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ExtractionParams {
    /// Shortest run emitted; shorter ones are skipped.
    pub min_component_width: usize,
    /// Gaps up to this many pixels within a row get bridged.
    pub max_skip_distance: usize,
    /// Hard cap on the total segment count.
    pub max_segments: usize,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            min_component_width: 0,
            max_skip_distance: 0,
            max_segments: 39_000,
        }
    }
}

/// Extract connected components from a binary image (nonzero = on).
///
/// Row runs are merged with `max_skip_distance` tolerance, then linked
/// across rows by x overlap through a union-find, producing a sorted
/// segment table with dense ids.
pub fn extract_components(
    binary: &GrayImage,
    params: &ExtractionParams,
    scratch: &Arena,
) -> TrackResult<ConnectedComponents> {
    let mut segments = scratch.alloc_with_capacity::<ComponentSegment>(params.max_segments)?;
    let mut parents = scratch.alloc_with_capacity::<u32>(params.max_segments)?;

    // Per-row 1-D extraction, provisional id = segment index.
    let mut prev_row_range = 0..0usize;
    for y in 0..binary.height {
        let row_start = segments.len();
        let row = &binary.data[y * binary.width..(y + 1) * binary.width];

        let mut run_start: Option<usize> = None;
        let mut last_on: Option<usize> = None;
        for x in 0..=binary.width {
            let on = x < binary.width && row[x] != 0;
            if on {
                if run_start.is_none() {
                    run_start = Some(x);
                } else if let Some(last) = last_on {
                    if x - last > params.max_skip_distance + 1 {
                        emit_run(
                            &mut segments,
                            &mut parents,
                            params,
                            run_start.take().unwrap(),
                            last,
                            y,
                        )?;
                        run_start = Some(x);
                    }
                }
                last_on = Some(x);
            } else if let (Some(start), Some(last)) = (run_start, last_on) {
                if x == binary.width || x - last > params.max_skip_distance + 1 {
                    emit_run(&mut segments, &mut parents, params, start, last, y)?;
                    run_start = None;
                }
            }
        }
        if let (Some(start), Some(last)) = (run_start, last_on) {
            emit_run(&mut segments, &mut parents, params, start, last, y)?;
        }

        // Link to the previous row's runs by x overlap.
        for i in row_start..segments.len() {
            for j in prev_row_range.clone() {
                if segments[i].x_start <= segments[j].x_end
                    && segments[j].x_start <= segments[i].x_end
                {
                    union(&mut parents, i as u32, j as u32);
                }
            }
        }
        prev_row_range = row_start..segments.len();
    }

    // Roots to dense ids, ascending by first appearance.
    let mut components = ConnectedComponents::default();
    components.segments = Vec::with_capacity(segments.len());
    let mut root_ids = vec![0u16; segments.len()];
    let mut next_id = 0u16;
    for i in 0..segments.len() {
        let root = find(&mut parents, i as u32) as usize;
        if root_ids[root] == 0 {
            next_id += 1;
            root_ids[root] = next_id;
        }
        let mut s = segments[i];
        s.id = root_ids[root];
        components.segments.push(s);
    }
    components.maximum_id = next_id;
    components.sort();
    Ok(components)
}

fn emit_run(
    segments: &mut Vec<ComponentSegment>,
    parents: &mut Vec<u32>,
    params: &ExtractionParams,
    start: usize,
    end: usize,
    y: usize,
) -> TrackResult<()> {
    if end - start + 1 < params.min_component_width.max(1) {
        return Ok(());
    }
    if segments.len() >= params.max_segments {
        return Err(TrackError::OutOfMemory {
            requested: std::mem::size_of::<ComponentSegment>(),
            available: 0,
        });
    }
    parents.push(segments.len() as u32);
    segments.push(ComponentSegment::new(start as u16, end as u16, y as u16, 0));
    Ok(())
}

fn find(parents: &mut [u32], mut i: u32) -> u32 {
    while parents[i as usize] != i {
        let grandparent = parents[parents[i as usize] as usize];
        parents[i as usize] = grandparent;
        i = grandparent;
    }
    i
}

fn union(parents: &mut [u32], a: u32, b: u32) {
    let ra = find(parents, a);
    let rb = find(parents, b);
    if ra != rb {
        let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
        parents[hi as usize] = lo;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(x_start: u16, x_end: u16, y: u16, id: u16) -> ComponentSegment {
        ComponentSegment::new(x_start, x_end, y, id)
    }

    #[test]
    fn size_filter_and_id_compression() {
        let mut components = ConnectedComponents::from_segments(vec![
            seg(0, 10, 0, 1),
            seg(12, 12, 1, 1),
            seg(16, 1004, 2, 1),
            seg(0, 4, 3, 2),
            seg(0, 2, 4, 3),
            seg(4, 6, 5, 3),
            seg(8, 10, 6, 3),
            seg(0, 4, 7, 4),
            seg(6, 6, 8, 4),
            seg(0, 1000, 9, 5),
        ]);

        components.invalidate_small_or_large(6, 1000);

        let ids: Vec<u16> = components.segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 0, 0, 0, 3, 3, 3, 4, 4, 0]);

        components.compress_ids();
        assert_eq!(components.maximum_id(), 2);
        let ids: Vec<u16> = components.segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![0, 0, 0, 0, 1, 1, 1, 2, 2, 0]);
    }

    #[test]
    fn hollow_center_filter_keeps_ring_rows() {
        let mut components = ConnectedComponents::from_segments(vec![
            // id 1: both rows leave the center column open.
            seg(0, 2, 5, 1),
            seg(4, 6, 5, 1),
            seg(0, 0, 6, 1),
            seg(6, 6, 6, 1),
            // id 2: the center column (x=6) is covered in every row.
            seg(0, 1, 7, 2),
            seg(3, 3, 7, 2),
            seg(5, 7, 7, 2),
            seg(0, 1, 8, 2),
            seg(5, 12, 8, 2),
            // id 3: one solid row.
            seg(0, 10, 12, 3),
        ]);

        components.invalidate_filled_centers(0.7);

        let ids: Vec<u16> = components.segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 1, 1, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn solid_and_sparse_blobs_are_rejected() {
        // A hollow ring (fill ~0.36), a filled blob (1.0), and a nearly
        // empty box (~0.02).
        let ring: Vec<ComponentSegment> = (0..10)
            .map(|y| match y {
                0 | 9 => seg(0, 9, y, 1),
                _ => seg(0, 0, y, 1),
            })
            .chain((1..9).map(|y| seg(9, 9, y, 1)))
            .collect();
        let mut segments = ring;
        for y in 20..30 {
            segments.push(seg(0, 9, y, 2));
        }
        segments.push(seg(0, 0, 40, 3));
        segments.push(seg(99, 99, 90, 3));
        let mut components = ConnectedComponents::from_segments(segments);
        components.sort();

        // sparse = 20.0 (ratio below 1/20 dies), solid = 0.5.
        components.invalidate_solid_or_sparse(20 * FIXED_POINT_SCALE, FIXED_POINT_SCALE / 2);

        assert!(components.segments_of(1).count() > 0, "ring survives");
        assert_eq!(components.segments_of(2).count(), 0, "blob dies");
        assert_eq!(components.segments_of(3).count(), 0, "sparse box dies");
    }

    #[test]
    fn segment_invariants_hold_after_extraction() {
        // Two separate blobs and one bridge-merged run.
        let mut img = GrayImage::new(16, 8);
        for x in 2..6 {
            img.data[1 * 16 + x] = 1;
            img.data[2 * 16 + x] = 1;
        }
        for x in 10..14 {
            img.data[5 * 16 + x] = 1;
        }
        img.data[6 * 16 + 10] = 1;
        img.data[6 * 16 + 12] = 1; // gap of 1, bridged below

        let arena = Arena::new(1 << 20);
        let params = ExtractionParams {
            max_skip_distance: 1,
            ..ExtractionParams::default()
        };
        let components = extract_components(&img, &params, &arena).unwrap();

        assert_eq!(components.maximum_id(), 2);
        for s in &components.segments {
            assert!(s.x_start <= s.x_end);
            assert!((s.y as usize) < 8);
        }
        // The bridged run spans the gap.
        let merged: Vec<_> = components
            .segments
            .iter()
            .filter(|s| s.y == 6)
            .collect();
        assert_eq!(merged.len(), 1);
        assert_eq!((merged[0].x_start, merged[0].x_end), (10, 12));
    }

    #[test]
    fn rows_link_by_overlap_only() {
        let mut img = GrayImage::new(8, 4);
        // Two vertically adjacent but non-overlapping runs.
        for x in 0..3 {
            img.data[x] = 1;
        }
        for x in 4..7 {
            img.data[8 + x] = 1;
        }
        let arena = Arena::new(1 << 16);
        let components =
            extract_components(&img, &ExtractionParams::default(), &arena).unwrap();
        assert_eq!(components.maximum_id(), 2);
    }
}
