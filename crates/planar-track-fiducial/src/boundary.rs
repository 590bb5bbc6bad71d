//! Exterior contour tracing of connected components.

use crate::components::ConnectedComponents;

/// Clockwise Moore neighborhood, starting east.
const NEIGHBORS: [(i32, i32); 8] = [
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
    (0, -1),
    (1, -1),
];

/// Walk a component's exterior contour in Moore-neighbor order until the
/// walk returns to its start, and report the pixels in image coordinates.
///
/// Single-pixel components come back as a single point. The walk is
/// bounded, so malformed input cannot loop forever.
pub fn trace_exterior_boundary(components: &ConnectedComponents, id: u16) -> Vec<(i32, i32)> {
    // Render the component into a local mask with a one-pixel border.
    let mut min_x = u16::MAX;
    let mut max_x = 0u16;
    let mut min_y = u16::MAX;
    let mut max_y = 0u16;
    let mut num_pixels = 0usize;
    for s in components.segments_of(id) {
        min_x = min_x.min(s.x_start);
        max_x = max_x.max(s.x_end);
        min_y = min_y.min(s.y);
        max_y = max_y.max(s.y);
        num_pixels += s.num_pixels();
    }
    if num_pixels == 0 {
        return Vec::new();
    }

    let w = (max_x - min_x) as usize + 3;
    let h = (max_y - min_y) as usize + 3;
    let mut mask = vec![false; w * h];
    for s in components.segments_of(id) {
        let y = (s.y - min_y) as usize + 1;
        for x in s.x_start..=s.x_end {
            mask[y * w + (x - min_x) as usize + 1] = true;
        }
    }
    let on = |x: i32, y: i32| -> bool {
        x >= 0 && y >= 0 && (x as usize) < w && (y as usize) < h && mask[y as usize * w + x as usize]
    };

    // Start at the topmost-leftmost pixel, entered from the west.
    let mut start = (0i32, 0i32);
    'outer: for y in 0..h as i32 {
        for x in 0..w as i32 {
            if on(x, y) {
                start = (x, y);
                break 'outer;
            }
        }
    }

    let to_image =
        |(x, y): (i32, i32)| (x - 1 + min_x as i32, y - 1 + min_y as i32);

    if num_pixels == 1 {
        return vec![to_image(start)];
    }

    let mut boundary = Vec::new();
    boundary.push(to_image(start));

    let mut current = start;
    // Index into NEIGHBORS of the direction we entered from (backtrack).
    let mut backtrack = 4usize; // came from the east scan means previous is west
    let max_steps = 4 * num_pixels + 8;

    for _ in 0..max_steps {
        let mut moved = false;
        for k in 0..8 {
            let dir = (backtrack + 1 + k) % 8;
            let (dx, dy) = NEIGHBORS[dir];
            let candidate = (current.0 + dx, current.1 + dy);
            if on(candidate.0, candidate.1) {
                current = candidate;
                // New backtrack points at the previous pixel.
                backtrack = (dir + 4) % 8;
                moved = true;
                break;
            }
        }
        if !moved {
            break; // isolated pixel cluster
        }
        if current == start {
            break;
        }
        boundary.push(to_image(current));
    }

    boundary
}
