use crate::{GrayImageView, Rect};

/// A 256-bin grayvalue histogram over a rectangular region of interest.
///
/// The x/y increments subsample the region; an increment of 4 visits every
/// fourth row and column, which is plenty for percentile estimation.
#[derive(Clone, Debug)]
pub struct IntegerCounts {
    counts: [u32; 256],
    total: u32,
}

impl IntegerCounts {
    pub fn from_region(
        img: &GrayImageView<'_>,
        region: &Rect,
        y_increment: usize,
        x_increment: usize,
    ) -> Self {
        let mut counts = [0u32; 256];
        let mut total = 0u32;

        let clipped = region.clipped(img.width, img.height);
        let x0 = clipped.left as usize;
        let x1 = clipped.right as usize;
        let y0 = clipped.top as usize;
        let y1 = clipped.bottom as usize;

        let y_step = y_increment.max(1);
        let x_step = x_increment.max(1);

        let mut y = y0;
        while y <= y1 && y < img.height {
            let row = &img.data[y * img.width..(y + 1) * img.width];
            let mut x = x0;
            while x <= x1 && x < img.width {
                counts[row[x] as usize] += 1;
                total += 1;
                x += x_step;
            }
            y += y_step;
        }

        Self { counts, total }
    }

    pub fn counts(&self) -> &[u32; 256] {
        &self.counts
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Smallest grayvalue whose cumulative count reaches `percentile` of
    /// the total. `percentile` is clamped to [0, 1].
    pub fn percentile(&self, percentile: f32) -> u8 {
        if self.total == 0 {
            return 127;
        }
        let target = (percentile.clamp(0.0, 1.0) * self.total as f32).ceil() as u32;
        let mut acc = 0u32;
        for (value, &count) in self.counts.iter().enumerate() {
            acc += count;
            if acc >= target {
                return value as u8;
            }
        }
        255
    }
}

/// Grayvalue threshold from a percentile window: the midpoint between the
/// black and white percentiles of the region histogram.
pub fn grayvalue_threshold(
    img: &GrayImageView<'_>,
    region: &Rect,
    y_increment: usize,
    x_increment: usize,
    black_percentile: f32,
    white_percentile: f32,
) -> u8 {
    let counts = IntegerCounts::from_region(img, region, y_increment, x_increment);
    let black = counts.percentile(black_percentile) as u16;
    let white = counts.percentile(white_percentile) as u16;
    ((black + white) / 2) as u8
}
