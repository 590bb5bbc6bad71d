//! The shared planar-transformation abstraction.
//!
//! All three tracker families express their per-frame fits through this
//! type: each produces an incremental delta in its own parameter space and
//! composes it here, so the warp/composition logic lives in exactly one
//! place. Coordinates for images are stored in the base resolution
//! ([`crate::BASE_IMAGE_WIDTH`] x [`crate::BASE_IMAGE_HEIGHT`]); the
//! `scale` argument on every warp decouples the tracked resolution from
//! the reported one.

use log::warn;
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

use crate::{GrayImage, GrayImageView, Quad, TrackError, TrackResult};

/// ASCII tag opening a serialized transformation segment.
pub const SERIALIZATION_TAG: &str = "PlanarTransformation_f32";

const SERIALIZATION_VERSION: u8 = 1;

/// Transformation family, ordered by degrees of freedom.
///
/// The wire tag encodes the parameter count in its high byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransformKind {
    Translation,
    Affine,
    Projective,
}

impl TransformKind {
    /// Number of update parameters for this kind.
    pub fn dof(self) -> usize {
        match self {
            TransformKind::Translation => 2,
            TransformKind::Affine => 6,
            TransformKind::Projective => 8,
        }
    }

    pub fn tag(self) -> u32 {
        (self.dof() as u32) << 8
    }

    pub fn from_tag(tag: u32) -> TrackResult<Self> {
        match tag {
            0x0200 => Ok(TransformKind::Translation),
            0x0600 => Ok(TransformKind::Affine),
            0x0800 => Ok(TransformKind::Projective),
            _ => Err(TrackError::InvalidParameters("unknown transform type tag")),
        }
    }
}

/// A 2-D homography between the zero-centered marker frame and the image.
///
/// The matrix always satisfies `h[(2,2)] == 1` after construction and after
/// every mutation. `center_offset` is subtracted from input points before
/// the matrix is applied (and added back after), so the homography itself
/// operates on zero-centered coordinates.
#[derive(Clone, Debug)]
pub struct PlanarTransform {
    kind: TransformKind,
    h: Matrix3<f32>,
    initial_corners: Quad,
    center_offset: Point2<f32>,
    initial_points_zero_centered: bool,
    valid: bool,
}

impl PlanarTransform {
    /// Identity transformation; the center offset defaults to the quad
    /// centroid.
    pub fn new(kind: TransformKind, initial_corners: Quad) -> Self {
        let center_offset = initial_corners.centroid();
        Self {
            kind,
            h: Matrix3::identity(),
            initial_corners,
            center_offset,
            initial_points_zero_centered: false,
            valid: true,
        }
    }

    pub fn with_center_offset(
        kind: TransformKind,
        initial_corners: Quad,
        center_offset: Point2<f32>,
    ) -> Self {
        Self {
            center_offset,
            ..Self::new(kind, initial_corners)
        }
    }

    pub fn with_homography(
        kind: TransformKind,
        initial_corners: Quad,
        homography: Matrix3<f32>,
        center_offset: Point2<f32>,
    ) -> TrackResult<Self> {
        let mut out = Self::with_center_offset(kind, initial_corners, center_offset);
        out.set_homography(&homography)?;
        Ok(out)
    }

    /// A deterministically invalid placeholder (failed construction).
    pub fn invalid() -> Self {
        Self {
            kind: TransformKind::Projective,
            h: Matrix3::identity(),
            initial_corners: Quad::from_arrays([[0.0, 0.0]; 4]),
            center_offset: Point2::new(0.0, 0.0),
            initial_points_zero_centered: false,
            valid: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid && self.h.iter().all(|v| v.is_finite())
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn set_kind(&mut self, kind: TransformKind) {
        self.kind = kind;
    }

    pub fn homography(&self) -> &Matrix3<f32> {
        &self.h
    }

    /// Install a homography. The bottom-right entry must already be near
    /// one; it is renormalized to exactly one.
    pub fn set_homography(&mut self, h: &Matrix3<f32>) -> TrackResult<()> {
        if h.iter().any(|v| !v.is_finite()) {
            return Err(TrackError::InvalidParameters("homography has NaN/inf"));
        }
        let h22 = h[(2, 2)];
        if (h22 - 1.0).abs() > 1e-3 {
            return Err(TrackError::InvalidParameters(
                "homography bottom-right entry must be ~1",
            ));
        }
        self.h = h / h22;
        Ok(())
    }

    pub fn initial_corners(&self) -> &Quad {
        &self.initial_corners
    }

    /// Center offset expressed at `scale` (divide by the tracking scale).
    pub fn center_offset(&self, scale: f32) -> Point2<f32> {
        if (scale - 1.0).abs() < 1e-6 {
            self.center_offset
        } else {
            Point2::new(self.center_offset.x / scale, self.center_offset.y / scale)
        }
    }

    pub fn set_center_offset(&mut self, center_offset: Point2<f32>) {
        self.center_offset = center_offset;
    }

    pub fn initial_points_zero_centered(&self) -> bool {
        self.initial_points_zero_centered
    }

    /// Suppress re-centering of input points. Used when the initial points
    /// already live in the zero-centered (model) frame, as in the planar
    /// 6-DoF tracker where `center_offset` holds the calibration center.
    pub fn set_initial_points_zero_centered(&mut self, zero_centered: bool) {
        self.initial_points_zero_centered = zero_centered;
    }

    /// Copy kind, homography, corners, and offset from another transform.
    pub fn set_from(&mut self, other: &PlanarTransform) {
        self.kind = other.kind;
        self.h = other.h;
        self.initial_corners = other.initial_corners;
        self.center_offset = other.center_offset;
        self.initial_points_zero_centered = other.initial_points_zero_centered;
        self.valid = other.valid;
    }

    /// Warp `xs`/`ys` into `x_out`/`y_out`.
    ///
    /// Input points are multiplied by `scale`, shifted by the center offset
    /// (unless already zero-centered), warped, un-shifted (unless the
    /// output should stay zero-centered), and divided by `scale` again.
    pub fn transform_points(
        &self,
        xs: &[f32],
        ys: &[f32],
        scale: f32,
        input_zero_centered: bool,
        output_zero_centered: bool,
        x_out: &mut [f32],
        y_out: &mut [f32],
    ) -> TrackResult<()> {
        if xs.len() != ys.len() || xs.len() != x_out.len() || xs.len() != y_out.len() {
            return Err(TrackError::InvalidSize(
                "point arrays must all have the same length",
            ));
        }
        if scale <= 0.0 || !scale.is_finite() {
            return Err(TrackError::InvalidParameters("scale must be positive"));
        }

        let in_off = if input_zero_centered || self.initial_points_zero_centered {
            Point2::new(0.0, 0.0)
        } else {
            self.center_offset
        };
        let out_off = if output_zero_centered {
            Point2::new(0.0, 0.0)
        } else {
            self.center_offset
        };

        match self.kind {
            TransformKind::Translation => {
                let dx = (self.h[(0, 2)] - in_off.x + out_off.x) / scale;
                let dy = (self.h[(1, 2)] - in_off.y + out_off.y) / scale;
                for i in 0..xs.len() {
                    x_out[i] = xs[i] + dx;
                    y_out[i] = ys[i] + dy;
                }
            }
            TransformKind::Affine => {
                let h = &self.h;
                for i in 0..xs.len() {
                    let xc = xs[i] * scale - in_off.x;
                    let yc = ys[i] * scale - in_off.y;
                    let xp = h[(0, 0)] * xc + h[(0, 1)] * yc + h[(0, 2)];
                    let yp = h[(1, 0)] * xc + h[(1, 1)] * yc + h[(1, 2)];
                    x_out[i] = (xp + out_off.x) / scale;
                    y_out[i] = (yp + out_off.y) / scale;
                }
            }
            TransformKind::Projective => {
                let h = &self.h;
                for i in 0..xs.len() {
                    let xc = xs[i] * scale - in_off.x;
                    let yc = ys[i] * scale - in_off.y;
                    let w = h[(2, 0)] * xc + h[(2, 1)] * yc + 1.0;
                    let wi = 1.0 / w;
                    let xp = (h[(0, 0)] * xc + h[(0, 1)] * yc + h[(0, 2)]) * wi;
                    let yp = (h[(1, 0)] * xc + h[(1, 1)] * yc + h[(1, 2)]) * wi;
                    x_out[i] = (xp + out_off.x) / scale;
                    y_out[i] = (yp + out_off.y) / scale;
                }
            }
        }

        Ok(())
    }

    /// Warp a single image-frame point.
    pub fn transform_point(&self, p: Point2<f32>, scale: f32) -> Point2<f32> {
        let mut xo = [0.0f32];
        let mut yo = [0.0f32];
        // Sizes match; scale was validated by construction sites.
        let _ = self.transform_points(&[p.x], &[p.y], scale, false, false, &mut xo, &mut yo);
        Point2::new(xo[0], yo[0])
    }

    /// Warp all four corners of a quadrilateral.
    pub fn transform_quad(&self, quad: &Quad, scale: f32) -> Quad {
        Quad::new(quad.corners.map(|c| self.transform_point(c, scale)))
    }

    /// The initial corners under the current homography.
    pub fn transformed_corners(&self) -> Quad {
        self.transform_quad(&self.initial_corners, 1.0)
    }

    /// Orientation of the warped quad's top edge, in `(-pi, pi]`.
    pub fn transformed_orientation(&self) -> f32 {
        let warped = self.transformed_corners();
        let d = warped.corners[1] - warped.corners[0];
        d.y.atan2(d.x)
    }

    /// Inverse-warp `src` into `dst`: for each destination pixel, invert
    /// the homography, sample `src` bilinearly, write.
    ///
    /// `src` and `dst` must not alias and must have equal dimensions.
    pub fn transform_image_into(
        &self,
        src: &GrayImageView<'_>,
        dst: &mut GrayImage,
        scale: f32,
    ) -> TrackResult<()> {
        if std::ptr::eq(src.data.as_ptr(), dst.data.as_ptr()) {
            return Err(TrackError::AliasedMemory(
                "source and destination images must differ",
            ));
        }
        if src.width != dst.width || src.height != dst.height {
            return Err(TrackError::InvalidSize(
                "source and destination images must have equal dimensions",
            ));
        }

        let Some(h_inv) = self.h.try_inverse() else {
            warn!("transform_image_into: homography is singular, output left unchanged");
            return Ok(());
        };

        for y in 0..dst.height {
            for x in 0..dst.width {
                let xc = x as f32 * scale - self.center_offset.x;
                let yc = y as f32 * scale - self.center_offset.y;
                let w = h_inv[(2, 0)] * xc + h_inv[(2, 1)] * yc + h_inv[(2, 2)];
                if w.abs() < 1e-12 {
                    dst.data[y * dst.width + x] = 0;
                    continue;
                }
                let sx = ((h_inv[(0, 0)] * xc + h_inv[(0, 1)] * yc + h_inv[(0, 2)]) / w
                    + self.center_offset.x)
                    / scale;
                let sy = ((h_inv[(1, 0)] * xc + h_inv[(1, 1)] * yc + h_inv[(1, 2)]) / w
                    + self.center_offset.y)
                    / scale;
                dst.data[y * dst.width + x] = crate::sample_bilinear_u8(src, sx, sy);
            }
        }
        Ok(())
    }

    /// Compose an incremental update into the transformation:
    /// `H <- H * inv(I + delta)`, then renormalize so `h[(2,2)] == 1`.
    ///
    /// Delta layout: translation `[-dx, -dy]`; affine
    /// `[h00, h01, h02, h10, h11, h12]` around identity; projective adds
    /// `[h20, h21]`. The translation block is pre-scaled by `scale`, the
    /// projective row divided by it. `update_kind` must not exceed the
    /// object's declared kind; `None` uses the declared kind.
    pub fn update(
        &mut self,
        delta: &[f32],
        scale: f32,
        update_kind: Option<TransformKind>,
    ) -> TrackResult<()> {
        let update_kind = update_kind.unwrap_or(self.kind);
        if update_kind > self.kind {
            return Err(TrackError::InvalidParameters(
                "update kind exceeds the transform's declared kind",
            ));
        }
        if delta.len() != update_kind.dof() {
            return Err(TrackError::InvalidSize("update delta has the wrong arity"));
        }
        if delta.iter().any(|v| !v.is_finite()) || !scale.is_finite() || scale <= 0.0 {
            return Err(TrackError::InvalidParameters("update delta has NaN/inf"));
        }

        if update_kind == TransformKind::Translation {
            self.h[(0, 2)] -= scale * delta[0];
            self.h[(1, 2)] -= scale * delta[1];
            return Ok(());
        }

        let mut incremental = Matrix3::new(
            1.0 + delta[0],
            delta[1],
            delta[2] * scale,
            delta[3],
            1.0 + delta[4],
            delta[5] * scale,
            0.0,
            0.0,
            1.0,
        );
        if update_kind == TransformKind::Projective {
            incremental[(2, 0)] = delta[6] / scale;
            incremental[(2, 1)] = delta[7] / scale;
        }

        let Some(inv) = incremental.try_inverse() else {
            warn!("update: incremental transform is singular, keeping previous homography");
            return Ok(());
        };

        let composed = self.h * inv;
        let h22 = composed[(2, 2)];
        if h22.abs() < 1e-12 || !h22.is_finite() {
            warn!("update: degenerate composition, keeping previous homography");
            return Ok(());
        }
        self.h = composed / h22;
        Ok(())
    }

    /// Serialize into a length-prefixed, self-describing segment.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&0u32.to_le_bytes()); // payload length, patched below
        out.extend_from_slice(SERIALIZATION_TAG.as_bytes());
        out.push(SERIALIZATION_VERSION);
        out.push(self.valid as u8);
        out.extend_from_slice(&self.kind.tag().to_le_bytes());
        // Array header: rows, cols.
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&3u32.to_le_bytes());
        for r in 0..3 {
            for c in 0..3 {
                out.extend_from_slice(&self.h[(r, c)].to_le_bytes());
            }
        }
        for corner in &self.initial_corners.corners {
            out.extend_from_slice(&corner.x.to_le_bytes());
            out.extend_from_slice(&corner.y.to_le_bytes());
        }
        out.extend_from_slice(&self.center_offset.x.to_le_bytes());
        out.extend_from_slice(&self.center_offset.y.to_le_bytes());

        let payload_len = (out.len() - start - 4) as u32;
        out[start..start + 4].copy_from_slice(&payload_len.to_le_bytes());
    }

    /// Deserialize a segment produced by [`Self::serialize`]. Returns the
    /// transform and the number of bytes consumed.
    pub fn deserialize(bytes: &[u8]) -> TrackResult<(Self, usize)> {
        let mut r = Reader::new(bytes);
        let payload_len = r.u32()? as usize;
        if bytes.len() < 4 + payload_len {
            return Err(TrackError::InvalidSize("serialized segment truncated"));
        }

        let tag = r.take(SERIALIZATION_TAG.len())?;
        if tag != SERIALIZATION_TAG.as_bytes() {
            return Err(TrackError::InvalidParameters("bad serialization tag"));
        }
        let version = r.u8()?;
        if version != SERIALIZATION_VERSION {
            return Err(TrackError::InvalidParameters(
                "unsupported serialization version",
            ));
        }
        let valid = r.u8()? != 0;
        let kind = TransformKind::from_tag(r.u32()?)?;
        let rows = r.u32()?;
        let cols = r.u32()?;
        if rows != 3 || cols != 3 {
            return Err(TrackError::InvalidSize("homography array must be 3x3"));
        }
        let mut h = Matrix3::zeros();
        for row in 0..3 {
            for col in 0..3 {
                h[(row, col)] = r.f32()?;
            }
        }
        let mut corners = [[0.0f32; 2]; 4];
        for corner in &mut corners {
            corner[0] = r.f32()?;
            corner[1] = r.f32()?;
        }
        let center_offset = Point2::new(r.f32()?, r.f32()?);

        let mut out = Self::with_homography(kind, Quad::from_arrays(corners), h, center_offset)?;
        out.valid = valid;
        Ok((out, 4 + payload_len))
    }
}

impl PlanarTransform {
    /// Exact byte length of one serialized segment.
    pub fn serialized_size() -> usize {
        // Length prefix, tag, version, validity, kind tag, array header,
        // homography, corners, center offset.
        4 + SERIALIZATION_TAG.len() + 1 + 1 + 4 + 8 + (9 + 8 + 2) * 4
    }
}

impl std::fmt::Display for PlanarTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{:?} center ({:.2}, {:.2})",
            self.kind, self.center_offset.x, self.center_offset.y
        )?;
        for r in 0..3 {
            writeln!(
                f,
                "  [{:9.5} {:9.5} {:9.3}]",
                self.h[(r, 0)],
                self.h[(r, 1)],
                self.h[(r, 2)]
            )?;
        }
        Ok(())
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> TrackResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(TrackError::InvalidSize("serialized segment truncated"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> TrackResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> TrackResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f32(&mut self) -> TrackResult<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };
    Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

fn normalize_points4(pts: &[Point2<f32>; 4]) -> ([Point2<f64>; 4], Matrix3<f64>) {
    let n = 4.0_f64;
    let mut cx = 0.0_f64;
    let mut cy = 0.0_f64;
    for p in pts {
        cx += p.x as f64;
        cy += p.y as f64;
    }
    cx /= n;
    cy /= n;

    let mut mean_dist = 0.0_f64;
    for p in pts {
        let dx = p.x as f64 - cx;
        let dy = p.y as f64 - cy;
        mean_dist += (dx * dx + dy * dy).sqrt();
    }
    mean_dist /= n;

    let t = hartley_normalization(cx, cy, mean_dist);

    let mut out = [Point2::new(0.0_f64, 0.0_f64); 4];
    for (i, p) in pts.iter().enumerate() {
        let v = t * Vector3::new(p.x as f64, p.y as f64, 1.0);
        out[i] = Point2::new(v[0], v[1]);
    }
    (out, t)
}

/// Compute H such that `dst ~ H * src` from four correspondences.
///
/// Corner order must be consistent between `src` and `dst`. The solve runs
/// in f64 with Hartley normalization; the result is normalized so the
/// bottom-right entry equals one.
pub fn homography_from_4pt(src: &[Point2<f32>; 4], dst: &[Point2<f32>; 4]) -> Option<Matrix3<f32>> {
    // Unknowns: [h11 h12 h13 h21 h22 h23 h31 h32], with h33 = 1.
    // For each correspondence (x,y)->(u,v):
    //   h11 x + h12 y + h13 - u h31 x - u h32 y = u
    //   h21 x + h22 y + h23 - v h31 x - v h32 y = v
    let (src_n, t_src) = normalize_points4(src);
    let (dst_n, t_dst) = normalize_points4(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for k in 0..4 {
        let x = src_n[k].x;
        let y = src_n[k].y;
        let u = dst_n[k].x;
        let v = dst_n[k].y;

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;

    let hn = Matrix3::<f64>::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);

    let t_dst_inv = t_dst.try_inverse()?;
    let h = t_dst_inv * hn * t_src;
    let h22 = h[(2, 2)];
    if h22.abs() < 1e-12 {
        return None;
    }
    let h = h / h22;

    Some(Matrix3::from_fn(|r, c| h[(r, c)] as f32))
}

/// Canonical zero-centered unit-square corners for marker decoding.
pub const CANONICAL_CORNERS: [[f32; 2]; 4] = [[-1.0, -1.0], [1.0, -1.0], [1.0, 1.0], [-1.0, 1.0]];

/// Homography mapping the canonical marker square onto `quad`.
///
/// On numerical failure the identity is returned with the flag set, so a
/// detection pipeline can keep the quad and mark the pose unusable.
pub fn homography_from_quad(quad: &Quad) -> (Matrix3<f32>, bool) {
    let src = CANONICAL_CORNERS.map(|c| Point2::new(c[0], c[1]));
    match homography_from_4pt(&src, &quad.corners) {
        Some(h) => (h, false),
        None => (Matrix3::identity(), true),
    }
}
