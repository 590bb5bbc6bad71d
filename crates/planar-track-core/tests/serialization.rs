use nalgebra::Point2;
use planar_track_core::{PlanarTransform, Quad, TransformKind, SERIALIZATION_TAG};

fn sample_transform() -> PlanarTransform {
    let quad = Quad::from_arrays([[96.0, 64.0], [224.0, 66.0], [226.0, 190.0], [94.0, 188.0]]);
    let mut t = PlanarTransform::new(TransformKind::Projective, quad);
    t.update(&[0.03, -0.004, 1.25, 0.002, 0.018, -2.5, 2e-4, -1e-4], 1.0, None)
        .unwrap();
    t
}

#[test]
fn wire_layout_is_stable() {
    let t = sample_transform();
    let mut bytes = Vec::new();
    t.serialize(&mut bytes);

    // Length prefix covers everything after itself.
    let payload_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
    assert_eq!(payload_len + 4, bytes.len());

    // ASCII tag, version, validity.
    let tag_end = 4 + SERIALIZATION_TAG.len();
    assert_eq!(&bytes[4..tag_end], SERIALIZATION_TAG.as_bytes());
    assert_eq!(bytes[tag_end], 1, "version byte");
    assert_eq!(bytes[tag_end + 1], 1, "validity byte");

    // Transform type tag: projective = 8 parameters in the high byte.
    let kind_tag = u32::from_le_bytes(bytes[tag_end + 2..tag_end + 6].try_into().unwrap());
    assert_eq!(kind_tag, 0x0800);

    // Array header, then 9 + 8 + 2 little-endian f32 values.
    let rows = u32::from_le_bytes(bytes[tag_end + 6..tag_end + 10].try_into().unwrap());
    let cols = u32::from_le_bytes(bytes[tag_end + 10..tag_end + 14].try_into().unwrap());
    assert_eq!((rows, cols), (3, 3));

    let values_start = tag_end + 14;
    assert_eq!(bytes.len() - values_start, (9 + 8 + 2) * 4);

    let h00 = f32::from_le_bytes(bytes[values_start..values_start + 4].try_into().unwrap());
    assert_eq!(h00, t.homography()[(0, 0)]);
    let h22_offset = values_start + 8 * 4;
    let h22 = f32::from_le_bytes(bytes[h22_offset..h22_offset + 4].try_into().unwrap());
    assert_eq!(h22, 1.0);
}

#[test]
fn round_trip_is_bit_exact() {
    let t = sample_transform();
    let mut bytes = Vec::new();
    t.serialize(&mut bytes);

    let (back, consumed) = PlanarTransform::deserialize(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(back.homography(), t.homography());
    assert_eq!(back.initial_corners(), t.initial_corners());
    assert_eq!(back.center_offset(1.0), t.center_offset(1.0));
    assert_eq!(back.kind(), TransformKind::Projective);

    // Serializing the round-tripped copy reproduces the stream.
    let mut again = Vec::new();
    back.serialize(&mut again);
    assert_eq!(bytes, again);
}

#[test]
fn streams_concatenate_cleanly() {
    let a = sample_transform();
    let b = PlanarTransform::new(
        TransformKind::Affine,
        Quad::from_arrays([[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0]]),
    );

    let mut bytes = Vec::new();
    a.serialize(&mut bytes);
    b.serialize(&mut bytes);

    let (first, used) = PlanarTransform::deserialize(&bytes).unwrap();
    let (second, used2) = PlanarTransform::deserialize(&bytes[used..]).unwrap();
    assert_eq!(used + used2, bytes.len());
    assert_eq!(first.kind(), TransformKind::Projective);
    assert_eq!(second.kind(), TransformKind::Affine);
    assert_eq!(second.center_offset(1.0), Point2::new(5.0, 5.0));
}

#[test]
fn homography_normalization_survives_update_chains() {
    // Bottom-right entry stays pinned at one through long update chains of
    // mixed arity, and the matrix stays finite.
    let mut t = sample_transform();
    let mut seed = 0x2545f4914f6cdd1du64;
    let mut next = || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
        ((seed >> 40) as f32 / 8388608.0) - 1.0 // roughly [-1, 1)
    };

    for round in 0..200 {
        match round % 3 {
            0 => t
                .update(&[next(), next()], 1.0, Some(TransformKind::Translation))
                .unwrap(),
            1 => t
                .update(
                    &[
                        next() * 0.01,
                        next() * 0.01,
                        next(),
                        next() * 0.01,
                        next() * 0.01,
                        next(),
                    ],
                    2.0,
                    Some(TransformKind::Affine),
                )
                .unwrap(),
            _ => t
                .update(
                    &[
                        next() * 0.01,
                        next() * 0.01,
                        next(),
                        next() * 0.01,
                        next() * 0.01,
                        next(),
                        next() * 1e-5,
                        next() * 1e-5,
                    ],
                    1.0,
                    Some(TransformKind::Projective),
                )
                .unwrap(),
        }

        assert!(
            (t.homography()[(2, 2)] - 1.0).abs() < 1e-5,
            "h22 drifted at round {round}"
        );
        assert!(t.homography().iter().all(|v| v.is_finite()));
    }
}
