//! Low-discrepancy jitter sequences
//!
//! Halton(2, 3) drives the temporal anti-aliasing sub-pixel offset;
//! Halton(2, 3, 5) drives the volumetric fog froxel offsets.

use glam::{Mat4, Vec2, Vec3};

/// Samples before the TAA jitter sequence repeats
pub const TAA_JITTER_SEQUENCE_LENGTH: u32 = 8;

/// Halton sequence value in [0, 1) for `index` in prime `base`
#[inline]
pub fn halton(index: u32, base: u32) -> f32 {
    let mut result = 0.0f32;
    let mut f = 1.0f32;
    let mut i = index;

    while i > 0 {
        f /= base as f32;
        result += f * (i % base) as f32;
        i /= base;
    }

    result
}

/// Pixel-space jitter in [-0.5, 0.5] for a frame
#[inline]
pub fn halton_2_3(frame_index: u64, sequence_length: u32) -> Vec2 {
    // Index 0 yields (0, 0), start at 1
    let index = (frame_index % sequence_length as u64) as u32 + 1;
    Vec2::new(halton(index, 2) - 0.5, halton(index, 3) - 0.5)
}

/// Froxel-space jitter in [0, 1) for a frame
#[inline]
pub fn halton_2_3_5(frame_index: u64, sequence_length: u32) -> Vec3 {
    let index = (frame_index % sequence_length.max(1) as u64) as u32 + 1;
    Vec3::new(halton(index, 2), halton(index, 3), halton(index, 5))
}

/// Clip-space offset of a pixel jitter for a `width`x`height` target
#[inline]
pub fn jitter_to_ndc(jitter: Vec2, width: u32, height: u32) -> Vec2 {
    Vec2::new(
        2.0 * jitter.x / width.max(1) as f32,
        -2.0 * jitter.y / height.max(1) as f32,
    )
}

/// Offset a projection matrix by an NDC translation
#[inline]
pub fn apply_jitter(projection: Mat4, ndc_offset: Vec2) -> Mat4 {
    Mat4::from_translation(ndc_offset.extend(0.0)) * projection
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halton_base_2() {
        assert_eq!(halton(1, 2), 0.5);
        assert_eq!(halton(2, 2), 0.25);
        assert_eq!(halton(3, 2), 0.75);
    }

    #[test]
    fn test_sequence_repeats() {
        let a = halton_2_3(3, TAA_JITTER_SEQUENCE_LENGTH);
        let b = halton_2_3(3 + TAA_JITTER_SEQUENCE_LENGTH as u64, TAA_JITTER_SEQUENCE_LENGTH);
        assert_eq!(a, b);
        assert!(a.x.abs() <= 0.5 && a.y.abs() <= 0.5);
        assert_ne!(halton_2_3(0, 8), Vec2::ZERO);
    }

    #[test]
    fn test_apply_jitter_shifts_clip_x() {
        let projection = Mat4::perspective_rh(1.0, 1.0, 1.0, 100.0);
        let jittered = apply_jitter(projection, Vec2::new(0.1, 0.0));
        let p = glam::Vec4::new(0.0, 0.0, -10.0, 1.0);
        let a = projection * p;
        let b = jittered * p;
        assert!((b.x / b.w - a.x / a.w - 0.1).abs() < 1e-5);
    }
}
