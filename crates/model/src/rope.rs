//! Rotary Position Embedding (RoPE)
//!
//! RoPE encodes position by rotating adjacent feature pairs. For the pair
//! starting at even index `i` of a query/key vector, at position `m`:
//!
//! ```text
//! freq  = theta^(-(i mod head_size) / head_size)
//! angle = m * freq
//! (v0, v1) -> (v0·cos(angle) − v1·sin(angle), v0·sin(angle) + v1·cos(angle))
//! ```

use crate::config::ROPE_THETA;

/// Frequency for the rotation pair starting at `index`
pub fn rope_frequency(index: usize, head_size: usize) -> f32 {
    let head_dim = index % head_size;
    1.0 / ROPE_THETA.powf(head_dim as f32 / head_size as f32)
}

/// Rotation angle for the pair starting at `index` at sequence `position`
pub fn rope_angle(index: usize, head_size: usize, position: usize) -> f32 {
    position as f32 * rope_frequency(index, head_size)
}

/// Apply the 2-D rotation to one pair
#[inline]
pub fn rotate_pair(v0: f32, v1: f32, angle: f32) -> (f32, f32) {
    let (sin, cos) = angle.sin_cos();
    (v0 * cos - v1 * sin, v0 * sin + v1 * cos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_zero_is_identity() {
        let (a, b) = rotate_pair(0.3, -1.2, rope_angle(6, 8, 0));
        assert_eq!(a, 0.3);
        assert_eq!(b, -1.2);
    }

    #[test]
    fn test_rotation_preserves_norm() {
        for pos in [1usize, 7, 100, 255] {
            for i in (0..16).step_by(2) {
                let (v0, v1) = (0.7f32, -0.4f32);
                let (r0, r1) = rotate_pair(v0, v1, rope_angle(i, 16, pos));
                let before = v0 * v0 + v1 * v1;
                let after = r0 * r0 + r1 * r1;
                assert!((before - after).abs() < 1e-5, "norm changed at pos {} pair {}", pos, i);
            }
        }
    }

    #[test]
    fn test_frequency_wraps_per_head() {
        assert_eq!(rope_frequency(0, 8), 1.0);
        assert_eq!(rope_frequency(8, 8), rope_frequency(0, 8));
        assert_eq!(rope_frequency(10, 8), rope_frequency(2, 8));
        assert!(rope_frequency(6, 8) < rope_frequency(2, 8));
    }
}
