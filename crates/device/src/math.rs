//! Numeric helpers shared by the kernels
//!
//! Dot products accumulate strictly left to right so that a product split
//! into segments gives bit-identical results to the unsplit one.

use pimlm_model::{rope_angle, rotate_pair, RMS_NORM_EPS};

use crate::error::Result;
use crate::tasklet::Tasklet;

/// `acc + Σ a[i]·b[i]`, accumulated in index order
#[inline]
pub fn dot_acc(mut acc: f32, a: &[f32], b: &[f32]) -> f32 {
    for (x, y) in a.iter().zip(b) {
        acc += x * y;
    }
    acc
}

/// Dot product of two bulk vectors streamed through scratch
///
/// Reads `len` words of each operand in segments of `a_buf.len()` words.
pub fn stream_dot(
    tasklet: &Tasklet<'_>,
    a: (&str, usize),
    b: (&str, usize),
    len: usize,
    a_buf: &mut [f32],
    b_buf: &mut [f32],
) -> Result<f32> {
    let segment = a_buf.len().min(b_buf.len()).max(1);
    let mut acc = 0.0f32;
    let mut done = 0;
    while done < len {
        let n = segment.min(len - done);
        tasklet.read(a.0, a.1 + done, &mut a_buf[..n])?;
        tasklet.read(b.0, b.1 + done, &mut b_buf[..n])?;
        acc = dot_acc(acc, &a_buf[..n], &b_buf[..n]);
        done += n;
    }
    Ok(acc)
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// SwiGLU gate: `gate · sigmoid(gate) · up`
#[inline]
pub fn swiglu(gate: f32, up: f32) -> f32 {
    gate * sigmoid(gate) * up
}

/// Rotate the pair starting at even feature `index` for `position`
#[inline]
pub fn rope_rotate(v0: f32, v1: f32, index: usize, head_size: usize, position: usize) -> (f32, f32) {
    rotate_pair(v0, v1, rope_angle(index, head_size, position))
}

/// Numerically stable softmax in place
///
/// Entries equal to negative infinity receive zero weight. A slice with no
/// finite entry is set to all zeros.
pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        x.fill(0.0);
        return;
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// Reciprocal RMS scale for a sum of squares over `len` values
#[inline]
pub fn rms_scale(sum_squares: f32, len: usize) -> f32 {
    1.0 / (sum_squares / len as f32 + RMS_NORM_EPS).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_masking() {
        let mut x = [1.0, 2.0, f32::NEG_INFINITY, f32::NEG_INFINITY];
        softmax(&mut x);
        assert!((x[0] + x[1] - 1.0).abs() < 1e-6);
        assert!(x[1] > x[0]);
        assert_eq!(x[2], 0.0);
        assert_eq!(x[3], 0.0);
    }

    #[test]
    fn test_softmax_fully_masked() {
        let mut x = [f32::NEG_INFINITY; 3];
        softmax(&mut x);
        assert_eq!(x, [0.0; 3]);
    }

    #[test]
    fn test_rope_preserves_norm() {
        for &(index, position) in &[(0, 1), (2, 7), (6, 100), (14, 3)] {
            let (a, b) = rope_rotate(0.6, -0.8, index, 16, position);
            assert!((a * a + b * b - 1.0).abs() < 1e-5);
        }
        assert_eq!(rope_rotate(0.6, -0.8, 4, 16, 0), (0.6, -0.8));
    }

    #[test]
    fn test_rms_scale_matches_reference_norm() {
        let x = [0.5f32, -1.5, 2.0, 0.25];
        let w = [1.0f32; 4];
        let mut expected = [0.0f32; 4];
        pimlm_model::rmsnorm(&mut expected, &x, &w);

        let scale = rms_scale(dot_acc(0.0, &x, &x), x.len());
        for (v, e) in x.iter().zip(&expected) {
            assert!((v * scale - e).abs() < 1e-6);
        }
    }

    #[test]
    fn test_rms_scale_zero_input() {
        let scale = rms_scale(0.0, 8);
        assert!(scale.is_finite());
    }

    #[test]
    fn test_swiglu() {
        assert_eq!(swiglu(0.0, 5.0), 0.0);
        assert!((swiglu(2.0, 1.0) - 2.0 * sigmoid(2.0)).abs() < 1e-7);
    }
}
