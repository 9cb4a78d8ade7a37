//! Single-threaded reference forward pass
//!
//! A straightforward llama2-style forward pass used as the correctness
//! oracle for the distributed engine. It shares no state with the engine.

use crate::config::{ModelConfig, RMS_NORM_EPS};
use crate::error::Result;
use crate::rope::{rope_angle, rotate_pair};
use crate::state::RunState;
use crate::weights::WeightSet;

/// RMSNorm: `o = x * w / sqrt(mean(x²) + eps)`
pub fn rmsnorm(o: &mut [f32], x: &[f32], weight: &[f32]) {
    let ss: f32 = x.iter().map(|v| v * v).sum::<f32>() / x.len() as f32;
    let scale = 1.0 / (ss + RMS_NORM_EPS).sqrt();
    for ((o, &x), &w) in o.iter_mut().zip(x).zip(weight) {
        *o = w * (scale * x);
    }
}

/// Numerically stable in-place softmax
pub fn softmax(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// `xout[i] = Σ_j w[i·n + j] · x[j]` for `i` in `0..d`
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], n: usize, d: usize) {
    for (i, out) in xout.iter_mut().enumerate().take(d) {
        let row = &w[i * n..(i + 1) * n];
        *out = row.iter().zip(x).map(|(w, x)| w * x).sum();
    }
}

/// Run one token through the model, returning the logits
pub fn forward_reference<'s>(
    weights: &WeightSet,
    state: &'s mut RunState,
    token: u32,
    pos: usize,
) -> Result<&'s [f32]> {
    let c: ModelConfig = weights.config;
    let (dim, hidden_dim, kv_dim) = (c.dim, c.hidden_dim, c.kv_dim());
    let head_size = c.head_size();
    let kv_mul = c.kv_mul();

    if pos == 0 {
        state.kv_cache.clear();
    }

    state.x.copy_from_slice(weights.embedding(token)?);

    for l in 0..c.n_layers {
        let lw = weights.layer(l);

        rmsnorm(&mut state.xb, &state.x, lw.rms_att);

        matmul(&mut state.q, &state.xb, lw.wq, dim, dim);
        matmul(&mut state.k, &state.xb, lw.wk, dim, kv_dim);
        matmul(&mut state.v, &state.xb, lw.wv, dim, kv_dim);

        for i in (0..dim).step_by(2) {
            let angle = rope_angle(i, head_size, pos);
            let (q0, q1) = rotate_pair(state.q[i], state.q[i + 1], angle);
            state.q[i] = q0;
            state.q[i + 1] = q1;
            if i < kv_dim {
                let (k0, k1) = rotate_pair(state.k[i], state.k[i + 1], angle);
                state.k[i] = k0;
                state.k[i + 1] = k1;
            }
        }

        state.kv_cache.store(l, pos, &state.k, &state.v)?;

        let scale = (head_size as f32).sqrt();
        for h in 0..c.n_heads {
            let q = &state.q[h * head_size..(h + 1) * head_size];
            let kv_off = (h / kv_mul) * head_size;
            let att = &mut state.att[h * c.seq_len..(h + 1) * c.seq_len];
            att.fill(0.0);

            for (t, score) in att.iter_mut().enumerate().take(pos + 1) {
                let k = &state.kv_cache.key(l, t)[kv_off..kv_off + head_size];
                *score = q.iter().zip(k).map(|(a, b)| a * b).sum::<f32>() / scale;
            }
            softmax(&mut att[..=pos]);

            let xb = &mut state.xb[h * head_size..(h + 1) * head_size];
            xb.fill(0.0);
            for (t, &a) in att.iter().enumerate().take(pos + 1) {
                let v = &state.kv_cache.value(l, t)[kv_off..kv_off + head_size];
                for (o, &vi) in xb.iter_mut().zip(v) {
                    *o += a * vi;
                }
            }
        }

        matmul(&mut state.xb2, &state.xb, lw.wo, dim, dim);
        for (x, d) in state.x.iter_mut().zip(&state.xb2) {
            *x += d;
        }

        rmsnorm(&mut state.xb, &state.x, lw.rms_ffn);

        matmul(&mut state.hb, &state.xb, lw.w1, dim, hidden_dim);
        matmul(&mut state.hb2, &state.xb, lw.w3, dim, hidden_dim);
        for (h, &up) in state.hb.iter_mut().zip(&state.hb2) {
            let gate = *h;
            *h = gate * (1.0 / (1.0 + (-gate).exp())) * up;
        }

        matmul(&mut state.xb, &state.hb, lw.w2, hidden_dim, dim);
        for (x, d) in state.x.iter_mut().zip(&state.xb) {
            *x += d;
        }
    }

    let x = state.x.clone();
    rmsnorm(&mut state.x, &x, &weights.rms_final);

    matmul(&mut state.logits, &state.x, weights.classifier(), dim, c.vocab_size);
    Ok(&state.logits)
}

/// Result of comparing two vectors element-wise
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorComparison {
    /// Largest absolute difference
    pub max_abs_diff: f32,
    /// Index of the largest difference
    pub index: usize,
    /// Whether every element is within tolerance
    pub within_tolerance: bool,
}

/// Compare two vectors and log the worst mismatch
pub fn compare_vectors(name: &str, a: &[f32], b: &[f32], tolerance: f32) -> VectorComparison {
    let mut max_abs_diff = 0.0f32;
    let mut index = 0;
    let mut within_tolerance = a.len() == b.len();

    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let diff = (x - y).abs();
        // NaN compares false, so count it as a mismatch explicitly
        if diff.is_nan() || diff > tolerance {
            within_tolerance = false;
        }
        if diff > max_abs_diff || diff.is_nan() {
            max_abs_diff = diff;
            index = i;
        }
    }

    if within_tolerance {
        tracing::debug!(name, max_abs_diff, "vectors match");
    } else {
        tracing::warn!(
            name,
            max_abs_diff,
            index,
            len_a = a.len(),
            len_b = b.len(),
            "vectors differ"
        );
    }

    VectorComparison {
        max_abs_diff,
        index,
        within_tolerance,
    }
}
