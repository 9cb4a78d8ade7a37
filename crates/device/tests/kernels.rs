//! Kernel results against straightforward host computations

use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use pimlm_device::kernels::{
    sym, AttnOutKernel, ClassifierKernel, Ffn1Kernel, Ffn2Kernel, MhaKernel, MhaStreamingKernel,
    QkvKernel, RmsNormKernel,
};
use pimlm_device::partition::pair_range;
use pimlm_device::{DeviceConfig, Kernel, UnitPool};

fn config(tasklets: usize) -> DeviceConfig {
    DeviceConfig {
        tasklets,
        scratch_bytes: 64 * 1024,
        bulk_bytes: 1 << 20,
        profile: None,
    }
}

fn random_vec(rng: &mut ChaCha20Rng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn assert_close(got: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(got.len(), expected.len());
    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        assert!((g - e).abs() <= tol, "index {}: got {}, expected {}", i, g, e);
    }
}

fn single_unit(kernel: Arc<dyn Kernel>, tasklets: usize) -> UnitPool {
    let mut pool = UnitPool::allocate(kernel.name(), 1, &config(tasklets)).unwrap();
    pool.load(kernel).unwrap();
    pool
}

#[test]
fn test_rmsnorm_matches_host() {
    let mut rng = ChaCha20Rng::seed_from_u64(1);
    let dim = 37;
    let x = random_vec(&mut rng, dim);
    let w: Vec<f32> = (0..dim).map(|_| rng.gen_range(0.5..1.5)).collect();

    let mut pool = single_unit(
        Arc::new(RmsNormKernel {
            dim,
            segment_words: 5,
        }),
        4,
    );
    pool.broadcast(sym::X, 0, &x).unwrap();
    pool.broadcast(sym::W, 0, &w).unwrap();
    pool.broadcast(sym::ACC, 0, &[0.0f32]).unwrap();
    pool.launch().unwrap();
    let y = pool.gather::<f32>(sym::Y, 0, &[dim]).unwrap().remove(0);

    let ss: f32 = x.iter().map(|v| v * v).sum();
    let scale = 1.0 / (ss / dim as f32 + 1e-5).sqrt();
    let expected: Vec<f32> = x.iter().zip(&w).map(|(x, w)| w * scale * x).collect();
    assert_close(&y, &expected, 1e-5);

    let mean: f32 = y.iter().zip(&w).map(|(y, w)| (y / w).powi(2)).sum::<f32>() / dim as f32;
    assert!((mean - 1.0).abs() < 1e-3, "mean square {}", mean);
}

#[test]
fn test_rmsnorm_zero_input_is_finite() {
    let dim = 8;
    let mut pool = single_unit(
        Arc::new(RmsNormKernel {
            dim,
            segment_words: 256,
        }),
        16,
    );
    pool.broadcast(sym::W, 0, &vec![1.0f32; dim]).unwrap();
    pool.launch().unwrap();
    let y = pool.gather::<f32>(sym::Y, 0, &[dim]).unwrap().remove(0);
    assert!(y.iter().all(|v| *v == 0.0));
}

#[test]
fn test_qkv_projects_and_rotates() {
    let mut rng = ChaCha20Rng::seed_from_u64(2);
    let (dim, head_size, kv_dim, pos) = (16, 8, 8, 3);
    let x = random_vec(&mut rng, dim);
    let wq = random_vec(&mut rng, dim * dim);
    let wk = random_vec(&mut rng, kv_dim * dim);
    let wv = random_vec(&mut rng, kv_dim * dim);

    let units = 2;
    let bands: Vec<_> = (0..units).map(|u| pair_range(dim, units, u)).collect();
    let max_rows = bands.iter().map(|b| b.len()).max().unwrap();

    let mut pool = UnitPool::allocate("qkv", units, &config(3)).unwrap();
    pool.load(Arc::new(QkvKernel {
        dim,
        max_rows,
        head_size,
        segment_words: 5,
    }))
    .unwrap();

    let kv_rows: Vec<usize> = bands
        .iter()
        .map(|b| kv_dim.saturating_sub(b.start).min(b.len()))
        .collect();
    let params: Vec<Vec<u32>> = bands
        .iter()
        .zip(&kv_rows)
        .map(|(b, &kv)| vec![b.start as u32, b.len() as u32, kv as u32, pos as u32])
        .collect();
    pool.scatter(sym::PARAMS, 0, &params).unwrap();
    pool.broadcast(sym::X, 0, &x).unwrap();
    let q_parts: Vec<&[f32]> = bands.iter().map(|b| &wq[b.start * dim..b.end * dim]).collect();
    let k_parts: Vec<&[f32]> = bands
        .iter()
        .zip(&kv_rows)
        .map(|(b, &kv)| &wk[b.start * dim..(b.start + kv) * dim])
        .collect();
    let v_parts: Vec<&[f32]> = bands
        .iter()
        .zip(&kv_rows)
        .map(|(b, &kv)| &wv[b.start * dim..(b.start + kv) * dim])
        .collect();
    pool.scatter(sym::WQ, 0, &q_parts).unwrap();
    pool.scatter(sym::WK, 0, &k_parts).unwrap();
    pool.scatter(sym::WV, 0, &v_parts).unwrap();
    pool.launch().unwrap();

    let lens: Vec<usize> = bands.iter().map(|b| b.len()).collect();
    let q: Vec<f32> = pool.gather::<f32>(sym::Q, 0, &lens).unwrap().concat();
    let k: Vec<f32> = pool.gather::<f32>(sym::K, 0, &kv_rows).unwrap().concat();
    let v: Vec<f32> = pool.gather::<f32>(sym::V, 0, &kv_rows).unwrap().concat();

    let rotate = |vec: &mut Vec<f32>| {
        for i in (0..vec.len()).step_by(2) {
            let freq = 1.0 / 10000f32.powf((i % head_size) as f32 / head_size as f32);
            let (sin, cos) = (pos as f32 * freq).sin_cos();
            let (a, b) = (vec[i], vec[i + 1]);
            vec[i] = a * cos - b * sin;
            vec[i + 1] = a * sin + b * cos;
        }
    };
    let mut expected_q: Vec<f32> = (0..dim).map(|r| dot(&x, &wq[r * dim..(r + 1) * dim])).collect();
    let mut expected_k: Vec<f32> = (0..kv_dim).map(|r| dot(&x, &wk[r * dim..(r + 1) * dim])).collect();
    let expected_v: Vec<f32> = (0..kv_dim).map(|r| dot(&x, &wv[r * dim..(r + 1) * dim])).collect();
    rotate(&mut expected_q);
    rotate(&mut expected_k);

    assert_close(&q, &expected_q, 1e-5);
    assert_close(&k, &expected_k, 1e-5);
    assert_close(&v, &expected_v, 1e-5);
}

struct AttentionInputs {
    head_size: usize,
    seq_len: usize,
    q: Vec<f32>,
    keys: Vec<Vec<f32>>,
    values: Vec<Vec<f32>>,
}

impl AttentionInputs {
    fn random(seed: u64, head_size: usize, seq_len: usize) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        Self {
            head_size,
            seq_len,
            q: random_vec(&mut rng, head_size),
            keys: (0..seq_len).map(|_| random_vec(&mut rng, head_size)).collect(),
            values: (0..seq_len).map(|_| random_vec(&mut rng, head_size)).collect(),
        }
    }

    fn run(&self, kernel: Arc<dyn Kernel>, tasklets: usize, pos: usize) -> (Vec<f32>, Vec<f32>) {
        let pool = {
            let mut pool = single_unit(kernel, tasklets);
            pool.broadcast(sym::PARAMS, 0, &[pos as u32]).unwrap();
            pool.broadcast(sym::Q, 0, &self.q).unwrap();
            for t in 0..=pos {
                pool.broadcast(sym::KC, t * self.head_size, &self.keys[t]).unwrap();
            }
            for o in 0..self.head_size {
                let column: Vec<f32> = (0..=pos).map(|t| self.values[t][o]).collect();
                pool.broadcast(sym::VC, o * self.seq_len, &column).unwrap();
            }
            pool.launch().unwrap();
            pool
        };
        let att = pool.gather::<f32>(sym::ATT, 0, &[self.seq_len]).unwrap().remove(0);
        let out = pool.gather::<f32>(sym::OUT, 0, &[self.head_size]).unwrap().remove(0);
        (att, out)
    }
}

#[test]
fn test_bounded_attention_matches_host() {
    let inputs = AttentionInputs::random(3, 8, 6);
    let pos = 3;
    let (att, out) = inputs.run(
        Arc::new(MhaKernel {
            head_size: 8,
            seq_len: 6,
        }),
        4,
        pos,
    );

    let scale = (8f32).sqrt();
    let scores: Vec<f32> = (0..=pos).map(|t| dot(&inputs.q, &inputs.keys[t]) / scale).collect();
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let weights: Vec<f32> = exps.iter().map(|e| e / sum).collect();

    assert_close(&att[..=pos], &weights, 1e-6);
    assert!(att[pos + 1..].iter().all(|w| *w == 0.0));
    assert!((att.iter().sum::<f32>() - 1.0).abs() < 1e-5);

    let expected: Vec<f32> = (0..8)
        .map(|o| (0..=pos).map(|t| weights[t] * inputs.values[t][o]).sum())
        .collect();
    assert_close(&out, &expected, 1e-5);
}

#[test]
fn test_single_position_attends_fully() {
    let inputs = AttentionInputs::random(4, 8, 4);
    let (att, out) = inputs.run(
        Arc::new(MhaKernel {
            head_size: 8,
            seq_len: 4,
        }),
        16,
        0,
    );
    assert_eq!(att, vec![1.0, 0.0, 0.0, 0.0]);
    assert_eq!(out, inputs.values[0]);
}

#[test]
fn test_streaming_attention_matches_bounded() {
    let (head_size, seq_len) = (24, 10);
    let inputs = AttentionInputs::random(5, head_size, seq_len);
    let segments = [(1, 1, 1), (5, 3, 4), (7, 64, 2), (128, 64, 64)];

    for tasklets in [3, 4, 16] {
        for pos in [0, 4, seq_len - 1] {
            let bounded = inputs.run(Arc::new(MhaKernel { head_size, seq_len }), tasklets, pos);
            for &(score_segment, output_segment, value_segment) in &segments {
                let streaming = inputs.run(
                    Arc::new(MhaStreamingKernel {
                        head_size,
                        seq_len,
                        score_segment,
                        output_segment,
                        value_segment,
                    }),
                    tasklets,
                    pos,
                );
                assert_eq!(
                    streaming, bounded,
                    "tasklets={} pos={} segments=({}, {}, {})",
                    tasklets, pos, score_segment, output_segment, value_segment
                );
            }
        }
    }
}

#[test]
fn test_streaming_attention_fits_smaller_scratch() {
    let bounded = MhaKernel {
        head_size: 128,
        seq_len: 1024,
    };
    let streaming = MhaStreamingKernel {
        head_size: 128,
        seq_len: 1024,
        score_segment: 128,
        output_segment: 64,
        value_segment: 64,
    };
    assert!(streaming.scratch_words(16) < bounded.scratch_words(16));
    assert!(streaming.scratch_words(16) <= 16 * 1024);
}

#[test]
fn test_attention_output_accumulates_into_residual() {
    let mut rng = ChaCha20Rng::seed_from_u64(6);
    let (rows, cols) = (3, 20);
    let v = random_vec(&mut rng, cols);
    let w = random_vec(&mut rng, rows * cols);
    let residual = random_vec(&mut rng, rows);

    // 8 tasklets over 3 rows: each row split two ways
    let mut pool = single_unit(
        Arc::new(AttnOutKernel {
            max_cols: cols,
            max_rows: 4,
            segment_words: 6,
        }),
        8,
    );
    pool.broadcast(sym::PARAMS, 0, &[rows as u32, cols as u32]).unwrap();
    pool.broadcast(sym::V, 0, &v).unwrap();
    pool.broadcast(sym::W, 0, &w).unwrap();
    pool.broadcast(sym::X, 0, &residual).unwrap();
    pool.launch().unwrap();
    let x = pool.gather::<f32>(sym::X, 0, &[rows]).unwrap().remove(0);

    let expected: Vec<f32> = (0..rows)
        .map(|r| residual[r] + dot(&w[r * cols..(r + 1) * cols], &v))
        .collect();
    assert_close(&x, &expected, 1e-5);
}

#[test]
fn test_ffn_gate_applies_swiglu() {
    let mut rng = ChaCha20Rng::seed_from_u64(7);
    let (dim, rows) = (12, 10);
    let x = random_vec(&mut rng, dim);
    let w1 = random_vec(&mut rng, rows * dim);
    let w3 = random_vec(&mut rng, rows * dim);

    let mut pool = single_unit(
        Arc::new(Ffn1Kernel {
            dim,
            max_rows: rows,
            segment_words: 5,
        }),
        4,
    );
    pool.broadcast(sym::PARAMS, 0, &[rows as u32]).unwrap();
    pool.broadcast(sym::X, 0, &x).unwrap();
    pool.broadcast(sym::W1, 0, &w1).unwrap();
    pool.broadcast(sym::W3, 0, &w3).unwrap();
    pool.launch().unwrap();
    let h = pool.gather::<f32>(sym::H, 0, &[rows]).unwrap().remove(0);

    let expected: Vec<f32> = (0..rows)
        .map(|r| {
            let g = dot(&x, &w1[r * dim..(r + 1) * dim]);
            let u = dot(&x, &w3[r * dim..(r + 1) * dim]);
            g / (1.0 + (-g).exp()) * u
        })
        .collect();
    assert_close(&h, &expected, 1e-5);
}

#[test]
fn test_ffn_down_projection_accumulates() {
    let mut rng = ChaCha20Rng::seed_from_u64(8);
    let (rows, cols) = (5, 30);
    let h = random_vec(&mut rng, cols);
    let w = random_vec(&mut rng, rows * cols);
    let residual = random_vec(&mut rng, rows);

    let mut pool = single_unit(
        Arc::new(Ffn2Kernel {
            max_cols: 32,
            max_rows: rows,
            segment_words: 7,
        }),
        3,
    );
    pool.broadcast(sym::PARAMS, 0, &[rows as u32, cols as u32]).unwrap();
    pool.broadcast(sym::H, 0, &h).unwrap();
    pool.broadcast(sym::W, 0, &w).unwrap();
    pool.broadcast(sym::X, 0, &residual).unwrap();
    pool.launch().unwrap();
    let x = pool.gather::<f32>(sym::X, 0, &[rows]).unwrap().remove(0);

    let expected: Vec<f32> = (0..rows)
        .map(|r| residual[r] + dot(&w[r * cols..(r + 1) * cols], &h))
        .collect();
    assert_close(&x, &expected, 1e-5);
}

#[test]
fn test_classifier_produces_one_logit_per_row() {
    let mut rng = ChaCha20Rng::seed_from_u64(9);
    let (dim, rows) = (12, 25);
    let x = random_vec(&mut rng, dim);
    let w = random_vec(&mut rng, rows * dim);

    let mut pool = single_unit(
        Arc::new(ClassifierKernel {
            dim,
            max_rows: rows,
            segment_words: 5,
        }),
        4,
    );
    pool.broadcast(sym::PARAMS, 0, &[rows as u32]).unwrap();
    pool.broadcast(sym::W, 0, &w).unwrap();

    // weights stay resident while x changes
    for _ in 0..2 {
        let x: Vec<f32> = x.iter().map(|v| v * rng.gen_range(0.5..2.0)).collect();
        pool.broadcast(sym::X, 0, &x).unwrap();
        pool.launch().unwrap();
        let logits = pool.gather::<f32>(sym::LOGITS, 0, &[rows]).unwrap().remove(0);
        let expected: Vec<f32> = (0..rows).map(|r| dot(&x, &w[r * dim..(r + 1) * dim])).collect();
        assert_close(&logits, &expected, 1e-5);
    }
}

#[test]
fn test_classifier_scratch_independent_of_dim() {
    let narrow = ClassifierKernel {
        dim: 288,
        max_rows: 100,
        segment_words: 256,
    };
    let wide = ClassifierKernel {
        dim: 4096,
        max_rows: 100,
        segment_words: 256,
    };
    assert_eq!(narrow.scratch_words(16), wide.scratch_words(16));
    assert!(wide.scratch_words(16) <= 16 * 1024);
}
