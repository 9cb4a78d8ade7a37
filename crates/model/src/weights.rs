//! Model weight structures
//!
//! All matrices are row-major with one row per output feature, so a
//! projection `y = W·x` reads row `i` of `W` to produce `y[i]`.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

/// Read-only model weights
#[derive(Debug, Clone)]
pub struct WeightSet {
    pub config: ModelConfig,
    /// Token embedding table: [vocab_size, dim]
    pub token_embedding: Vec<f32>,
    /// Attention RMSNorm weights: [n_layers, dim]
    pub rms_att: Vec<f32>,
    /// FFN RMSNorm weights: [n_layers, dim]
    pub rms_ffn: Vec<f32>,
    /// Query projection: [n_layers, dim, dim]
    pub wq: Vec<f32>,
    /// Key projection: [n_layers, kv_dim, dim]
    pub wk: Vec<f32>,
    /// Value projection: [n_layers, kv_dim, dim]
    pub wv: Vec<f32>,
    /// Attention output projection: [n_layers, dim, dim]
    pub wo: Vec<f32>,
    /// FFN gate projection: [n_layers, hidden_dim, dim]
    pub w1: Vec<f32>,
    /// FFN down projection: [n_layers, dim, hidden_dim]
    pub w2: Vec<f32>,
    /// FFN up projection: [n_layers, hidden_dim, dim]
    pub w3: Vec<f32>,
    /// Final RMSNorm weights: [dim]
    pub rms_final: Vec<f32>,
    /// Classifier: [vocab_size, dim]; `None` when tied to the embedding table
    pub wcls: Option<Vec<f32>>,
}

/// Borrowed view of one layer's weights
#[derive(Debug, Clone, Copy)]
pub struct LayerWeights<'a> {
    pub rms_att: &'a [f32],
    pub rms_ffn: &'a [f32],
    pub wq: &'a [f32],
    pub wk: &'a [f32],
    pub wv: &'a [f32],
    pub wo: &'a [f32],
    pub w1: &'a [f32],
    pub w2: &'a [f32],
    pub w3: &'a [f32],
}

impl WeightSet {
    /// Random weights for testing, deterministic in `seed`
    ///
    /// Matrices are drawn uniformly from ±1/sqrt(fan_in) and norm weights
    /// from [0.5, 1.5], which keeps activations in a well-conditioned range.
    pub fn random(config: ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha20Rng::seed_from_u64(seed);

        let dim = config.dim;
        let hidden = config.hidden_dim;
        let kv_dim = config.kv_dim();
        let layers = config.n_layers;

        let mut matrix = |len: usize, fan_in: usize| -> Vec<f32> {
            let bound = 1.0 / (fan_in as f32).sqrt();
            (0..len).map(|_| rng.gen_range(-bound..bound)).collect()
        };

        let token_embedding = matrix(config.vocab_size * dim, 1);
        let wq = matrix(layers * dim * dim, dim);
        let wk = matrix(layers * kv_dim * dim, dim);
        let wv = matrix(layers * kv_dim * dim, dim);
        let wo = matrix(layers * dim * dim, dim);
        let w1 = matrix(layers * hidden * dim, dim);
        let w2 = matrix(layers * dim * hidden, hidden);
        let w3 = matrix(layers * hidden * dim, dim);
        let wcls = matrix(config.vocab_size * dim, dim);

        let mut norm = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.gen_range(0.5..1.5)).collect() };
        let rms_att = norm(layers * dim);
        let rms_ffn = norm(layers * dim);
        let rms_final = norm(dim);

        Ok(Self {
            config,
            token_embedding,
            rms_att,
            rms_ffn,
            wq,
            wk,
            wv,
            wo,
            w1,
            w2,
            w3,
            rms_final,
            wcls: Some(wcls),
        })
    }

    /// Check every tensor against the configured dimensions
    pub fn validate(&self) -> Result<()> {
        let c = &self.config;
        c.validate()?;
        let (dim, hidden, kv_dim, layers) = (c.dim, c.hidden_dim, c.kv_dim(), c.n_layers);

        let mut checks = vec![
            ("token_embedding", self.token_embedding.len(), c.vocab_size * dim),
            ("rms_att", self.rms_att.len(), layers * dim),
            ("rms_ffn", self.rms_ffn.len(), layers * dim),
            ("wq", self.wq.len(), layers * dim * dim),
            ("wk", self.wk.len(), layers * kv_dim * dim),
            ("wv", self.wv.len(), layers * kv_dim * dim),
            ("wo", self.wo.len(), layers * dim * dim),
            ("w1", self.w1.len(), layers * hidden * dim),
            ("w2", self.w2.len(), layers * dim * hidden),
            ("w3", self.w3.len(), layers * hidden * dim),
            ("rms_final", self.rms_final.len(), dim),
        ];
        if let Some(wcls) = &self.wcls {
            checks.push(("wcls", wcls.len(), c.vocab_size * dim));
        }

        for (name, got, expected) in checks {
            if got != expected {
                return Err(ModelError::InvalidShape {
                    name: name.to_string(),
                    expected,
                    got,
                });
            }
        }
        Ok(())
    }

    /// Weights of layer `l`
    pub fn layer(&self, l: usize) -> LayerWeights<'_> {
        let c = &self.config;
        let (dim, hidden, kv_dim) = (c.dim, c.hidden_dim, c.kv_dim());
        let slice = |data: &[f32], size: usize| -> std::ops::Range<usize> {
            debug_assert!(data.len() >= (l + 1) * size);
            l * size..(l + 1) * size
        };

        LayerWeights {
            rms_att: &self.rms_att[slice(&self.rms_att, dim)],
            rms_ffn: &self.rms_ffn[slice(&self.rms_ffn, dim)],
            wq: &self.wq[slice(&self.wq, dim * dim)],
            wk: &self.wk[slice(&self.wk, kv_dim * dim)],
            wv: &self.wv[slice(&self.wv, kv_dim * dim)],
            wo: &self.wo[slice(&self.wo, dim * dim)],
            w1: &self.w1[slice(&self.w1, hidden * dim)],
            w2: &self.w2[slice(&self.w2, dim * hidden)],
            w3: &self.w3[slice(&self.w3, hidden * dim)],
        }
    }

    /// Embedding row for `token`
    pub fn embedding(&self, token: u32) -> Result<&[f32]> {
        let vocab_size = self.config.vocab_size;
        let t = token as usize;
        if t >= vocab_size {
            return Err(ModelError::InvalidToken { token, vocab_size });
        }
        let dim = self.config.dim;
        Ok(&self.token_embedding[t * dim..(t + 1) * dim])
    }

    /// Classifier matrix (the embedding table when weights are tied)
    pub fn classifier(&self) -> &[f32] {
        self.wcls.as_deref().unwrap_or(&self.token_embedding)
    }

    /// Whether the classifier shares the embedding table
    pub fn shared_classifier(&self) -> bool {
        self.wcls.is_none()
    }

    /// Total parameter count
    pub fn num_parameters(&self) -> usize {
        self.token_embedding.len()
            + self.rms_att.len()
            + self.rms_ffn.len()
            + self.wq.len()
            + self.wk.len()
            + self.wv.len()
            + self.wo.len()
            + self.w1.len()
            + self.w2.len()
            + self.w3.len()
            + self.rms_final.len()
            + self.wcls.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            dim: 16,
            hidden_dim: 32,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            vocab_size: 20,
            seq_len: 8,
        }
    }

    #[test]
    fn test_random_weights_are_deterministic() {
        let a = WeightSet::random(config(), 7).unwrap();
        let b = WeightSet::random(config(), 7).unwrap();
        let c = WeightSet::random(config(), 8).unwrap();
        a.validate().unwrap();
        assert_eq!(a.wq, b.wq);
        assert_ne!(a.wq, c.wq);
    }

    #[test]
    fn test_layer_views() {
        let w = WeightSet::random(config(), 1).unwrap();
        let l1 = w.layer(1);
        assert_eq!(l1.wq.len(), 16 * 16);
        assert_eq!(l1.wk.len(), 8 * 16);
        assert_eq!(l1.w2.len(), 16 * 32);
        assert_eq!(l1.wq[0], w.wq[16 * 16]);
        assert_eq!(l1.rms_ffn[3], w.rms_ffn[16 + 3]);
    }

    #[test]
    fn test_embedding_lookup() {
        let w = WeightSet::random(config(), 1).unwrap();
        assert_eq!(w.embedding(2).unwrap(), &w.token_embedding[32..48]);
        assert!(matches!(
            w.embedding(20),
            Err(ModelError::InvalidToken { token: 20, vocab_size: 20 })
        ));
    }

    #[test]
    fn test_tied_classifier() {
        let mut w = WeightSet::random(config(), 1).unwrap();
        assert!(!w.shared_classifier());
        w.wcls = None;
        assert!(w.shared_classifier());
        assert_eq!(w.classifier().as_ptr(), w.token_embedding.as_ptr());
    }

    #[test]
    fn test_validate_detects_shape_mismatch() {
        let mut w = WeightSet::random(config(), 1).unwrap();
        w.w2.pop();
        match w.validate() {
            Err(ModelError::InvalidShape { name, .. }) => assert_eq!(name, "w2"),
            other => panic!("expected shape error, got {:?}", other),
        }
    }
}
