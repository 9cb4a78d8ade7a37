//! Model hyperparameters

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// RMSNorm epsilon, added before the reciprocal square root
pub const RMS_NORM_EPS: f32 = 1e-5;

/// RoPE base frequency
pub const ROPE_THETA: f32 = 10000.0;

/// Transformer hyperparameters, fixed for the lifetime of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Transformer (embedding) dimension
    pub dim: usize,
    /// FFN hidden dimension
    pub hidden_dim: usize,
    /// Number of transformer layers
    pub n_layers: usize,
    /// Number of query heads
    pub n_heads: usize,
    /// Number of key/value heads (less than `n_heads` for grouped-query attention)
    pub n_kv_heads: usize,
    /// Vocabulary size
    pub vocab_size: usize,
    /// Maximum sequence length
    pub seq_len: usize,
}

impl Default for ModelConfig {
    /// The stories15M geometry
    fn default() -> Self {
        Self {
            dim: 288,
            hidden_dim: 768,
            n_layers: 6,
            n_heads: 6,
            n_kv_heads: 6,
            vocab_size: 32000,
            seq_len: 256,
        }
    }
}

impl ModelConfig {
    /// Per-head dimension
    pub fn head_size(&self) -> usize {
        self.dim / self.n_heads
    }

    /// Width of one key (or value) row in the KV cache
    pub fn kv_dim(&self) -> usize {
        self.dim * self.n_kv_heads / self.n_heads
    }

    /// Number of query heads sharing one key/value head
    pub fn kv_mul(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Check dimensional consistency
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("dim", self.dim),
            ("hidden_dim", self.hidden_dim),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.n_kv_heads),
            ("vocab_size", self.vocab_size),
            ("seq_len", self.seq_len),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(ModelError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.dim % self.n_heads != 0 {
            return Err(ModelError::Config(format!(
                "dim ({}) must be divisible by n_heads ({})",
                self.dim, self.n_heads
            )));
        }
        if self.n_heads % self.n_kv_heads != 0 {
            return Err(ModelError::Config(format!(
                "n_heads ({}) must be divisible by n_kv_heads ({})",
                self.n_heads, self.n_kv_heads
            )));
        }
        if self.head_size() % 2 != 0 {
            return Err(ModelError::Config(format!(
                "head_size ({}) must be even for rotary embedding",
                self.head_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.head_size(), 48);
        assert_eq!(config.kv_dim(), 288);
        assert_eq!(config.kv_mul(), 1);
    }

    #[test]
    fn test_grouped_query_dims() {
        let config = ModelConfig {
            dim: 64,
            hidden_dim: 128,
            n_layers: 2,
            n_heads: 8,
            n_kv_heads: 2,
            vocab_size: 100,
            seq_len: 16,
        };
        config.validate().unwrap();
        assert_eq!(config.head_size(), 8);
        assert_eq!(config.kv_dim(), 16);
        assert_eq!(config.kv_mul(), 4);
    }

    #[test]
    fn test_invalid_configs() {
        let base = ModelConfig::default();

        let bad_heads = ModelConfig { n_heads: 5, ..base };
        assert!(matches!(bad_heads.validate(), Err(ModelError::Config(_))));

        let bad_kv = ModelConfig { n_kv_heads: 4, ..base };
        assert!(bad_kv.validate().is_err());

        let zero_vocab = ModelConfig { vocab_size: 0, ..base };
        assert!(zero_vocab.validate().is_err());

        // head_size 3 cannot be split into rotation pairs
        let odd_head = ModelConfig { dim: 18, n_heads: 6, n_kv_heads: 6, ..base };
        assert!(odd_head.validate().is_err());
    }
}
