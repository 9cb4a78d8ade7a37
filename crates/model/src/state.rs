//! Per-token activation buffers

use crate::config::ModelConfig;
use crate::kv_cache::KvCache;

/// Mutable activations for one forward pass plus the KV cache
#[derive(Debug, Clone)]
pub struct RunState {
    /// Activation at the current time step: [dim]
    pub x: Vec<f32>,
    /// Activation inside a residual branch: [dim]
    pub xb: Vec<f32>,
    /// Scratch buffer for projections: [dim]
    pub xb2: Vec<f32>,
    /// FFN hidden buffer: [hidden_dim]
    pub hb: Vec<f32>,
    /// Second FFN hidden buffer: [hidden_dim]
    pub hb2: Vec<f32>,
    /// Query: [dim]
    pub q: Vec<f32>,
    /// Key for the current position: [kv_dim]
    pub k: Vec<f32>,
    /// Value for the current position: [kv_dim]
    pub v: Vec<f32>,
    /// Attention scores/weights: [n_heads, seq_len]
    pub att: Vec<f32>,
    /// Output logits: [vocab_size]
    pub logits: Vec<f32>,
    pub kv_cache: KvCache,
}

impl RunState {
    pub fn new(config: &ModelConfig) -> Self {
        let kv_dim = config.kv_dim();
        Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            xb2: vec![0.0; config.dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            q: vec![0.0; config.dim],
            k: vec![0.0; kv_dim],
            v: vec![0.0; kv_dim],
            att: vec![0.0; config.n_heads * config.seq_len],
            logits: vec![0.0; config.vocab_size],
            kv_cache: KvCache::new(config),
        }
    }

    /// Attention weights of head `h` from the last forward pass
    pub fn head_attention(&self, h: usize) -> &[f32] {
        let seq_len = self.kv_cache.seq_len();
        &self.att[h * seq_len..(h + 1) * seq_len]
    }
}
