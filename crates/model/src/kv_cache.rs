//! Append-only key/value cache
//!
//! Keys and values are stored time-major: `[layer][position][kv_dim]`.
//! Each (layer, position) slot is written exactly once, in position order,
//! and stays valid for the rest of the generation run.

use crate::config::ModelConfig;
use crate::error::{ModelError, Result};

/// KV cache for autoregressive generation
#[derive(Debug, Clone)]
pub struct KvCache {
    /// Key cache: [n_layers, seq_len, kv_dim]
    key: Vec<f32>,
    /// Value cache: [n_layers, seq_len, kv_dim]
    value: Vec<f32>,
    /// Number of positions written per layer
    lengths: Vec<usize>,
    n_layers: usize,
    seq_len: usize,
    kv_dim: usize,
}

impl KvCache {
    pub fn new(config: &ModelConfig) -> Self {
        let kv_dim = config.kv_dim();
        let size = config.n_layers * config.seq_len * kv_dim;
        Self {
            key: vec![0.0; size],
            value: vec![0.0; size],
            lengths: vec![0; config.n_layers],
            n_layers: config.n_layers,
            seq_len: config.seq_len,
            kv_dim,
        }
    }

    /// Append the key/value rows for `position` in `layer`
    ///
    /// `position` must be the next unwritten slot of that layer.
    pub fn store(&mut self, layer: usize, position: usize, k: &[f32], v: &[f32]) -> Result<()> {
        if layer >= self.n_layers {
            return Err(ModelError::Config(format!(
                "layer {} out of range ({} layers)",
                layer, self.n_layers
            )));
        }
        if position >= self.seq_len {
            return Err(ModelError::PositionOutOfRange {
                position,
                seq_len: self.seq_len,
            });
        }
        let expected = self.lengths[layer];
        if position != expected {
            return Err(ModelError::CacheOrder {
                layer,
                expected,
                got: position,
            });
        }
        for (name, row) in [("key", k), ("value", v)] {
            if row.len() != self.kv_dim {
                return Err(ModelError::InvalidShape {
                    name: name.to_string(),
                    expected: self.kv_dim,
                    got: row.len(),
                });
            }
        }

        let start = self.offset(layer, position);
        self.key[start..start + self.kv_dim].copy_from_slice(k);
        self.value[start..start + self.kv_dim].copy_from_slice(v);
        self.lengths[layer] += 1;
        Ok(())
    }

    /// Key row for a cached position
    pub fn key(&self, layer: usize, position: usize) -> &[f32] {
        let start = self.offset(layer, position);
        &self.key[start..start + self.kv_dim]
    }

    /// Value row for a cached position
    pub fn value(&self, layer: usize, position: usize) -> &[f32] {
        let start = self.offset(layer, position);
        &self.value[start..start + self.kv_dim]
    }

    /// All key rows of a layer: [seq_len, kv_dim]
    pub fn layer_keys(&self, layer: usize) -> &[f32] {
        let start = self.offset(layer, 0);
        &self.key[start..start + self.seq_len * self.kv_dim]
    }

    /// All value rows of a layer: [seq_len, kv_dim]
    pub fn layer_values(&self, layer: usize) -> &[f32] {
        let start = self.offset(layer, 0);
        &self.value[start..start + self.seq_len * self.kv_dim]
    }

    /// Number of positions cached for a layer
    pub fn len(&self, layer: usize) -> usize {
        self.lengths[layer]
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.iter().all(|&l| l == 0)
    }

    pub fn kv_dim(&self) -> usize {
        self.kv_dim
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Start a new generation run
    pub fn clear(&mut self) {
        self.key.fill(0.0);
        self.value.fill(0.0);
        self.lengths.fill(0);
    }

    /// Memory usage in bytes
    pub fn memory_bytes(&self) -> usize {
        (self.key.len() + self.value.len()) * std::mem::size_of::<f32>()
    }

    fn offset(&self, layer: usize, position: usize) -> usize {
        (layer * self.seq_len + position) * self.kv_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ModelConfig {
        ModelConfig {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 10,
            seq_len: 3,
        }
    }

    #[test]
    fn test_store_and_read() {
        let mut cache = KvCache::new(&config());
        assert_eq!(cache.kv_dim(), 4);
        assert!(cache.is_empty());

        cache.store(1, 0, &[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0]).unwrap();
        cache.store(1, 1, &[9.0; 4], &[10.0; 4]).unwrap();

        assert_eq!(cache.len(1), 2);
        assert_eq!(cache.len(0), 0);
        assert_eq!(cache.key(1, 0), &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(cache.value(1, 1), &[10.0; 4]);
        assert_eq!(&cache.layer_keys(1)[4..8], &[9.0; 4]);
    }

    #[test]
    fn test_positions_are_write_once_and_ordered() {
        let mut cache = KvCache::new(&config());
        cache.store(0, 0, &[1.0; 4], &[1.0; 4]).unwrap();

        // Rewriting an earlier slot is rejected
        let err = cache.store(0, 0, &[2.0; 4], &[2.0; 4]).unwrap_err();
        assert!(matches!(err, ModelError::CacheOrder { expected: 1, got: 0, .. }));
        assert_eq!(cache.key(0, 0), &[1.0; 4]);

        // Skipping ahead is rejected
        assert!(cache.store(0, 2, &[2.0; 4], &[2.0; 4]).is_err());
    }

    #[test]
    fn test_capacity_and_clear() {
        let mut cache = KvCache::new(&config());
        for pos in 0..3 {
            cache.store(0, pos, &[pos as f32; 4], &[0.0; 4]).unwrap();
        }
        assert!(matches!(
            cache.store(0, 3, &[0.0; 4], &[0.0; 4]),
            Err(ModelError::PositionOutOfRange { position: 3, seq_len: 3 })
        ));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.key(0, 2), &[0.0; 4]);
        cache.store(0, 0, &[1.0; 4], &[1.0; 4]).unwrap();
    }

    #[test]
    fn test_row_width_checked() {
        let mut cache = KvCache::new(&config());
        assert!(matches!(
            cache.store(0, 0, &[1.0; 3], &[1.0; 4]),
            Err(ModelError::InvalidShape { .. })
        ));
        assert_eq!(cache.len(0), 0);
    }
}
