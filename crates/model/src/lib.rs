//! PimLM Model
//!
//! Llama-style model description shared by the distributed engine and the
//! single-threaded reference forward pass: hyperparameters, weights,
//! activation buffers, the KV cache and the llama2-format checkpoint loader.

mod checkpoint;
mod config;
mod error;
mod kv_cache;
mod reference;
mod rope;
mod state;
mod weights;

pub use checkpoint::{load_checkpoint, write_checkpoint, CHECKPOINT_HEADER_BYTES};
pub use config::{ModelConfig, RMS_NORM_EPS, ROPE_THETA};
pub use error::{ModelError, Result};
pub use kv_cache::KvCache;
pub use reference::{
    compare_vectors, forward_reference, matmul, rmsnorm, softmax, VectorComparison,
};
pub use rope::{rope_angle, rope_frequency, rotate_pair};
pub use state::RunState;
pub use weights::{LayerWeights, WeightSet};
