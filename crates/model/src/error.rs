//! Model error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model config error: {0}")]
    Config(String),

    #[error("Invalid tensor shape for {name}: expected {expected} values, got {got}")]
    InvalidShape {
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("Invalid token ID: {token} (vocab size {vocab_size})")]
    InvalidToken { token: u32, vocab_size: usize },

    #[error("Position {position} out of range for max sequence length {seq_len}")]
    PositionOutOfRange { position: usize, seq_len: usize },

    #[error("KV cache layer {layer}: expected position {expected}, got {got}")]
    CacheOrder {
        layer: usize,
        expected: usize,
        got: usize,
    },
}

pub type Result<T> = std::result::Result<T, ModelError>;
