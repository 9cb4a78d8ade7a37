//! Per-kernel programs
//!
//! Each kernel is a small struct whose fields fix the symbol capacities for
//! one model shape. Per-launch scalars (row counts, position) travel in the
//! `params` symbol as `u32` words.

mod attout;
mod cls;
mod ffn1;
mod ffn2;
mod mha;
mod mha_streaming;
mod qkv;
mod rmsnorm;

pub use attout::AttnOutKernel;
pub use cls::ClassifierKernel;
pub use ffn1::Ffn1Kernel;
pub use ffn2::Ffn2Kernel;
pub use mha::{AttentionPhase, MhaKernel};
pub use mha_streaming::MhaStreamingKernel;
pub use qkv::QkvKernel;
pub use rmsnorm::RmsNormKernel;

use crate::error::{DeviceError, Result};

/// Program names
pub mod names {
    pub const RMSNORM: &str = "rmsnorm";
    pub const QKV: &str = "qkv";
    pub const MHA: &str = "mha";
    pub const MHA_STREAMING: &str = "mha_streaming";
    pub const ATTN_OUT: &str = "attout";
    pub const FFN1: &str = "ffn1";
    pub const FFN2: &str = "ffn2";
    pub const CLS: &str = "cls";
}

/// Bulk symbol names
pub mod sym {
    pub use crate::tasklet::PARAMS;

    pub const X: &str = "x";
    pub const W: &str = "w";
    pub const Y: &str = "y";
    pub const ACC: &str = "acc";
    pub const WQ: &str = "wq";
    pub const WK: &str = "wk";
    pub const WV: &str = "wv";
    pub const Q: &str = "q";
    pub const K: &str = "k";
    pub const V: &str = "v";
    pub const KC: &str = "kc";
    pub const VC: &str = "vc";
    pub const ATT: &str = "att";
    pub const OUT: &str = "out";
    pub const W1: &str = "w1";
    pub const W3: &str = "w3";
    pub const H: &str = "h";
    pub const LOGITS: &str = "logits";
}

/// Segment length for streaming `len` words with a preferred segment size
pub(crate) fn segment(preferred: usize, len: usize) -> usize {
    preferred.min(len).max(1)
}

pub(crate) fn check_param(name: &str, value: usize, max: usize) -> Result<()> {
    if value > max {
        return Err(DeviceError::InvalidParameter(format!(
            "{} = {} exceeds capacity {}",
            name, value, max
        )));
    }
    Ok(())
}
