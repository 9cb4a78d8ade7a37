//! PimLM Engine
//!
//! Drives a llama-style forward pass across pools of simulated compute
//! units. The [`Engine`] owns every pool, host buffer and the KV cache,
//! and exposes a single entry point, [`Engine::forward`].

mod config;
mod engine;
mod error;
mod plan;
mod reduction;
mod transpose;

pub use config::{AttentionMode, EngineConfig, PoolUnits};
pub use engine::{Engine, EngineStats};
pub use error::{EngineError, Result};
pub use plan::{PoolPlan, Programs};
pub use reduction::{Assignment, ReductionPlan};
pub use transpose::{transpose_keys, transpose_values, CacheLayout};
