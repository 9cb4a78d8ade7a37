//! Pool sizing and program construction
//!
//! Pools are sized from the model shape and the tasklet count:
//!
//! | Pool | Programs | Units |
//! |------|----------|-------|
//! | rmsnorm | rmsnorm | 1 |
//! | shared | qkv, attout, ffn2 | `ceil(dim / 2T)` |
//! | heads | mha or mha_streaming | `n_heads` |
//! | ffn1 | ffn1 | `ceil(hidden_dim / 4T)` |
//! | cls | cls | `ceil(vocab / (T · rows_per_tasklet))` |
//!
//! Every program is checked against the unit's scratch budget and bulk
//! capacity here, before any pool exists.

use std::ops::Range;
use std::sync::Arc;

use pimlm_device::kernels::{
    names, AttnOutKernel, ClassifierKernel, Ffn1Kernel, Ffn2Kernel, MhaKernel, MhaStreamingKernel,
    QkvKernel, RmsNormKernel,
};
use pimlm_device::partition::{chunk_range, pair_range};
use pimlm_device::{layout_words, Kernel, ProgramRegistry};
use pimlm_model::ModelConfig;

use crate::config::{AttentionMode, EngineConfig};
use crate::error::{EngineError, Result};
use crate::reduction::ReductionPlan;

/// Unit counts and row assignments for every pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    pub tasklets: usize,
    pub shared_units: usize,
    /// QKV output rows per shared unit, whole RoPE pairs
    pub qkv_bands: Vec<Range<usize>>,
    /// One unit per query head
    pub heads: usize,
    pub ffn1_bands: Vec<Range<usize>>,
    pub cls_bands: Vec<Range<usize>>,
    pub attn_out: ReductionPlan,
    pub ffn2: ReductionPlan,
}

fn bands(rows: usize, units: usize, pairs: bool) -> Vec<Range<usize>> {
    (0..units)
        .map(|u| {
            if pairs {
                pair_range(rows, units, u)
            } else {
                chunk_range(rows, units, u)
            }
        })
        .collect()
}

fn widest(bands: &[Range<usize>]) -> usize {
    bands.iter().map(|b| b.len()).max().unwrap_or(0)
}

impl PoolPlan {
    pub fn new(model: &ModelConfig, config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let t = config.device.tasklets;

        let shared_units = config
            .units
            .shared
            .unwrap_or_else(|| model.dim.div_ceil(2 * t));
        let ffn1_units = config
            .units
            .ffn1
            .unwrap_or_else(|| model.hidden_dim.div_ceil(4 * t));
        let cls_units = config
            .units
            .cls
            .unwrap_or_else(|| model.vocab_size.div_ceil(t * config.cls_rows_per_tasklet));

        Ok(Self {
            tasklets: t,
            shared_units,
            qkv_bands: bands(model.dim, shared_units, true),
            heads: model.n_heads,
            ffn1_bands: bands(model.hidden_dim, ffn1_units, false),
            cls_bands: bands(model.vocab_size, cls_units, false),
            attn_out: ReductionPlan::new(model.dim, model.dim, shared_units, config.reduction_splits)?,
            ffn2: ReductionPlan::new(
                model.dim,
                model.hidden_dim,
                shared_units,
                config.reduction_splits,
            )?,
        })
    }

    pub fn ffn1_units(&self) -> usize {
        self.ffn1_bands.len()
    }

    pub fn cls_units(&self) -> usize {
        self.cls_bands.len()
    }
}

/// Program images for one model shape
pub struct Programs {
    pub registry: ProgramRegistry,
    /// Attention program the head pool runs
    pub attention: &'static str,
}

impl Programs {
    /// Build, check and register every program the pipeline runs
    pub fn build(model: &ModelConfig, config: &EngineConfig, plan: &PoolPlan) -> Result<Self> {
        let seg = config.segment_words;
        let hs = model.head_size();

        let kernels: Vec<Arc<dyn Kernel>> = vec![
            Arc::new(RmsNormKernel {
                dim: model.dim,
                segment_words: seg,
            }),
            Arc::new(QkvKernel {
                dim: model.dim,
                max_rows: widest(&plan.qkv_bands),
                head_size: hs,
                segment_words: seg,
            }),
            Arc::new(AttnOutKernel {
                max_cols: plan.attn_out.max_cols(),
                max_rows: plan.attn_out.max_rows(),
                segment_words: seg,
            }),
            Arc::new(Ffn1Kernel {
                dim: model.dim,
                max_rows: widest(&plan.ffn1_bands),
                segment_words: seg,
            }),
            Arc::new(Ffn2Kernel {
                max_cols: plan.ffn2.max_cols(),
                max_rows: plan.ffn2.max_rows(),
                segment_words: seg,
            }),
            Arc::new(ClassifierKernel {
                dim: model.dim,
                max_rows: widest(&plan.cls_bands),
                segment_words: seg,
            }),
        ];

        let mut registry = ProgramRegistry::new();
        for kernel in kernels {
            check_fits(kernel.as_ref(), config)?;
            registry.register(kernel);
        }

        let bounded: Arc<dyn Kernel> = Arc::new(MhaKernel {
            head_size: hs,
            seq_len: model.seq_len,
        });
        let streaming: Arc<dyn Kernel> = Arc::new(MhaStreamingKernel {
            head_size: hs,
            seq_len: model.seq_len,
            score_segment: config.score_segment,
            output_segment: config.output_segment,
            value_segment: config.value_segment,
        });
        let attention = match config.attention {
            AttentionMode::Bounded => bounded,
            AttentionMode::Streaming => streaming,
            AttentionMode::Auto => {
                if check_fits(bounded.as_ref(), config).is_ok() {
                    bounded
                } else {
                    streaming
                }
            }
        };
        check_fits(attention.as_ref(), config)?;
        let name = attention.name();
        registry.register(attention);

        tracing::debug!(
            programs = registry.len(),
            attention = name,
            "programs built"
        );

        Ok(Self {
            registry,
            attention: name,
        })
    }

    pub fn uses_streaming_attention(&self) -> bool {
        self.attention == names::MHA_STREAMING
    }
}

/// Scratch and bulk requirements of `kernel` against one unit
fn check_fits(kernel: &dyn Kernel, config: &EngineConfig) -> Result<()> {
    let t = config.device.tasklets;
    let scratch = kernel.scratch_words(t);
    let budget = config.device.scratch_words();
    if scratch > budget {
        return Err(EngineError::Config(format!(
            "program '{}' needs {} scratch words with {} tasklets, budget is {}",
            kernel.name(),
            scratch,
            t,
            budget
        )));
    }

    let bulk = layout_words(&kernel.symbols());
    let capacity = config.device.bulk_words();
    if bulk > capacity {
        return Err(EngineError::Config(format!(
            "program '{}' needs {} bulk words per unit, capacity is {}",
            kernel.name(),
            bulk,
            capacity
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_sizes() {
        // stories15M shape with 16 tasklets
        let model = ModelConfig::default();
        let plan = PoolPlan::new(&model, &EngineConfig::default()).unwrap();
        assert_eq!(plan.shared_units, 9);
        assert_eq!(plan.heads, 6);
        assert_eq!(plan.ffn1_units(), 12);
        assert_eq!(plan.cls_units(), 20);
        assert!(plan.qkv_bands.iter().all(|b| b.start % 2 == 0 && b.len() % 2 == 0));
        assert_eq!(plan.qkv_bands.iter().map(|b| b.len()).sum::<usize>(), 288);
    }

    #[test]
    fn test_bounded_attention_chosen_when_it_fits() {
        let model = ModelConfig::default();
        let config = EngineConfig::default();
        let plan = PoolPlan::new(&model, &config).unwrap();
        let programs = Programs::build(&model, &config, &plan).unwrap();
        assert_eq!(programs.attention, names::MHA);
        assert_eq!(programs.registry.len(), 7);
    }

    #[test]
    fn test_streaming_attention_when_scratch_is_tight() {
        let model = ModelConfig {
            seq_len: 1024,
            ..ModelConfig::default()
        };
        let mut config = EngineConfig::default();
        let plan = PoolPlan::new(&model, &config).unwrap();
        let programs = Programs::build(&model, &config, &plan).unwrap();
        assert!(programs.uses_streaming_attention());

        config.attention = AttentionMode::Bounded;
        assert!(matches!(
            Programs::build(&model, &config, &plan),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_bulk_capacity_checked() {
        let model = ModelConfig::default();
        let mut config = EngineConfig::default();
        config.device.bulk_bytes = 1024;
        let plan = PoolPlan::new(&model, &config).unwrap();
        assert!(matches!(
            Programs::build(&model, &config, &plan),
            Err(EngineError::Config(_))
        ));
    }
}
