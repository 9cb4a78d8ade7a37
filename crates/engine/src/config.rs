//! Engine configuration

use std::fmt;
use std::str::FromStr;

use pimlm_device::DeviceConfig;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Which attention kernel the head pool runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttentionMode {
    /// Bounded when its working set fits in scratch, streaming otherwise
    #[default]
    Auto,
    Bounded,
    Streaming,
}

impl FromStr for AttentionMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AttentionMode::Auto),
            "bounded" => Ok(AttentionMode::Bounded),
            "streaming" | "big" => Ok(AttentionMode::Streaming),
            other => Err(EngineError::Config(format!(
                "unknown attention mode '{}' (expected auto, bounded or streaming)",
                other
            ))),
        }
    }
}

impl fmt::Display for AttentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttentionMode::Auto => "auto",
            AttentionMode::Bounded => "bounded",
            AttentionMode::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Unit-count overrides; `None` uses the size derived from the model
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUnits {
    /// Pool shared by QKV, attention output and FFN down projection
    pub shared: Option<usize>,
    pub ffn1: Option<usize>,
    pub cls: Option<usize>,
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub device: DeviceConfig,

    /// Streaming segment for matrix-vector kernels, in words
    pub segment_words: usize,

    /// Streaming attention: head-dimension segment for scores
    pub score_segment: usize,

    /// Streaming attention: output dimensions per pass
    pub output_segment: usize,

    /// Streaming attention: time steps per pass
    pub value_segment: usize,

    pub attention: AttentionMode,

    pub units: PoolUnits,

    /// Units cooperating on one row band of AttnOut/FFN2, each taking a
    /// slice of the input dimension; their partial sums meet on the host
    pub reduction_splits: usize,

    /// Vocabulary rows per tasklet when sizing the classifier pool
    pub cls_rows_per_tasklet: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            segment_words: 256,
            score_segment: 128,
            output_segment: 64,
            value_segment: 64,
            attention: AttentionMode::Auto,
            units: PoolUnits::default(),
            reduction_splits: 1,
            cls_rows_per_tasklet: 100,
        }
    }
}

impl EngineConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self {
            device: DeviceConfig::from_env(),
            ..Self::default()
        };

        if let Ok(words) = std::env::var("PIMLM_SEGMENT_WORDS") {
            if let Ok(w) = words.parse() {
                config.segment_words = w;
            }
        }

        if let Ok(mode) = std::env::var("PIMLM_ATTENTION") {
            match mode.parse() {
                Ok(m) => config.attention = m,
                Err(e) => tracing::warn!("ignoring PIMLM_ATTENTION: {}", e),
            }
        }

        if let Ok(splits) = std::env::var("PIMLM_REDUCTION_SPLITS") {
            if let Ok(s) = splits.parse() {
                config.reduction_splits = s;
            }
        }

        config
    }

    /// Reject values no pool layout can satisfy
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("tasklets", self.device.tasklets),
            ("scratch_bytes", self.device.scratch_bytes),
            ("bulk_bytes", self.device.bulk_bytes),
            ("segment_words", self.segment_words),
            ("score_segment", self.score_segment),
            ("output_segment", self.output_segment),
            ("value_segment", self.value_segment),
            ("reduction_splits", self.reduction_splits),
            ("cls_rows_per_tasklet", self.cls_rows_per_tasklet),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must be non-zero", name)));
            }
        }
        for (name, value) in [
            ("shared", self.units.shared),
            ("ffn1", self.units.ffn1),
            ("cls", self.units.cls),
        ] {
            if value == Some(0) {
                return Err(EngineError::Config(format!(
                    "{} pool override must be non-zero",
                    name
                )));
            }
        }
        Ok(())
    }
}
