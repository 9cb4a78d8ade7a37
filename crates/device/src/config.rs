//! Device configuration

use serde::{Deserialize, Serialize};

/// Shape of every simulated compute unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Cooperative tasklets per unit
    pub tasklets: usize,

    /// Fast scratch memory per unit, in bytes
    pub scratch_bytes: usize,

    /// Bulk memory per unit, in bytes
    pub bulk_bytes: usize,

    /// Allocation profile passed through to pool allocation
    pub profile: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            tasklets: 16,
            scratch_bytes: 64 * 1024,
            bulk_bytes: 64 * 1024 * 1024,
            profile: None,
        }
    }
}

impl DeviceConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(tasklets) = std::env::var("PIMLM_TASKLETS") {
            if let Ok(t) = tasklets.parse() {
                config.tasklets = t;
            }
        }

        if let Ok(bytes) = std::env::var("PIMLM_SCRATCH_BYTES") {
            if let Ok(b) = bytes.parse() {
                config.scratch_bytes = b;
            }
        }

        if let Ok(bytes) = std::env::var("PIMLM_BULK_BYTES") {
            if let Ok(b) = bytes.parse() {
                config.bulk_bytes = b;
            }
        }

        if let Ok(profile) = std::env::var("PIMLM_PROFILE") {
            if !profile.is_empty() {
                config.profile = Some(profile);
            }
        }

        config
    }

    /// Scratch budget in 32-bit words
    pub fn scratch_words(&self) -> usize {
        self.scratch_bytes / 4
    }

    /// Bulk capacity in 32-bit words
    pub fn bulk_words(&self) -> usize {
        self.bulk_bytes / 4
    }
}
