//! Engine error types

use pimlm_device::DeviceError;
use pimlm_model::ModelError;
use thiserror::Error;

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Engine configuration error: {0}")]
    Config(String),

    #[error("Position out of order: expected {expected} (or 0 to restart), got {got}")]
    PositionOutOfOrder { expected: usize, got: usize },
}
