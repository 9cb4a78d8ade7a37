//! Device error types

use thiserror::Error;

/// Device result type
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised at the host/unit boundary or inside a kernel
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Access out of bounds: symbol '{symbol}' holds {len} words, access {offset}..{end}")]
    OutOfBounds {
        symbol: String,
        offset: usize,
        end: usize,
        len: usize,
    },

    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Bulk memory exhausted loading '{program}': need {required} words, capacity {capacity}")]
    BulkExhausted {
        program: String,
        required: usize,
        capacity: usize,
    },

    #[error("Scratch exhausted: requested {requested} words with {used} of {budget} in use")]
    ScratchExhausted {
        requested: usize,
        used: usize,
        budget: usize,
    },

    #[error("Unknown program: {0}")]
    UnknownProgram(String),

    #[error("No program loaded in pool '{0}'")]
    NoProgramLoaded(String),

    #[error("Transfer size mismatch: expected {expected}, got {got}")]
    TransferSizeMismatch { expected: usize, got: usize },

    #[error("Barrier {0} poisoned by a failed tasklet")]
    BarrierPoisoned(usize),

    #[error("Tasklet {tasklet} on unit {unit} failed: {source}")]
    TaskletFailed {
        unit: usize,
        tasklet: usize,
        #[source]
        source: Box<DeviceError>,
    },

    #[error("Tasklet {tasklet} on unit {unit} panicked")]
    TaskletPanicked { unit: usize, tasklet: usize },

    #[error("Unit allocation failed: {0}")]
    Allocation(String),

    #[error("Invalid kernel parameter: {0}")]
    InvalidParameter(String),
}

impl DeviceError {
    /// True for errors that only report a sibling tasklet's failure
    pub fn is_poison(&self) -> bool {
        match self {
            DeviceError::BarrierPoisoned(_) => true,
            DeviceError::TaskletFailed { source, .. } => source.is_poison(),
            _ => false,
        }
    }
}
