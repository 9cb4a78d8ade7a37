//! PimLM Device
//!
//! A software model of processing-in-memory compute units. Each unit owns a
//! large word-addressed bulk memory and a small scratch arena, and runs a
//! fixed number of cooperative tasklets that synchronize only through
//! barriers and atomic accumulation into bulk memory.
//!
//! The host talks to units through a [`UnitPool`] using four primitives:
//! broadcast, scatter, gather and a synchronous launch.

mod barrier;
mod bulk;
mod config;
mod error;
pub mod kernels;
pub mod math;
pub mod partition;
mod pool;
mod program;
mod scratch;
mod tasklet;
mod unit;

pub use barrier::Barrier;
pub use bulk::{layout_words, BulkMemory, Region, SymbolDecl, Word, REGION_ALIGN_WORDS};
pub use config::DeviceConfig;
pub use error::{DeviceError, Result};
pub use pool::{LaunchReport, UnitPool};
pub use program::{Kernel, ProgramRegistry};
pub use scratch::{ScratchArena, ScratchBuf, ScratchScope};
pub use tasklet::{Tasklet, PARAMS};
pub use unit::ComputeUnit;
