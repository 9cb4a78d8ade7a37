//! Kernel programs and the registry used to load them by name

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::bulk::SymbolDecl;
use crate::error::{DeviceError, Result};
use crate::tasklet::Tasklet;

/// A program image runnable on a compute unit
///
/// Every tasklet of a unit calls [`Kernel::run`] concurrently with its own
/// [`Tasklet`] context.
pub trait Kernel: Send + Sync {
    /// Name used to load the program
    fn name(&self) -> &'static str;

    /// Bulk symbols the program reads and writes
    fn symbols(&self) -> Vec<SymbolDecl>;

    /// Number of barriers the program waits on
    fn barriers(&self) -> usize {
        0
    }

    /// Peak scratch words used by `tasklets` tasklets together
    fn scratch_words(&self, tasklets: usize) -> usize;

    fn run(&self, tasklet: &Tasklet<'_>) -> Result<()>;
}

impl fmt::Debug for dyn Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name()).finish()
    }
}

/// Named program images available to pools
#[derive(Default)]
pub struct ProgramRegistry {
    programs: HashMap<&'static str, Arc<dyn Kernel>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a program, replacing any previous one with the same name
    pub fn register(&mut self, kernel: Arc<dyn Kernel>) {
        self.programs.insert(kernel.name(), kernel);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Kernel>> {
        self.programs
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownProgram(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Kernel>> {
        self.programs.values()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}
