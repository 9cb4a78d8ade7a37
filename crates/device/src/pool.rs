//! Pools of homogeneous compute units
//!
//! The host moves data with four primitives: [`UnitPool::broadcast`] (same
//! data to every unit), [`UnitPool::scatter`] (distinct data per unit),
//! [`UnitPool::gather`] (read back per unit) and [`UnitPool::launch`]
//! (run the loaded program everywhere and block until all units finish).

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::bulk::Word;
use crate::config::DeviceConfig;
use crate::error::{DeviceError, Result};
use crate::program::{Kernel, ProgramRegistry};
use crate::unit::ComputeUnit;

/// Outcome of one launch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchReport {
    pub units: usize,
    pub tasklets: usize,
    /// Largest scratch high-water mark across units
    pub scratch_high_water: usize,
    pub elapsed_ms: f64,
}

/// A fixed group of units sharing one program image
#[derive(Debug)]
pub struct UnitPool {
    name: String,
    tasklets: usize,
    units: Vec<ComputeUnit>,
    program: Option<Arc<dyn Kernel>>,
    loads: usize,
    launches: usize,
}

impl UnitPool {
    /// Allocate `count` units shaped by `config`
    pub fn allocate(name: impl Into<String>, count: usize, config: &DeviceConfig) -> Result<Self> {
        let name = name.into();
        if count == 0 {
            return Err(DeviceError::Allocation(format!(
                "pool '{}' requested zero units",
                name
            )));
        }
        if config.tasklets == 0 {
            return Err(DeviceError::Allocation(format!(
                "pool '{}' configured with zero tasklets",
                name
            )));
        }

        let units = (0..count)
            .map(|i| ComputeUnit::new(i, config.bulk_words(), config.scratch_words()))
            .collect();

        tracing::info!(
            pool = %name,
            units = count,
            tasklets = config.tasklets,
            scratch_bytes = config.scratch_bytes,
            profile = config.profile.as_deref().unwrap_or("default"),
            "allocated unit pool"
        );

        Ok(Self {
            name,
            tasklets: config.tasklets,
            units,
            program: None,
            loads: 0,
            launches: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn tasklets(&self) -> usize {
        self.tasklets
    }

    pub fn units(&self) -> &[ComputeUnit] {
        &self.units
    }

    /// Name of the loaded program, if any
    pub fn program(&self) -> Option<&'static str> {
        self.program.as_ref().map(|p| p.name())
    }

    /// Number of program loads performed
    pub fn loads(&self) -> usize {
        self.loads
    }

    pub fn launches(&self) -> usize {
        self.launches
    }

    /// Load a program into every unit, laying out its symbols
    ///
    /// Loading discards all bulk contents, including when the same program
    /// is loaded again.
    pub fn load(&mut self, kernel: Arc<dyn Kernel>) -> Result<()> {
        let symbols = kernel.symbols();
        for unit in &mut self.units {
            unit.bulk_mut().layout(kernel.name(), &symbols)?;
        }
        tracing::debug!(
            pool = %self.name,
            program = kernel.name(),
            words = self.units[0].bulk().used(),
            "loaded program"
        );
        self.program = Some(kernel);
        self.loads += 1;
        Ok(())
    }

    /// Load a registered program by name
    pub fn load_named(&mut self, registry: &ProgramRegistry, name: &str) -> Result<()> {
        let kernel = registry.get(name)?;
        self.load(kernel)
    }

    /// Load `name` unless it is already the current program
    ///
    /// Returns whether a load happened.
    pub fn ensure_loaded(&mut self, registry: &ProgramRegistry, name: &str) -> Result<bool> {
        if self.program() == Some(name) {
            return Ok(false);
        }
        self.load_named(registry, name)?;
        Ok(true)
    }

    /// Write the same data to every unit
    pub fn broadcast<W: Word>(&self, symbol: &str, offset: usize, data: &[W]) -> Result<()> {
        tracing::trace!(pool = %self.name, symbol, words = data.len(), "broadcast");
        for unit in &self.units {
            unit.bulk().write(symbol, offset, data)?;
        }
        Ok(())
    }

    /// Write `parts[i]` to unit `i`
    pub fn scatter<W: Word, D: AsRef<[W]>>(
        &self,
        symbol: &str,
        offset: usize,
        parts: &[D],
    ) -> Result<()> {
        if parts.len() != self.units.len() {
            return Err(DeviceError::TransferSizeMismatch {
                expected: self.units.len(),
                got: parts.len(),
            });
        }
        tracing::trace!(pool = %self.name, symbol, units = parts.len(), "scatter");
        for (unit, part) in self.units.iter().zip(parts) {
            unit.bulk().write(symbol, offset, part.as_ref())?;
        }
        Ok(())
    }

    /// Read `lens[i]` words from unit `i`
    pub fn gather<W: Word + Default>(
        &self,
        symbol: &str,
        offset: usize,
        lens: &[usize],
    ) -> Result<Vec<Vec<W>>> {
        if lens.len() != self.units.len() {
            return Err(DeviceError::TransferSizeMismatch {
                expected: self.units.len(),
                got: lens.len(),
            });
        }
        tracing::trace!(pool = %self.name, symbol, units = lens.len(), "gather");
        self.units
            .iter()
            .zip(lens)
            .map(|(unit, &len)| {
                let mut out = vec![W::default(); len];
                unit.bulk().read(symbol, offset, &mut out)?;
                Ok(out)
            })
            .collect()
    }

    /// Run the loaded program on every unit and block until all finish
    ///
    /// Units run in parallel; the first failing unit's error is returned.
    pub fn launch(&mut self) -> Result<LaunchReport> {
        let kernel = self
            .program
            .clone()
            .ok_or_else(|| DeviceError::NoProgramLoaded(self.name.clone()))?;
        let tasklets = self.tasklets;
        let start = Instant::now();

        self.units
            .par_iter()
            .map(|unit| unit.run(kernel.as_ref(), tasklets))
            .collect::<Result<Vec<()>>>()?;

        self.launches += 1;
        let report = LaunchReport {
            units: self.units.len(),
            tasklets,
            scratch_high_water: self
                .units
                .iter()
                .map(|u| u.scratch().high_water())
                .max()
                .unwrap_or(0),
            elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        };
        tracing::debug!(
            pool = %self.name,
            program = kernel.name(),
            units = report.units,
            elapsed_ms = report.elapsed_ms,
            "launch complete"
        );
        Ok(report)
    }
}
