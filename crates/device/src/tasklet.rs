//! Execution context handed to each tasklet

use crate::barrier::Barrier;
use crate::bulk::{BulkMemory, Word};
use crate::error::{DeviceError, Result};
use crate::scratch::{ScratchArena, ScratchBuf};

/// Symbol holding per-launch scalar parameters
pub const PARAMS: &str = "params";

/// One tasklet's view of its unit
pub struct Tasklet<'a> {
    id: usize,
    count: usize,
    unit: usize,
    bulk: &'a BulkMemory,
    scratch: &'a ScratchArena,
    barriers: &'a [Barrier],
}

impl<'a> Tasklet<'a> {
    pub fn new(
        id: usize,
        count: usize,
        unit: usize,
        bulk: &'a BulkMemory,
        scratch: &'a ScratchArena,
        barriers: &'a [Barrier],
    ) -> Self {
        Self {
            id,
            count,
            unit,
            bulk,
            scratch,
            barriers,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Tasklets running this launch on the unit
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    pub fn bulk(&self) -> &BulkMemory {
        self.bulk
    }

    /// Bulk to scratch
    pub fn read<W: Word>(&self, symbol: &str, offset: usize, out: &mut [W]) -> Result<()> {
        self.bulk.read(symbol, offset, out)
    }

    /// Scratch to bulk
    pub fn write<W: Word>(&self, symbol: &str, offset: usize, data: &[W]) -> Result<()> {
        self.bulk.write(symbol, offset, data)
    }

    pub fn atomic_add(&self, symbol: &str, index: usize, value: f32) -> Result<()> {
        self.bulk.atomic_add_f32(symbol, index, value).map(|_| ())
    }

    /// Read word `index` of the `params` symbol
    pub fn param(&self, index: usize) -> Result<usize> {
        let mut word = [0u32];
        self.bulk.read(PARAMS, index, &mut word)?;
        Ok(word[0] as usize)
    }

    pub fn alloc(&self, words: usize) -> Result<ScratchBuf> {
        self.scratch.alloc(words)
    }

    /// Release the unit's scratch; callers must ensure no sibling is
    /// allocating, typically by holding every other tasklet at a barrier
    pub fn reset_scratch(&self) {
        self.scratch.reset();
    }

    pub fn barrier(&self, index: usize) -> Result<()> {
        let barrier = self.barriers.get(index).ok_or_else(|| {
            DeviceError::InvalidParameter(format!(
                "barrier {} not declared ({} available)",
                index,
                self.barriers.len()
            ))
        })?;
        barrier.wait()
    }
}
