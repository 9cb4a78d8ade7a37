//! A single compute unit and its tasklet launcher

use crate::barrier::Barrier;
use crate::bulk::BulkMemory;
use crate::error::{DeviceError, Result};
use crate::program::Kernel;
use crate::scratch::ScratchArena;
use crate::tasklet::Tasklet;

/// Bulk memory plus scratch, executing one program at a time
#[derive(Debug)]
pub struct ComputeUnit {
    index: usize,
    bulk: BulkMemory,
    scratch: ScratchArena,
}

/// Poisons the unit's barriers unless the tasklet finished cleanly
struct PoisonGuard<'a> {
    barriers: &'a [Barrier],
    armed: bool,
}

impl Drop for PoisonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            for barrier in self.barriers {
                barrier.poison();
            }
        }
    }
}

impl ComputeUnit {
    pub fn new(index: usize, bulk_words: usize, scratch_words: usize) -> Self {
        Self {
            index,
            bulk: BulkMemory::new(bulk_words),
            scratch: ScratchArena::new(scratch_words),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bulk(&self) -> &BulkMemory {
        &self.bulk
    }

    pub fn bulk_mut(&mut self) -> &mut BulkMemory {
        &mut self.bulk
    }

    pub fn scratch(&self) -> &ScratchArena {
        &self.scratch
    }

    /// Run `kernel` on `tasklets` threads and wait for all of them
    ///
    /// When tasklets fail, the first failure that is not a barrier poison
    /// is reported, since poison errors only echo a sibling's failure.
    pub fn run(&self, kernel: &dyn Kernel, tasklets: usize) -> Result<()> {
        let tasklets = tasklets.max(1);
        let barriers: Vec<Barrier> = (0..kernel.barriers())
            .map(|id| Barrier::new(id, tasklets))
            .collect();
        let _scope = self.scratch.scope();

        let outcomes: Vec<Result<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..tasklets)
                .map(|id| {
                    let barriers = &barriers;
                    s.spawn(move || {
                        let mut guard = PoisonGuard {
                            barriers,
                            armed: true,
                        };
                        let tasklet = Tasklet::new(
                            id,
                            tasklets,
                            self.index,
                            &self.bulk,
                            &self.scratch,
                            barriers,
                        );
                        let result = kernel.run(&tasklet);
                        guard.armed = result.is_err();
                        result
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .map(|(id, handle)| match handle.join() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(DeviceError::TaskletFailed {
                        unit: self.index,
                        tasklet: id,
                        source: Box::new(err),
                    }),
                    Err(_) => Err(DeviceError::TaskletPanicked {
                        unit: self.index,
                        tasklet: id,
                    }),
                })
                .collect()
        });

        let mut first_poison = None;
        for outcome in outcomes {
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_poison() => {
                    first_poison.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        match first_poison {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
