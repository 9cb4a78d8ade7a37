//! Reusable in-unit barrier
//!
//! A generation-counted rendezvous for a fixed number of tasklets. When a
//! tasklet fails it poisons every barrier of its unit so siblings parked in
//! [`Barrier::wait`] return an error instead of waiting forever.

use parking_lot::{Condvar, Mutex};

use crate::error::{DeviceError, Result};

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    poisoned: bool,
}

/// Rendezvous point for `parties` tasklets
#[derive(Debug)]
pub struct Barrier {
    id: usize,
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl Barrier {
    pub fn new(id: usize, parties: usize) -> Self {
        Self {
            id,
            parties: parties.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                poisoned: false,
            }),
            cvar: Condvar::new(),
        }
    }

    /// Block until all parties arrive
    ///
    /// Everything a tasklet wrote before `wait` is visible to every tasklet
    /// after `wait` returns.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.poisoned {
            return Err(DeviceError::BarrierPoisoned(self.id));
        }

        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.poisoned {
            self.cvar.wait(&mut state);
        }
        if state.generation == generation {
            return Err(DeviceError::BarrierPoisoned(self.id));
        }
        Ok(())
    }

    /// Wake all waiters with an error; later waits fail immediately
    pub fn poison(&self) {
        let mut state = self.state.lock();
        state.poisoned = true;
        self.cvar.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.state.lock().poisoned
    }
}
