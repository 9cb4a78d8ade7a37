//! Per-unit scratch arena
//!
//! A bump allocator over a fixed word budget. Allocations are never freed
//! individually; the whole arena is reset between kernel phases and on
//! every launch boundary. Buffers are handed out as owned vectors, so a
//! reset only releases budget and never invalidates memory a tasklet holds.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{DeviceError, Result};

/// Fast memory budget shared by all tasklets of one unit
#[derive(Debug)]
pub struct ScratchArena {
    budget: usize,
    used: AtomicUsize,
    high_water: AtomicUsize,
}

impl ScratchArena {
    pub fn new(budget_words: usize) -> Self {
        Self {
            budget: budget_words,
            used: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
        }
    }

    /// Allocate a zeroed buffer of `words` f32 values
    pub fn alloc(&self, words: usize) -> Result<ScratchBuf> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            let next = used + words;
            if next > self.budget {
                return Err(DeviceError::ScratchExhausted {
                    requested: words,
                    used,
                    budget: self.budget,
                });
            }
            match self
                .used
                .compare_exchange_weak(used, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.high_water.fetch_max(next, Ordering::Relaxed);
                    return Ok(ScratchBuf {
                        data: vec![0.0; words],
                    });
                }
                Err(actual) => used = actual,
            }
        }
    }

    /// Release every allocation
    pub fn reset(&self) {
        self.used.store(0, Ordering::Release);
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Peak usage since creation
    pub fn high_water(&self) -> usize {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Scoped reset: clears the arena now and again when the scope ends
    pub fn scope(&self) -> ScratchScope<'_> {
        self.reset();
        ScratchScope { arena: self }
    }
}

/// Guard that resets its arena on drop, including on early return or panic
#[derive(Debug)]
pub struct ScratchScope<'a> {
    arena: &'a ScratchArena,
}

impl Drop for ScratchScope<'_> {
    fn drop(&mut self) {
        self.arena.reset();
    }
}

/// A buffer carved from the scratch budget
#[derive(Debug)]
pub struct ScratchBuf {
    data: Vec<f32>,
}

impl Deref for ScratchBuf {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl DerefMut for ScratchBuf {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_enforced() {
        let arena = ScratchArena::new(10);
        let a = arena.alloc(6).unwrap();
        assert_eq!(a.len(), 6);
        let err = arena.alloc(5).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::ScratchExhausted {
                requested: 5,
                used: 6,
                budget: 10
            }
        ));
        arena.alloc(4).unwrap();
        assert_eq!(arena.used(), 10);
    }

    #[test]
    fn test_scope_resets_on_exit() {
        let arena = ScratchArena::new(8);
        arena.alloc(3).unwrap();
        {
            let _scope = arena.scope();
            assert_eq!(arena.used(), 0);
            arena.alloc(8).unwrap();
        }
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.high_water(), 8);
    }

    #[test]
    fn test_scope_resets_on_error_path() {
        fn failing(arena: &ScratchArena) -> Result<()> {
            let _scope = arena.scope();
            arena.alloc(4)?;
            arena.alloc(100)?;
            Ok(())
        }

        let arena = ScratchArena::new(8);
        assert!(failing(&arena).is_err());
        assert_eq!(arena.used(), 0);
    }
}
