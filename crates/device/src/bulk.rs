//! Word-addressed bulk memory
//!
//! Bulk memory is a flat array of 32-bit words. A program declares named
//! symbols with word capacities and [`BulkMemory::layout`] places them at
//! 8-byte aligned offsets. Every access names a symbol and is bounds-checked
//! against that symbol's region, never against the whole memory.
//!
//! Words are stored as atomics so tasklets can read, write and accumulate
//! concurrently through a shared reference. Plain reads and writes are
//! relaxed; ordering between tasklets comes from barriers, and ordering
//! between host and tasklets from launch join.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{DeviceError, Result};

/// Region alignment in words (8 bytes)
pub const REGION_ALIGN_WORDS: usize = 2;

/// A value that travels through bulk memory as one 32-bit word
pub trait Word: Copy + Send + Sync + 'static {
    fn to_word(self) -> u32;
    fn from_word(word: u32) -> Self;
}

impl Word for f32 {
    fn to_word(self) -> u32 {
        self.to_bits()
    }

    fn from_word(word: u32) -> Self {
        f32::from_bits(word)
    }
}

impl Word for u32 {
    fn to_word(self) -> u32 {
        self
    }

    fn from_word(word: u32) -> Self {
        word
    }
}

impl Word for i32 {
    fn to_word(self) -> u32 {
        self as u32
    }

    fn from_word(word: u32) -> Self {
        word as i32
    }
}

/// A symbol a program expects in bulk memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolDecl {
    pub name: &'static str,
    pub words: usize,
}

impl SymbolDecl {
    pub const fn new(name: &'static str, words: usize) -> Self {
        Self { name, words }
    }
}

/// Words a symbol table occupies once laid out
pub fn layout_words(decls: &[SymbolDecl]) -> usize {
    decls
        .iter()
        .map(|d| d.words.div_ceil(REGION_ALIGN_WORDS) * REGION_ALIGN_WORDS)
        .sum()
}

/// Placement of one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

/// Bulk memory of one compute unit
#[derive(Debug)]
pub struct BulkMemory {
    capacity: usize,
    words: Vec<AtomicU32>,
    symbols: HashMap<&'static str, Region>,
}

impl BulkMemory {
    /// Empty memory with a capacity in words
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            words: Vec::new(),
            symbols: HashMap::new(),
        }
    }

    /// Lay out a program's symbols, discarding previous contents
    pub fn layout(&mut self, program: &str, decls: &[SymbolDecl]) -> Result<()> {
        let mut symbols = HashMap::with_capacity(decls.len());
        let mut cursor = 0usize;
        for decl in decls {
            let region = Region {
                offset: cursor,
                len: decl.words,
            };
            cursor += decl.words.div_ceil(REGION_ALIGN_WORDS) * REGION_ALIGN_WORDS;
            symbols.insert(decl.name, region);
        }

        debug_assert_eq!(cursor, layout_words(decls));
        if cursor > self.capacity {
            return Err(DeviceError::BulkExhausted {
                program: program.to_string(),
                required: cursor,
                capacity: self.capacity,
            });
        }

        self.words = (0..cursor).map(|_| AtomicU32::new(0)).collect();
        self.symbols = symbols;
        Ok(())
    }

    /// Capacity in words
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Words currently laid out
    pub fn used(&self) -> usize {
        self.words.len()
    }

    /// Region of a symbol
    pub fn region(&self, symbol: &str) -> Result<Region> {
        self.symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| DeviceError::UnknownSymbol(symbol.to_string()))
    }

    fn span(&self, symbol: &str, offset: usize, len: usize) -> Result<&[AtomicU32]> {
        let region = self.region(symbol)?;
        let end = offset + len;
        if end > region.len {
            return Err(DeviceError::OutOfBounds {
                symbol: symbol.to_string(),
                offset,
                end,
                len: region.len,
            });
        }
        let start = region.offset + offset;
        Ok(&self.words[start..start + len])
    }

    /// Copy `out.len()` words starting at `offset` into `out`
    pub fn read<W: Word>(&self, symbol: &str, offset: usize, out: &mut [W]) -> Result<()> {
        let span = self.span(symbol, offset, out.len())?;
        for (dst, src) in out.iter_mut().zip(span) {
            *dst = W::from_word(src.load(Ordering::Relaxed));
        }
        Ok(())
    }

    /// Copy `data` into the symbol starting at `offset`
    pub fn write<W: Word>(&self, symbol: &str, offset: usize, data: &[W]) -> Result<()> {
        let span = self.span(symbol, offset, data.len())?;
        for (dst, &src) in span.iter().zip(data) {
            dst.store(src.to_word(), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Set `len` words starting at `offset` to zero
    pub fn zero(&self, symbol: &str, offset: usize, len: usize) -> Result<()> {
        for word in self.span(symbol, offset, len)? {
            word.store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Atomically add `value` to the f32 at `index`, returning the previous value
    pub fn atomic_add_f32(&self, symbol: &str, index: usize, value: f32) -> Result<f32> {
        let cell = &self.span(symbol, index, 1)?[0];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(previous) => return Ok(f32::from_bits(previous)),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> BulkMemory {
        let mut bulk = BulkMemory::new(64);
        bulk.layout(
            "test",
            &[SymbolDecl::new("a", 3), SymbolDecl::new("b", 4)],
        )
        .unwrap();
        bulk
    }

    #[test]
    fn test_layout_alignment() {
        let bulk = memory();
        assert_eq!(bulk.region("a").unwrap(), Region { offset: 0, len: 3 });
        assert_eq!(bulk.region("b").unwrap(), Region { offset: 4, len: 4 });
        assert_eq!(bulk.used(), 8);
    }

    #[test]
    fn test_layout_exceeds_capacity() {
        let mut bulk = BulkMemory::new(4);
        let err = bulk.layout("big", &[SymbolDecl::new("w", 5)]).unwrap_err();
        assert!(matches!(err, DeviceError::BulkExhausted { required: 6, .. }));
    }

    #[test]
    fn test_read_write_words() {
        let bulk = memory();
        bulk.write("b", 1, &[1.5f32, -2.0]).unwrap();
        bulk.write("a", 0, &[7u32]).unwrap();

        let mut out = [0.0f32; 4];
        bulk.read("b", 0, &mut out).unwrap();
        assert_eq!(out, [0.0, 1.5, -2.0, 0.0]);

        let mut word = [0u32; 1];
        bulk.read("a", 0, &mut word).unwrap();
        assert_eq!(word[0], 7);
    }

    #[test]
    fn test_bounds_are_per_symbol() {
        let bulk = memory();
        let err = bulk.write("a", 2, &[1.0f32, 2.0]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { end: 4, len: 3, .. }));
        assert!(matches!(
            bulk.read("missing", 0, &mut [0u32; 1]),
            Err(DeviceError::UnknownSymbol(_))
        ));
    }

    #[test]
    fn test_atomic_add() {
        let bulk = memory();
        bulk.write("a", 1, &[2.0f32]).unwrap();
        let previous = bulk.atomic_add_f32("a", 1, 0.5).unwrap();
        assert_eq!(previous, 2.0);

        let mut out = [0.0f32];
        bulk.read("a", 1, &mut out).unwrap();
        assert_eq!(out[0], 2.5);
    }

    #[test]
    fn test_relayout_clears_contents() {
        let mut bulk = memory();
        bulk.write("a", 0, &[3.0f32]).unwrap();
        bulk.layout("again", &[SymbolDecl::new("a", 3)]).unwrap();

        let mut out = [1.0f32];
        bulk.read("a", 0, &mut out).unwrap();
        assert_eq!(out[0], 0.0);
        assert!(bulk.region("b").is_err());
    }
}
