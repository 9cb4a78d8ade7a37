//! RMSNorm: `y = x · w / sqrt(mean(x²) + eps)`
//!
//! Every tasklet owns a slice of the vector. Partial sums of squares meet
//! in the `acc` cell, which the host zeroes before launch; the barrier
//! makes the full sum visible before any tasklet derives the scale.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::{dot_acc, rms_scale};
use crate::partition::{chunk_range, max_chunk};
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{names, segment, sym};

/// Symbols: `x[dim]`, `w[dim]`, `y[dim]`, `acc[1]`
#[derive(Debug, Clone)]
pub struct RmsNormKernel {
    pub dim: usize,
    pub segment_words: usize,
}

impl RmsNormKernel {
    fn segment_for(&self, tasklets: usize) -> usize {
        segment(self.segment_words, max_chunk(self.dim, tasklets))
    }
}

impl Kernel for RmsNormKernel {
    fn name(&self) -> &'static str {
        names::RMSNORM
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        vec![
            SymbolDecl::new(sym::X, self.dim),
            SymbolDecl::new(sym::W, self.dim),
            SymbolDecl::new(sym::Y, self.dim),
            SymbolDecl::new(sym::ACC, 1),
        ]
    }

    fn barriers(&self) -> usize {
        1
    }

    fn scratch_words(&self, tasklets: usize) -> usize {
        tasklets * 2 * self.segment_for(tasklets)
    }

    fn run(&self, t: &Tasklet<'_>) -> Result<()> {
        let range = chunk_range(self.dim, t.count(), t.id());
        let seg = self.segment_for(t.count());
        let mut xs = t.alloc(seg)?;
        let mut ws = t.alloc(seg)?;

        let mut sum_squares = 0.0f32;
        let mut start = range.start;
        while start < range.end {
            let n = seg.min(range.end - start);
            t.read(sym::X, start, &mut xs[..n])?;
            sum_squares = dot_acc(sum_squares, &xs[..n], &xs[..n]);
            start += n;
        }
        if !range.is_empty() {
            t.atomic_add(sym::ACC, 0, sum_squares)?;
        }

        t.barrier(0)?;

        let mut total = [0.0f32];
        t.read(sym::ACC, 0, &mut total)?;
        let scale = rms_scale(total[0], self.dim);

        let mut start = range.start;
        while start < range.end {
            let n = seg.min(range.end - start);
            t.read(sym::X, start, &mut xs[..n])?;
            t.read(sym::W, start, &mut ws[..n])?;
            for (x, w) in xs[..n].iter_mut().zip(&ws[..n]) {
                *x = w * (scale * *x);
            }
            t.write(sym::Y, start, &xs[..n])?;
            start += n;
        }
        Ok(())
    }
}
