//! FFN gate: `h[r] = silu(w1[r]·x) · (w3[r]·x)`
//!
//! Rows are independent; no synchronization. Params: `[rows]`.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::{stream_dot, swiglu};
use crate::partition::chunk_range;
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{check_param, names, segment, sym};

/// Symbols: `params[1]`, `x[dim]`, `w1/w3[max_rows·dim]`, `h[max_rows]`
#[derive(Debug, Clone)]
pub struct Ffn1Kernel {
    pub dim: usize,
    pub max_rows: usize,
    pub segment_words: usize,
}

impl Kernel for Ffn1Kernel {
    fn name(&self) -> &'static str {
        names::FFN1
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        let weights = self.max_rows * self.dim;
        vec![
            SymbolDecl::new(sym::PARAMS, 1),
            SymbolDecl::new(sym::X, self.dim),
            SymbolDecl::new(sym::W1, weights),
            SymbolDecl::new(sym::W3, weights),
            SymbolDecl::new(sym::H, self.max_rows),
        ]
    }

    fn scratch_words(&self, tasklets: usize) -> usize {
        tasklets * 2 * segment(self.segment_words, self.dim)
    }

    fn run(&self, t: &Tasklet<'_>) -> Result<()> {
        let rows = t.param(0)?;
        check_param("rows", rows, self.max_rows)?;
        let range = chunk_range(rows, t.count(), t.id());
        if range.is_empty() {
            return Ok(());
        }

        let seg = segment(self.segment_words, self.dim);
        let mut xs = t.alloc(seg)?;
        let mut ws = t.alloc(seg)?;

        for row in range {
            let w_off = row * self.dim;
            let gate = stream_dot(t, (sym::X, 0), (sym::W1, w_off), self.dim, &mut xs, &mut ws)?;
            let up = stream_dot(t, (sym::X, 0), (sym::W3, w_off), self.dim, &mut xs, &mut ws)?;
            t.write(sym::H, row, &[swiglu(gate, up)])?;
        }
        Ok(())
    }
}
