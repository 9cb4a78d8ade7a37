//! FFN down projection with accumulation into the residual
//!
//! One row per tasklet at a time; the hidden-dimension dot product is
//! streamed in segments and added into `x[r]` atomically. The host seeds
//! `x` before launch, as for [`AttnOutKernel`](super::AttnOutKernel).
//!
//! Params: `[rows, cols]`. Weights are packed with row stride `cols`.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::stream_dot;
use crate::partition::chunk_range;
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{check_param, names, segment, sym};

/// Symbols: `params[2]`, `h[max_cols]`, `w[max_rows·max_cols]`, `x[max_rows]`
#[derive(Debug, Clone)]
pub struct Ffn2Kernel {
    pub max_cols: usize,
    pub max_rows: usize,
    pub segment_words: usize,
}

impl Kernel for Ffn2Kernel {
    fn name(&self) -> &'static str {
        names::FFN2
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        vec![
            SymbolDecl::new(sym::PARAMS, 2),
            SymbolDecl::new(sym::H, self.max_cols),
            SymbolDecl::new(sym::W, self.max_rows * self.max_cols),
            SymbolDecl::new(sym::X, self.max_rows),
        ]
    }

    fn scratch_words(&self, tasklets: usize) -> usize {
        tasklets * 2 * segment(self.segment_words, self.max_cols)
    }

    fn run(&self, t: &Tasklet<'_>) -> Result<()> {
        let rows = t.param(0)?;
        let cols = t.param(1)?;
        check_param("rows", rows, self.max_rows)?;
        check_param("cols", cols, self.max_cols)?;
        let range = chunk_range(rows, t.count(), t.id());
        if range.is_empty() || cols == 0 {
            return Ok(());
        }

        let seg = segment(self.segment_words, self.max_cols);
        let mut hs = t.alloc(seg)?;
        let mut ws = t.alloc(seg)?;

        for row in range {
            let partial = stream_dot(t, (sym::H, 0), (sym::W, row * cols), cols, &mut hs, &mut ws)?;
            t.atomic_add(sym::X, row, partial)?;
        }
        Ok(())
    }
}
