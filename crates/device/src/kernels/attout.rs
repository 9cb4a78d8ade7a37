//! Attention output projection with accumulation into the residual
//!
//! `x[r] += Σ_c w[r][c] · v[c]` for the unit's rows. When a unit has fewer
//! rows than tasklets, each row's columns are split `T / rows` ways so idle
//! tasklets share the work; every partial lands in `x` through atomic add.
//! The host seeds `x` (residual or zero) before launch.
//!
//! Params: `[rows, cols]`. Weights are packed with row stride `cols`.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::stream_dot;
use crate::partition::chunk_range;
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{check_param, names, segment, sym};

/// Symbols: `params[2]`, `v[max_cols]`, `w[max_rows·max_cols]`, `x[max_rows]`
#[derive(Debug, Clone)]
pub struct AttnOutKernel {
    pub max_cols: usize,
    pub max_rows: usize,
    pub segment_words: usize,
}

impl Kernel for AttnOutKernel {
    fn name(&self) -> &'static str {
        names::ATTN_OUT
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        vec![
            SymbolDecl::new(sym::PARAMS, 2),
            SymbolDecl::new(sym::V, self.max_cols),
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
        if rows == 0 {
            return Ok(());
        }

        let splits = (t.count() / rows).max(1);
        let items = chunk_range(rows * splits, t.count(), t.id());
        if items.is_empty() {
            return Ok(());
        }

        let seg = segment(self.segment_words, self.max_cols);
        let mut vs = t.alloc(seg)?;
        let mut ws = t.alloc(seg)?;

        for item in items {
            let row = item / splits;
            let span = chunk_range(cols, splits, item % splits);
            if span.is_empty() {
                continue;
            }
            let partial = stream_dot(
                t,
                (sym::V, span.start),
                (sym::W, row * cols + span.start),
                span.len(),
                &mut vs,
                &mut ws,
            )?;
            t.atomic_add(sym::X, row, partial)?;
        }
        Ok(())
    }
}
