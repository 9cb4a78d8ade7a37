//! Classifier: one logit per vocabulary row
//!
//! Params: `[rows]`. The weight band is written once and reused for every
//! token; only `x` changes between launches. Both `x` and the weight row
//! are streamed through scratch in segments.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::stream_dot;
use crate::partition::chunk_range;
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{check_param, names, segment, sym};

/// Symbols: `params[1]`, `x[dim]`, `w[max_rows·dim]`, `logits[max_rows]`
#[derive(Debug, Clone)]
pub struct ClassifierKernel {
    pub dim: usize,
    pub max_rows: usize,
    pub segment_words: usize,
}

impl Kernel for ClassifierKernel {
    fn name(&self) -> &'static str {
        names::CLS
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        vec![
            SymbolDecl::new(sym::PARAMS, 1),
            SymbolDecl::new(sym::X, self.dim),
            SymbolDecl::new(sym::W, self.max_rows * self.dim),
            SymbolDecl::new(sym::LOGITS, self.max_rows),
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
            let logit = stream_dot(t, (sym::X, 0), (sym::W, w_off), self.dim, &mut xs, &mut ws)?;
            t.write(sym::LOGITS, row, &[logit])?;
        }
        Ok(())
    }
}
