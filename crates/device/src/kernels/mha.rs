//! Single-head attention whose working set fits in scratch
//!
//! One unit serves one head. The kernel runs three phases separated by
//! barriers:
//!
//! ```text
//! Score        all tasklets   att[t] = q·k[t] / sqrt(hs), or -inf for t > pos
//!   barrier 0  every score is in bulk before the softmax reads att
//! Softmax      tasklet 0      att = softmax(att), others wait
//!   barrier 1  normalized weights are in bulk before any weighted sum
//! WeightedSum  all tasklets   out[o] = Σ_t att[t] · v[o][t]
//! ```
//!
//! Keys arrive time-major (`kc[t][o]`), values head-dimension-major
//! (`vc[o][t]`), so both phases read contiguous rows. Params: `[pos]`.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::{dot_acc, softmax};
use crate::partition::{chunk_range, max_chunk};
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{check_param, names, sym};

/// Phases of the attention pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionPhase {
    Score,
    Softmax,
    WeightedSum,
}

impl AttentionPhase {
    pub fn next(self) -> Option<Self> {
        match self {
            AttentionPhase::Score => Some(AttentionPhase::Softmax),
            AttentionPhase::Softmax => Some(AttentionPhase::WeightedSum),
            AttentionPhase::WeightedSum => None,
        }
    }

    /// Barrier every tasklet crosses when leaving this phase
    pub fn exit_barrier(self) -> Option<usize> {
        match self {
            AttentionPhase::Score => Some(0),
            AttentionPhase::Softmax => Some(1),
            AttentionPhase::WeightedSum => None,
        }
    }

    /// Drive `step` through all phases in order
    pub(crate) fn run_all(
        t: &Tasklet<'_>,
        mut step: impl FnMut(AttentionPhase) -> Result<()>,
    ) -> Result<()> {
        let mut phase = Some(AttentionPhase::Score);
        while let Some(current) = phase {
            step(current)?;
            if let Some(barrier) = current.exit_barrier() {
                t.barrier(barrier)?;
            }
            phase = current.next();
        }
        Ok(())
    }
}

/// Symbols: `params[1]`, `q[hs]`, `kc[seq·hs]`, `vc[hs·seq]`, `att[seq]`, `out[hs]`
#[derive(Debug, Clone)]
pub struct MhaKernel {
    pub head_size: usize,
    pub seq_len: usize,
}

pub(crate) fn attention_symbols(head_size: usize, seq_len: usize) -> Vec<SymbolDecl> {
    vec![
        SymbolDecl::new(sym::PARAMS, 1),
        SymbolDecl::new(sym::Q, head_size),
        SymbolDecl::new(sym::KC, seq_len * head_size),
        SymbolDecl::new(sym::VC, head_size * seq_len),
        SymbolDecl::new(sym::ATT, seq_len),
        SymbolDecl::new(sym::OUT, head_size),
    ]
}

impl MhaKernel {
    fn score(&self, t: &Tasklet<'_>, pos: usize) -> Result<()> {
        let hs = self.head_size;
        let steps = chunk_range(self.seq_len, t.count(), t.id());
        if steps.is_empty() {
            return Ok(());
        }
        let mut q = t.alloc(hs)?;
        let mut k = t.alloc(hs)?;
        let mut scores = t.alloc(steps.len())?;
        t.read(sym::Q, 0, &mut q)?;

        let scale = (hs as f32).sqrt();
        for (score, step) in scores.iter_mut().zip(steps.clone()) {
            *score = if step > pos {
                f32::NEG_INFINITY
            } else {
                t.read(sym::KC, step * hs, &mut k)?;
                dot_acc(0.0, &q, &k) / scale
            };
        }
        t.write(sym::ATT, steps.start, &scores)
    }

    fn softmax(&self, t: &Tasklet<'_>) -> Result<()> {
        if t.id() != 0 {
            return Ok(());
        }
        t.reset_scratch();
        let mut att = t.alloc(self.seq_len)?;
        t.read(sym::ATT, 0, &mut att)?;
        softmax(&mut att);
        t.write(sym::ATT, 0, &att)?;
        t.reset_scratch();
        Ok(())
    }

    fn weighted_sum(&self, t: &Tasklet<'_>, pos: usize) -> Result<()> {
        let dims = chunk_range(self.head_size, t.count(), t.id());
        if dims.is_empty() {
            return Ok(());
        }
        let valid = pos + 1;
        let mut att = t.alloc(valid)?;
        let mut v = t.alloc(valid)?;
        let mut out = t.alloc(dims.len())?;
        t.read(sym::ATT, 0, &mut att)?;

        for (o, dim) in out.iter_mut().zip(dims.clone()) {
            t.read(sym::VC, dim * self.seq_len, &mut v)?;
            *o = dot_acc(0.0, &att, &v);
        }
        t.write(sym::OUT, dims.start, &out)
    }
}

impl Kernel for MhaKernel {
    fn name(&self) -> &'static str {
        names::MHA
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        attention_symbols(self.head_size, self.seq_len)
    }

    fn barriers(&self) -> usize {
        2
    }

    fn scratch_words(&self, tasklets: usize) -> usize {
        let score = tasklets * (2 * self.head_size + max_chunk(self.seq_len, tasklets));
        let softmax = self.seq_len;
        let weighted = tasklets * (2 * self.seq_len + max_chunk(self.head_size, tasklets));
        score.max(softmax).max(weighted)
    }

    fn run(&self, t: &Tasklet<'_>) -> Result<()> {
        let pos = t.param(0)?;
        check_param("pos", pos, self.seq_len.saturating_sub(1))?;

        AttentionPhase::run_all(t, |phase| match phase {
            AttentionPhase::Score => self.score(t, pos),
            AttentionPhase::Softmax => self.softmax(t),
            AttentionPhase::WeightedSum => self.weighted_sum(t, pos),
        })
    }
}
