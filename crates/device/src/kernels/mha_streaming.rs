//! Single-head attention for heads too large for scratch
//!
//! Same phases and barriers as [`MhaKernel`](super::MhaKernel), but nothing
//! proportional to `head_size` or `seq_len` is held whole:
//!
//! - Score: each tasklet keeps running scores for its chunk of time steps
//!   and streams query and key rows across the head dimension in
//!   `score_segment` pieces.
//! - Softmax: tasklet 0 makes three segmented passes (max, sum, normalize).
//! - WeightedSum: output dimensions are taken `output_segment` at a time
//!   and time steps are streamed `value_segment` at a time.
//!
//! Accumulation order matches the bounded kernel, so both produce the same
//! bits for the same inputs.

use crate::bulk::SymbolDecl;
use crate::error::Result;
use crate::math::dot_acc;
use crate::partition::{chunk_range, max_chunk};
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::mha::{attention_symbols, AttentionPhase};
use super::{check_param, names, segment, sym};

#[derive(Debug, Clone)]
pub struct MhaStreamingKernel {
    pub head_size: usize,
    pub seq_len: usize,
    pub score_segment: usize,
    pub output_segment: usize,
    pub value_segment: usize,
}

impl MhaStreamingKernel {
    fn score_seg(&self) -> usize {
        segment(self.score_segment, self.head_size)
    }

    fn softmax_seg(&self) -> usize {
        segment(self.score_segment, self.seq_len)
    }

    fn output_seg(&self) -> usize {
        segment(self.output_segment, self.head_size)
    }

    fn value_seg(&self) -> usize {
        segment(self.value_segment, self.seq_len)
    }

    fn score(&self, t: &Tasklet<'_>, pos: usize) -> Result<()> {
        let hs = self.head_size;
        let steps = chunk_range(self.seq_len, t.count(), t.id());
        if steps.is_empty() {
            return Ok(());
        }
        let valid_end = steps.end.min(pos + 1);
        let seg = self.score_seg();
        let mut q = t.alloc(seg)?;
        let mut k = t.alloc(seg)?;
        let mut scores = t.alloc(steps.len())?;

        let mut start = 0;
        while start < hs {
            let n = seg.min(hs - start);
            t.read(sym::Q, start, &mut q[..n])?;
            for step in steps.start..valid_end {
                t.read(sym::KC, step * hs + start, &mut k[..n])?;
                let running = &mut scores[step - steps.start];
                *running = dot_acc(*running, &q[..n], &k[..n]);
            }
            start += n;
        }

        let scale = (hs as f32).sqrt();
        for (score, step) in scores.iter_mut().zip(steps.clone()) {
            *score = if step > pos {
                f32::NEG_INFINITY
            } else {
                *score / scale
            };
        }
        t.write(sym::ATT, steps.start, &scores)
    }

    fn softmax(&self, t: &Tasklet<'_>) -> Result<()> {
        if t.id() != 0 {
            return Ok(());
        }
        t.reset_scratch();
        let seg = self.softmax_seg();
        let mut buf = t.alloc(seg)?;
        let len = self.seq_len;

        let mut max = f32::NEG_INFINITY;
        let mut start = 0;
        while start < len {
            let n = seg.min(len - start);
            t.read(sym::ATT, start, &mut buf[..n])?;
            max = buf[..n].iter().copied().fold(max, f32::max);
            start += n;
        }

        if max == f32::NEG_INFINITY {
            buf.fill(0.0);
            let mut start = 0;
            while start < len {
                let n = seg.min(len - start);
                t.write(sym::ATT, start, &buf[..n])?;
                start += n;
            }
            t.reset_scratch();
            return Ok(());
        }

        let mut sum = 0.0f32;
        let mut start = 0;
        while start < len {
            let n = seg.min(len - start);
            t.read(sym::ATT, start, &mut buf[..n])?;
            for v in &buf[..n] {
                sum += (v - max).exp();
            }
            start += n;
        }

        let mut start = 0;
        while start < len {
            let n = seg.min(len - start);
            t.read(sym::ATT, start, &mut buf[..n])?;
            for v in buf[..n].iter_mut() {
                *v = (*v - max).exp() / sum;
            }
            t.write(sym::ATT, start, &buf[..n])?;
            start += n;
        }
        t.reset_scratch();
        Ok(())
    }

    fn weighted_sum(&self, t: &Tasklet<'_>, pos: usize) -> Result<()> {
        let dims = chunk_range(self.head_size, t.count(), t.id());
        if dims.is_empty() {
            return Ok(());
        }
        let valid = pos + 1;
        let oseg = self.output_seg();
        let vseg = self.value_seg();
        let mut acc = t.alloc(oseg)?;
        let mut att = t.alloc(vseg)?;
        let mut v = t.alloc(vseg)?;

        let mut o_start = dims.start;
        while o_start < dims.end {
            let on = oseg.min(dims.end - o_start);
            acc[..on].fill(0.0);

            let mut t_start = 0;
            while t_start < valid {
                let tn = vseg.min(valid - t_start);
                t.read(sym::ATT, t_start, &mut att[..tn])?;
                for (j, running) in acc[..on].iter_mut().enumerate() {
                    let row = (o_start + j) * self.seq_len;
                    t.read(sym::VC, row + t_start, &mut v[..tn])?;
                    *running = dot_acc(*running, &att[..tn], &v[..tn]);
                }
                t_start += tn;
            }

            t.write(sym::OUT, o_start, &acc[..on])?;
            o_start += on;
        }
        Ok(())
    }
}

impl Kernel for MhaStreamingKernel {
    fn name(&self) -> &'static str {
        names::MHA_STREAMING
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        attention_symbols(self.head_size, self.seq_len)
    }

    fn barriers(&self) -> usize {
        2
    }

    fn scratch_words(&self, tasklets: usize) -> usize {
        let score = tasklets * (2 * self.score_seg() + max_chunk(self.seq_len, tasklets));
        let softmax = self.softmax_seg();
        let weighted = tasklets * (self.output_seg() + 2 * self.value_seg());
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
