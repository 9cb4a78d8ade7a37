//! Query/key/value projection with rotary embedding
//!
//! A unit holds a contiguous band of output rows starting at `row_start`.
//! Tasklets take whole row pairs so both halves of a RoPE pair are computed
//! and rotated by the same tasklet. Key and value rows exist only below
//! `kv_rows` (grouped-query models have fewer key/value features).
//!
//! Params: `[row_start, rows, kv_rows, pos]`.

use crate::bulk::SymbolDecl;
use crate::error::{DeviceError, Result};
use crate::math::{rope_rotate, stream_dot};
use crate::partition::pair_range;
use crate::program::Kernel;
use crate::tasklet::Tasklet;

use super::{check_param, names, segment, sym};

/// Symbols: `params[4]`, `x[dim]`, `wq/wk/wv[max_rows·dim]`, `q/k/v[max_rows]`
#[derive(Debug, Clone)]
pub struct QkvKernel {
    pub dim: usize,
    pub max_rows: usize,
    pub head_size: usize,
    pub segment_words: usize,
}

impl Kernel for QkvKernel {
    fn name(&self) -> &'static str {
        names::QKV
    }

    fn symbols(&self) -> Vec<SymbolDecl> {
        let weights = self.max_rows * self.dim;
        vec![
            SymbolDecl::new(sym::PARAMS, 4),
            SymbolDecl::new(sym::X, self.dim),
            SymbolDecl::new(sym::WQ, weights),
            SymbolDecl::new(sym::WK, weights),
            SymbolDecl::new(sym::WV, weights),
            SymbolDecl::new(sym::Q, self.max_rows),
            SymbolDecl::new(sym::K, self.max_rows),
            SymbolDecl::new(sym::V, self.max_rows),
        ]
    }

    fn scratch_words(&self, tasklets: usize) -> usize {
        tasklets * 2 * segment(self.segment_words, self.dim)
    }

    fn run(&self, t: &Tasklet<'_>) -> Result<()> {
        let row_start = t.param(0)?;
        let rows = t.param(1)?;
        let kv_rows = t.param(2)?;
        let pos = t.param(3)?;
        check_param("rows", rows, self.max_rows)?;
        check_param("kv_rows", kv_rows, rows)?;
        if row_start % 2 != 0 {
            return Err(DeviceError::InvalidParameter(format!(
                "row_start {} splits a rotation pair",
                row_start
            )));
        }

        let range = pair_range(rows, t.count(), t.id());
        if range.is_empty() {
            return Ok(());
        }

        let seg = segment(self.segment_words, self.dim);
        let mut xs = t.alloc(seg)?;
        let mut ws = t.alloc(seg)?;

        let mut r = range.start;
        while r < range.end {
            let pair_end = (r + 2).min(range.end);
            let mut q = [0.0f32; 2];
            let mut k = [0.0f32; 2];
            let mut v = [0.0f32; 2];

            for row in r..pair_end {
                let j = row - r;
                let w_off = row * self.dim;
                q[j] = stream_dot(t, (sym::X, 0), (sym::WQ, w_off), self.dim, &mut xs, &mut ws)?;
                if row < kv_rows {
                    k[j] = stream_dot(t, (sym::X, 0), (sym::WK, w_off), self.dim, &mut xs, &mut ws)?;
                    v[j] = stream_dot(t, (sym::X, 0), (sym::WV, w_off), self.dim, &mut xs, &mut ws)?;
                }
            }

            let n = pair_end - r;
            if n == 2 {
                let index = row_start + r;
                let (q0, q1) = rope_rotate(q[0], q[1], index, self.head_size, pos);
                q = [q0, q1];
                if r + 1 < kv_rows {
                    let (k0, k1) = rope_rotate(k[0], k[1], index, self.head_size, pos);
                    k = [k0, k1];
                }
            }

            t.write(sym::Q, r, &q[..n])?;
            let kv_n = kv_rows.saturating_sub(r).min(n);
            if kv_n > 0 {
                t.write(sym::K, r, &k[..kv_n])?;
                t.write(sym::V, r, &v[..kv_n])?;
            }
            r = pair_end;
        }
        Ok(())
    }
}
