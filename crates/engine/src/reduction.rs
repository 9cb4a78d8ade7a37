//! Host-mediated reduction for the residual projections
//!
//! Attention output and FFN down projection both compute `x += W·v`. The
//! output rows are split into bands across row groups; with
//! `reduction_splits > 1` each band is further split along the input
//! dimension across several units. Every unit accumulates its partial sums
//! into its own copy of the band, and the host adds the copies together.
//!
//! The split-0 unit of each band is seeded with the residual and the other
//! splits with zero, so the sum of all copies is `x + W·v`.

use std::borrow::Cow;
use std::ops::Range;

use pimlm_device::partition::{chunk_range, pair_range};

use crate::error::{EngineError, Result};

/// Work given to one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Output rows
    pub rows: Range<usize>,
    /// Input columns
    pub cols: Range<usize>,
    /// Index of the column slice within the row group
    pub split: usize,
}

/// How a residual projection is spread over a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReductionPlan {
    out_dim: usize,
    in_dim: usize,
    splits: usize,
    assignments: Vec<Assignment>,
}

impl ReductionPlan {
    /// Spread `out_dim × in_dim` over `units` with up to `splits` column slices
    ///
    /// Units beyond the last full row group stay idle.
    pub fn new(out_dim: usize, in_dim: usize, units: usize, splits: usize) -> Result<Self> {
        if units == 0 || splits == 0 {
            return Err(EngineError::Config(format!(
                "reduction over {} units with {} splits",
                units, splits
            )));
        }
        let splits = splits.min(units);
        let groups = units / splits;

        let assignments = (0..units)
            .map(|u| {
                if u < groups * splits {
                    Assignment {
                        rows: pair_range(out_dim, groups, u / splits),
                        cols: chunk_range(in_dim, splits, u % splits),
                        split: u % splits,
                    }
                } else {
                    Assignment {
                        rows: 0..0,
                        cols: 0..0,
                        split: 0,
                    }
                }
            })
            .collect();

        Ok(Self {
            out_dim,
            in_dim,
            splits,
            assignments,
        })
    }

    pub fn assignments(&self) -> &[Assignment] {
        &self.assignments
    }

    /// Effective number of column slices per row band
    pub fn splits(&self) -> usize {
        self.splits
    }

    pub fn max_rows(&self) -> usize {
        self.assignments.iter().map(|a| a.rows.len()).max().unwrap_or(0)
    }

    pub fn max_cols(&self) -> usize {
        self.assignments.iter().map(|a| a.cols.len()).max().unwrap_or(0)
    }

    /// Kernel params `[rows, cols]` per unit
    pub fn params(&self) -> Vec<Vec<u32>> {
        self.assignments
            .iter()
            .map(|a| vec![a.rows.len() as u32, a.cols.len() as u32])
            .collect()
    }

    /// Input slice per unit
    pub fn inputs<'a>(&self, input: &'a [f32]) -> Vec<&'a [f32]> {
        self.assignments.iter().map(|a| &input[a.cols.clone()]).collect()
    }

    /// Weight block per unit, packed with row stride equal to its column count
    ///
    /// Borrowed directly when a unit covers full rows.
    pub fn weights<'a>(&self, w: &'a [f32]) -> Vec<Cow<'a, [f32]>> {
        let in_dim = self.in_dim;
        self.assignments
            .iter()
            .map(|a| {
                if a.cols == (0..in_dim) {
                    Cow::Borrowed(&w[a.rows.start * in_dim..a.rows.end * in_dim])
                } else {
                    let mut block = Vec::with_capacity(a.rows.len() * a.cols.len());
                    for r in a.rows.clone() {
                        let row = &w[r * in_dim..(r + 1) * in_dim];
                        block.extend_from_slice(&row[a.cols.clone()]);
                    }
                    Cow::Owned(block)
                }
            })
            .collect()
    }

    /// Accumulator seed per unit
    pub fn seeds(&self, residual: &[f32]) -> Vec<Vec<f32>> {
        self.assignments
            .iter()
            .map(|a| {
                if a.split == 0 {
                    residual[a.rows.clone()].to_vec()
                } else {
                    vec![0.0; a.rows.len()]
                }
            })
            .collect()
    }

    /// Rows to read back per unit
    pub fn lens(&self) -> Vec<usize> {
        self.assignments.iter().map(|a| a.rows.len()).collect()
    }

    /// Sum every unit's band into `out`
    pub fn combine(&self, gathered: &[Vec<f32>], out: &mut [f32]) -> Result<()> {
        if gathered.len() != self.assignments.len() || out.len() != self.out_dim {
            return Err(EngineError::Config(format!(
                "reduction combine over {} bands into {} rows, planned {} units and {} rows",
                gathered.len(),
                out.len(),
                self.assignments.len(),
                self.out_dim
            )));
        }
        out.fill(0.0);
        for (assignment, band) in self.assignments.iter().zip(gathered) {
            for (dst, src) in out[assignment.rows.clone()].iter_mut().zip(band) {
                *dst += src;
            }
        }
        Ok(())
    }
}
