//! The synchronous relaxation kernel and its double buffer.
//!
//! One sweep applies
//!
//! ```text
//! next[y,x] = cur[y,x] % 4 + cur[y-1,x] / 4 + cur[y+1,x] / 4 + cur[y,x-1] / 4 + cur[y,x+1] / 4
//! ```
//!
//! to every interior cell at once. A cell keeps its residue below the
//! threshold and receives one grain for every full topple of each neighbor,
//! so a sweep is a batch of simultaneous topples. By the abelian property the
//! fixed point reached this way is the same one sequential toppling reaches
//! in any order, which is what allows the rows to be swept in parallel.

use rayon::prelude::*;

use super::grid::{Cell, TOPPLE_THRESHOLD};
use crate::error::{padded_len, try_zeroed, Result};

/// Below this many interior rows the parallel sweep falls back to sequential.
const PARALLEL_ROW_THRESHOLD: usize = 64;

/// Relaxed value of the cell at buffer index `idx`.
#[inline(always)]
pub fn relax_cell(current: &[Cell], stride: usize, idx: usize) -> Cell {
    current[idx] % TOPPLE_THRESHOLD
        + current[idx - 1] / TOPPLE_THRESHOLD
        + current[idx + 1] / TOPPLE_THRESHOLD
        + current[idx - stride] / TOPPLE_THRESHOLD
        + current[idx + stride] / TOPPLE_THRESHOLD
}

/// Update padded cell `(y, x)` from `current` into `next`.
///
/// Returns `true` if the value changed.
#[inline(always)]
pub fn update_cell(current: &[Cell], next: &mut [Cell], stride: usize, y: usize, x: usize) -> bool {
    let idx = y * stride + x;
    next[idx] = relax_cell(current, stride, idx);
    next[idx] != current[idx]
}

/// Relax one interior row. `row_out` is the full padded output row.
#[inline]
fn sweep_row(current: &[Cell], row_out: &mut [Cell], stride: usize, y: usize) -> bool {
    let row_start = y * stride;
    let mut changed = false;
    for x in 1..stride - 1 {
        let value = relax_cell(current, stride, row_start + x);
        changed |= value != current[row_start + x];
        row_out[x] = value;
    }
    changed
}

/// Sequential sweep over interior rows `1..=rows` of a padded buffer with
/// `cols` interior columns.
pub fn sweep(current: &[Cell], next: &mut [Cell], rows: usize, cols: usize) -> bool {
    let stride = cols + 2;
    let mut changed = false;
    for y in 1..=rows {
        let row_start = y * stride;
        changed |= sweep_row(current, &mut next[row_start..row_start + stride], stride, y);
    }
    changed
}

/// Data-parallel sweep: interior rows are relaxed independently with rayon
/// and the changed flags are OR-reduced.
pub fn sweep_parallel(current: &[Cell], next: &mut [Cell], rows: usize, cols: usize) -> bool {
    if rows < PARALLEL_ROW_THRESHOLD {
        return sweep(current, next, rows, cols);
    }

    let stride = cols + 2;
    next[stride..(rows + 1) * stride]
        .par_chunks_mut(stride)
        .enumerate()
        .map(|(offset, row_out)| sweep_row(current, row_out, stride, offset + 1))
        .reduce(|| false, |a, b| a | b)
}

/// A pair of identically shaped padded buffers.
///
/// A sweep only reads `current` and only writes `next`; [`swap`](Self::swap)
/// exchanges ownership afterwards. Row 0 and row `rows + 1` are the ghost (or
/// sink) rows, column 0 and column `cols + 1` the sink columns.
#[derive(Debug, Clone)]
pub struct DoubleBuffer {
    rows: usize,
    cols: usize,
    current: Vec<Cell>,
    next: Vec<Cell>,
}

impl DoubleBuffer {
    /// Allocate zeroed buffers for `rows x cols` interior cells.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        let len = padded_len("partition buffer", rows, cols)?;
        Ok(Self {
            rows,
            cols,
            current: try_zeroed("partition buffer", len)?,
            next: try_zeroed("partition buffer", len)?,
        })
    }

    /// Interior rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Interior columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Padded row stride.
    #[inline(always)]
    pub fn stride(&self) -> usize {
        self.cols + 2
    }

    /// The buffer the next sweep reads.
    pub fn current(&self) -> &[Cell] {
        &self.current
    }

    /// Padded row `y` (0 and `rows + 1` are ghost rows) of the current buffer.
    pub fn row(&self, y: usize) -> &[Cell] {
        let start = y * self.stride();
        &self.current[start..start + self.stride()]
    }

    /// Mutable padded row `y` of the current buffer.
    pub fn row_mut(&mut self, y: usize) -> &mut [Cell] {
        let stride = self.stride();
        let start = y * stride;
        &mut self.current[start..start + stride]
    }

    /// Relax every interior cell from `current` into `next`.
    pub fn sweep(&mut self) -> bool {
        sweep(&self.current, &mut self.next, self.rows, self.cols)
    }

    /// Like [`sweep`](Self::sweep) but with rows processed in parallel.
    pub fn sweep_parallel(&mut self) -> bool {
        sweep_parallel(&self.current, &mut self.next, self.rows, self.cols)
    }

    /// Make the freshly written buffer current.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.next);
    }

    /// Whether any interior cell of the current buffer can topple.
    pub fn is_stable(&self) -> bool {
        (1..=self.rows).all(|y| self.row(y)[1..=self.cols].iter().all(|&c| c < TOPPLE_THRESHOLD))
    }
}
