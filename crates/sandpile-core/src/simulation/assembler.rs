//! Collection of per-partition rows into the final grid.
//!
//! The assembler is a variable-size gather: every rank contributes exactly
//! its band's interior cells and they land at a precomputed offset, so the
//! concatenation reproduces the logical row order no matter in which order
//! the contributions arrive.

use super::grid::{Cell, TOPPLE_THRESHOLD};
use super::partition::RowBand;
use crate::error::{cell_count, try_zeroed, Phase, Result, SandpileError};

/// The relaxed interior, row-major, sink border stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StableGrid {
    height: usize,
    width: usize,
    cells: Vec<Cell>,
}

impl StableGrid {
    /// Interior rows.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Interior columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Row-major cells.
    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    /// Take the row-major cells.
    pub fn into_cells(self) -> Vec<Cell> {
        self.cells
    }

    /// Cell at `(y, x)`.
    pub fn get(&self, y: usize, x: usize) -> Option<Cell> {
        if y < self.height && x < self.width {
            Some(self.cells[y * self.width + x])
        } else {
            None
        }
    }

    /// Row `y`, or `None` past the last row.
    pub fn row(&self, y: usize) -> Option<&[Cell]> {
        if y < self.height {
            Some(&self.cells[y * self.width..(y + 1) * self.width])
        } else {
            None
        }
    }

    /// Iterate over rows.
    pub fn rows(&self) -> impl Iterator<Item = &[Cell]> {
        self.cells.chunks_exact(self.width)
    }

    /// Whether every cell is below the topple threshold.
    pub fn is_stable(&self) -> bool {
        self.cells.iter().all(|&c| c < TOPPLE_THRESHOLD)
    }

    /// Total grains.
    pub fn total_grains(&self) -> u64 {
        self.cells.iter().map(|&c| u64::from(c)).sum()
    }

    /// Number of cells holding 0, 1, 2 and 3 grains. Unstable cells are not counted.
    pub fn histogram(&self) -> [usize; 4] {
        let mut counts = [0usize; 4];
        for &c in &self.cells {
            if let Some(slot) = counts.get_mut(c as usize) {
                *slot += 1;
            }
        }
        counts
    }
}

/// Gathers interior rows from every rank.
#[derive(Debug)]
pub struct ResultAssembler {
    height: usize,
    width: usize,
    counts: Vec<usize>,
    offsets: Vec<usize>,
    received: Vec<bool>,
    cells: Vec<Cell>,
}

impl ResultAssembler {
    /// Prepare a gather for `bands` of `width` columns.
    pub fn new(bands: &[RowBand], width: usize) -> Result<Self> {
        let counts = bands
            .iter()
            .map(|band| cell_count("result buffer", band.rows(), width))
            .collect::<Result<Vec<usize>>>()?;
        let mut offsets = Vec::with_capacity(counts.len());
        let mut total: usize = 0;
        for &count in &counts {
            offsets.push(total);
            total = total.checked_add(count).ok_or(SandpileError::ResourceExhausted {
                what: "result buffer",
                cells: usize::MAX,
            })?;
        }
        let height = bands.iter().map(RowBand::rows).sum();

        Ok(Self {
            height,
            width,
            received: vec![false; counts.len()],
            counts,
            offsets,
            cells: try_zeroed("result buffer", total)?,
        })
    }

    /// Cells expected from each rank.
    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    /// Position of each rank's first cell in the output.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Store the interior cells of `rank`.
    pub fn contribute(&mut self, rank: usize, interior: &[Cell]) -> Result<()> {
        let Some(&expected) = self.counts.get(rank) else {
            return Err(SandpileError::communication(
                rank,
                Phase::Gather,
                format!("unknown rank in a gather of {}", self.counts.len()),
            ));
        };
        if self.received[rank] {
            return Err(SandpileError::communication(
                rank,
                Phase::Gather,
                "rows contributed twice",
            ));
        }
        if interior.len() != expected {
            return Err(SandpileError::communication(
                rank,
                Phase::Gather,
                format!("contributed {} cells, expected {}", interior.len(), expected),
            ));
        }

        let offset = self.offsets[rank];
        self.cells[offset..offset + expected].copy_from_slice(interior);
        self.received[rank] = true;
        Ok(())
    }

    /// Finish the gather once every rank has contributed.
    pub fn finish(self) -> Result<StableGrid> {
        if let Some(missing) = self.received.iter().position(|&done| !done) {
            return Err(SandpileError::communication(
                missing,
                Phase::Gather,
                "rows never contributed",
            ));
        }
        Ok(StableGrid {
            height: self.height,
            width: self.width,
            cells: self.cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::partition::partition_rows;

    #[test]
    fn test_counts_and_offsets() {
        let bands = partition_rows(5, 3, 2).unwrap();
        let assembler = ResultAssembler::new(&bands, 3).unwrap();

        assert_eq!(assembler.counts(), &[9, 6]);
        assert_eq!(assembler.offsets(), &[0, 9]);
    }

    #[test]
    fn test_out_of_order_contributions_keep_row_order() {
        let bands = partition_rows(3, 2, 3).unwrap();
        let mut assembler = ResultAssembler::new(&bands, 2).unwrap();

        assembler.contribute(2, &[5, 6]).unwrap();
        assembler.contribute(0, &[1, 2]).unwrap();
        assembler.contribute(1, &[3, 0]).unwrap();
        let grid = assembler.finish().unwrap();

        assert_eq!(grid.cells(), &[1, 2, 3, 0, 5, 6]);
        assert_eq!(grid.row(1), Some(&[3, 0][..]));
        assert_eq!(grid.row(3), None);
        assert_eq!(grid.get(2, 1), Some(6));
        assert_eq!(grid.get(3, 0), None);
        assert!(!grid.is_stable());
    }

    #[test]
    fn test_gather_faults() {
        let bands = partition_rows(4, 2, 2).unwrap();
        let mut assembler = ResultAssembler::new(&bands, 2).unwrap();

        assert!(assembler.contribute(0, &[1, 2, 3]).is_err());
        assert!(assembler.contribute(7, &[0; 4]).is_err());
        assembler.contribute(0, &[0; 4]).unwrap();
        assert!(assembler.contribute(0, &[0; 4]).is_err());

        match assembler.finish().unwrap_err() {
            SandpileError::Communication { worker, phase, .. } => {
                assert_eq!(worker, 1);
                assert_eq!(phase, Phase::Gather);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_oversized_gather_rejected() {
        let bands = [RowBand {
            rank: 0,
            workers: 1,
            start: 0,
            end: usize::MAX,
        }];
        let err = ResultAssembler::new(&bands, 2).unwrap_err();
        assert!(matches!(err, SandpileError::ResourceExhausted { .. }));
    }

    #[test]
    fn test_histogram() {
        let bands = partition_rows(2, 3, 1).unwrap();
        let mut assembler = ResultAssembler::new(&bands, 3).unwrap();
        assembler.contribute(0, &[0, 1, 1, 3, 3, 3]).unwrap();
        let grid = assembler.finish().unwrap();

        assert_eq!(grid.histogram(), [1, 2, 0, 3]);
        assert_eq!(grid.total_grains(), 11);
        assert_eq!(grid.rows().count(), 2);
        assert!(grid.is_stable());
    }
}
