//! Row-band domain decomposition.
//!
//! The interior rows are split into contiguous full-width bands, one per
//! worker. Each band is stored with one ghost row above and below:
//!
//! ```text
//! +--+----------------+--+
//! |  | north ghost    |  |  <- last real row of worker p-1 (or sink)
//! +--+----------------+--+
//! |S |                |S |
//! |  | start..end     |  |
//! |  |                |  |
//! +--+----------------+--+
//! |  | south ghost    |  |  <- first real row of worker p+1 (or sink)
//! +--+----------------+--+
//! ```
//!
//! Bands never split columns, so the east/west neighbors of every cell are
//! always local and only rows have to be exchanged.

use super::grid::{check_dimensions, Cell, InitialFill, SandpileGrid};
use super::halo::HaloDirection;
use super::kernel::DoubleBuffer;
use crate::error::{Phase, Result, SandpileError};

/// Half-open range of logical rows owned by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RowBand {
    /// Worker rank.
    pub rank: usize,
    /// Total number of workers.
    pub workers: usize,
    /// First owned logical row.
    pub start: usize,
    /// One past the last owned logical row.
    pub end: usize,
}

impl RowBand {
    /// Number of owned rows.
    pub fn rows(&self) -> usize {
        self.end - self.start
    }

    /// Rank of the worker owning the rows directly above, if any.
    pub fn north_neighbor(&self) -> Option<usize> {
        self.rank.checked_sub(1)
    }

    /// Rank of the worker owning the rows directly below, if any.
    pub fn south_neighbor(&self) -> Option<usize> {
        if self.rank + 1 < self.workers {
            Some(self.rank + 1)
        } else {
            None
        }
    }

    /// Neighbor rank in `direction`.
    pub fn neighbor(&self, direction: HaloDirection) -> Option<usize> {
        match direction {
            HaloDirection::North => self.north_neighbor(),
            HaloDirection::South => self.south_neighbor(),
        }
    }

    /// Local buffer shape `(rows + 2, width + 2)` including ghosts and sink columns.
    pub fn local_shape(&self, width: usize) -> (usize, usize) {
        (self.rows() + 2, width + 2)
    }
}

/// Split `height` rows across `workers`.
///
/// Every band gets `height / workers` rows and the first `height % workers`
/// bands one extra. A worker count that would leave any band empty is a
/// configuration error.
pub fn partition_rows(height: usize, width: usize, workers: usize) -> Result<Vec<RowBand>> {
    check_dimensions(height, width)?;
    if workers == 0 {
        return Err(SandpileError::config("worker count must be at least 1"));
    }
    if workers > height {
        return Err(SandpileError::config(format!(
            "{} workers for {} rows would leave worker {} with zero rows",
            workers, height, height
        )));
    }

    let base = height / workers;
    let remainder = height % workers;
    let mut bands = Vec::with_capacity(workers);
    let mut cursor = 0;
    for rank in 0..workers {
        let rows = base + usize::from(rank < remainder);
        bands.push(RowBand {
            rank,
            workers,
            start: cursor,
            end: cursor + rows,
        });
        cursor += rows;
    }
    debug_assert_eq!(cursor, height);
    Ok(bands)
}

/// One worker's share of the grid.
///
/// Real rows are `1..=band.rows()` of the local buffers and are only ever
/// mutated by the sweep of this partition. Ghost rows are only written by
/// [`write_ghost`](Self::write_ghost) during the halo exchange.
#[derive(Debug, Clone)]
pub struct Partition {
    band: RowBand,
    width: usize,
    buffers: DoubleBuffer,
}

impl Partition {
    /// Allocate a partition and populate its rows from `fill`.
    pub fn with_fill(band: RowBand, height: usize, width: usize, fill: InitialFill) -> Result<Self> {
        let mut buffers = DoubleBuffer::new(band.rows(), width)?;
        for local in 0..band.rows() {
            let row = buffers.row_mut(local + 1);
            for x in 0..width {
                row[x + 1] = fill.grains_at(band.start + local, x, height, width);
            }
        }
        Ok(Self {
            band,
            width,
            buffers,
        })
    }

    /// Allocate a partition holding a copy of `band`'s rows of `grid`.
    pub fn from_grid(band: RowBand, grid: &SandpileGrid) -> Result<Self> {
        let mut buffers = DoubleBuffer::new(band.rows(), grid.width)?;
        for local in 0..band.rows() {
            buffers
                .row_mut(local + 1)
                .copy_from_slice(grid.padded_row(band.start + local));
        }
        Ok(Self {
            band,
            width: grid.width,
            buffers,
        })
    }

    /// The rows this partition owns.
    pub fn band(&self) -> &RowBand {
        &self.band
    }

    /// Worker rank.
    pub fn rank(&self) -> usize {
        self.band.rank
    }

    /// Interior columns.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Padded length of a boundary or ghost row.
    pub fn row_len(&self) -> usize {
        self.width + 2
    }

    /// The real row a neighbor in `direction` needs for its ghost row.
    pub fn edge_row(&self, direction: HaloDirection) -> &[Cell] {
        match direction {
            HaloDirection::North => self.buffers.row(1),
            HaloDirection::South => self.buffers.row(self.band.rows()),
        }
    }

    /// Current contents of the ghost row on `side`.
    pub fn ghost_row(&self, side: HaloDirection) -> &[Cell] {
        match side {
            HaloDirection::North => self.buffers.row(0),
            HaloDirection::South => self.buffers.row(self.band.rows() + 1),
        }
    }

    /// Store a neighbor's boundary row in the ghost row on `side`.
    ///
    /// A side without a neighbor is the permanent sink and cannot be written.
    pub fn write_ghost(&mut self, side: HaloDirection, row: &[Cell]) -> Result<()> {
        if self.band.neighbor(side).is_none() {
            return Err(SandpileError::communication(
                self.band.rank,
                Phase::HaloExchange,
                format!("refusing to overwrite {} sink row", side),
            ));
        }
        if row.len() != self.row_len() {
            return Err(SandpileError::communication(
                self.band.rank,
                Phase::HaloExchange,
                format!(
                    "{} ghost row has {} cells, expected {}",
                    side,
                    row.len(),
                    self.row_len()
                ),
            ));
        }
        let y = match side {
            HaloDirection::North => 0,
            HaloDirection::South => self.band.rows() + 1,
        };
        self.buffers.row_mut(y).copy_from_slice(row);
        Ok(())
    }

    /// Relax every owned cell into the back buffer.
    pub fn sweep(&mut self) -> bool {
        self.buffers.sweep()
    }

    /// Relax every owned cell into the back buffer, rows in parallel.
    pub fn sweep_parallel(&mut self) -> bool {
        self.buffers.sweep_parallel()
    }

    /// Promote the back buffer after a sweep.
    pub fn swap(&mut self) {
        self.buffers.swap();
    }

    /// Owned cells in row-major order, ghosts and sink columns excluded.
    pub fn interior(&self) -> Vec<Cell> {
        let mut out = Vec::with_capacity(self.band.rows() * self.width);
        for y in 1..=self.band.rows() {
            out.extend_from_slice(&self.buffers.row(y)[1..=self.width]);
        }
        out
    }

    /// Grains on the owned rows.
    pub fn total_grains(&self) -> u64 {
        (1..=self.band.rows())
            .flat_map(|y| self.buffers.row(y)[1..=self.width].iter())
            .map(|&c| u64::from(c))
            .sum()
    }

    /// Whether no owned cell can topple.
    pub fn is_stable(&self) -> bool {
        self.buffers.is_stable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bands_tile_rows() {
        let bands = partition_rows(10, 4, 4).unwrap();

        let sizes: Vec<usize> = bands.iter().map(RowBand::rows).collect();
        assert_eq!(sizes, vec![3, 3, 2, 2]);
        assert_eq!(bands[0].start, 0);
        for pair in bands.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(bands[3].end, 10);
    }

    #[test]
    fn test_single_worker_owns_everything() {
        let bands = partition_rows(7, 3, 1).unwrap();

        assert_eq!(bands.len(), 1);
        assert_eq!((bands[0].start, bands[0].end), (0, 7));
        assert_eq!(bands[0].north_neighbor(), None);
        assert_eq!(bands[0].south_neighbor(), None);
        assert_eq!(bands[0].local_shape(3), (9, 5));
    }

    #[test]
    fn test_neighbors() {
        let bands = partition_rows(6, 2, 3).unwrap();

        assert_eq!(bands[0].north_neighbor(), None);
        assert_eq!(bands[0].south_neighbor(), Some(1));
        assert_eq!(bands[1].neighbor(HaloDirection::North), Some(0));
        assert_eq!(bands[1].neighbor(HaloDirection::South), Some(2));
        assert_eq!(bands[2].south_neighbor(), None);
    }

    #[test]
    fn test_too_many_workers_rejected() {
        let err = partition_rows(3, 8, 4).unwrap_err();
        assert!(err.is_configuration());
        assert!(partition_rows(3, 8, 0).unwrap_err().is_configuration());
        assert!(partition_rows(0, 8, 1).unwrap_err().is_configuration());
    }

    #[test]
    fn test_partition_from_fill_uses_global_rows() {
        let bands = partition_rows(5, 5, 2).unwrap();
        let fill = InitialFill::CenterPile { grains: 9 };

        let top = Partition::with_fill(bands[0], 5, 5, fill).unwrap();
        let bottom = Partition::with_fill(bands[1], 5, 5, fill).unwrap();

        // Rows 0..3 and 3..5; the pile sits on global row 2.
        assert_eq!(top.total_grains(), 9);
        assert_eq!(top.interior()[2 * 5 + 2], 9);
        assert_eq!(bottom.total_grains(), 0);
    }

    #[test]
    fn test_edge_and_ghost_rows() {
        let grid = SandpileGrid::from_interior(4, 2, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let bands = partition_rows(4, 2, 2).unwrap();
        let mut top = Partition::from_grid(bands[0], &grid).unwrap();
        let bottom = Partition::from_grid(bands[1], &grid).unwrap();

        assert_eq!(top.edge_row(HaloDirection::North), &[0, 1, 2, 0]);
        assert_eq!(top.edge_row(HaloDirection::South), &[0, 3, 4, 0]);

        top.write_ghost(HaloDirection::South, bottom.edge_row(HaloDirection::North))
            .unwrap();
        assert_eq!(top.ghost_row(HaloDirection::South), &[0, 5, 6, 0]);
        assert_eq!(top.ghost_row(HaloDirection::North), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_sink_ghost_is_read_only() {
        let bands = partition_rows(4, 2, 2).unwrap();
        let mut top = Partition::with_fill(bands[0], 4, 2, InitialFill::default()).unwrap();

        let err = top
            .write_ghost(HaloDirection::North, &[0, 9, 9, 0])
            .unwrap_err();
        assert!(err.is_communication());
        assert_eq!(top.ghost_row(HaloDirection::North), &[0, 0, 0, 0]);
    }

    #[test]
    fn test_ghost_length_checked() {
        let bands = partition_rows(4, 2, 2).unwrap();
        let mut top = Partition::with_fill(bands[0], 4, 2, InitialFill::default()).unwrap();

        assert!(top.write_ghost(HaloDirection::South, &[1, 2]).is_err());
    }
}
