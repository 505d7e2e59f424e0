//! Grid storage for the sandpile relaxation.
//!
//! The logical interior of `height x width` cells is surrounded by a
//! one-cell sink border. Border cells are zero at allocation and are never
//! written afterwards, so they always read as 0 when used as a neighbor and
//! grains toppled onto them are discarded.

use serde::{Deserialize, Serialize};

use crate::error::{padded_len, try_zeroed, Result, SandpileError};

/// Grain count at a lattice site.
pub type Cell = u32;

/// A cell topples once it holds this many grains.
pub const TOPPLE_THRESHOLD: Cell = 4;

/// How the interior is populated before relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialFill {
    /// Every interior cell holds the same number of grains.
    Uniform {
        /// Grains per interior cell.
        grains: Cell,
    },
    /// A single pile at the interior center, every other cell empty.
    ///
    /// `grains = 0` means `height * width` grains.
    CenterPile {
        /// Grains placed on the center cell.
        grains: Cell,
    },
}

impl Default for InitialFill {
    fn default() -> Self {
        InitialFill::Uniform {
            grains: TOPPLE_THRESHOLD,
        }
    }
}

impl InitialFill {
    /// Grains at interior cell `(y, x)` of a `height x width` grid.
    pub fn grains_at(&self, y: usize, x: usize, height: usize, width: usize) -> Cell {
        match *self {
            InitialFill::Uniform { grains } => grains,
            InitialFill::CenterPile { grains } => {
                if y == height / 2 && x == width / 2 {
                    if grains == 0 {
                        height
                            .checked_mul(width)
                            .and_then(|cells| Cell::try_from(cells).ok())
                            .unwrap_or(Cell::MAX)
                    } else {
                        grains
                    }
                } else {
                    0
                }
            }
        }
    }
}

/// A full sandpile grid with its sink border.
///
/// Storage is row-major over `(height + 2) x (width + 2)` cells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandpileGrid {
    /// Interior rows.
    pub height: usize,
    /// Interior columns.
    pub width: usize,
    cells: Vec<Cell>,
}

impl SandpileGrid {
    /// Create an empty grid (all interior cells 0).
    pub fn new(height: usize, width: usize) -> Result<Self> {
        check_dimensions(height, width)?;
        let cells = try_zeroed("sandpile grid", padded_len("sandpile grid", height, width)?)?;
        Ok(Self {
            height,
            width,
            cells,
        })
    }

    /// Create a grid populated by `fill`.
    pub fn with_fill(height: usize, width: usize, fill: InitialFill) -> Result<Self> {
        let mut grid = Self::new(height, width)?;
        for y in 0..height {
            for x in 0..width {
                let idx = grid.idx(y, x);
                grid.cells[idx] = fill.grains_at(y, x, height, width);
            }
        }
        Ok(grid)
    }

    /// Create a grid from row-major interior values.
    pub fn from_interior(height: usize, width: usize, interior: &[Cell]) -> Result<Self> {
        if height.checked_mul(width) != Some(interior.len()) {
            return Err(SandpileError::config(format!(
                "interior has {} cells, expected {}x{}",
                interior.len(),
                height,
                width
            )));
        }
        let mut grid = Self::new(height, width)?;
        for (y, row) in interior.chunks_exact(width).enumerate() {
            let start = grid.idx(y, 0);
            grid.cells[start..start + width].copy_from_slice(row);
        }
        Ok(grid)
    }

    /// Padded row stride (`width + 2`).
    #[inline(always)]
    pub fn stride(&self) -> usize {
        self.width + 2
    }

    /// Buffer index of interior cell `(y, x)`.
    #[inline(always)]
    fn idx(&self, y: usize, x: usize) -> usize {
        (y + 1) * self.stride() + (x + 1)
    }

    /// Grain count at interior cell `(y, x)`.
    pub fn get(&self, y: usize, x: usize) -> Option<Cell> {
        if y < self.height && x < self.width {
            Some(self.cells[self.idx(y, x)])
        } else {
            None
        }
    }

    /// Overwrite interior cell `(y, x)`. Out-of-range writes are ignored so
    /// the sink border can never be touched.
    pub fn set(&mut self, y: usize, x: usize, grains: Cell) {
        if y < self.height && x < self.width {
            let idx = self.idx(y, x);
            self.cells[idx] = grains;
        }
    }

    /// Drop `grains` onto interior cell `(y, x)`.
    pub fn add_grains(&mut self, y: usize, x: usize, grains: Cell) {
        if y < self.height && x < self.width {
            let idx = self.idx(y, x);
            self.cells[idx] = self.cells[idx].saturating_add(grains);
        }
    }

    /// Interior row `y` including its two sink columns.
    pub fn padded_row(&self, y: usize) -> &[Cell] {
        let start = (y + 1) * self.stride();
        &self.cells[start..start + self.stride()]
    }

    /// Interior row `y` without sink columns.
    pub fn row(&self, y: usize) -> &[Cell] {
        let start = self.idx(y, 0);
        &self.cells[start..start + self.width]
    }

    /// Interior cells in row-major order.
    pub fn interior(&self) -> Vec<Cell> {
        let mut out = Vec::with_capacity(self.height * self.width);
        for y in 0..self.height {
            out.extend_from_slice(self.row(y));
        }
        out
    }

    /// Total grains on the interior.
    pub fn total_grains(&self) -> u64 {
        self.cells.iter().map(|&c| u64::from(c)).sum()
    }

    /// Whether no interior cell can topple.
    pub fn is_stable(&self) -> bool {
        (0..self.height).all(|y| self.row(y).iter().all(|&c| c < TOPPLE_THRESHOLD))
    }

    /// Whether every border cell still reads 0.
    pub fn sink_is_empty(&self) -> bool {
        let stride = self.stride();
        let last = self.height + 1;
        let rows_clear = self.cells[..stride].iter().all(|&c| c == 0)
            && self.cells[last * stride..].iter().all(|&c| c == 0);
        let cols_clear = (1..=self.height)
            .all(|y| self.cells[y * stride] == 0 && self.cells[y * stride + stride - 1] == 0);
        rows_clear && cols_clear
    }

    /// Number of interior cells.
    pub fn cell_count(&self) -> usize {
        self.height * self.width
    }
}

pub(crate) fn check_dimensions(height: usize, width: usize) -> Result<()> {
    if height == 0 || width == 0 {
        return Err(SandpileError::config(format!(
            "grid dimensions must be positive, got {}x{}",
            height, width
        )));
    }
    Ok(())
}
