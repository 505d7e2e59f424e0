//! Binary PPM (P6) rendering of a stable grid.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use sandpile_core::simulation::Cell;
use sandpile_core::StableGrid;

/// RGB color for a cell value.
pub fn color(cell: Cell) -> [u8; 3] {
    match cell {
        1 => [0, 255, 0],
        2 => [0, 0, 255],
        3 => [255, 0, 0],
        _ => [0, 0, 0],
    }
}

/// Write `grid` as P6 to `writer`.
pub fn write_ppm<W: Write>(writer: &mut W, grid: &StableGrid) -> io::Result<()> {
    write!(writer, "P6\n{} {}\n255\n", grid.width(), grid.height())?;
    for row in grid.rows() {
        let pixels: Vec<u8> = row.iter().flat_map(|&c| color(c)).collect();
        writer.write_all(&pixels)?;
    }
    writer.flush()
}

/// Write `grid` to the file at `path`.
pub fn save_ppm(path: &Path, grid: &StableGrid) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_ppm(&mut writer, grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandpile_core::simulation::{partition_rows, ResultAssembler};

    fn grid(height: usize, width: usize, cells: &[Cell]) -> StableGrid {
        let bands = partition_rows(height, width, 1).unwrap();
        let mut assembler = ResultAssembler::new(&bands, width).unwrap();
        assembler.contribute(0, cells).unwrap();
        assembler.finish().unwrap()
    }

    #[test]
    fn test_palette() {
        assert_eq!(color(0), [0, 0, 0]);
        assert_eq!(color(1), [0, 255, 0]);
        assert_eq!(color(2), [0, 0, 255]);
        assert_eq!(color(3), [255, 0, 0]);
        assert_eq!(color(9), [0, 0, 0]);
    }

    #[test]
    fn test_header_and_pixels() {
        let grid = grid(1, 3, &[1, 3, 0]);
        let mut out = Vec::new();
        write_ppm(&mut out, &grid).unwrap();

        let header = b"P6\n3 1\n255\n";
        assert_eq!(&out[..header.len()], header);
        assert_eq!(&out[header.len()..], &[0, 255, 0, 255, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_width_precedes_height() {
        let grid = grid(2, 1, &[2, 2]);
        let mut out = Vec::new();
        write_ppm(&mut out, &grid).unwrap();

        assert!(out.starts_with(b"P6\n1 2\n255\n"));
        assert_eq!(out.len(), 11 + 2 * 3);
    }
}
