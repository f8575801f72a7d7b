//! Fixed-shape 2-D grids holding one value per sensor cell.
//!
//! Cells are stored row-major, so cell `(r, c)` lives at `r * COLS + c`. This
//! is the same layout a C-ordered `(ROWS, COLS)` array has on disk, which keeps
//! persisting a grid a straight copy.

use crate::mat::{COLS, FRAME_SIZE, ROWS};

use ndarray::Array2;
use std::{
    fmt::{self, Write},
    ops::{Index, IndexMut},
};

/// One raw sample of the mat, as reported by the ADCs.
pub type SensorGrid = Grid<u8>;

/// One calibrated sample of the mat, in pascals.
pub type CalibratedGrid = Grid<f64>;

/// A `ROWS x COLS` grid of values.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    cells: Vec<T>,
}

impl<T: Copy> Grid<T> {
    /// A grid with every cell set to `value`.
    pub fn filled(value: T) -> Self {
        Grid {
            cells: vec![value; FRAME_SIZE],
        }
    }

    /// Builds a grid by calling `f(row, col)` for every cell.
    pub fn from_fn(mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut cells = Vec::with_capacity(FRAME_SIZE);
        for r in 0..ROWS {
            for c in 0..COLS {
                cells.push(f(r, c));
            }
        }
        Grid { cells }
    }

    /// Wraps a row-major vector of cells, returning `None` when it does not
    /// hold exactly one value per cell.
    pub fn from_vec(cells: Vec<T>) -> Option<Self> {
        (cells.len() == FRAME_SIZE).then_some(Grid { cells })
    }

    /// Applies `f` to every cell, producing a new grid of the same shape.
    pub fn map<U: Copy>(&self, f: impl FnMut(T) -> U) -> Grid<U> {
        Grid {
            cells: self.cells.iter().copied().map(f).collect(),
        }
    }
}

impl<T> Grid<T> {
    /// The cells in row-major order.
    pub fn as_slice(&self) -> &[T] {
        &self.cells
    }

    /// Mutable access to the cells in row-major order.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.cells
    }

    /// Iterates over the cells in row-major order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.cells.iter()
    }

    /// A `(ROWS, COLS)` array of the cells.
    pub fn to_array(&self) -> Array2<T>
    where
        T: Copy,
    {
        Array2::from_shape_fn((ROWS, COLS), |(r, c)| self[(r, c)])
    }
}

impl<T: Copy + PartialOrd> Grid<T> {
    /// The `(row, col)` of the largest cell. Ties resolve to the first cell in
    /// row-major order.
    pub fn argmax(&self) -> (usize, usize) {
        let mut best = 0;
        for (i, v) in self.cells.iter().enumerate() {
            if *v > self.cells[best] {
                best = i;
            }
        }
        (best / COLS, best % COLS)
    }
}

impl<T> Index<(usize, usize)> for Grid<T> {
    type Output = T;

    fn index(&self, (r, c): (usize, usize)) -> &T {
        &self.cells[r * COLS + c]
    }
}

impl<T> IndexMut<(usize, usize)> for Grid<T> {
    fn index_mut(&mut self, (r, c): (usize, usize)) -> &mut T {
        &mut self.cells[r * COLS + c]
    }
}

/// How a single cell is printed when rendering a grid as text.
pub trait CellFormat: Copy + PartialOrd {
    /// Appends the cell to `out`.
    fn write_cell(&self, out: &mut String) -> fmt::Result;
}

impl CellFormat for u8 {
    fn write_cell(&self, out: &mut String) -> fmt::Result {
        write!(out, "{:03}", self)
    }
}

impl CellFormat for f64 {
    fn write_cell(&self, out: &mut String) -> fmt::Result {
        write!(out, "{:3.2}", self)
    }
}

const HIGHLIGHT_ON: &str = "\x1b[1;92m";
const HIGHLIGHT_OFF: &str = "\x1b[0m";

impl<T: CellFormat> Grid<T> {
    /// Renders the grid one row per line. With `highlight_max` the largest
    /// cell is wrapped in ANSI colour codes.
    pub fn render(&self, highlight_max: bool) -> Result<String, fmt::Error> {
        let max = highlight_max.then(|| self.argmax());
        let mut out = String::new();
        for r in 0..ROWS {
            for c in 0..COLS {
                if c > 0 {
                    out.push(' ');
                }
                let highlighted = max == Some((r, c));
                if highlighted {
                    out.push_str(HIGHLIGHT_ON);
                }
                self[(r, c)].write_cell(&mut out)?;
                if highlighted {
                    out.push_str(HIGHLIGHT_OFF);
                }
            }
            out.push('\n');
        }
        Ok(out)
    }
}

impl<T: CellFormat> fmt::Display for Grid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(false)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_fn_is_row_major() {
        let grid = Grid::from_fn(|r, c| (r * COLS + c) as u32);
        assert_eq!(grid[(0, 0)], 0);
        assert_eq!(grid[(0, COLS - 1)], (COLS - 1) as u32);
        assert_eq!(grid[(1, 0)], COLS as u32);
        assert_eq!(grid.as_slice()[COLS + 3], grid[(1, 3)]);
    }

    #[test]
    fn array_keeps_cell_positions() {
        let grid = Grid::from_fn(|r, c| (r * COLS + c) as f64);
        let array = grid.to_array();
        assert_eq!(array.shape(), &[ROWS, COLS]);
        assert_eq!(array[[3, 7]], grid[(3, 7)]);
        assert_eq!(array[[ROWS - 1, 0]], grid[(ROWS - 1, 0)]);
    }

    #[test]
    fn from_vec_rejects_wrong_length() {
        assert!(Grid::from_vec(vec![0u8; FRAME_SIZE - 1]).is_none());
        assert!(Grid::from_vec(vec![0u8; FRAME_SIZE]).is_some());
    }

    #[test]
    fn argmax_finds_the_peak() {
        let mut grid = SensorGrid::filled(3);
        grid[(17, 40)] = 200;
        assert_eq!(grid.argmax(), (17, 40));
    }

    #[test]
    fn render_has_one_line_per_row() {
        let grid = SensorGrid::filled(7);
        let text = grid.to_string();
        assert_eq!(text.lines().count(), ROWS);
        assert!(text.lines().all(|l| l.split(' ').count() == COLS));
        assert!(text.starts_with("007 007"));
    }

    #[test]
    fn render_highlights_only_the_max() {
        let mut grid = CalibratedGrid::filled(0.0);
        grid[(2, 5)] = 12.5;
        let text = grid.render(true).unwrap();
        assert_eq!(text.matches(HIGHLIGHT_ON).count(), 1);
        assert!(text.contains(&format!("{HIGHLIGHT_ON}12.50{HIGHLIGHT_OFF}")));
    }
}
