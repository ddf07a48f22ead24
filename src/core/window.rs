use crate::types::{ElevationView, TopoError, TopoResult, NODATA};
use ndarray::{s, Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// How a window treats cells that fall outside the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeMode {
    /// Replicate the nearest valid pixel (moving-average filters)
    Clamp,
    /// Refuse with `OutOfBounds`
    Reject,
    /// Read outside cells as no-data
    Mask,
}

/// Square neighborhood of side `2 * halfwidth + 1` copied out of a grid
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    values: Array2<f64>,
    center: (usize, usize),
    halfwidth: usize,
}

impl Window {
    /// Wrap an already-extracted square array, centered at its middle cell
    pub fn from_array(values: Array2<f64>) -> TopoResult<Self> {
        let (rows, cols) = values.dim();
        if rows != cols || rows % 2 == 0 {
            return Err(TopoError::InvalidConfig(format!(
                "Centered windows must be square with an odd side, got {}x{}",
                rows, cols
            )));
        }
        let halfwidth = rows / 2;
        Ok(Self {
            values,
            center: (halfwidth, halfwidth),
            halfwidth,
        })
    }

    /// Side length `N`
    pub fn size(&self) -> usize {
        2 * self.halfwidth + 1
    }

    pub fn halfwidth(&self) -> usize {
        self.halfwidth
    }

    /// Center coordinate in the source grid
    pub fn center(&self) -> (usize, usize) {
        self.center
    }

    pub fn center_value(&self) -> f64 {
        self.values[[self.halfwidth, self.halfwidth]]
    }

    pub fn values(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }

    pub fn has_nodata(&self) -> bool {
        self.values.iter().any(|v| v.is_nan())
    }

    /// Plain arithmetic mean over all cells, NaN if any cell is no-data
    pub fn mean(&self) -> f64 {
        let sum: f64 = self.values.iter().sum();
        sum / self.values.len() as f64
    }
}

/// Whether a centered window fits entirely inside a grid of `shape`
pub fn window_fits(shape: (usize, usize), row: usize, col: usize, halfwidth: usize) -> bool {
    let (rows, cols) = shape;
    row >= halfwidth && col >= halfwidth && row + halfwidth < rows && col + halfwidth < cols
}

/// Extract the neighborhood of `(center_row, center_col)` from `grid`
pub fn extract_window(
    grid: ElevationView<'_>,
    center_row: usize,
    center_col: usize,
    halfwidth: usize,
    edge_mode: EdgeMode,
) -> TopoResult<Window> {
    let (rows, cols) = grid.dim();
    let out_of_bounds = || TopoError::OutOfBounds {
        row: center_row,
        col: center_col,
        halfwidth,
        rows,
        cols,
    };

    if center_row >= rows || center_col >= cols {
        return Err(out_of_bounds());
    }

    let size = 2 * halfwidth + 1;

    let values = if window_fits((rows, cols), center_row, center_col, halfwidth) {
        grid.slice(s![
            center_row - halfwidth..=center_row + halfwidth,
            center_col - halfwidth..=center_col + halfwidth
        ])
        .to_owned()
    } else {
        match edge_mode {
            EdgeMode::Reject => return Err(out_of_bounds()),
            EdgeMode::Clamp => Array2::from_shape_fn((size, size), |(wi, wj)| {
                let r = (center_row + wi).saturating_sub(halfwidth).min(rows - 1);
                let c = (center_col + wj).saturating_sub(halfwidth).min(cols - 1);
                grid[[r, c]]
            }),
            EdgeMode::Mask => Array2::from_shape_fn((size, size), |(wi, wj)| {
                let r = (center_row + wi) as isize - halfwidth as isize;
                let c = (center_col + wj) as isize - halfwidth as isize;
                if r < 0 || c < 0 || r >= rows as isize || c >= cols as isize {
                    NODATA
                } else {
                    grid[[r as usize, c as usize]]
                }
            }),
        }
    };

    Ok(Window {
        values,
        center: (center_row, center_col),
        halfwidth,
    })
}
