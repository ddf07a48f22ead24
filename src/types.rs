use ndarray::{Array2, ArrayView2};
use num_traits::Float;
use serde::{Deserialize, Serialize};

/// Elevation or metric value
pub type Elevation = f64;

/// 2D elevation grid (rows x cols, origin top-left)
pub type ElevationGrid = Array2<Elevation>;

/// Read-only view into an elevation grid
pub type ElevationView<'a> = ArrayView2<'a, Elevation>;

/// 2D grid of computed metric values, same shape as the input
pub type MetricGrid = Array2<Elevation>;

/// No-data marker used throughout the engine
pub const NODATA: Elevation = f64::NAN;

/// Pixel spacing in linear units (meters)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpacing {
    /// Spacing along columns (x)
    pub dx: f64,
    /// Spacing along rows (y)
    pub dy: f64,
}

impl GridSpacing {
    /// Anisotropic spacing, both components must be finite and positive
    pub fn new(dx: f64, dy: f64) -> TopoResult<Self> {
        let spacing = Self { dx, dy };
        spacing.validate()?;
        Ok(spacing)
    }

    /// Square pixels
    pub fn isotropic(spacing: f64) -> TopoResult<Self> {
        Self::new(spacing, spacing)
    }

    pub fn validate(&self) -> TopoResult<()> {
        if !(self.dx.is_finite() && self.dx > 0.0 && self.dy.is_finite() && self.dy > 0.0) {
            return Err(TopoError::InvalidConfig(format!(
                "Grid spacing must be positive and finite, got ({}, {})",
                self.dx, self.dy
            )));
        }
        Ok(())
    }

    /// Area of a single cell
    pub fn cell_area(&self) -> f64 {
        self.dx * self.dy
    }

    /// Geometric mean spacing, used where a scalar spacing is required
    pub fn mean(&self) -> f64 {
        (self.dx * self.dy).sqrt()
    }

    pub fn is_isotropic(&self) -> bool {
        (self.dx - self.dy).abs() <= f64::EPSILON * self.dx.max(self.dy)
    }
}

/// Half-open rectangular region `[row_start, row_end) x [col_start, col_end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridRegion {
    pub row_start: usize,
    pub row_end: usize,
    pub col_start: usize,
    pub col_end: usize,
}

impl GridRegion {
    pub fn new(row_start: usize, row_end: usize, col_start: usize, col_end: usize) -> Self {
        Self {
            row_start,
            row_end,
            col_start,
            col_end,
        }
    }

    /// Region covering a whole grid of the given shape
    pub fn full(shape: (usize, usize)) -> Self {
        Self::new(0, shape.0, 0, shape.1)
    }

    pub fn rows(&self) -> usize {
        self.row_end.saturating_sub(self.row_start)
    }

    pub fn cols(&self) -> usize {
        self.col_end.saturating_sub(self.col_start)
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }

    pub fn len(&self) -> usize {
        self.rows() * self.cols()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row_start && row < self.row_end && col >= self.col_start && col < self.col_end
    }

    /// Intersection of two regions (possibly empty)
    pub fn intersect(&self, other: &GridRegion) -> GridRegion {
        let row_start = self.row_start.max(other.row_start);
        let col_start = self.col_start.max(other.col_start);
        GridRegion::new(
            row_start,
            self.row_end.min(other.row_end).max(row_start),
            col_start,
            self.col_end.min(other.col_end).max(col_start),
        )
    }

    /// Express this region relative to `origin`'s top-left corner
    pub fn relative_to(&self, origin: &GridRegion) -> GridRegion {
        GridRegion::new(
            self.row_start - origin.row_start,
            self.row_end - origin.row_start,
            self.col_start - origin.col_start,
            self.col_end - origin.col_start,
        )
    }

    /// Cells at least `border` cells away from every edge of a grid
    pub fn inset(shape: (usize, usize), border: usize) -> GridRegion {
        let (rows, cols) = shape;
        let row_end = rows.saturating_sub(border).max(border.min(rows));
        let col_end = cols.saturating_sub(border).max(border.min(cols));
        GridRegion::new(border.min(rows), row_end, border.min(cols), col_end)
    }
}

/// Elevation data handed over by the raster I/O collaborator
#[derive(Debug, Clone)]
pub struct DemInput {
    /// Elevations with no-data normalised to NaN
    pub elevation: ElevationGrid,
    pub spacing: GridSpacing,
}

impl DemInput {
    /// Build from an `f64` grid, converting `nodata` cells to NaN
    pub fn new(
        elevation: ElevationGrid,
        spacing: GridSpacing,
        nodata: Option<f64>,
    ) -> TopoResult<Self> {
        Self::from_array(elevation, spacing, nodata)
    }

    /// Build from any float grid (`f32` DEMs are common)
    pub fn from_array<T: Float>(
        data: Array2<T>,
        spacing: GridSpacing,
        nodata: Option<T>,
    ) -> TopoResult<Self> {
        spacing.validate()?;

        let (rows, cols) = data.dim();
        if rows == 0 || cols == 0 {
            return Err(TopoError::InvalidConfig(format!(
                "Elevation grid must not be empty, got {}x{}",
                rows, cols
            )));
        }

        let elevation = data.mapv(|v| {
            let is_sentinel = nodata.map_or(false, |nd| v == nd);
            if is_sentinel {
                NODATA
            } else {
                v.to_f64().unwrap_or(NODATA)
            }
        });

        Ok(Self { elevation, spacing })
    }

    pub fn shape(&self) -> (usize, usize) {
        self.elevation.dim()
    }

    pub fn view(&self) -> ElevationView<'_> {
        self.elevation.view()
    }

    /// Number of no-data cells in the input
    pub fn nodata_count(&self) -> usize {
        self.elevation.iter().filter(|v| v.is_nan()).count()
    }
}

/// Basic statistics over the valid cells of a grid
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GridStatistics {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
    pub valid_count: usize,
    pub nodata_count: usize,
}

impl GridStatistics {
    pub fn compute(grid: &ElevationGrid) -> Self {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;

        for &value in grid.iter() {
            if !value.is_finite() {
                continue;
            }
            min = min.min(value);
            max = max.max(value);
            sum += value;
            count += 1;
        }

        if count == 0 {
            return Self {
                nodata_count: grid.len(),
                ..Self::default()
            };
        }

        Self {
            min: Some(min),
            max: Some(max),
            mean: Some(sum / count as f64),
            valid_count: count,
            nodata_count: grid.len() - count,
        }
    }
}

/// Error types for terrain analysis
#[derive(Debug, thiserror::Error)]
pub enum TopoError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Window at ({row}, {col}) with half-width {halfwidth} exceeds grid bounds {rows}x{cols}")]
    OutOfBounds {
        row: usize,
        col: usize,
        halfwidth: usize,
        rows: usize,
        cols: usize,
    },

    #[error("Numerically degenerate window: {0}")]
    NumericDegenerate(String),

    #[error("Convolution failure: {0}")]
    ConvolutionFailure(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Run cancelled after {completed} of {total} work items")]
    Cancelled { completed: usize, total: usize },

    #[error("Processing error: {0}")]
    Processing(String),
}

impl TopoError {
    /// Fatal errors abort the whole run instead of degrading to no-data
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TopoError::InvalidConfig(_)
                | TopoError::OutOfBounds { .. }
                | TopoError::ShapeMismatch { .. }
                | TopoError::Cancelled { .. }
        )
    }
}

/// Result type for terrain analysis operations
pub type TopoResult<T> = Result<T, TopoError>;
