//! Metric selection and per-chunk window evaluation
//!
//! Windowed metrics (TPI, rugosity, fractal dimension) are pure functions of
//! a single [`Window`]; a chunk is evaluated by sliding that function over
//! the chunk interior. The wavelet metric convolves the whole grid at once
//! and is handled by [`super::wavelet`].

use super::fractal::fractal_dimension;
use super::partition::Chunk;
use super::rugosity::{rugosity, RugosityMethod};
use super::tpi::tpi;
use super::wavelet::WaveletParams;
use super::window::{extract_window, window_fits, EdgeMode, Window};
use crate::types::{ElevationGrid, ElevationView, GridSpacing, TopoError, TopoResult, NODATA};
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

/// Terrain metric selected at configuration time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    /// Topographic Position Index
    Tpi,
    Rugosity {
        #[serde(default)]
        method: RugosityMethod,
    },
    FractalDimension,
    /// Mexican-hat wavelet curvature
    Wavelet(WaveletParams),
}

impl Default for Metric {
    fn default() -> Self {
        Metric::Tpi
    }
}

impl Metric {
    pub fn name(&self) -> &'static str {
        match self {
            Metric::Tpi => "tpi",
            Metric::Rugosity { .. } => "rugosity",
            Metric::FractalDimension => "fractal_dimension",
            Metric::Wavelet(_) => "wavelet",
        }
    }

    /// Whether the metric is evaluated window by window
    pub fn is_windowed(&self) -> bool {
        !matches!(self, Metric::Wavelet(_))
    }

    /// Edge handling the metric uses unless overridden
    pub fn native_edge_mode(&self) -> EdgeMode {
        match self {
            Metric::Tpi => EdgeMode::Clamp,
            _ => EdgeMode::Reject,
        }
    }

    /// Smallest window side the metric can work with
    pub fn min_window_size(&self) -> usize {
        match self {
            Metric::Tpi | Metric::Wavelet(_) => 1,
            Metric::Rugosity { .. } => 3,
            Metric::FractalDimension => 5,
        }
    }

    /// Evaluate a windowed metric
    ///
    /// `NumericDegenerate` marks a pixel as no-data; other errors are fatal.
    pub fn evaluate(&self, window: &Window, spacing: GridSpacing) -> TopoResult<f64> {
        match self {
            Metric::Tpi => Ok(tpi(window)),
            Metric::Rugosity { method } => rugosity(window, spacing, *method),
            Metric::FractalDimension => fractal_dimension(window),
            Metric::Wavelet(_) => Err(TopoError::InvalidConfig(
                "wavelet convolution is not a windowed metric".to_string(),
            )),
        }
    }
}

/// Windowed evaluation settings shared by every chunk of a run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowedKernel {
    pub metric: Metric,
    pub halfwidth: usize,
    pub edge_mode: EdgeMode,
    pub spacing: GridSpacing,
}

impl WindowedKernel {
    pub fn new(metric: Metric, window_size: usize, spacing: GridSpacing) -> TopoResult<Self> {
        if !metric.is_windowed() {
            return Err(TopoError::InvalidConfig(format!(
                "metric '{}' is not windowed",
                metric.name()
            )));
        }
        if window_size % 2 == 0 {
            return Err(TopoError::InvalidConfig(format!(
                "window_size must be odd, got {}",
                window_size
            )));
        }
        Ok(Self {
            metric,
            halfwidth: window_size / 2,
            edge_mode: metric.native_edge_mode(),
            spacing,
        })
    }

    pub fn with_edge_mode(mut self, edge_mode: EdgeMode) -> Self {
        self.edge_mode = edge_mode;
        self
    }

    /// Evaluate every interior cell of `chunk`
    ///
    /// `grid` is the full input grid; only the chunk extent is read. With
    /// `EdgeMode::Reject`, cells whose window leaves the grid are skipped
    /// and stay no-data.
    pub fn evaluate_chunk(&self, grid: ElevationView<'_>, chunk: &Chunk) -> TopoResult<ChunkResult> {
        let extent = chunk.extent;
        let local = grid.slice(s![
            extent.row_start..extent.row_end,
            extent.col_start..extent.col_end
        ]);
        let interior = chunk.interior_local();
        let mut values = Array2::from_elem(chunk.shape(), NODATA);
        let mut degenerate = 0;

        for i in interior.row_start..interior.row_end {
            for j in interior.col_start..interior.col_end {
                let (gi, gj) = chunk.to_global(i, j);
                if self.edge_mode == EdgeMode::Reject
                    && !window_fits(grid.dim(), gi, gj, self.halfwidth)
                {
                    continue;
                }

                // Extent edges coincide with grid edges wherever a window can
                // reach them, so local and global extraction agree
                let window = extract_window(local, i, j, self.halfwidth, self.edge_mode)?;
                match self.metric.evaluate(&window, self.spacing) {
                    Ok(value) => values[[i, j]] = value,
                    Err(TopoError::NumericDegenerate(reason)) => {
                        log::trace!("Cell ({}, {}) degenerate: {}", gi, gj, reason);
                        degenerate += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(ChunkResult {
            chunk: *chunk,
            values,
            degenerate,
        })
    }
}

/// Output of one chunk, shaped like the chunk extent
///
/// Only the interior holds results; the overlap ring is no-data.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub chunk: Chunk,
    pub values: ElevationGrid,
    /// Cells left as no-data by a degenerate window
    pub degenerate: usize,
}
