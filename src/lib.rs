//! topocomplexity: windowed terrain-complexity metrics for DEM rasters
//!
//! Computes per-pixel topographic position index, rugosity, fractal
//! dimension and Mexican-hat wavelet curvature over a digital elevation
//! model. Large grids are split into overlapping chunks that are evaluated
//! in parallel and reassembled into a single result grid without seams.
//!
//! ```no_run
//! use ndarray::Array2;
//! use topocomplexity::{analyze, AnalysisParams, DemInput, GridSpacing, Metric};
//!
//! let dem = Array2::<f32>::zeros((256, 256));
//! let input = DemInput::from_array(dem, GridSpacing::isotropic(10.0)?, Some(-9999.0))?;
//! let params = AnalysisParams {
//!     window_size: 9,
//!     ..AnalysisParams::for_metric(Metric::FractalDimension)
//! };
//! let output = analyze(&input, params)?;
//! println!("{:?}", output.report.statistics);
//! # Ok::<(), topocomplexity::TopoError>(())
//! ```

pub mod types;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    DemInput, Elevation, ElevationGrid, GridRegion, GridSpacing, GridStatistics, MetricGrid,
    TopoError, TopoResult, NODATA,
};

pub use crate::core::{
    analyze, AnalysisOutput, AnalysisParams, AnalysisReport, BorderPolicy, CancellationToken,
    ConvolutionMethod, EdgeMode, ExecutorParams, Metric, Parallelism, RugosityMethod,
    TerrainAnalyzer, WaveletParams, WaveletScale,
};
