//! Core terrain analysis modules

pub mod window;
pub mod partition;
pub mod tpi;
pub mod rugosity;
pub mod fractal;
pub mod wavelet;
pub mod kernel;
pub mod executor;
pub mod assembler;
pub mod analyzer;

// Re-export main types
pub use window::{extract_window, EdgeMode, Window};
pub use partition::{partition, Chunk, ChunkIter, ChunkPartitioner};
pub use rugosity::{PlaneFit, RugosityMethod};
pub use fractal::{linear_regression, LinearFit};
pub use wavelet::{
    scale_from_wavelength, ConvolutionMethod, WaveletConvolver, WaveletKernel, WaveletKernelCache,
    WaveletParams, WaveletScale,
};
pub use kernel::{ChunkResult, Metric, WindowedKernel};
pub use executor::{
    CancellationToken, ExecutionReport, ExecutorParams, ItemOutcome, ParallelExecutor,
    Parallelism, ProgressCallback, ProgressCounter,
};
pub use assembler::{BorderPolicy, ResultAssembler};
pub use analyzer::{analyze, AnalysisOutput, AnalysisParams, AnalysisReport, TerrainAnalyzer};
