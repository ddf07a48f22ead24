use super::assembler::{BorderPolicy, ResultAssembler};
use super::executor::{
    CancellationToken, ExecutorParams, ItemOutcome, ParallelExecutor, ProgressCallback,
    ProgressCounter,
};
use super::kernel::{ChunkResult, Metric, WindowedKernel};
use super::partition::{Chunk, ChunkPartitioner};
use super::wavelet::{WaveletConvolver, WaveletScale};
use super::window::EdgeMode;
use crate::types::{DemInput, GridStatistics, MetricGrid, TopoError, TopoResult, NODATA};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Parameters for a terrain analysis run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisParams {
    pub metric: Metric,
    /// Window side in cells (odd)
    pub window_size: usize,
    /// Chunk interior side in cells, read with a `window_size / 2` overlap
    /// border; `None` processes the grid as a single chunk
    pub chunk_size: Option<usize>,
    /// Overrides the metric's native edge mode
    pub edge_mode: Option<EdgeMode>,
    pub border: BorderPolicy,
    pub executor: ExecutorParams,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            metric: Metric::Tpi,
            window_size: 3,
            chunk_size: Some(512),
            edge_mode: None,
            border: BorderPolicy::Mask,
            executor: ExecutorParams::default(),
        }
    }
}

impl AnalysisParams {
    /// Parameters for a metric with the default window and chunking
    pub fn for_metric(metric: Metric) -> Self {
        Self {
            metric,
            ..Self::default()
        }
    }

    pub fn window_radius(&self) -> usize {
        self.window_size / 2
    }

    /// Edge mode actually used by windowed metrics
    pub fn effective_edge_mode(&self) -> EdgeMode {
        self.edge_mode.unwrap_or_else(|| self.metric.native_edge_mode())
    }

    /// Check the configuration before any work starts
    pub fn validate(&self) -> TopoResult<()> {
        self.executor.validate()?;

        if let Metric::Wavelet(wavelet) = &self.metric {
            // Scale is resolved against the grid spacing at run time
            let value = match wavelet.scale {
                WaveletScale::Scale(s) | WaveletScale::Wavelength(s) => s,
            };
            if !(value.is_finite() && value > 0.0) {
                return Err(TopoError::InvalidConfig(format!(
                    "wavelet scale must be positive and finite, got {:?}",
                    wavelet.scale
                )));
            }
            return Ok(());
        }

        if self.window_size == 0 || self.window_size % 2 == 0 {
            return Err(TopoError::InvalidConfig(format!(
                "window_size must be a positive odd number, got {}",
                self.window_size
            )));
        }

        let min_size = self.metric.min_window_size();
        if self.window_size < min_size {
            return Err(TopoError::InvalidConfig(format!(
                "{} needs window_size >= {}, got {}",
                self.metric.name(),
                min_size,
                self.window_size
            )));
        }

        if let Some(chunk_size) = self.chunk_size {
            if chunk_size <= 2 * self.window_radius() {
                return Err(TopoError::InvalidConfig(format!(
                    "chunk_size {} must exceed twice the window radius ({})",
                    chunk_size,
                    2 * self.window_radius()
                )));
            }
        }

        Ok(())
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    pub metric: &'static str,
    pub shape: (usize, usize),
    /// Work items dispatched (chunks, or the FFT pass plus one per
    /// direct-convolution row)
    pub work_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub timed_out_items: usize,
    /// Cells left as no-data by degenerate windows
    pub degenerate_cells: usize,
    /// Cells recomputed by direct convolution
    pub fallback_cells: usize,
    /// Valid-region cells the convolution left as no-data
    pub unrecovered_cells: usize,
    /// Width of the no-data border
    pub border_width: usize,
    /// Window side in linear units (`spacing x window_size`)
    pub window_size_m: f64,
    pub elapsed: Duration,
    pub statistics: GridStatistics,
}

/// Result grid plus its run report
#[derive(Debug, Clone)]
pub struct AnalysisOutput {
    /// Same shape as the input, NaN for no-data
    pub result: MetricGrid,
    pub report: AnalysisReport,
}

impl AnalysisOutput {
    /// Result with NaN replaced by a caller-supplied sentinel
    pub fn to_array_with_nodata(&self, nodata: f64) -> MetricGrid {
        self.result.mapv(|v| if v.is_nan() { nodata } else { v })
    }
}

/// Windowed terrain-complexity analysis over a DEM
///
/// Partitions the grid into overlapping chunks, evaluates the selected
/// metric over each chunk in parallel and assembles the chunk interiors into
/// the output grid. The wavelet metric convolves the whole grid instead.
pub struct TerrainAnalyzer {
    params: AnalysisParams,
    executor: ParallelExecutor,
    convolver: Option<WaveletConvolver>,
}

impl TerrainAnalyzer {
    /// Create an analyzer; the configuration is validated here
    pub fn new(params: AnalysisParams) -> TopoResult<Self> {
        params.validate()?;

        log::debug!("Terrain analysis configuration: {:?}", params);

        let convolver = match params.metric {
            Metric::Wavelet(wavelet) => Some(WaveletConvolver::new(wavelet)),
            _ => None,
        };

        Ok(Self {
            executor: ParallelExecutor::new(params.executor.clone()),
            convolver,
            params,
        })
    }

    /// TPI over a 3x3 window
    pub fn standard() -> TopoResult<Self> {
        Self::new(AnalysisParams::default())
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.executor = self.executor.with_cancellation(token);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.executor = self.executor.with_progress_callback(callback);
        self
    }

    pub fn params(&self) -> &AnalysisParams {
        &self.params
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.executor.cancellation_token()
    }

    pub fn progress(&self) -> ProgressCounter {
        self.executor.progress()
    }

    /// Run the analysis
    pub fn analyze(&self, input: &DemInput) -> TopoResult<AnalysisOutput> {
        input.spacing.validate()?;
        let shape = input.shape();
        let start = Instant::now();

        log::info!(
            "Computing {} over {}x{} grid (window {}, spacing {}x{})",
            self.params.metric.name(),
            shape.0,
            shape.1,
            self.params.window_size,
            input.spacing.dx,
            input.spacing.dy
        );

        let (result, mut report) = match &self.convolver {
            Some(convolver) => self.analyze_wavelet(convolver, input)?,
            None => self.analyze_windowed(input)?,
        };

        report.elapsed = start.elapsed();
        report.statistics = GridStatistics::compute(&result);

        log::info!(
            "{} complete in {:.2}s: {} valid cells, {} no-data",
            report.metric,
            report.elapsed.as_secs_f64(),
            report.statistics.valid_count,
            report.statistics.nodata_count
        );

        Ok(AnalysisOutput { result, report })
    }

    fn analyze_windowed(&self, input: &DemInput) -> TopoResult<(MetricGrid, AnalysisReport)> {
        let shape = input.shape();
        let radius = self.params.window_radius();

        let partitioner = match self.params.chunk_size {
            Some(chunk_size) => ChunkPartitioner::new(shape, radius, chunk_size)?,
            None => ChunkPartitioner::single(shape, radius),
        };
        let chunks: Vec<Chunk> = partitioner.iter().collect();

        log::debug!(
            "Partitioned into {} chunks ({:?} lattice, stride {})",
            chunks.len(),
            partitioner.lattice(),
            partitioner.stride()
        );

        let kernel = WindowedKernel::new(self.params.metric, self.params.window_size, input.spacing)?
            .with_edge_mode(self.params.effective_edge_mode());
        let grid = input.view();

        let execution = self
            .executor
            .execute(&chunks, |chunk| kernel.evaluate_chunk(grid, chunk))?;
        let (completed_items, failed_items, timed_out_items) =
            (execution.completed(), execution.failed(), execution.timed_out());

        let mut assembler = ResultAssembler::new(shape, radius, self.params.border);
        let mut degenerate_cells = 0;
        for (index, outcome) in execution.outcomes {
            let chunk = chunks[index];
            match outcome {
                ItemOutcome::Completed(result) => {
                    degenerate_cells += result.degenerate;
                    assembler.write(&result)?;
                }
                ItemOutcome::Failed(e) if e.is_fatal() => return Err(e),
                other => {
                    log::warn!(
                        "Chunk {} ({:?}) produced no result ({}); leaving it as no-data",
                        index,
                        chunk.interior,
                        describe_outcome(&other)
                    );
                    assembler.write(&ChunkResult {
                        chunk,
                        values: MetricGrid::from_elem(chunk.shape(), NODATA),
                        degenerate: 0,
                    })?;
                }
            }
        }

        let report = AnalysisReport {
            metric: self.params.metric.name(),
            shape,
            work_items: chunks.len(),
            completed_items,
            failed_items,
            timed_out_items,
            degenerate_cells,
            fallback_cells: 0,
            unrecovered_cells: 0,
            border_width: radius,
            window_size_m: input.spacing.mean() * self.params.window_size as f64,
            elapsed: Duration::ZERO,
            statistics: GridStatistics::default(),
        };

        Ok((assembler.finish(), report))
    }

    fn analyze_wavelet(
        &self,
        convolver: &WaveletConvolver,
        input: &DemInput,
    ) -> TopoResult<(MetricGrid, AnalysisReport)> {
        let shape = input.shape();
        if !input.spacing.is_isotropic() {
            log::warn!(
                "Wavelet convolution assumes square pixels; using mean spacing {}",
                input.spacing.mean()
            );
        }
        let spacing = input.spacing.mean();

        let outcome = convolver.convolve(input.view(), spacing, &self.executor)?;

        let mut assembler = ResultAssembler::new(shape, outcome.border, self.params.border);
        assembler.write_grid(&outcome.values)?;

        let kernel = convolver.kernel(spacing)?;
        let report = AnalysisReport {
            metric: self.params.metric.name(),
            shape,
            work_items: outcome.work_items,
            completed_items: outcome.completed_items,
            failed_items: outcome.failed_items,
            timed_out_items: outcome.timed_out_items,
            degenerate_cells: 0,
            fallback_cells: outcome.fallback_cells,
            unrecovered_cells: outcome.unrecovered_cells,
            border_width: outcome.border,
            window_size_m: spacing * kernel.values().nrows() as f64,
            elapsed: Duration::ZERO,
            statistics: GridStatistics::default(),
        };

        Ok((assembler.finish(), report))
    }
}

fn describe_outcome<T>(outcome: &ItemOutcome<T>) -> String {
    match outcome {
        ItemOutcome::Completed(_) => "completed".to_string(),
        ItemOutcome::Failed(e) => e.to_string(),
        ItemOutcome::Panicked(message) => format!("panicked: {}", message),
        ItemOutcome::TimedOut(elapsed) => format!("over budget after {:.3}s", elapsed.as_secs_f64()),
    }
}

/// Analyze `input` with `params` in one call
pub fn analyze(input: &DemInput, params: AnalysisParams) -> TopoResult<AnalysisOutput> {
    TerrainAnalyzer::new(params)?.analyze(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::executor::Parallelism;
    use crate::core::rugosity::RugosityMethod;
    use crate::core::wavelet::WaveletParams;
    use crate::types::GridSpacing;
    use ndarray::Array2;

    fn input(grid: Array2<f64>) -> DemInput {
        DemInput::new(grid, GridSpacing::isotropic(1.0).unwrap(), None).unwrap()
    }

    #[test]
    fn test_validate_rejects_bad_windows() {
        let even = AnalysisParams {
            window_size: 4,
            ..AnalysisParams::default()
        };
        assert!(matches!(even.validate(), Err(TopoError::InvalidConfig(_))));

        let small_fractal = AnalysisParams {
            metric: Metric::FractalDimension,
            window_size: 3,
            ..AnalysisParams::default()
        };
        assert!(small_fractal.validate().is_err());

        let small_chunk = AnalysisParams {
            window_size: 5,
            chunk_size: Some(4),
            ..AnalysisParams::default()
        };
        assert!(TerrainAnalyzer::new(small_chunk).is_err());

        let bad_wavelet = AnalysisParams::for_metric(Metric::Wavelet(WaveletParams {
            scale: WaveletScale::Wavelength(-1.0),
            ..WaveletParams::default()
        }));
        assert!(bad_wavelet.validate().is_err());
    }

    #[test]
    fn test_effective_edge_mode() {
        let params = AnalysisParams::for_metric(Metric::Rugosity {
            method: RugosityMethod::ArcChord,
        });
        assert_eq!(params.effective_edge_mode(), EdgeMode::Reject);

        let params = AnalysisParams {
            edge_mode: Some(EdgeMode::Mask),
            ..params
        };
        assert_eq!(params.effective_edge_mode(), EdgeMode::Mask);
    }

    #[test]
    fn test_flat_tpi_report() {
        let params = AnalysisParams {
            chunk_size: Some(4),
            executor: ExecutorParams {
                parallelism: Parallelism::Sequential,
                item_budget: None,
            },
            ..AnalysisParams::default()
        };
        let output = analyze(&input(Array2::from_elem((6, 6), 10.0)), params).unwrap();

        assert_eq!(output.report.work_items, 4);
        assert_eq!(output.report.completed_items, 4);
        assert_eq!(output.report.border_width, 1);
        assert_eq!(output.report.statistics.valid_count, 16);
        assert_eq!(output.report.statistics.max, Some(0.0));
        assert_eq!(output.report.window_size_m, 3.0);
    }

    #[test]
    fn test_nodata_sentinel_encoding() {
        let output = analyze(&input(Array2::from_elem((4, 4), 1.0)), AnalysisParams::default()).unwrap();
        let encoded = output.to_array_with_nodata(-9999.0);
        assert_eq!(encoded[[0, 0]], -9999.0);
        assert_eq!(encoded[[1, 1]], 0.0);
    }

    #[test]
    fn test_wavelet_border() {
        let params = AnalysisParams::for_metric(Metric::Wavelet(WaveletParams {
            scale: WaveletScale::Scale(1.0),
            ..WaveletParams::default()
        }));
        let output = analyze(&input(Array2::from_elem((20, 20), 5.0)), params).unwrap();

        assert_eq!(output.report.border_width, 4);
        assert_eq!(output.report.statistics.valid_count, 12 * 12);
        assert!(output.result[[3, 10]].is_nan());
        assert!(output.result[[4, 10]].is_finite());
    }
}
