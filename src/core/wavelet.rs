use super::executor::{ItemOutcome, ParallelExecutor};
use crate::types::{ElevationGrid, ElevationView, GridRegion, TopoError, TopoResult, NODATA};
use ndarray::{s, Array2, Axis};
use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};

/// How the wavelet scale is specified
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveletScale {
    /// Dimensionless scale `s` (in pixels)
    Scale(f64),
    /// Target wavelength `λ` in linear units
    Wavelength(f64),
}

impl WaveletScale {
    /// Dimensionless scale for a grid with the given spacing
    pub fn resolve(&self, spacing: f64) -> TopoResult<f64> {
        let scale = match *self {
            WaveletScale::Scale(s) => s,
            WaveletScale::Wavelength(wavelength) => scale_from_wavelength(wavelength, spacing),
        };

        if !scale.is_finite() || scale <= 0.0 {
            return Err(TopoError::InvalidConfig(format!(
                "wavelet scale must be positive and finite, got {} from {:?}",
                scale, self
            )));
        }
        Ok(scale)
    }
}

/// `s = (λ / Δ) * sqrt(5/2) / (2π)`
pub fn scale_from_wavelength(wavelength: f64, spacing: f64) -> f64 {
    (wavelength / spacing) * 2.5f64.sqrt() / (2.0 * PI)
}

/// Inverse of [`scale_from_wavelength`]
pub fn wavelength_from_scale(scale: f64, spacing: f64) -> f64 {
    scale * spacing * 2.0 * PI / 2.5f64.sqrt()
}

/// Convolution backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvolutionMethod {
    #[default]
    Fft,
    /// Slow reference path, also used as the FFT fallback
    Direct,
}

/// Mexican-hat wavelet parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveletParams {
    pub scale: WaveletScale,
    pub method: ConvolutionMethod,
}

impl Default for WaveletParams {
    fn default() -> Self {
        Self {
            scale: WaveletScale::Scale(2.0),
            method: ConvolutionMethod::Fft,
        }
    }
}

/// Mexican-hat point-spread function at pixel offset `(x, y)`
pub fn mexican_hat(x: f64, y: f64, scale: f64, spacing: f64) -> f64 {
    let r2 = (x * x + y * y) / (2.0 * scale * scale);
    -(1.0 / (PI * (scale * spacing).powi(4))) * (1.0 - r2) * (-r2).exp()
}

/// Kernel support half-width, `ceil(8s)`
pub fn kernel_radius(scale: f64) -> usize {
    (8.0 * scale).ceil() as usize
}

/// Width of the invalid border, `ceil(4s)`
pub fn border_width(scale: f64) -> usize {
    (4.0 * scale).ceil() as usize
}

/// Sampled Mexican-hat kernel on integer offsets `-R..=R`
#[derive(Debug, Clone, PartialEq)]
pub struct WaveletKernel {
    scale: f64,
    spacing: f64,
    radius: usize,
    values: Array2<f64>,
}

impl WaveletKernel {
    pub fn new(scale: f64, spacing: f64) -> TopoResult<Self> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(TopoError::InvalidConfig(format!("invalid wavelet scale {}", scale)));
        }
        if !(spacing.is_finite() && spacing > 0.0) {
            return Err(TopoError::InvalidConfig(format!("invalid grid spacing {}", spacing)));
        }

        let radius = kernel_radius(scale);
        let size = 2 * radius + 1;
        let values = Array2::from_shape_fn((size, size), |(i, j)| {
            let y = i as f64 - radius as f64;
            let x = j as f64 - radius as f64;
            mexican_hat(x, y, scale, spacing)
        });

        Ok(Self {
            scale,
            spacing,
            radius,
            values,
        })
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn spacing(&self) -> f64 {
        self.spacing
    }

    pub fn radius(&self) -> usize {
        self.radius
    }

    pub fn border(&self) -> usize {
        border_width(self.scale)
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    fn matches(&self, scale: f64, spacing: f64) -> bool {
        self.scale.to_bits() == scale.to_bits() && self.spacing.to_bits() == spacing.to_bits()
    }
}

struct KernelSpectrum {
    kernel: Arc<WaveletKernel>,
    shape: (usize, usize),
    values: Arc<Array2<Complex64>>,
}

/// Keeps the last kernel and its spectrum until `(s, Δ)` or the padded
/// shape change
#[derive(Default)]
pub struct WaveletKernelCache {
    kernel: Option<Arc<WaveletKernel>>,
    spectrum: Option<KernelSpectrum>,
    builds: usize,
}

impl WaveletKernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kernel(&mut self, scale: f64, spacing: f64) -> TopoResult<Arc<WaveletKernel>> {
        if let Some(kernel) = &self.kernel {
            if kernel.matches(scale, spacing) {
                return Ok(Arc::clone(kernel));
            }
        }

        log::debug!("Building Mexican-hat kernel (s = {:.3}, spacing = {})", scale, spacing);
        let kernel = Arc::new(WaveletKernel::new(scale, spacing)?);
        self.kernel = Some(Arc::clone(&kernel));
        self.spectrum = None;
        self.builds += 1;
        Ok(kernel)
    }

    fn spectrum(
        &mut self,
        kernel: &Arc<WaveletKernel>,
        shape: (usize, usize),
        planner: &mut FftPlanner<f64>,
    ) -> TopoResult<Arc<Array2<Complex64>>> {
        if let Some(cached) = &self.spectrum {
            if Arc::ptr_eq(&cached.kernel, kernel) && cached.shape == shape {
                return Ok(Arc::clone(&cached.values));
            }
        }

        let (rows, cols) = shape;
        let r = kernel.radius();
        let mut padded = Array2::<Complex64>::zeros(shape);
        for ((i, j), &k) in kernel.values().indexed_iter() {
            // Kernel center wraps to the origin
            padded[[(i + rows - r) % rows, (j + cols - r) % cols]] = Complex64::new(k, 0.0);
        }
        fft2(&mut padded, planner, FftDirection::Forward)?;

        let values = Arc::new(padded);
        self.spectrum = Some(KernelSpectrum {
            kernel: Arc::clone(kernel),
            shape,
            values: Arc::clone(&values),
        });
        Ok(values)
    }

    /// Number of kernels built so far
    pub fn builds(&self) -> usize {
        self.builds
    }
}

/// Raw convolution output plus fallback bookkeeping
#[derive(Debug, Clone)]
pub struct ConvolutionOutcome {
    /// Convolved grid; cells within `border` of an edge are not valid
    pub values: ElevationGrid,
    pub scale: f64,
    pub border: usize,
    /// Cells computed by direct convolution
    pub fallback_cells: usize,
    /// Valid-region cells left as no-data: kernel support touching no-data,
    /// or a direct evaluation that failed
    pub unrecovered_cells: usize,
    /// Work items run: the FFT pass plus one per direct-convolution row
    pub work_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    pub timed_out_items: usize,
}

/// Mexican-hat convolution over a whole grid
pub struct WaveletConvolver {
    params: WaveletParams,
    cache: Mutex<WaveletKernelCache>,
}

impl WaveletConvolver {
    pub fn new(params: WaveletParams) -> Self {
        Self {
            params,
            cache: Mutex::new(WaveletKernelCache::new()),
        }
    }

    pub fn params(&self) -> &WaveletParams {
        &self.params
    }

    /// Kernel for the given spacing, from the cache when possible
    pub fn kernel(&self, spacing: f64) -> TopoResult<Arc<WaveletKernel>> {
        let scale = self.params.scale.resolve(spacing)?;
        self.lock_cache()?.kernel(scale, spacing)
    }

    pub fn kernel_builds(&self) -> TopoResult<usize> {
        Ok(self.lock_cache()?.builds())
    }

    fn lock_cache(&self) -> TopoResult<std::sync::MutexGuard<'_, WaveletKernelCache>> {
        self.cache
            .lock()
            .map_err(|_| TopoError::Processing("wavelet kernel cache lock poisoned".to_string()))
    }

    /// Convolve `grid` with the wavelet, scaled by `spacing²`
    ///
    /// Cells whose kernel support touches no-data are no-data. Cells the FFT
    /// path leaves non-finite are recomputed by direct convolution; those
    /// still non-finite afterwards are no-data.
    pub fn convolve(
        &self,
        grid: ElevationView<'_>,
        spacing: f64,
        executor: &ParallelExecutor,
    ) -> TopoResult<ConvolutionOutcome> {
        let (rows, cols) = grid.dim();
        let kernel = self.kernel(spacing)?;
        let border = kernel.border();
        let valid = GridRegion::inset((rows, cols), border);

        log::info!(
            "Wavelet convolution: s = {:.3}, kernel {}x{}, border {} ({:?})",
            kernel.scale(),
            kernel.values().nrows(),
            kernel.values().ncols(),
            border,
            self.params.method
        );

        let support = NodataSupport::new(grid);
        let (clean, contaminated): (Vec<(usize, usize)>, Vec<(usize, usize)>) = region_cells(&valid)
            .into_iter()
            .partition(|&(i, j)| !support.touches(i, j, kernel.radius()));
        if !contaminated.is_empty() {
            log::warn!(
                "{} cells have no-data inside their kernel support; leaving them as no-data",
                contaminated.len()
            );
        }

        let mut fft_items = (0, 0, 0);
        let (mut values, affected) = match self.params.method {
            ConvolutionMethod::Direct => (Array2::from_elem((rows, cols), NODATA), clean),
            ConvolutionMethod::Fft => {
                match executor.install(|| self.fft_convolve(grid, &kernel)).and_then(|r| r) {
                    Ok(values) => {
                        fft_items = (1, 1, 0);
                        let affected: Vec<(usize, usize)> = clean
                            .into_iter()
                            .filter(|&(i, j)| !values[[i, j]].is_finite())
                            .collect();
                        if !affected.is_empty() {
                            log::warn!(
                                "FFT convolution non-finite for {} cells; falling back to direct convolution",
                                affected.len()
                            );
                        }
                        (values, affected)
                    }
                    Err(e) => {
                        log::warn!("{}; falling back to direct convolution for the whole grid", e);
                        fft_items = (1, 0, 1);
                        (Array2::from_elem((rows, cols), NODATA), clean)
                    }
                }
            }
        };

        for &(i, j) in &contaminated {
            values[[i, j]] = NODATA;
        }

        let fallback = if affected.is_empty() {
            FallbackSummary::default()
        } else {
            self.direct_convolve_cells(grid, &kernel, &affected, &mut values, executor)?
        };

        if fallback.unrecovered > 0 {
            log::warn!(
                "Direct convolution left {} cells as no-data",
                fallback.unrecovered
            );
        }

        let (fft_total, fft_completed, fft_failed) = fft_items;
        Ok(ConvolutionOutcome {
            values,
            scale: kernel.scale(),
            border,
            fallback_cells: affected.len(),
            unrecovered_cells: contaminated.len() + fallback.unrecovered,
            work_items: fft_total + fallback.work_items,
            completed_items: fft_completed + fallback.completed_items,
            failed_items: fft_failed + fallback.failed_items,
            timed_out_items: fallback.timed_out_items,
        })
    }

    fn fft_convolve(&self, grid: ElevationView<'_>, kernel: &Arc<WaveletKernel>) -> TopoResult<ElevationGrid> {
        let (rows, cols) = grid.dim();
        let r = kernel.radius();

        // At least R cells of zero padding keep the circular convolution
        // linear, and the kernel taps must not wrap onto each other
        let padded = |n: usize| next_smooth((n + r).max(2 * r + 1));
        let shape = (padded(rows), padded(cols));
        let mut planner = FftPlanner::<f64>::new();
        let spectrum = self.lock_cache()?.spectrum(kernel, shape, &mut planner)?;

        let mut data = Array2::<Complex64>::zeros(shape);
        data.slice_mut(s![..rows, ..cols])
            .zip_mut_with(&grid, |d, &z| {
                *d = Complex64::new(if z.is_finite() { z } else { 0.0 }, 0.0)
            });

        fft2(&mut data, &mut planner, FftDirection::Forward)?;
        data.zip_mut_with(spectrum.as_ref(), |d, &k| *d *= k);
        fft2(&mut data, &mut planner, FftDirection::Inverse)?;

        let spacing = kernel.spacing();
        let norm = spacing * spacing / (shape.0 * shape.1) as f64;
        Ok(data.slice(s![..rows, ..cols]).mapv(|c| c.re * norm))
    }

    /// Direct convolution for a set of cells, fanned out per grid row
    fn direct_convolve_cells(
        &self,
        grid: ElevationView<'_>,
        kernel: &WaveletKernel,
        cells: &[(usize, usize)],
        values: &mut ElevationGrid,
        executor: &ParallelExecutor,
    ) -> TopoResult<FallbackSummary> {
        let mut rows: Vec<(usize, Vec<usize>)> = Vec::new();
        for &(i, j) in cells {
            if let Some((row, cols)) = rows.last_mut() {
                if *row == i {
                    cols.push(j);
                    continue;
                }
            }
            rows.push((i, vec![j]));
        }

        let report = executor.execute(&rows, |(row, cols)| {
            Ok(cols
                .iter()
                .map(|&col| convolve_at(grid, kernel, *row, col))
                .collect::<Vec<f64>>())
        })?;

        let mut summary = FallbackSummary {
            work_items: rows.len(),
            completed_items: report.completed(),
            failed_items: report.failed(),
            timed_out_items: report.timed_out(),
            unrecovered: 0,
        };
        for (index, outcome) in report.outcomes {
            let (row, cols) = &rows[index];
            match outcome {
                ItemOutcome::Completed(results) => {
                    for (&col, value) in cols.iter().zip(results) {
                        if value.is_finite() {
                            values[[*row, col]] = value;
                        } else {
                            values[[*row, col]] = NODATA;
                            summary.unrecovered += 1;
                        }
                    }
                }
                ItemOutcome::Failed(e) if e.is_fatal() => return Err(e),
                _ => {
                    for &col in cols {
                        values[[*row, col]] = NODATA;
                    }
                    summary.unrecovered += cols.len();
                }
            }
        }

        Ok(summary)
    }
}

/// Bookkeeping of one direct-convolution fallback pass
#[derive(Debug, Default)]
struct FallbackSummary {
    work_items: usize,
    completed_items: usize,
    failed_items: usize,
    timed_out_items: usize,
    unrecovered: usize,
}

/// Direct convolution at one cell; cells outside the grid count as zero
///
/// Returns NaN as soon as the kernel support reaches a no-data cell.
pub fn convolve_at(grid: ElevationView<'_>, kernel: &WaveletKernel, row: usize, col: usize) -> f64 {
    let (rows, cols) = grid.dim();
    let r = kernel.radius() as isize;
    let weights = kernel.values();
    let mut sum = 0.0;

    for u in -r..=r {
        let gi = row as isize - u;
        if gi < 0 || gi >= rows as isize {
            continue;
        }
        for v in -r..=r {
            let gj = col as isize - v;
            if gj < 0 || gj >= cols as isize {
                continue;
            }
            let z = grid[[gi as usize, gj as usize]];
            if !z.is_finite() {
                return NODATA;
            }
            sum += weights[[(u + r) as usize, (v + r) as usize]] * z;
        }
    }

    let spacing = kernel.spacing();
    sum * spacing * spacing
}

/// Summed-area table of non-finite input cells
struct NodataSupport {
    table: Array2<u32>,
    shape: (usize, usize),
}

impl NodataSupport {
    fn new(grid: ElevationView<'_>) -> Self {
        let (rows, cols) = grid.dim();
        let mut table = Array2::<u32>::zeros((rows + 1, cols + 1));
        for i in 0..rows {
            let mut row_sum = 0u32;
            for j in 0..cols {
                row_sum += u32::from(!grid[[i, j]].is_finite());
                table[[i + 1, j + 1]] = table[[i, j + 1]] + row_sum;
            }
        }
        Self {
            table,
            shape: (rows, cols),
        }
    }

    /// Whether the square of half-width `radius` around `(row, col)` holds no-data
    fn touches(&self, row: usize, col: usize, radius: usize) -> bool {
        let (rows, cols) = self.shape;
        let r0 = row.saturating_sub(radius);
        let c0 = col.saturating_sub(radius);
        let r1 = (row + radius + 1).min(rows);
        let c1 = (col + radius + 1).min(cols);
        let count = self.table[[r1, c1]] + self.table[[r0, c0]]
            - self.table[[r0, c1]]
            - self.table[[r1, c0]];
        count > 0
    }
}

fn region_cells(region: &GridRegion) -> Vec<(usize, usize)> {
    (region.row_start..region.row_end)
        .flat_map(|i| (region.col_start..region.col_end).map(move |j| (i, j)))
        .collect()
}

/// In-place 2D FFT: rows, then columns through a contiguous transpose
fn fft2(
    data: &mut Array2<Complex64>,
    planner: &mut FftPlanner<f64>,
    direction: FftDirection,
) -> TopoResult<()> {
    let (rows, cols) = data.dim();

    let row_fft = planner.plan_fft(cols, direction);
    fft_rows(data, row_fft.as_ref())?;

    let col_fft = planner.plan_fft(rows, direction);
    let mut transposed = data.t().as_standard_layout().into_owned();
    fft_rows(&mut transposed, col_fft.as_ref())?;
    data.assign(&transposed.t());

    Ok(())
}

#[cfg(feature = "parallel")]
fn fft_rows(data: &mut Array2<Complex64>, fft: &dyn Fft<f64>) -> TopoResult<()> {
    use ndarray::parallel::prelude::*;

    data.axis_iter_mut(Axis(0))
        .into_par_iter()
        .try_for_each(|mut row| {
            let buffer = row
                .as_slice_mut()
                .ok_or_else(|| TopoError::ConvolutionFailure("non-contiguous FFT row".to_string()))?;
            fft.process(buffer);
            Ok(())
        })
}

#[cfg(not(feature = "parallel"))]
fn fft_rows(data: &mut Array2<Complex64>, fft: &dyn Fft<f64>) -> TopoResult<()> {
    for mut row in data.axis_iter_mut(Axis(0)) {
        let buffer = row
            .as_slice_mut()
            .ok_or_else(|| TopoError::ConvolutionFailure("non-contiguous FFT row".to_string()))?;
        fft.process(buffer);
    }
    Ok(())
}

/// Checks if a number is 5-smooth (only prime factors 2, 3, 5)
fn is_smooth_number(mut n: usize) -> bool {
    if n == 0 {
        return false;
    }
    for d in [2, 3, 5] {
        while n % d == 0 {
            n /= d;
        }
    }
    n == 1
}

/// Smallest 5-smooth number `>= n`; FFTs are fastest on such lengths
fn next_smooth(n: usize) -> usize {
    (n.max(1)..).find(|&m| is_smooth_number(m)).unwrap_or(n)
}
