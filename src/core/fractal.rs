//! Local fractal dimension from voxel box counting
//!
//! For a window of half-width `hw`, elevations are turned into voxel
//! columns relative to the center cell, clamped to `[0, window_size]`. For
//! every box size `q` dividing `hw` the leading `2hw x 2hw` block is tiled
//! with `q x q` boxes and `N(q) = max box sum / q`. The slope of
//! `ln N(q)` against `ln q` gives `D = 3 - slope / 2`.

use super::window::Window;
use crate::types::{TopoError, TopoResult};
use ndarray::{s, Array2};

/// Ordinary least-squares line `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Number of samples used
    pub samples: usize,
}

/// Fit a line through the finite `(x, y)` pairs
///
/// Sums are taken over deviations from the means so large offsets do not
/// cancel catastrophically.
pub fn linear_regression(samples: &[(f64, f64)]) -> TopoResult<LinearFit> {
    let finite: Vec<(f64, f64)> = samples
        .iter()
        .copied()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();

    if finite.len() < 2 {
        return Err(TopoError::NumericDegenerate(format!(
            "regression needs two finite points, got {}",
            finite.len()
        )));
    }

    let n = finite.len() as f64;
    let x_mean = finite.iter().map(|(x, _)| x).sum::<f64>() / n;
    let y_mean = finite.iter().map(|(_, y)| y).sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for &(x, y) in &finite {
        let dx = x - x_mean;
        sxy += dx * (y - y_mean);
        sxx += dx * dx;
    }

    if sxx == 0.0 {
        return Err(TopoError::NumericDegenerate(
            "regression abscissae are all equal".to_string(),
        ));
    }

    let slope = sxy / sxx;
    Ok(LinearFit {
        slope,
        intercept: y_mean - slope * x_mean,
        samples: finite.len(),
    })
}

/// Exact integer divisors of `halfwidth`, ascending
pub fn box_sizes(halfwidth: usize) -> Vec<usize> {
    (1..=halfwidth).filter(|q| halfwidth % q == 0).collect()
}

/// Voxel column heights relative to the window center
pub fn voxel_counts(window: &Window) -> Array2<f64> {
    let center = window.center_value();
    let ceiling = window.size() as f64;
    window.values().mapv(|z| (z - center).clamp(0.0, ceiling))
}

/// `(q, N(q))` for every box size
pub fn box_counts(voxels: &Array2<f64>, halfwidth: usize) -> Vec<(usize, f64)> {
    let span = 2 * halfwidth;
    let block = voxels.slice(s![..span, ..span]);

    box_sizes(halfwidth)
        .into_iter()
        .map(|q| {
            let mut max_sum = f64::NEG_INFINITY;
            for bi in (0..span).step_by(q) {
                for bj in (0..span).step_by(q) {
                    let sum: f64 = block.slice(s![bi..bi + q, bj..bj + q]).sum();
                    max_sum = max_sum.max(sum);
                }
            }
            (q, max_sum / q as f64)
        })
        .collect()
}

/// Fractal dimension of a window
///
/// Windows containing no-data are degenerate, as are windows with fewer
/// than two box sizes yielding a positive, finite count.
pub fn fractal_dimension(window: &Window) -> TopoResult<f64> {
    let hw = window.halfwidth();
    if hw == 0 {
        return Err(TopoError::NumericDegenerate(
            "fractal dimension needs a window larger than one cell".to_string(),
        ));
    }
    if window.has_nodata() {
        return Err(TopoError::NumericDegenerate(
            "window contains no-data".to_string(),
        ));
    }

    let voxels = voxel_counts(window);
    let samples: Vec<(f64, f64)> = box_counts(&voxels, hw)
        .into_iter()
        .filter(|&(_, count)| count.is_finite() && count > 0.0)
        .map(|(q, count)| ((q as f64).ln(), count.ln()))
        .collect();

    let fit = linear_regression(&samples)?;
    Ok(3.0 - fit.slope / 2.0)
}
