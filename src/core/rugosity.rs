use super::window::Window;
use crate::types::{GridSpacing, TopoError, TopoResult};
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};

/// Rugosity estimators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RugosityMethod {
    /// Arc-chord ratio: surface area over the area of the footprint
    /// projected onto the least-squares plane (slope corrected)
    #[default]
    ArcChord,
    /// Triangulated 3D surface area over planar area (Jenness 2004),
    /// not slope corrected
    SurfaceRatio,
}

/// Least-squares plane `z = a*x + b*y + c` over a window
///
/// Coordinates are in linear units relative to the window center, with x
/// growing along columns and y growing along rows. The normal equations are
/// solved in cell-index units so the singularity test does not depend on
/// the grid spacing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaneFit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl PlaneFit {
    /// Fit by minimising the sum of squared vertical residuals
    pub fn fit(window: &Window, spacing: GridSpacing) -> TopoResult<Self> {
        let values = window.values();
        let hw = window.halfwidth() as f64;

        let (mut sxx, mut sxy, mut syy, mut sx, mut sy, mut n) = (0.0, 0.0, 0.0, 0.0, 0.0, 0.0);
        let (mut sxz, mut syz, mut sz) = (0.0, 0.0, 0.0);

        for ((i, j), &z) in values.indexed_iter() {
            let x = j as f64 - hw;
            let y = i as f64 - hw;
            sxx += x * x;
            sxy += x * y;
            syy += y * y;
            sx += x;
            sy += y;
            n += 1.0;
            sxz += x * z;
            syz += y * z;
            sz += z;
        }

        let det = det3([[sxx, sxy, sx], [sxy, syy, sy], [sx, sy, n]]);
        let scale = sxx.max(syy).max(n).powi(3);
        if !det.is_finite() || det.abs() <= 1e-12 * scale {
            return Err(TopoError::NumericDegenerate(format!(
                "singular plane fit (det = {:e})",
                det
            )));
        }

        let a = det3([[sxz, sxy, sx], [syz, syy, sy], [sz, sy, n]]) / det / spacing.dx;
        let b = det3([[sxx, sxz, sx], [sxy, syz, sy], [sx, sz, n]]) / det / spacing.dy;
        let c = det3([[sxx, sxy, sxz], [sxy, syy, syz], [sx, sy, sz]]) / det;

        if !(a.is_finite() && b.is_finite() && c.is_finite()) {
            return Err(TopoError::NumericDegenerate(
                "non-finite plane coefficients".to_string(),
            ));
        }

        Ok(Self { a, b, c })
    }

    /// Unit normal of the plane, from `(a, b, -1)`
    pub fn unit_normal(&self) -> TopoResult<[f64; 3]> {
        let norm = (self.a * self.a + self.b * self.b + 1.0).sqrt();
        if !norm.is_finite() || norm == 0.0 {
            return Err(TopoError::NumericDegenerate(
                "zero-length plane normal".to_string(),
            ));
        }
        Ok([self.a / norm, self.b / norm, -1.0 / norm])
    }

    pub fn evaluate(&self, x: f64, y: f64) -> f64 {
        self.a * x + self.b * y + self.c
    }
}

fn det3(m: [[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Rugosity of a window with the chosen estimator
///
/// Windows containing no-data are degenerate: the estimate needs the full
/// neighborhood.
pub fn rugosity(window: &Window, spacing: GridSpacing, method: RugosityMethod) -> TopoResult<f64> {
    if window.halfwidth() == 0 {
        return Err(TopoError::NumericDegenerate(
            "rugosity needs at least a 3x3 window".to_string(),
        ));
    }
    if window.has_nodata() {
        return Err(TopoError::NumericDegenerate(
            "window contains no-data".to_string(),
        ));
    }

    match method {
        RugosityMethod::ArcChord => arc_chord_ratio(window, spacing),
        RugosityMethod::SurfaceRatio => surface_ratio(window, spacing),
    }
}

/// Arc-chord ratio: gradient-based surface area over plane-projected area
pub fn arc_chord_ratio(window: &Window, spacing: GridSpacing) -> TopoResult<f64> {
    let plane = PlaneFit::fit(window, spacing)?;
    let normal = plane.unit_normal()?;

    let size = window.size() as f64;
    let window_area = size * size * spacing.cell_area();

    // Footprint lifted onto the plane: area grows by 1 / |n_z|
    let nz = normal[2].abs();
    if nz == 0.0 {
        return Err(TopoError::NumericDegenerate("vertical plane".to_string()));
    }
    let projected_area = window_area / nz;

    let surface_area = gradient_surface_area(window.values(), spacing);
    let ratio = surface_area / projected_area;

    if !ratio.is_finite() {
        return Err(TopoError::NumericDegenerate(format!(
            "non-finite ratio {} / {}",
            surface_area, projected_area
        )));
    }
    Ok(ratio)
}

/// Sum of `sqrt(1 + zx^2 + zy^2)` over the window, times the cell area
///
/// Central differences inside the window, one-sided at its edges.
fn gradient_surface_area(values: ArrayView2<'_, f64>, spacing: GridSpacing) -> f64 {
    let (rows, cols) = values.dim();
    let mut total = 0.0;

    for i in 0..rows {
        for j in 0..cols {
            let dz_dx = if j == 0 {
                (values[[i, 1]] - values[[i, 0]]) / spacing.dx
            } else if j == cols - 1 {
                (values[[i, j]] - values[[i, j - 1]]) / spacing.dx
            } else {
                (values[[i, j + 1]] - values[[i, j - 1]]) / (2.0 * spacing.dx)
            };

            let dz_dy = if i == 0 {
                (values[[1, j]] - values[[0, j]]) / spacing.dy
            } else if i == rows - 1 {
                (values[[i, j]] - values[[i - 1, j]]) / spacing.dy
            } else {
                (values[[i + 1, j]] - values[[i - 1, j]]) / (2.0 * spacing.dy)
            };

            total += (1.0 + dz_dx * dz_dx + dz_dy * dz_dy).sqrt();
        }
    }

    total * spacing.cell_area()
}

/// Triangulated surface area of the window's cell-center lattice divided
/// by its planar area
pub fn surface_ratio(window: &Window, spacing: GridSpacing) -> TopoResult<f64> {
    let values = window.values();
    let n = window.size();
    let mut surface_area = 0.0;

    for i in 0..n - 1 {
        for j in 0..n - 1 {
            let p00 = [0.0, 0.0, values[[i, j]]];
            let p01 = [spacing.dx, 0.0, values[[i, j + 1]]];
            let p10 = [0.0, spacing.dy, values[[i + 1, j]]];
            let p11 = [spacing.dx, spacing.dy, values[[i + 1, j + 1]]];

            surface_area += triangle_area(p00, p01, p11) + triangle_area(p00, p11, p10);
        }
    }

    let span = (n - 1) as f64;
    let planar_area = span * span * spacing.cell_area();
    let ratio = surface_area / planar_area;

    if !ratio.is_finite() {
        return Err(TopoError::NumericDegenerate(
            "non-finite surface ratio".to_string(),
        ));
    }
    Ok(ratio)
}

fn triangle_area(p: [f64; 3], q: [f64; 3], r: [f64; 3]) -> f64 {
    let u = [q[0] - p[0], q[1] - p[1], q[2] - p[2]];
    let v = [r[0] - p[0], r[1] - p[1], r[2] - p[2]];
    let cross = [
        u[1] * v[2] - u[2] * v[1],
        u[2] * v[0] - u[0] * v[2],
        u[0] * v[1] - u[1] * v[0],
    ];
    0.5 * (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    fn spacing(d: f64) -> GridSpacing {
        GridSpacing::isotropic(d).unwrap()
    }

    fn tilted(size: usize, slope_x: f64, slope_y: f64, d: f64) -> Window {
        let values = Array2::from_shape_fn((size, size), |(i, j)| {
            100.0 + slope_x * j as f64 * d + slope_y * i as f64 * d
        });
        Window::from_array(values).unwrap()
    }

    #[test]
    fn test_plane_fit_recovers_coefficients() {
        let window = tilted(5, 0.5, -0.25, 2.0);
        let plane = PlaneFit::fit(&window, spacing(2.0)).unwrap();

        assert_abs_diff_eq!(plane.a, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(plane.b, -0.25, epsilon = 1e-12);
        // Center cell (2, 2) sits at the origin
        assert_abs_diff_eq!(plane.c, window.center_value(), epsilon = 1e-9);
        assert_abs_diff_eq!(plane.evaluate(0.0, 0.0), window.center_value(), epsilon = 1e-9);
    }

    #[test]
    fn test_flat_window_is_one() {
        let window = Window::from_array(Array2::from_elem((7, 7), 12.0)).unwrap();
        assert_eq!(arc_chord_ratio(&window, spacing(1.0)).unwrap(), 1.0);
        assert_abs_diff_eq!(surface_ratio(&window, spacing(3.0)).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_tilted_plane_is_slope_corrected() {
        let window = tilted(5, 1.0, 0.5, 1.5);

        let acr = arc_chord_ratio(&window, spacing(1.5)).unwrap();
        assert_abs_diff_eq!(acr, 1.0, epsilon = 1e-9);

        // Surface ratio is not slope corrected: sqrt(1 + 1 + 0.25)
        let sr = surface_ratio(&window, spacing(1.5)).unwrap();
        assert_abs_diff_eq!(sr, 1.5, epsilon = 1e-9);
    }

    #[test]
    fn test_arc_chord_independent_of_spacing() {
        for d in [1e-3, 5e-4, 1.0, 1e3] {
            let flat = Window::from_array(Array2::from_elem((5, 5), 3.2)).unwrap();
            assert_eq!(arc_chord_ratio(&flat, spacing(d)).unwrap(), 1.0, "flat at {}", d);

            let window = tilted(5, 0.8, -0.3, d);
            let plane = PlaneFit::fit(&window, spacing(d)).unwrap();
            assert_abs_diff_eq!(plane.a, 0.8, epsilon = 1e-6);
            assert_abs_diff_eq!(plane.b, -0.3, epsilon = 1e-6);
            let acr = arc_chord_ratio(&window, spacing(d)).unwrap();
            assert_abs_diff_eq!(acr, 1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_rough_window_exceeds_one() {
        let values = Array2::from_shape_fn((5, 5), |(i, j)| if (i + j) % 2 == 0 { 0.0 } else { 3.0 });
        let window = Window::from_array(values).unwrap();

        assert!(arc_chord_ratio(&window, spacing(1.0)).unwrap() > 1.0);
        assert!(surface_ratio(&window, spacing(1.0)).unwrap() > 1.0);
    }

    #[test]
    fn test_nodata_window_is_degenerate() {
        let mut values = Array2::from_elem((3, 3), 1.0);
        values[[2, 0]] = f64::NAN;
        let window = Window::from_array(values).unwrap();

        let result = rugosity(&window, spacing(1.0), RugosityMethod::ArcChord);
        assert!(matches!(result, Err(TopoError::NumericDegenerate(_))));
    }

    #[test]
    fn test_single_cell_window_is_degenerate() {
        let window = Window::from_array(Array2::from_elem((1, 1), 1.0)).unwrap();
        assert!(matches!(
            rugosity(&window, spacing(1.0), RugosityMethod::SurfaceRatio),
            Err(TopoError::NumericDegenerate(_))
        ));
        assert!(PlaneFit::fit(&window, spacing(1.0)).is_err());
    }

    #[test]
    fn test_unit_normal_points_down_the_z_axis_for_flat_plane() {
        let plane = PlaneFit { a: 0.0, b: 0.0, c: 5.0 };
        assert_eq!(plane.unit_normal().unwrap(), [0.0, 0.0, -1.0]);
    }
}
