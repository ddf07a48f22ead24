//! Topographic Position Index
//!
//!   TPI = z_center - mean(z_window)
//!
//! Positive values mark cells higher than their surroundings (ridges),
//! negative values mark depressions. The mean is the plain arithmetic mean
//! over every cell of the window, center included, matching a uniform
//! moving-average filter. Windows are extracted with edge clamping.
//!
//! No-data anywhere in the window propagates to the result.

use super::window::Window;

/// TPI of a single window
pub fn tpi(window: &Window) -> f64 {
    window.center_value() - window.mean()
}
