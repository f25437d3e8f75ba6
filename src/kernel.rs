//! Convolution kernels for source detection
//!
//! Detection works best when the image is filtered with a kernel matched to
//! the angular scale of the sources being looked for. This module provides
//! six precomputed kernels (tophat and Gaussian profiles at common FWHM
//! values) plus a parametric Gaussian generator for everything else.

use ndarray::{arr2, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stats::normal_cdf;

/// Errors from kernel selection and generation
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("convolution kernel preset {0} is not yet supported (presets 1-6 are available)")]
    UnsupportedPreset(u8),
    #[error("invalid Gaussian kernel parameters: size {size}, sigma {sigma} (need size >= 1 and finite sigma > 0)")]
    InvalidGaussian { size: usize, sigma: f64 },
}

/// Specification of the detection kernel, resolved to a weight matrix on use.
///
/// `Preset` selects one of the six hand-tabulated kernels by id (1-6);
/// `Gaussian` generates a `(2*size+1) x (2*size+1)` kernel from the closed
/// form in [`gaussian_kernel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum KernelSpec {
    /// Precomputed kernel id, 1 through 6
    Preset(u8),
    /// Parametric Gaussian: half-width in pixels and standard deviation
    Gaussian { size: usize, sigma: f64 },
}

impl KernelSpec {
    /// Resolve the specification into a concrete weight matrix.
    pub fn matrix(&self) -> Result<Array2<f64>, KernelError> {
        match *self {
            KernelSpec::Preset(id) => preset_kernel(id),
            KernelSpec::Gaussian { size, sigma } => gaussian_kernel(size, sigma),
        }
    }
}

/// Precomputed convolution kernel for source detection.
///
/// The weight tables are fixed reference values, not derived at runtime:
/// 1. tophat, FWHM 3.0, 3x3
/// 2. tophat, FWHM 4.0, 5x5
/// 3. tophat, FWHM 5.0, 5x5
/// 4. Gaussian, FWHM 3.0, 5x5
/// 5. Gaussian, FWHM 4.0, 7x7
/// 6. Gaussian, FWHM 5.0, 9x9
///
/// Ids outside 1-6 fail with [`KernelError::UnsupportedPreset`].
pub fn preset_kernel(id: u8) -> Result<Array2<f64>, KernelError> {
    let kernel = match id {
        // Tophat, FWHM 3.0, 3x3
        1 => arr2(&[
            [0.560000, 0.980000, 0.560000],
            [0.980000, 1.000000, 0.980000],
            [0.560000, 0.980000, 0.560000],
        ]),
        // Tophat, FWHM 4.0, 5x5
        2 => arr2(&[
            [0.000000, 0.220000, 0.480000, 0.220000, 0.000000],
            [0.220000, 0.990000, 1.000000, 0.990000, 0.220000],
            [0.480000, 1.000000, 1.000000, 1.000000, 0.480000],
            [0.220000, 0.990000, 1.000000, 0.990000, 0.220000],
            [0.000000, 0.220000, 0.480000, 0.220000, 0.000000],
        ]),
        // Tophat, FWHM 5.0, 5x5
        3 => arr2(&[
            [0.150000, 0.770000, 1.000000, 0.770000, 0.150000],
            [0.770000, 1.000000, 1.000000, 1.000000, 0.770000],
            [1.000000, 1.000000, 1.000000, 1.000000, 1.000000],
            [0.770000, 1.000000, 1.000000, 1.000000, 0.770000],
            [0.150000, 0.770000, 1.000000, 0.770000, 0.150000],
        ]),
        // Gaussian, FWHM 3.0, 5x5
        4 => arr2(&[
            [0.092163, 0.221178, 0.296069, 0.221178, 0.092163],
            [0.221178, 0.530797, 0.710525, 0.530797, 0.221178],
            [0.296069, 0.710525, 0.951108, 0.710525, 0.296069],
            [0.221178, 0.530797, 0.710525, 0.530797, 0.221178],
            [0.092163, 0.221178, 0.296069, 0.221178, 0.092163],
        ]),
        // Gaussian, FWHM 4.0, 7x7
        5 => arr2(&[
            [
                0.047454, 0.109799, 0.181612, 0.214776, 0.181612, 0.109799, 0.047454,
            ],
            [
                0.109799, 0.254053, 0.420215, 0.496950, 0.420215, 0.254053, 0.109799,
            ],
            [
                0.181612, 0.420215, 0.695055, 0.821978, 0.695055, 0.420215, 0.181612,
            ],
            [
                0.214776, 0.496950, 0.821978, 0.972079, 0.821978, 0.496950, 0.214776,
            ],
            [
                0.181612, 0.420215, 0.695055, 0.821978, 0.695055, 0.420215, 0.181612,
            ],
            [
                0.109799, 0.254053, 0.420215, 0.496950, 0.420215, 0.254053, 0.109799,
            ],
            [
                0.047454, 0.109799, 0.181612, 0.214776, 0.181612, 0.109799, 0.047454,
            ],
        ]),
        // Gaussian, FWHM 5.0, 9x9
        6 => arr2(&[
            [
                0.030531, 0.065238, 0.112208, 0.155356, 0.173152, 0.155356, 0.112208, 0.065238,
                0.030531,
            ],
            [
                0.065238, 0.139399, 0.239763, 0.331961, 0.369987, 0.331961, 0.239763, 0.139399,
                0.065238,
            ],
            [
                0.112208, 0.239763, 0.412386, 0.570963, 0.636368, 0.570963, 0.412386, 0.239763,
                0.112208,
            ],
            [
                0.155356, 0.331961, 0.570963, 0.790520, 0.881075, 0.790520, 0.570963, 0.331961,
                0.155356,
            ],
            [
                0.173152, 0.369987, 0.636368, 0.881075, 0.982004, 0.881075, 0.636368, 0.369987,
                0.173152,
            ],
            [
                0.155356, 0.331961, 0.570963, 0.790520, 0.881075, 0.790520, 0.570963, 0.331961,
                0.155356,
            ],
            [
                0.112208, 0.239763, 0.412386, 0.570963, 0.636368, 0.570963, 0.412386, 0.239763,
                0.112208,
            ],
            [
                0.065238, 0.139399, 0.239763, 0.331961, 0.369987, 0.331961, 0.239763, 0.139399,
                0.065238,
            ],
            [
                0.030531, 0.065238, 0.112208, 0.155356, 0.173152, 0.155356, 0.112208, 0.065238,
                0.030531,
            ],
        ]),
        _ => return Err(KernelError::UnsupportedPreset(id)),
    };

    Ok(kernel)
}

/// Generate a normalized 2D Gaussian kernel of shape `(2*size+1, 2*size+1)`.
///
/// The 1-D profile is built by differencing the standard normal CDF over
/// `2*size+2` evenly spaced sample points spanning `[-sigma - d/2,
/// sigma + d/2]` with `d = (2*sigma + 1) / (2*size + 1)`, so each entry is
/// the probability mass of one sample bin. The 2-D kernel is the element-wise
/// square root of the outer product of that profile with itself, normalized
/// to sum to 1.
///
/// # Arguments
/// * `size` - Kernel half-width in pixels; output is `(2*size+1)` on a side
/// * `sigma` - Standard deviation of the profile in pixels
///
/// # Returns
/// Symmetric non-negative weight matrix summing to 1.0
pub fn gaussian_kernel(size: usize, sigma: f64) -> Result<Array2<f64>, KernelError> {
    if size == 0 || !sigma.is_finite() || sigma <= 0.0 {
        return Err(KernelError::InvalidGaussian { size, sigma });
    }

    let width = 2 * size + 1;
    let interval = (2.0 * sigma + 1.0) / width as f64;
    let lo = -sigma - interval / 2.0;
    let hi = sigma + interval / 2.0;
    let step = (hi - lo) / width as f64;

    // Probability mass per sample bin
    let mut kern1d = Vec::with_capacity(width);
    let mut prev = normal_cdf(lo);
    for i in 1..=width {
        let cdf = normal_cdf(lo + step * i as f64);
        kern1d.push(cdf - prev);
        prev = cdf;
    }

    let mut kernel =
        Array2::from_shape_fn((width, width), |(r, c)| (kern1d[r] * kern1d[c]).sqrt());
    let total = kernel.sum();
    kernel.mapv_inplace(|v| v / total);

    Ok(kernel)
}
