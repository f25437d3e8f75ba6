//! 2D convolution for detection-image filtering
//!
//! Same-size correlation (the kernel is not flipped) with selectable edge
//! handling, parallelized over output pixels with rayon. All detection
//! kernels in this crate are symmetric, so correlation and convolution
//! coincide.

use ndarray::{Array2, ArrayView2, Zip};

/// Options for controlling the convolution operation
#[derive(Debug, Clone, Copy)]
pub struct ConvolveOptions {
    /// Whether to use parallel processing with rayon
    pub parallel: bool,

    /// Controls how edges are handled
    pub edge_mode: EdgeMode,
}

impl Default for ConvolveOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            edge_mode: EdgeMode::Extend,
        }
    }
}

/// Edge handling modes for convolution
#[derive(Debug, Clone, Copy)]
pub enum EdgeMode {
    /// Uses a constant value for pixels outside image bounds
    Constant(f64),

    /// Extends the edge pixels outward
    Extend,

    /// Reflects the image at the edges
    Reflect,
}

/// Convolve a 2D array with a kernel, producing an output of the same shape.
///
/// # Arguments
/// * `input` - Input 2D array
/// * `kernel` - Convolution kernel (any shape; center at `dim/2`)
/// * `options` - Edge handling and parallelism options
pub fn convolve2d(
    input: &ArrayView2<f64>,
    kernel: &ArrayView2<f64>,
    options: ConvolveOptions,
) -> Array2<f64> {
    let (rows, cols) = input.dim();
    let (kernel_rows, kernel_cols) = kernel.dim();

    // Kernel center
    let kr = kernel_rows / 2;
    let kc = kernel_cols / 2;

    let mut output = Array2::zeros((rows, cols));

    let compute = |(i, j): (usize, usize), out: &mut f64| {
        let mut sum = 0.0;
        for ki in 0..kernel_rows {
            for kj in 0..kernel_cols {
                let ii = i as isize + ki as isize - kr as isize;
                let jj = j as isize + kj as isize - kc as isize;
                sum += get_pixel(input, ii, jj, options.edge_mode) * kernel[[ki, kj]];
            }
        }
        *out = sum;
    };

    if options.parallel {
        Zip::indexed(&mut output).par_for_each(compute);
    } else {
        Zip::indexed(&mut output).for_each(compute);
    }

    output
}

/// Fetch a pixel with out-of-bounds coordinates resolved per the edge mode.
fn get_pixel(input: &ArrayView2<f64>, i: isize, j: isize, edge_mode: EdgeMode) -> f64 {
    let (rows, cols) = input.dim();

    if i >= 0 && i < rows as isize && j >= 0 && j < cols as isize {
        return input[[i as usize, j as usize]];
    }

    match edge_mode {
        EdgeMode::Constant(value) => value,
        EdgeMode::Extend => {
            let ci = i.clamp(0, rows as isize - 1) as usize;
            let cj = j.clamp(0, cols as isize - 1) as usize;
            input[[ci, cj]]
        }
        EdgeMode::Reflect => {
            let ri = reflect(i, rows);
            let rj = reflect(j, cols);
            input[[ri, rj]]
        }
    }
}

// Mirror an index across the array boundary. A single reflection is enough
// for any kernel no wider than the image.
fn reflect(index: isize, len: usize) -> usize {
    let len = len as isize;
    let reflected = if index < 0 {
        -index - 1
    } else if index >= len {
        2 * len - index - 1
    } else {
        index
    };
    reflected.clamp(0, len - 1) as usize
}
