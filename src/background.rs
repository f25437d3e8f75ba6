//! Spatially varying background estimation
//!
//! Estimates a smooth model of the sky level and per-pixel noise by tiling
//! the image into boxes, computing sigma-clipped statistics per box, median
//! filtering the resulting meshes to suppress boxes contaminated by bright
//! sources, and bilinearly interpolating back to full resolution.

use log::debug;
use ndarray::{Array2, ArrayView2, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stats::{median, sigma_clipped_stats};

/// Errors from background estimation
#[derive(Error, Debug)]
pub enum BackgroundError {
    #[error("cannot estimate background of an empty image")]
    EmptyImage,
    #[error("mask shape {mask:?} does not match image shape {image:?}")]
    MaskShapeMismatch {
        image: (usize, usize),
        mask: (usize, usize),
    },
    #[error("image shape {image:?} does not match background model shape {model:?}")]
    ShapeMismatch {
        image: (usize, usize),
        model: (usize, usize),
    },
    #[error("no usable pixels for background estimation (all masked or non-finite)")]
    NoUsablePixels,
}

/// Settings for background mesh construction.
///
/// Unset tile sizes default to one fifth of the image's first-axis extent,
/// floored at `bkgsize_min`; unset filter sizes default to half the
/// corresponding tile size. Filter sizes follow the mesh-filter convention:
/// they count mesh cells, clamped to the mesh grid and forced odd.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Tile width in pixels (columns per box)
    pub bw: Option<usize>,
    /// Tile height in pixels (rows per box)
    pub bh: Option<usize>,
    /// Median filter width in mesh cells
    pub fw: Option<usize>,
    /// Median filter height in mesh cells
    pub fh: Option<usize>,
    /// Lower bound applied to defaulted tile sizes
    pub bkgsize_min: usize,
    /// Sigma-clipping limit for per-tile statistics
    pub clip_sigma: f64,
    /// Maximum sigma-clipping iterations per tile
    pub clip_iters: usize,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            bw: None,
            bh: None,
            fw: None,
            fh: None,
            bkgsize_min: 10,
            clip_sigma: 3.0,
            clip_iters: 5,
        }
    }
}

/// Smooth spatial model of sky level and per-pixel noise.
///
/// Produced by [`estimate_background`]. Exposes the interpolated level and
/// rms at any pixel, scalar global summaries, and in-place subtraction of
/// the level from a caller-owned image (the only mutating operation in
/// this crate).
#[derive(Debug, Clone)]
pub struct Background {
    shape: (usize, usize),
    bw: usize,
    bh: usize,
    fw: usize,
    fh: usize,
    level_mesh: Array2<f64>,
    rms_mesh: Array2<f64>,
    // Pixel coordinates of tile centers along each axis
    row_centers: Vec<f64>,
    col_centers: Vec<f64>,
    global_level: f64,
    global_rms: f64,
}

impl Background {
    /// Resolved `(bw, bh, fw, fh)` actually used for the mesh.
    pub fn tile_sizes(&self) -> (usize, usize, usize, usize) {
        (self.bw, self.bh, self.fw, self.fh)
    }

    /// Median sky level over the filtered mesh.
    pub fn global_level(&self) -> f64 {
        self.global_level
    }

    /// Median per-pixel noise estimate over the filtered mesh.
    pub fn global_rms(&self) -> f64 {
        self.global_rms
    }

    /// Interpolated sky level at a pixel.
    pub fn level_at(&self, row: usize, col: usize) -> f64 {
        interpolate(
            &self.level_mesh,
            &self.row_centers,
            &self.col_centers,
            row as f64,
            col as f64,
        )
    }

    /// Interpolated noise rms at a pixel.
    pub fn rms_at(&self, row: usize, col: usize) -> f64 {
        interpolate(
            &self.rms_mesh,
            &self.row_centers,
            &self.col_centers,
            row as f64,
            col as f64,
        )
    }

    /// Render the full-resolution sky level image.
    pub fn level_image(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.shape, |(r, c)| self.level_at(r, c))
    }

    /// Render the full-resolution noise rms image.
    pub fn rms_image(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.shape, |(r, c)| self.rms_at(r, c))
    }

    /// Subtract the interpolated sky level from `image` in place.
    pub fn subtract_from(&self, image: &mut Array2<f64>) -> Result<(), BackgroundError> {
        if image.dim() != self.shape {
            return Err(BackgroundError::ShapeMismatch {
                image: image.dim(),
                model: self.shape,
            });
        }

        Zip::indexed(image).par_for_each(|(r, c), value| {
            *value -= self.level_at(r, c);
        });

        Ok(())
    }
}

/// Estimate a background model for `image`.
///
/// Masked pixels (`mask[[r, c]] == true`) are excluded from tile statistics;
/// tiles with no usable pixels are filled from the median of the valid tiles.
///
/// # Arguments
/// * `image` - Input image
/// * `mask` - Optional boolean mask of pixels to exclude
/// * `config` - Tile/filter sizes and clipping parameters
pub fn estimate_background(
    image: &ArrayView2<f64>,
    mask: Option<&ArrayView2<bool>>,
    config: &BackgroundConfig,
) -> Result<Background, BackgroundError> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Err(BackgroundError::EmptyImage);
    }

    if let Some(mask) = mask {
        if mask.dim() != image.dim() {
            return Err(BackgroundError::MaskShapeMismatch {
                image: image.dim(),
                mask: mask.dim(),
            });
        }
    }

    let (bw, bh, fw, fh) = resolved_sizes(rows, config);

    let mesh_rows = rows.div_ceil(bh);
    let mesh_cols = cols.div_ceil(bw);

    let mut level_mesh = Array2::from_elem((mesh_rows, mesh_cols), f64::NAN);
    let mut rms_mesh = Array2::from_elem((mesh_rows, mesh_cols), f64::NAN);
    let mut row_centers = Vec::with_capacity(mesh_rows);
    let mut col_centers = Vec::with_capacity(mesh_cols);

    let mut tile = Vec::with_capacity(bw * bh);
    for ti in 0..mesh_rows {
        let r0 = ti * bh;
        let r1 = ((ti + 1) * bh).min(rows);
        for tj in 0..mesh_cols {
            let c0 = tj * bw;
            let c1 = ((tj + 1) * bw).min(cols);

            tile.clear();
            for r in r0..r1 {
                for c in c0..c1 {
                    if let Some(mask) = mask {
                        if mask[[r, c]] {
                            continue;
                        }
                    }
                    let value = image[[r, c]];
                    if value.is_finite() {
                        tile.push(value);
                    }
                }
            }

            if let Some((level, rms)) =
                sigma_clipped_stats(&tile, config.clip_sigma, config.clip_iters)
            {
                level_mesh[[ti, tj]] = level;
                rms_mesh[[ti, tj]] = rms;
            }
        }
    }

    for ti in 0..mesh_rows {
        let r0 = ti * bh;
        let r1 = ((ti + 1) * bh).min(rows);
        row_centers.push((r0 + r1 - 1) as f64 / 2.0);
    }
    for tj in 0..mesh_cols {
        let c0 = tj * bw;
        let c1 = ((tj + 1) * bw).min(cols);
        col_centers.push((c0 + c1 - 1) as f64 / 2.0);
    }

    // Fill tiles that had no usable pixels from the valid-tile medians
    let level_fill =
        median(level_mesh.as_slice().unwrap()).ok_or(BackgroundError::NoUsablePixels)?;
    let rms_fill = median(rms_mesh.as_slice().unwrap()).ok_or(BackgroundError::NoUsablePixels)?;
    level_mesh.mapv_inplace(|v| if v.is_nan() { level_fill } else { v });
    rms_mesh.mapv_inplace(|v| if v.is_nan() { rms_fill } else { v });

    // Median filter the meshes to reject source-contaminated tiles
    let level_mesh = median_filter_mesh(&level_mesh, fh, fw);
    let rms_mesh = median_filter_mesh(&rms_mesh, fh, fw);

    let global_level = median(level_mesh.as_slice().unwrap()).unwrap_or(level_fill);
    let global_rms = median(rms_mesh.as_slice().unwrap()).unwrap_or(rms_fill);

    debug!(
        "background mesh {mesh_rows}x{mesh_cols} (bw={bw} bh={bh} fw={fw} fh={fh}): \
         level {global_level:.3}, rms {global_rms:.3}"
    );

    Ok(Background {
        shape: (rows, cols),
        bw,
        bh,
        fw,
        fh,
        level_mesh,
        rms_mesh,
        row_centers,
        col_centers,
        global_level,
        global_rms,
    })
}

/// Resolve defaulted tile and filter sizes against the image's first axis.
fn resolved_sizes(rows: usize, config: &BackgroundConfig) -> (usize, usize, usize, usize) {
    let default_box = (rows / 5).max(config.bkgsize_min).max(1);
    let bw = config.bw.unwrap_or(default_box).max(1);
    let bh = config.bh.unwrap_or(default_box).max(1);
    let fw = config.fw.unwrap_or_else(|| (bw / 2).max(1)).max(1);
    let fh = config.fh.unwrap_or_else(|| (bh / 2).max(1)).max(1);
    (bw, bh, fw, fh)
}

/// Median filter a mesh with a window of `fh x fw` cells, clamped to the
/// mesh extent and forced odd.
fn median_filter_mesh(mesh: &Array2<f64>, fh: usize, fw: usize) -> Array2<f64> {
    let (rows, cols) = mesh.dim();
    let wr = force_odd(fh.min(rows));
    let wc = force_odd(fw.min(cols));

    if wr <= 1 && wc <= 1 {
        return mesh.clone();
    }

    let hr = wr / 2;
    let hc = wc / 2;
    let mut window = Vec::with_capacity(wr * wc);

    Array2::from_shape_fn((rows, cols), |(i, j)| {
        window.clear();
        let r0 = i.saturating_sub(hr);
        let r1 = (i + hr + 1).min(rows);
        let c0 = j.saturating_sub(hc);
        let c1 = (j + hc + 1).min(cols);
        for r in r0..r1 {
            for c in c0..c1 {
                window.push(mesh[[r, c]]);
            }
        }
        median(&window).unwrap_or(mesh[[i, j]])
    })
}

fn force_odd(n: usize) -> usize {
    if n == 0 {
        1
    } else if n % 2 == 0 {
        n - 1
    } else {
        n
    }
}

/// Bilinear interpolation of a mesh at pixel coordinates, clamped to the
/// outermost tile centers.
fn interpolate(
    mesh: &Array2<f64>,
    row_centers: &[f64],
    col_centers: &[f64],
    row: f64,
    col: f64,
) -> f64 {
    let (i0, i1, tr) = bracket(row_centers, row);
    let (j0, j1, tc) = bracket(col_centers, col);

    let top = mesh[[i0, j0]] * (1.0 - tc) + mesh[[i0, j1]] * tc;
    let bottom = mesh[[i1, j0]] * (1.0 - tc) + mesh[[i1, j1]] * tc;
    top * (1.0 - tr) + bottom * tr
}

/// Find the bracketing center indices and interpolation weight for `x`.
fn bracket(centers: &[f64], x: f64) -> (usize, usize, f64) {
    let n = centers.len();
    if n == 1 || x <= centers[0] {
        return (0, 0, 0.0);
    }
    if x >= centers[n - 1] {
        return (n - 1, n - 1, 0.0);
    }

    let hi = centers.partition_point(|&c| c <= x);
    let lo = hi - 1;
    let span = centers[hi] - centers[lo];
    let t = if span > 0.0 { (x - centers[lo]) / span } else { 0.0 };
    (lo, hi, t)
}
