//! Source extraction: thresholding, segmentation, and object measurement
//!
//! Turns a (background-subtracted) image into a catalog of sources. The
//! image is optionally filtered with a detection kernel, thresholded into a
//! binary mask, labeled with two-pass union-find connected components
//! (8-connectivity), deblended with a multi-threshold scan, and measured
//! with intensity-weighted moments for sub-pixel positions and shape
//! parameters.

use log::debug;
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::convolve::{convolve2d, ConvolveOptions};

/// Errors from source extraction
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("cannot extract sources from an empty image")]
    EmptyImage,
    #[error("noise map shape {map:?} does not match image shape {image:?}")]
    NoiseShapeMismatch {
        image: (usize, usize),
        map: (usize, usize),
    },
}

/// How the detection kernel is applied before thresholding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterType {
    /// Noise-weighted filtering: with a per-pixel noise map the smoothed
    /// image is inverse-variance weighted; without one this reduces to
    /// plain convolution
    Matched,
    /// Plain convolution with the unit-sum kernel
    Convolution,
}

/// Settings for the extraction pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Minimum number of pixels for a detection to survive
    pub minarea: usize,
    /// Kernel application mode
    pub filter_type: FilterType,
    /// Number of deblending sub-threshold levels
    pub deblend_nthresh: usize,
    /// Minimum flux fraction for a deblended branch; >= 1.0 disables
    /// deblending
    pub deblend_cont: f64,
    /// Whether to build the integer segmentation map
    pub segmentation_map: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            minarea: 5,
            filter_type: FilterType::Matched,
            deblend_nthresh: 32,
            deblend_cont: 0.005,
            segmentation_map: false,
        }
    }
}

/// Detection threshold: a single absolute level, or a per-pixel map scaled
/// by a sigma multiple.
#[derive(Debug, Clone)]
pub enum Threshold {
    /// Absolute flux level applied everywhere
    Absolute(f64),
    /// Per-pixel standard deviation map; a pixel detects above `scale * map`
    Sigma { scale: f64, map: Array2<f64> },
    /// Per-pixel variance map; a pixel detects above `scale * sqrt(map)`
    Variance { scale: f64, map: Array2<f64> },
}

impl Threshold {
    /// Threshold level at a pixel.
    fn at(&self, row: usize, col: usize) -> f64 {
        match self {
            Threshold::Absolute(level) => *level,
            Threshold::Sigma { scale, map } => scale * map[[row, col]],
            Threshold::Variance { scale, map } => scale * map[[row, col]].max(0.0).sqrt(),
        }
    }

    fn map_shape(&self) -> Option<(usize, usize)> {
        match self {
            Threshold::Absolute(_) => None,
            Threshold::Sigma { map, .. } | Threshold::Variance { map, .. } => Some(map.dim()),
        }
    }

    /// Per-pixel variance, if a noise map is available.
    fn variance_at(&self, row: usize, col: usize) -> Option<f64> {
        match self {
            Threshold::Absolute(_) => None,
            Threshold::Sigma { map, .. } => Some(map[[row, col]].powi(2)),
            Threshold::Variance { map, .. } => Some(map[[row, col]].max(0.0)),
        }
    }
}

/// A detected source with sub-pixel position and shape moments.
///
/// Positions are in pixel coordinates with `x` along columns and `y` along
/// rows, matching the catalog convention. Flux and moments are measured on
/// the unfiltered input image over the object's pixels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    /// Object id; matches the segmentation map label (1-based)
    pub id: usize,
    /// Centroid x-coordinate (column) with sub-pixel precision
    pub x: f64,
    /// Centroid y-coordinate (row) with sub-pixel precision
    pub y: f64,
    /// Total flux over the object's pixels
    pub flux: f64,
    /// Brightest pixel value
    pub peak: f64,
    /// Number of pixels in the object
    pub npix: usize,
    /// Bounding box, inclusive pixel ranges
    pub xmin: usize,
    pub xmax: usize,
    pub ymin: usize,
    pub ymax: usize,
    /// Second central moment in x
    pub m_xx: f64,
    /// Second central moment in y
    pub m_yy: f64,
    /// Second central cross moment
    pub m_xy: f64,
    /// Ellipse semi-major axis from the moment eigenvalues
    pub a: f64,
    /// Ellipse semi-minor axis from the moment eigenvalues
    pub b: f64,
    /// Ellipse position angle in radians, counterclockwise from +x
    pub theta: f64,
}

/// Result of an extraction pass
#[derive(Debug, Clone)]
pub struct Extraction {
    /// Detected sources in label order
    pub sources: Vec<Source>,
    /// Integer label image: object id per pixel, 0 for background.
    /// Present when `ExtractionConfig::segmentation_map` is set.
    pub segmentation: Option<Array2<u32>>,
}

/// Extract sources from an image.
///
/// # Arguments
/// * `image` - Input image, already background-subtracted by the caller
/// * `threshold` - Detection threshold (absolute or per-pixel)
/// * `filter_kernel` - Optional detection kernel; convolved over the image
///   before thresholding, normalized to unit sum so flat regions keep their
///   level
/// * `config` - Extraction settings
pub fn extract(
    image: &ArrayView2<f64>,
    threshold: &Threshold,
    filter_kernel: Option<&ArrayView2<f64>>,
    config: &ExtractionConfig,
) -> Result<Extraction, ExtractError> {
    let (rows, cols) = image.dim();
    if rows == 0 || cols == 0 {
        return Err(ExtractError::EmptyImage);
    }
    if let Some(shape) = threshold.map_shape() {
        if shape != image.dim() {
            return Err(ExtractError::NoiseShapeMismatch {
                image: image.dim(),
                map: shape,
            });
        }
    }

    let detection = detection_image(image, threshold, filter_kernel, config.filter_type);

    // Threshold into a binary mask
    let mask = Array2::from_shape_fn((rows, cols), |(r, c)| {
        detection[[r, c]] > threshold.at(r, c)
    });

    let (labels, label_count) = connected_components(&mask.view());

    // Gather pixels per component
    let mut components: Vec<Vec<(usize, usize)>> = vec![Vec::new(); label_count];
    for ((r, c), &label) in labels.indexed_iter() {
        if label > 0 {
            components[label - 1].push((r, c));
        }
    }

    // Area filter, then deblend survivors
    let mut objects: Vec<Vec<(usize, usize)>> = Vec::new();
    for pixels in components {
        if pixels.len() < config.minarea {
            continue;
        }
        match deblend(
            &detection,
            &pixels,
            config.deblend_nthresh,
            config.deblend_cont,
        ) {
            Some(children) => objects.extend(children),
            None => objects.push(pixels),
        }
    }

    let sources: Vec<Source> = objects
        .iter()
        .enumerate()
        .map(|(i, pixels)| measure_source(image, pixels, i + 1))
        .collect();

    let segmentation = config.segmentation_map.then(|| {
        let mut segmap = Array2::zeros((rows, cols));
        for (i, pixels) in objects.iter().enumerate() {
            for &(r, c) in pixels {
                segmap[[r, c]] = (i + 1) as u32;
            }
        }
        segmap
    });

    debug!(
        "extracted {} sources from {} raw components ({}x{} image)",
        sources.len(),
        label_count,
        rows,
        cols
    );

    Ok(Extraction {
        sources,
        segmentation,
    })
}

/// Build the detection image the threshold is compared against.
fn detection_image(
    image: &ArrayView2<f64>,
    threshold: &Threshold,
    filter_kernel: Option<&ArrayView2<f64>>,
    filter_type: FilterType,
) -> Array2<f64> {
    let Some(kernel) = filter_kernel else {
        return image.to_owned();
    };

    let total = kernel.sum();
    // A zero-sum kernel cannot be normalized; use it as-is
    let normalized = if total.abs() > f64::EPSILON {
        kernel.mapv(|v| v / total)
    } else {
        kernel.to_owned()
    };

    let has_noise_map = threshold.map_shape().is_some();
    if filter_type == FilterType::Matched && has_noise_map {
        // Inverse-variance weighted smoothing: convolve image/var and 1/var
        // separately so noisy pixels contribute less
        let (rows, cols) = image.dim();
        let mut weighted = Array2::zeros((rows, cols));
        let mut weights = Array2::zeros((rows, cols));
        for r in 0..rows {
            for c in 0..cols {
                let var = threshold.variance_at(r, c).unwrap_or(1.0).max(f64::MIN_POSITIVE);
                weighted[[r, c]] = image[[r, c]] / var;
                weights[[r, c]] = 1.0 / var;
            }
        }
        let num = convolve2d(&weighted.view(), &normalized.view(), ConvolveOptions::default());
        let den = convolve2d(&weights.view(), &normalized.view(), ConvolveOptions::default());
        let mut filtered = num;
        for r in 0..rows {
            for c in 0..cols {
                let d = den[[r, c]];
                filtered[[r, c]] = if d > 0.0 { filtered[[r, c]] / d } else { 0.0 };
            }
        }
        filtered
    } else {
        convolve2d(image, &normalized.view(), ConvolveOptions::default())
    }
}

/// Find the root label in a disjoint-set (union-find) structure.
fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        // Path compression: point at the grandparent while walking up
        parents[current] = parents[parents[current]];
        current = parents[current];
    }
    current
}

/// Union two labels, keeping the smaller as the root.
fn union_labels(parents: &mut [usize], label1: usize, label2: usize) {
    let root1 = find_root(parents, label1);
    let root2 = find_root(parents, label2);
    if root1 != root2 {
        if root1 < root2 {
            parents[root2] = root1;
        } else {
            parents[root1] = root2;
        }
    }
}

/// Two-pass connected component labeling with union-find, 8-connectivity.
///
/// Returns the label image (0 = background, labels consecutive from 1) and
/// the number of components.
pub fn connected_components(mask: &ArrayView2<bool>) -> (Array2<usize>, usize) {
    let (rows, cols) = mask.dim();
    let mut labels = Array2::zeros((rows, cols));
    let mut parents = vec![0usize];
    let mut label_count = 0;

    // First pass: provisional labels from already-visited neighbors
    for i in 0..rows {
        for j in 0..cols {
            if !mask[[i, j]] {
                continue;
            }

            let mut neighbor_labels: [usize; 4] = [0; 4];
            let mut n = 0;
            // Up, left, up-left, up-right
            if i > 0 && labels[[i - 1, j]] > 0 {
                neighbor_labels[n] = labels[[i - 1, j]];
                n += 1;
            }
            if j > 0 && labels[[i, j - 1]] > 0 {
                neighbor_labels[n] = labels[[i, j - 1]];
                n += 1;
            }
            if i > 0 && j > 0 && labels[[i - 1, j - 1]] > 0 {
                neighbor_labels[n] = labels[[i - 1, j - 1]];
                n += 1;
            }
            if i > 0 && j + 1 < cols && labels[[i - 1, j + 1]] > 0 {
                neighbor_labels[n] = labels[[i - 1, j + 1]];
                n += 1;
            }

            if n == 0 {
                label_count += 1;
                labels[[i, j]] = label_count;
                parents.push(label_count);
            } else {
                let min_label = *neighbor_labels[..n].iter().min().unwrap();
                labels[[i, j]] = min_label;
                for &neighbor in &neighbor_labels[..n] {
                    if neighbor != min_label {
                        union_labels(&mut parents, min_label, neighbor);
                    }
                }
            }
        }
    }

    // Flatten the equivalences and map roots to consecutive labels
    for i in 1..parents.len() {
        find_root(&mut parents, i);
    }
    let mut relabel = vec![0usize; parents.len()];
    let mut next = 0;
    for i in 1..parents.len() {
        let root = parents[i];
        if relabel[root] == 0 {
            next += 1;
            relabel[root] = next;
        }
        relabel[i] = relabel[root];
    }

    // Second pass: apply final labels
    for label in labels.iter_mut() {
        if *label > 0 {
            *label = relabel[*label];
        }
    }

    (labels, next)
}

/// Multi-threshold deblending of one connected component.
///
/// Scans `nthresh` levels between the component's faintest detected pixel
/// and its peak (exponentially spaced when possible). At the first level
/// where the component splits into two or more branches each holding more
/// than `cont` of the total component flux, the branches become separate
/// objects and the remaining pixels join the branch with the nearest
/// flux-weighted centroid. Returns `None` when the component does not split.
fn deblend(
    detection: &Array2<f64>,
    pixels: &[(usize, usize)],
    nthresh: usize,
    cont: f64,
) -> Option<Vec<Vec<(usize, usize)>>> {
    if nthresh < 2 || cont >= 1.0 || pixels.len() < 2 {
        return None;
    }

    let values: Vec<f64> = pixels.iter().map(|&(r, c)| detection[[r, c]]).collect();
    let peak = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let base = values.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(peak > base) {
        return None;
    }

    let total_flux: f64 = values.iter().sum();
    let min_branch_flux = cont * total_flux;

    for k in 1..nthresh {
        let level = if base > 0.0 {
            base * (peak / base).powf(k as f64 / nthresh as f64)
        } else {
            base + (peak - base) * k as f64 / nthresh as f64
        };

        let branches = label_above_level(detection, pixels, level);
        if branches.len() < 2 {
            continue;
        }

        let significant: Vec<&Vec<(usize, usize)>> = branches
            .iter()
            .filter(|branch| {
                let flux: f64 = branch.iter().map(|&(r, c)| detection[[r, c]]).sum();
                flux > min_branch_flux
            })
            .collect();

        if significant.len() >= 2 {
            // Seed children with the significant branches
            let mut children: Vec<Vec<(usize, usize)>> =
                significant.iter().map(|b| (*b).clone()).collect();
            let centroids: Vec<(f64, f64)> = children
                .iter()
                .map(|branch| flux_weighted_centroid(detection, branch))
                .collect();

            // Assign every remaining component pixel to the nearest child
            let claimed: std::collections::HashSet<(usize, usize)> = significant
                .iter()
                .flat_map(|child| child.iter().copied())
                .collect();
            for &(r, c) in pixels.iter() {
                if claimed.contains(&(r, c)) {
                    continue;
                }
                let mut best = 0;
                let mut best_dist = f64::INFINITY;
                for (ci, &(cy, cx)) in centroids.iter().enumerate() {
                    let d = (r as f64 - cy).powi(2) + (c as f64 - cx).powi(2);
                    if d < best_dist {
                        best_dist = d;
                        best = ci;
                    }
                }
                children[best].push((r, c));
            }

            return Some(children);
        }
    }

    None
}

/// Label the sub-components of `pixels` whose detection value is at or
/// above `level`, using 8-connectivity flood fill within the component's
/// bounding box.
fn label_above_level(
    detection: &Array2<f64>,
    pixels: &[(usize, usize)],
    level: f64,
) -> Vec<Vec<(usize, usize)>> {
    let min_r = pixels.iter().map(|p| p.0).min().unwrap();
    let max_r = pixels.iter().map(|p| p.0).max().unwrap();
    let min_c = pixels.iter().map(|p| p.1).min().unwrap();
    let max_c = pixels.iter().map(|p| p.1).max().unwrap();
    let height = max_r - min_r + 1;
    let width = max_c - min_c + 1;

    let mut local = Array2::from_elem((height, width), false);
    for &(r, c) in pixels {
        if detection[[r, c]] >= level {
            local[[r - min_r, c - min_c]] = true;
        }
    }

    let neighbors = [
        (-1isize, -1isize),
        (-1, 0),
        (-1, 1),
        (0, -1),
        (0, 1),
        (1, -1),
        (1, 0),
        (1, 1),
    ];

    let mut visited = Array2::from_elem((height, width), false);
    let mut branches = Vec::new();

    for start_r in 0..height {
        for start_c in 0..width {
            if !local[[start_r, start_c]] || visited[[start_r, start_c]] {
                continue;
            }

            let mut branch = Vec::new();
            let mut stack = vec![(start_r, start_c)];
            visited[[start_r, start_c]] = true;

            while let Some((y, x)) = stack.pop() {
                branch.push((y + min_r, x + min_c));
                for &(dy, dx) in &neighbors {
                    let ny = y as isize + dy;
                    let nx = x as isize + dx;
                    if ny < 0 || nx < 0 || ny >= height as isize || nx >= width as isize {
                        continue;
                    }
                    let (ny, nx) = (ny as usize, nx as usize);
                    if local[[ny, nx]] && !visited[[ny, nx]] {
                        visited[[ny, nx]] = true;
                        stack.push((ny, nx));
                    }
                }
            }

            branches.push(branch);
        }
    }

    branches
}

/// Flux-weighted centroid of a pixel set as `(row, col)`.
fn flux_weighted_centroid(detection: &Array2<f64>, pixels: &[(usize, usize)]) -> (f64, f64) {
    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    for &(r, c) in pixels {
        let w = detection[[r, c]].max(0.0);
        m00 += w;
        m10 += r as f64 * w;
        m01 += c as f64 * w;
    }
    if m00 > f64::EPSILON {
        (m10 / m00, m01 / m00)
    } else {
        let n = pixels.len() as f64;
        let r: f64 = pixels.iter().map(|p| p.0 as f64).sum::<f64>() / n;
        let c: f64 = pixels.iter().map(|p| p.1 as f64).sum::<f64>() / n;
        (r, c)
    }
}

/// Measure photometry and shape for one object's pixel set.
///
/// Computes raw moments on the unfiltered image, then central moments
/// relative to the centroid and the ellipse parameters from the moment
/// matrix eigenvalues.
fn measure_source(image: &ArrayView2<f64>, pixels: &[(usize, usize)], id: usize) -> Source {
    let mut m00 = 0.0;
    let mut m10 = 0.0;
    let mut m01 = 0.0;
    let mut m20 = 0.0;
    let mut m02 = 0.0;
    let mut m11 = 0.0;
    let mut peak = f64::NEG_INFINITY;

    let mut xmin = usize::MAX;
    let mut xmax = 0;
    let mut ymin = usize::MAX;
    let mut ymax = 0;

    for &(r, c) in pixels {
        let intensity = image[[r, c]];
        peak = peak.max(intensity);
        xmin = xmin.min(c);
        xmax = xmax.max(c);
        ymin = ymin.min(r);
        ymax = ymax.max(r);

        m00 += intensity;
        m10 += c as f64 * intensity;
        m01 += r as f64 * intensity;
        m20 += (c as f64).powi(2) * intensity;
        m02 += (r as f64).powi(2) * intensity;
        m11 += (r as f64) * (c as f64) * intensity;
    }

    let npix = pixels.len();

    // Fall back to the unweighted pixel mean when the net flux vanishes
    if m00 <= f64::EPSILON {
        let n = npix as f64;
        let x = pixels.iter().map(|p| p.1 as f64).sum::<f64>() / n;
        let y = pixels.iter().map(|p| p.0 as f64).sum::<f64>() / n;
        return Source {
            id,
            x,
            y,
            flux: m00,
            peak,
            npix,
            xmin,
            xmax,
            ymin,
            ymax,
            m_xx: 0.0,
            m_yy: 0.0,
            m_xy: 0.0,
            a: 0.0,
            b: 0.0,
            theta: 0.0,
        };
    }

    let x = m10 / m00;
    let y = m01 / m00;

    let m_xx = m20 / m00 - x.powi(2);
    let m_yy = m02 / m00 - y.powi(2);
    let m_xy = m11 / m00 - x * y;

    let mean = (m_xx + m_yy) / 2.0;
    let diff = (m_xx - m_yy) / 2.0;
    let discriminant = (diff.powi(2) + m_xy.powi(2)).sqrt();

    let a = (mean + discriminant).max(0.0).sqrt();
    let b = (mean - discriminant).max(0.0).sqrt();
    let theta = 0.5 * (2.0 * m_xy).atan2(m_xx - m_yy);

    Source {
        id,
        x,
        y,
        flux: m00,
        peak,
        npix,
        xmin,
        xmax,
        ymin,
        ymax,
        m_xx,
        m_yy,
        m_xy,
        a,
        b,
        theta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Render a 2D Gaussian into the image
    fn add_gaussian(image: &mut Array2<f64>, x: f64, y: f64, amplitude: f64, sigma: f64) {
        let (rows, cols) = image.dim();
        for r in 0..rows {
            for c in 0..cols {
                let dx = c as f64 - x;
                let dy = r as f64 - y;
                image[[r, c]] += amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    fn plain_config() -> ExtractionConfig {
        ExtractionConfig {
            segmentation_map: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_two_separated_sources() {
        let mut image = Array2::zeros((64, 64));
        add_gaussian(&mut image, 16.0, 16.0, 100.0, 1.5);
        add_gaussian(&mut image, 48.0, 40.0, 80.0, 1.5);

        let result = extract(
            &image.view(),
            &Threshold::Absolute(5.0),
            None,
            &plain_config(),
        )
        .unwrap();

        assert_eq!(result.sources.len(), 2);

        let mut sources = result.sources.clone();
        sources.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap());
        assert_relative_eq!(sources[0].x, 16.0, epsilon = 0.2);
        assert_relative_eq!(sources[0].y, 16.0, epsilon = 0.2);
        assert_relative_eq!(sources[1].x, 48.0, epsilon = 0.2);
        assert_relative_eq!(sources[1].y, 40.0, epsilon = 0.2);

        assert!(sources[0].flux > sources[1].flux * 0.8);
        assert!(sources[0].peak > 90.0);
    }

    #[test]
    fn test_segmentation_labels_match_ids() {
        let mut image = Array2::zeros((48, 48));
        add_gaussian(&mut image, 12.0, 12.0, 50.0, 1.5);
        add_gaussian(&mut image, 36.0, 36.0, 50.0, 1.5);

        let result = extract(
            &image.view(),
            &Threshold::Absolute(2.0),
            None,
            &plain_config(),
        )
        .unwrap();

        let segmap = result.segmentation.as_ref().unwrap();
        assert_eq!(segmap.dim(), (48, 48));

        for source in &result.sources {
            let label = segmap[[source.y.round() as usize, source.x.round() as usize]];
            assert_eq!(label as usize, source.id);
        }

        // Labels used in the map are exactly the source ids plus background
        let mut seen: Vec<u32> = segmap.iter().copied().filter(|&v| v > 0).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), result.sources.len());
    }

    #[test]
    fn test_minarea_rejects_single_pixel() {
        let mut image = Array2::zeros((32, 32));
        image[[10, 10]] = 100.0; // hot pixel
        add_gaussian(&mut image, 22.0, 22.0, 50.0, 1.5);

        let result = extract(
            &image.view(),
            &Threshold::Absolute(5.0),
            None,
            &plain_config(),
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1);
        assert_relative_eq!(result.sources[0].x, 22.0, epsilon = 0.3);
    }

    #[test]
    fn test_no_segmentation_map_by_default() {
        let mut image = Array2::zeros((32, 32));
        add_gaussian(&mut image, 16.0, 16.0, 50.0, 1.5);

        let result = extract(
            &image.view(),
            &Threshold::Absolute(5.0),
            None,
            &ExtractionConfig::default(),
        )
        .unwrap();

        assert!(result.segmentation.is_none());
        assert_eq!(result.sources.len(), 1);
    }

    #[test]
    fn test_sigma_map_threshold() {
        let mut image = Array2::zeros((40, 40));
        add_gaussian(&mut image, 10.0, 10.0, 30.0, 1.5);
        add_gaussian(&mut image, 30.0, 30.0, 30.0, 1.5);

        // Noisy half of the frame gets a high sigma, quiet half a low one
        let sigma_map = Array2::from_shape_fn((40, 40), |(r, _)| if r < 20 { 20.0 } else { 1.0 });

        let result = extract(
            &image.view(),
            &Threshold::Sigma {
                scale: 3.0,
                map: sigma_map,
            },
            None,
            &ExtractionConfig {
                filter_type: FilterType::Convolution,
                ..plain_config()
            },
        )
        .unwrap();

        // Only the source in the quiet half clears 3 sigma
        assert_eq!(result.sources.len(), 1);
        assert_relative_eq!(result.sources[0].y, 30.0, epsilon = 0.3);
    }

    #[test]
    fn test_variance_map_equivalent_to_sigma() {
        let mut image = Array2::zeros((40, 40));
        add_gaussian(&mut image, 20.0, 20.0, 50.0, 1.5);

        let sigma_map = Array2::from_elem((40, 40), 2.0);
        let var_map = Array2::from_elem((40, 40), 4.0);

        let with_sigma = extract(
            &image.view(),
            &Threshold::Sigma {
                scale: 5.0,
                map: sigma_map,
            },
            None,
            &plain_config(),
        )
        .unwrap();
        let with_var = extract(
            &image.view(),
            &Threshold::Variance {
                scale: 5.0,
                map: var_map,
            },
            None,
            &plain_config(),
        )
        .unwrap();

        assert_eq!(with_sigma.sources.len(), 1);
        assert_eq!(with_var.sources.len(), 1);
        assert_eq!(with_sigma.sources[0].npix, with_var.sources[0].npix);
        assert_relative_eq!(
            with_sigma.sources[0].x,
            with_var.sources[0].x,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_filter_kernel_smooths_detection() {
        // A faint extended source detectable only after smoothing a noisy map
        let mut image = Array2::zeros((32, 32));
        add_gaussian(&mut image, 16.0, 16.0, 10.0, 2.0);
        // Single-pixel spike that smoothing should dilute below threshold
        image[[4, 4]] += 12.0;

        let kernel = crate::kernel::preset_kernel(4).unwrap();
        let result = extract(
            &image.view(),
            &Threshold::Absolute(5.0),
            Some(&kernel.view()),
            &plain_config(),
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1);
        assert_relative_eq!(result.sources[0].x, 16.0, epsilon = 0.3);
    }

    #[test]
    fn test_deblend_splits_close_pair() {
        // 10 px apart: the saddle between the peaks stays above threshold,
        // so the pair merges into one component before deblending
        let mut image = Array2::zeros((64, 64));
        add_gaussian(&mut image, 27.0, 32.0, 100.0, 2.0);
        add_gaussian(&mut image, 37.0, 32.0, 100.0, 2.0);

        let result = extract(
            &image.view(),
            &Threshold::Absolute(3.0),
            None,
            &plain_config(),
        )
        .unwrap();

        assert_eq!(result.sources.len(), 2, "close pair should deblend");
        let mut xs: Vec<f64> = result.sources.iter().map(|s| s.x).collect();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_relative_eq!(xs[0], 27.0, epsilon = 1.5);
        assert_relative_eq!(xs[1], 37.0, epsilon = 1.5);
    }

    #[test]
    fn test_deblend_disabled_by_cont() {
        let mut image = Array2::zeros((64, 64));
        add_gaussian(&mut image, 27.0, 32.0, 100.0, 2.0);
        add_gaussian(&mut image, 37.0, 32.0, 100.0, 2.0);

        let result = extract(
            &image.view(),
            &Threshold::Absolute(3.0),
            None,
            &ExtractionConfig {
                deblend_cont: 1.0,
                ..plain_config()
            },
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1, "cont >= 1 disables deblending");
    }

    #[test]
    fn test_elongated_source_shape() {
        let mut image = Array2::zeros((48, 48));
        // Elongated along x: sigma_x = 3, sigma_y = 1
        for r in 0..48 {
            for c in 0..48 {
                let dx = (c as f64 - 24.0) / 3.0;
                let dy = (r as f64 - 24.0) / 1.0;
                image[[r, c]] += 100.0 * (-(dx * dx + dy * dy) / 2.0).exp();
            }
        }

        let result = extract(
            &image.view(),
            &Threshold::Absolute(2.0),
            None,
            &plain_config(),
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1);
        let source = &result.sources[0];
        assert!(source.m_xx > source.m_yy);
        assert!(source.a > source.b);
        // Major axis along x means theta near zero
        assert!(source.theta.abs() < 0.1);
    }

    #[test]
    fn test_empty_image_errors() {
        let image = Array2::<f64>::zeros((0, 0));
        let err = extract(
            &image.view(),
            &Threshold::Absolute(1.0),
            None,
            &ExtractionConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::EmptyImage));
    }

    #[test]
    fn test_noise_map_shape_mismatch() {
        let image = Array2::<f64>::zeros((20, 20));
        let map = Array2::from_elem((10, 20), 1.0);
        let err = extract(
            &image.view(),
            &Threshold::Sigma { scale: 1.0, map },
            None,
            &ExtractionConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ExtractError::NoiseShapeMismatch { .. }));
    }

    #[test]
    fn test_connected_components_diagonal_linkage() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask[[0, 0]] = true;
        mask[[1, 1]] = true; // diagonal neighbor, 8-connectivity joins it
        mask[[3, 4]] = true; // separate component

        let (labels, count) = connected_components(&mask.view());
        assert_eq!(count, 2);
        assert_eq!(labels[[0, 0]], labels[[1, 1]]);
        assert_ne!(labels[[0, 0]], labels[[3, 4]]);
    }

    #[test]
    fn test_connected_components_u_shape_merges() {
        // A U shape forces a label equivalence to be resolved
        let mut mask = Array2::from_elem((4, 5), false);
        for r in 0..3 {
            mask[[r, 0]] = true;
            mask[[r, 4]] = true;
        }
        for c in 0..5 {
            mask[[3, c]] = true;
        }

        let (labels, count) = connected_components(&mask.view());
        assert_eq!(count, 1);
        assert_eq!(labels[[0, 0]], labels[[0, 4]]);
    }
}
