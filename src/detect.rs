//! End-to-end source detection pipeline
//!
//! Wires the individual stages together: resolve the detection kernel,
//! estimate the background, optionally subtract it, resolve the detection
//! threshold against either a caller-supplied noise map or the background's
//! global rms, and run the extraction pass.

use log::debug;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::background::{estimate_background, Background, BackgroundConfig, BackgroundError};
use crate::extract::{extract, ExtractError, ExtractionConfig, Source, Threshold};
use crate::kernel::{KernelError, KernelSpec};

/// Errors from the detection pipeline. Stage errors pass through unchanged.
#[derive(Error, Debug)]
pub enum DetectionError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Background(#[from] BackgroundError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Settings for the full detection pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Subtract the estimated background from the image before extraction
    pub subtract_background: bool,
    /// Interpret a caller-supplied error array as per-pixel standard
    /// deviation; when false it is treated as variance
    pub use_sigma: bool,
    /// Keep the background model in the result
    pub return_background: bool,
    /// Background mesh settings
    pub background: BackgroundConfig,
    /// Extraction settings
    pub extraction: ExtractionConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            subtract_background: true,
            use_sigma: true,
            return_background: true,
            background: BackgroundConfig::default(),
            extraction: ExtractionConfig {
                segmentation_map: true,
                ..Default::default()
            },
        }
    }
}

/// Output of a detection run.
///
/// The source catalog is always present; the segmentation map and the
/// background model follow their respective config flags.
#[derive(Debug, Clone)]
pub struct Detections {
    /// Detected sources
    pub sources: Vec<Source>,
    /// Integer label image when `extraction.segmentation_map` is set
    pub segmentation: Option<Array2<u32>>,
    /// Background model when `return_background` is set
    pub background: Option<Background>,
}

/// Detect sources in an image.
///
/// The image is modified in place when `config.subtract_background` is set;
/// otherwise it is left untouched.
///
/// Without an error array, `threshold` is a multiple of the background's
/// global rms. With one, `threshold` scales the per-pixel noise: standard
/// deviation when `config.use_sigma` is set, variance otherwise.
///
/// # Arguments
/// * `image` - Input image; background-subtracted in place when configured
/// * `threshold` - Detection significance in noise units
/// * `kernel` - Detection kernel specification
/// * `err` - Optional per-pixel noise array (sigma or variance)
/// * `mask` - Optional boolean mask of pixels excluded from background
///   estimation
/// * `config` - Pipeline settings
pub fn detect_sources(
    image: &mut Array2<f64>,
    threshold: f64,
    kernel: &KernelSpec,
    err: Option<Array2<f64>>,
    mask: Option<&Array2<bool>>,
    config: &DetectionConfig,
) -> Result<Detections, DetectionError> {
    let kernel_matrix = kernel.matrix()?;

    let background = estimate_background(
        &image.view(),
        mask.map(|m| m.view()).as_ref(),
        &config.background,
    )?;

    if config.subtract_background {
        background.subtract_from(image)?;
    }

    let resolved_threshold = match err {
        None => {
            let level = threshold * background.global_rms();
            debug!(
                "threshold {threshold} x global rms {:.4} = {level:.4}",
                background.global_rms()
            );
            Threshold::Absolute(level)
        }
        Some(map) if config.use_sigma => Threshold::Sigma {
            scale: threshold,
            map,
        },
        Some(map) => Threshold::Variance {
            scale: threshold,
            map,
        },
    };

    let extraction = extract(
        &image.view(),
        &resolved_threshold,
        Some(&kernel_matrix.view()),
        &config.extraction,
    )?;

    debug!("detection finished with {} sources", extraction.sources.len());

    Ok(Detections {
        sources: extraction.sources,
        segmentation: extraction.segmentation,
        background: config.return_background.then_some(background),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn scene(shape: (usize, usize), sky: f64, noise: f64, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let dist = Normal::new(sky, noise).unwrap();
        Array2::from_shape_fn(shape, |_| dist.sample(&mut rng))
    }

    fn add_star(image: &mut Array2<f64>, x: f64, y: f64, amplitude: f64, sigma: f64) {
        let (rows, cols) = image.dim();
        for r in 0..rows {
            for c in 0..cols {
                let dx = c as f64 - x;
                let dy = r as f64 - y;
                image[[r, c]] += amplitude * (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
            }
        }
    }

    #[test]
    fn test_single_star_detected() {
        let mut image = scene((120, 120), 100.0, 2.0, 42);
        add_star(&mut image, 60.0, 60.0, 500.0, 2.0);

        let result = detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(4),
            None,
            None,
            &DetectionConfig::default(),
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1);
        assert_relative_eq!(result.sources[0].x, 60.0, epsilon = 0.5);
        assert_relative_eq!(result.sources[0].y, 60.0, epsilon = 0.5);
        assert!(result.background.is_some());
        assert!(result.segmentation.is_some());
    }

    #[test]
    fn test_background_subtracted_in_place() {
        let mut image = scene((100, 100), 250.0, 1.0, 9);
        let before = image.mean().unwrap();

        detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(1),
            None,
            None,
            &DetectionConfig::default(),
        )
        .unwrap();

        let after = image.mean().unwrap();
        assert!(before > 200.0);
        assert!(after.abs() < 1.0, "sky not removed: {after}");
    }

    #[test]
    fn test_subtraction_disabled_leaves_image() {
        let mut image = scene((100, 100), 250.0, 1.0, 9);
        let before = image.clone();

        let config = DetectionConfig {
            subtract_background: false,
            ..Default::default()
        };
        detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(1),
            None,
            None,
            &config,
        )
        .unwrap();

        assert_eq!(image, before);
    }

    #[test]
    fn test_optional_outputs_follow_flags() {
        let mut image = scene((100, 100), 50.0, 1.0, 4);
        add_star(&mut image, 50.0, 50.0, 300.0, 2.0);

        let config = DetectionConfig {
            return_background: false,
            extraction: ExtractionConfig {
                segmentation_map: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(4),
            None,
            None,
            &config,
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1);
        assert!(result.background.is_none());
        assert!(result.segmentation.is_none());
    }

    #[test]
    fn test_error_array_as_sigma() {
        let mut image = scene((100, 100), 0.0, 1.0, 17);
        add_star(&mut image, 30.0, 70.0, 200.0, 2.0);

        let err = Array2::from_elem((100, 100), 1.0);
        let config = DetectionConfig {
            subtract_background: false,
            ..Default::default()
        };
        let result = detect_sources(
            &mut image,
            10.0,
            &KernelSpec::Preset(4),
            Some(err),
            None,
            &config,
        )
        .unwrap();

        assert_eq!(result.sources.len(), 1);
        assert_relative_eq!(result.sources[0].x, 30.0, epsilon = 0.5);
        assert_relative_eq!(result.sources[0].y, 70.0, epsilon = 0.5);
    }

    #[test]
    fn test_error_array_as_variance() {
        let mut image = scene((100, 100), 0.0, 1.0, 17);
        add_star(&mut image, 30.0, 70.0, 200.0, 2.0);

        // Variance 4 is sigma 2, so this must match a sigma run at scale 2x
        let var = Array2::from_elem((100, 100), 4.0);
        let config = DetectionConfig {
            subtract_background: false,
            use_sigma: false,
            ..Default::default()
        };
        let with_var = detect_sources(
            &mut image.clone(),
            5.0,
            &KernelSpec::Preset(4),
            Some(var),
            None,
            &config,
        )
        .unwrap();

        let sig = Array2::from_elem((100, 100), 2.0);
        let sigma_config = DetectionConfig {
            subtract_background: false,
            ..Default::default()
        };
        let with_sigma = detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(4),
            Some(sig),
            None,
            &sigma_config,
        )
        .unwrap();

        assert_eq!(with_var.sources.len(), with_sigma.sources.len());
        assert_eq!(with_var.sources[0].npix, with_sigma.sources[0].npix);
    }

    #[test]
    fn test_kernel_error_passes_through() {
        let mut image = scene((60, 60), 10.0, 1.0, 1);
        let err = detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(9),
            None,
            None,
            &DetectionConfig::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            DetectionError::Kernel(KernelError::UnsupportedPreset(9))
        ));
    }

    #[test]
    fn test_mask_forwarded_to_background() {
        let mut image = scene((100, 100), 20.0, 1.0, 23);
        let mask = Array2::from_elem((90, 100), false);
        let err = detect_sources(
            &mut image,
            5.0,
            &KernelSpec::Preset(1),
            None,
            Some(&mask),
            &DetectionConfig::default(),
        )
        .unwrap_err();

        assert!(matches!(
            err,
            DetectionError::Background(BackgroundError::MaskShapeMismatch { .. })
        ));
    }
}
