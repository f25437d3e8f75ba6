//! Source detection for astronomical images.
//!
//! The pipeline mirrors the standard extraction workflow: pick a detection
//! kernel ([`kernel`]), estimate and optionally subtract a spatially varying
//! background ([`background`]), then threshold, segment, deblend, and
//! measure sources ([`extract`]). [`detect::detect_sources`] runs the whole
//! chain with one call.
//!
//! ```no_run
//! use ndarray::Array2;
//! use stardetect::detect::{detect_sources, DetectionConfig};
//! use stardetect::kernel::KernelSpec;
//!
//! # fn main() -> Result<(), stardetect::detect::DetectionError> {
//! let mut image: Array2<f64> = Array2::zeros((512, 512));
//! let detections = detect_sources(
//!     &mut image,
//!     3.0,
//!     &KernelSpec::Preset(4),
//!     None,
//!     None,
//!     &DetectionConfig::default(),
//! )?;
//! for source in &detections.sources {
//!     println!("({:.2}, {:.2}) flux {:.1}", source.x, source.y, source.flux);
//! }
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod convolve;
pub mod detect;
pub mod extract;
pub mod kernel;
pub mod stats;

pub use background::{estimate_background, Background, BackgroundConfig, BackgroundError};
pub use detect::{detect_sources, DetectionConfig, DetectionError, Detections};
pub use extract::{extract, Extraction, ExtractionConfig, FilterType, Source, Threshold};
pub use kernel::{gaussian_kernel, preset_kernel, KernelError, KernelSpec};
