//! Statistical helpers shared by the background estimator and kernel generator.

use scilib::math::basic::erf;
use std::f64::consts::SQRT_2;

/// Cumulative distribution function for the standard normal distribution
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Calculate the median of a slice of f64 values, ignoring NaN entries.
///
/// For even-length data, returns the average of the two middle values.
/// Returns `None` if no valid values remain after filtering NaN.
pub fn median(values: &[f64]) -> Option<f64> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();

    if valid.is_empty() {
        return None;
    }

    valid.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mid = valid.len() / 2;
    if valid.len() % 2 == 0 {
        Some((valid[mid - 1] + valid[mid]) / 2.0)
    } else {
        Some(valid[mid])
    }
}

/// Sigma-clipped location and spread estimate.
///
/// Iteratively rejects values more than `sigma` standard deviations from the
/// running median, then returns `(median, std_dev)` of the surviving values.
/// Non-finite values are dropped up front. Returns `None` when nothing
/// survives the filtering.
///
/// # Arguments
/// * `values` - Sample data (typically one background tile's pixels)
/// * `sigma` - Clip limit in units of the running standard deviation
/// * `max_iters` - Maximum number of rejection passes
pub fn sigma_clipped_stats(values: &[f64], sigma: f64, max_iters: usize) -> Option<(f64, f64)> {
    let mut kept: Vec<f64> = values.iter().filter(|v| v.is_finite()).copied().collect();

    if kept.is_empty() {
        return None;
    }

    let mut center = median(&kept)?;
    let mut spread = std_around(&kept, center);

    for _ in 0..max_iters {
        let cutoff = sigma * spread;
        let before = kept.len();
        kept.retain(|v| (v - center).abs() <= cutoff);

        if kept.is_empty() {
            // Degenerate spread estimate rejected everything; report the
            // last stable statistics instead.
            return Some((center, spread));
        }

        center = median(&kept)?;
        spread = std_around(&kept, center);

        if kept.len() == before {
            break;
        }
    }

    Some((center, spread))
}

/// Standard deviation of `values` about a fixed center.
fn std_around(values: &[f64], center: f64) -> f64 {
    let n = values.len() as f64;
    let var = values.iter().map(|v| (v - center).powi(2)).sum::<f64>() / n;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_normal_cdf_known_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.0) - 0.8413447461).abs() < 1e-6);
        assert!((normal_cdf(-1.0) - 0.1586552539).abs() < 1e-6);
        assert!((normal_cdf(1.96) - 0.975).abs() < 0.001);
    }

    #[test]
    fn test_median_odd_length() {
        let values = vec![1.0, 3.0, 2.0, 5.0, 4.0];
        assert_eq!(median(&values).unwrap(), 3.0);
    }

    #[test]
    fn test_median_even_length() {
        let values = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(median(&values).unwrap(), 2.5);
    }

    #[test]
    fn test_median_with_nan() {
        let values = vec![1.0, f64::NAN, 3.0, 2.0, f64::NAN];
        assert_eq!(median(&values).unwrap(), 2.0);
    }

    #[test]
    fn test_median_all_nan() {
        let values = vec![f64::NAN, f64::NAN];
        assert!(median(&values).is_none());
    }

    #[test]
    fn test_sigma_clip_rejects_outlier() {
        // 99 background-like values plus one bright source pixel
        let mut values = vec![10.0; 99];
        for (i, v) in values.iter_mut().enumerate() {
            *v += (i % 7) as f64 * 0.01;
        }
        values.push(5000.0);

        let (center, spread) = sigma_clipped_stats(&values, 3.0, 5).unwrap();
        assert_relative_eq!(center, 10.03, epsilon = 0.05);
        assert!(spread < 1.0, "outlier should not inflate spread: {spread}");
    }

    #[test]
    fn test_sigma_clip_constant_data() {
        let values = vec![7.5; 50];
        let (center, spread) = sigma_clipped_stats(&values, 3.0, 5).unwrap();
        assert_eq!(center, 7.5);
        assert_eq!(spread, 0.0);
    }

    #[test]
    fn test_sigma_clip_empty() {
        assert!(sigma_clipped_stats(&[], 3.0, 5).is_none());
        assert!(sigma_clipped_stats(&[f64::NAN], 3.0, 5).is_none());
    }
}
