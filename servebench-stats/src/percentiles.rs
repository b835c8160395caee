//! Percentile Computation
//!
//! Tail percentiles of hit wait times are what an operator looks at when a
//! batch size starts to hurt, so they are computed from every sample.

use serde::{Deserialize, Serialize};

/// Standard percentiles reported per iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Percentiles {
    /// 50th percentile (median)
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 95th percentile
    pub p95: f64,
    /// 99th percentile
    pub p99: f64,
}

/// Compute a single percentile with linear interpolation between nearest ranks.
///
/// Returns `None` for an empty slice.
pub fn compute_percentile(samples: &[f64], percentile: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(percentile_of_sorted(&sorted, percentile))
}

/// Compute all standard percentiles with a single sort.
pub fn compute_percentiles(samples: &[f64]) -> Option<Percentiles> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    Some(Percentiles {
        p50: percentile_of_sorted(&sorted, 50.0),
        p90: percentile_of_sorted(&sorted, 90.0),
        p95: percentile_of_sorted(&sorted, 95.0),
        p99: percentile_of_sorted(&sorted, 99.0),
    })
}

// `sorted` must be non-empty and ascending.
pub(crate) fn percentile_of_sorted(sorted: &[f64], percentile: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }
    let p = (percentile / 100.0).clamp(0.0, 1.0);
    let rank = p * (n - 1) as f64;
    let lower_idx = rank.floor() as usize;
    let upper_idx = (lower_idx + 1).min(n - 1);
    let fraction = rank - lower_idx as f64;
    sorted[lower_idx] + fraction * (sorted[upper_idx] - sorted[lower_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        let samples = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(compute_percentile(&samples, 50.0), Some(3.0));
    }

    #[test]
    fn test_interpolates_between_ranks() {
        let samples = vec![10.0, 20.0];
        let p = compute_percentile(&samples, 50.0).unwrap();
        assert!((p - 15.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_tail_percentiles() {
        let samples: Vec<f64> = (1..=1000).map(|x| x as f64).collect();
        let p = compute_percentiles(&samples).unwrap();
        assert!(p.p50 > 499.0 && p.p50 < 502.0);
        assert!(p.p99 > 985.0 && p.p99 < 995.0);
    }

    #[test]
    fn test_single_sample() {
        let p = compute_percentiles(&[42.0]).unwrap();
        assert_eq!(p.p50, 42.0);
        assert_eq!(p.p99, 42.0);
    }

    #[test]
    fn test_empty_samples() {
        assert_eq!(compute_percentile(&[], 50.0), None);
        assert!(compute_percentiles(&[]).is_none());
    }
}
