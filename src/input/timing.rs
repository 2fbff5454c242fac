//! Randomized human-like delays.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A normally distributed delay in seconds, never below `min`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GaussianDelay {
    pub mean: f64,
    pub stddev: f64,
    pub min: f64,
}

impl GaussianDelay {
    pub const fn new(mean: f64, stddev: f64, min: f64) -> Self {
        Self { mean, stddev, min }
    }

    /// Draws one delay.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        secs(self.sample_secs(rng))
    }

    pub fn sample_secs<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let value = self.mean + self.stddev.abs() * rng.sample::<f64, _>(StandardNormal);
        value.max(self.min).max(0.0)
    }
}

/// Uniform draw from `[min, max)`, or `min` when the range is empty or its
/// width is not finite.
pub fn uniform<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    if max > min && (max - min).is_finite() {
        rng.random_range(min..max)
    } else {
        min
    }
}

/// Seconds to a `Duration`. Negative and NaN values become zero, values
/// too large for a `Duration` saturate to `Duration::MAX`.
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_gaussian_respects_floor() {
        let mut rng = StdRng::seed_from_u64(1);
        // Mean below the floor: most draws would be under it without clamping
        let delay = GaussianDelay::new(0.0, 0.05, 0.01);
        for _ in 0..2000 {
            assert!(delay.sample_secs(&mut rng) >= 0.01);
        }
    }

    #[test]
    fn test_gaussian_centers_on_mean() {
        let mut rng = StdRng::seed_from_u64(2);
        let delay = GaussianDelay::new(0.08, 0.03, 0.0);
        let n = 5000;
        let mean = (0..n).map(|_| delay.sample_secs(&mut rng)).sum::<f64>() / n as f64;
        assert!((mean - 0.08).abs() < 0.005, "sample mean {}", mean);
    }

    #[test]
    fn test_gaussian_spread_matches_stddev() {
        let mut rng = StdRng::seed_from_u64(5);
        let delay = GaussianDelay::new(10.0, 2.0, 0.0);
        let draws: Vec<f64> = (0..5000).map(|_| delay.sample_secs(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / draws.len() as f64;
        let var = draws.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / draws.len() as f64;
        assert!((var.sqrt() - 2.0).abs() < 0.1, "sample stddev {}", var.sqrt());
    }

    #[test]
    fn test_uniform_degenerate_range() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(uniform(&mut rng, 2.0, 2.0), 2.0);
        assert_eq!(uniform(&mut rng, 3.0, 1.0), 3.0);
        let v = uniform(&mut rng, 1.0, 3.0);
        assert!((1.0..3.0).contains(&v));
    }

    #[test]
    fn test_secs_rejects_negative() {
        assert_eq!(secs(-1.0), Duration::ZERO);
        assert_eq!(secs(f64::NAN), Duration::ZERO);
        assert_eq!(secs(0.5), Duration::from_millis(500));
    }

    #[test]
    fn test_secs_saturates_huge_values() {
        assert_eq!(secs(1e20), Duration::MAX);
        assert_eq!(secs(f64::INFINITY), Duration::MAX);
    }

    #[test]
    fn test_uniform_unbounded_span() {
        let mut rng = StdRng::seed_from_u64(4);
        assert_eq!(uniform(&mut rng, -f64::MAX, f64::MAX), -f64::MAX);
        assert_eq!(uniform(&mut rng, 1.0, f64::INFINITY), 1.0);
    }
}
