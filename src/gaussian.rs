//! Diagonal-covariance multivariate Gaussian.
//!
//! A [`GaussianComponent`] keeps its mean, its variance and a per-dimension
//! variance floor. The normalisation constant and the inverse variances are cached
//! and refreshed by every setter, so likelihood evaluation never recomputes them.

use crate::{
    errors::{validate_all_finite, validate_dimension, EmError, EmResult},
    math_utils::{
        constants::{DEFAULT_THRESHOLD, LN_TWO_PI},
        float_ops::slices_close,
    },
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Multivariate Gaussian with diagonal covariance.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GaussianComponent {
    mean: Vec<f64>,
    variance: Vec<f64>,
    variance_thresholds: Vec<f64>,
    /// `D ln(2π) + Σ ln σ²`
    g_norm: f64,
    inv_variance: Vec<f64>,
}

impl GaussianComponent {
    /// Zero mean, unit variance, machine-epsilon floor.
    pub fn new(n_inputs: usize) -> Self {
        let mut gaussian = Self {
            mean: vec![0.0; n_inputs],
            variance: vec![1.0; n_inputs],
            variance_thresholds: vec![DEFAULT_THRESHOLD; n_inputs],
            g_norm: 0.0,
            inv_variance: vec![1.0; n_inputs],
        };
        gaussian.precompute();
        gaussian
    }

    /// Build a component from explicit parameters.
    pub fn from_parameters(mean: Vec<f64>, variance: Vec<f64>) -> EmResult<Self> {
        let mut gaussian = Self::new(mean.len());
        gaussian.set_mean(&mean)?;
        gaussian.set_variance(&variance)?;
        Ok(gaussian)
    }

    /// Feature dimensionality D.
    pub fn n_inputs(&self) -> usize {
        self.mean.len()
    }

    /// Resize to `n_inputs`, resetting to the default parameters.
    pub fn resize(&mut self, n_inputs: usize) {
        *self = Self::new(n_inputs);
    }

    /// Mean vector.
    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    /// Variance vector (diagonal of the covariance).
    pub fn variance(&self) -> &[f64] {
        &self.variance
    }

    /// Per-dimension variance floor.
    pub fn variance_thresholds(&self) -> &[f64] {
        &self.variance_thresholds
    }

    /// Cached `D ln(2π) + Σ ln σ²`.
    pub fn g_norm(&self) -> f64 {
        self.g_norm
    }

    /// Set the mean; length must equal D and values must be finite.
    pub fn set_mean(&mut self, mean: &[f64]) -> EmResult<()> {
        validate_dimension(mean.len(), self.n_inputs(), "mean length")?;
        validate_all_finite(mean, "mean")?;
        self.mean.copy_from_slice(mean);
        Ok(())
    }

    /// Set the variance; it is floored at the current thresholds.
    pub fn set_variance(&mut self, variance: &[f64]) -> EmResult<()> {
        validate_dimension(variance.len(), self.n_inputs(), "variance length")?;
        validate_all_finite(variance, "variance")?;
        if let Some(&v) = variance.iter().find(|&&v| v < 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "variance".to_string(),
                value: v,
                constraint: ">= 0".to_string(),
            });
        }
        self.variance.copy_from_slice(variance);
        self.apply_variance_thresholds();
        Ok(())
    }

    /// Same floor for every dimension.
    pub fn set_variance_thresholds(&mut self, threshold: f64) -> EmResult<()> {
        let thresholds = vec![threshold; self.n_inputs()];
        self.set_variance_threshold_vector(&thresholds)
    }

    /// Per-dimension floor; re-applied to the current variance immediately.
    pub fn set_variance_threshold_vector(&mut self, thresholds: &[f64]) -> EmResult<()> {
        validate_dimension(thresholds.len(), self.n_inputs(), "variance thresholds length")?;
        validate_all_finite(thresholds, "variance thresholds")?;
        if let Some(&t) = thresholds.iter().find(|&&t| t < 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "variance_thresholds".to_string(),
                value: t,
                constraint: ">= 0".to_string(),
            });
        }
        self.variance_thresholds.copy_from_slice(thresholds);
        self.apply_variance_thresholds();
        Ok(())
    }

    /// `variance[d] = max(variance[d], floor[d])`, then refresh the caches.
    pub fn apply_variance_thresholds(&mut self) {
        for (v, &floor) in self.variance.iter_mut().zip(self.variance_thresholds.iter()) {
            if *v < floor {
                *v = floor;
            }
        }
        self.precompute();
    }

    /// Log-density of `x`. The caller guarantees `x.len() == D`.
    pub fn log_likelihood(&self, x: &[f64]) -> f64 {
        let mahalanobis: f64 = x
            .iter()
            .zip(self.mean.iter())
            .zip(self.inv_variance.iter())
            .map(|((&xi, &mi), &inv)| {
                let diff = xi - mi;
                diff * diff * inv
            })
            .sum();
        -0.5 * (self.g_norm + mahalanobis)
    }

    /// Log-density of `x` with a length check.
    pub fn log_likelihood_checked(&self, x: &[f64]) -> EmResult<f64> {
        validate_dimension(x.len(), self.n_inputs(), "sample length")?;
        Ok(self.log_likelihood(x))
    }

    /// Approximate equality of all parameters.
    pub fn is_similar_to(&self, other: &Self, r_epsilon: f64, a_epsilon: f64) -> bool {
        slices_close(&self.mean, &other.mean, r_epsilon, a_epsilon)
            && slices_close(&self.variance, &other.variance, r_epsilon, a_epsilon)
            && slices_close(
                &self.variance_thresholds,
                &other.variance_thresholds,
                r_epsilon,
                a_epsilon,
            )
    }

    /// Trainer commit path: values were produced by an M-step from validated statistics.
    pub(crate) fn commit_mean(&mut self, mean: &[f64]) {
        self.mean.copy_from_slice(mean);
    }

    /// Trainer commit path; flooring and cache refresh happen here.
    pub(crate) fn commit_variance(&mut self, variance: &[f64]) {
        self.variance.copy_from_slice(variance);
        self.apply_variance_thresholds();
    }

    fn precompute(&mut self) {
        let d = self.n_inputs() as f64;
        self.g_norm = d * LN_TWO_PI + self.variance.iter().map(|v| v.ln()).sum::<f64>();
        for (inv, &v) in self.inv_variance.iter_mut().zip(self.variance.iter()) {
            *inv = 1.0 / v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use statrs::distribution::{Continuous, Normal};

    #[test]
    fn test_default_component() {
        let g = GaussianComponent::new(3);
        assert_eq!(g.mean(), &[0.0, 0.0, 0.0]);
        assert_eq!(g.variance(), &[1.0, 1.0, 1.0]);
        assert_eq!(g.variance_thresholds(), &[f64::EPSILON; 3]);
        assert_approx_eq!(g.g_norm(), 3.0 * LN_TWO_PI, 1e-12);
    }

    #[test]
    fn test_log_likelihood_matches_univariate_normal() {
        let g = GaussianComponent::from_parameters(vec![1.5], vec![4.0]).unwrap();
        let reference = Normal::new(1.5, 2.0).unwrap();
        for &x in &[-3.0, 0.0, 1.5, 2.7, 10.0] {
            assert_approx_eq!(g.log_likelihood(&[x]), reference.ln_pdf(x), 1e-10);
        }
    }

    #[test]
    fn test_log_likelihood_is_sum_over_dimensions() {
        let g = GaussianComponent::from_parameters(vec![0.0, 2.0], vec![1.0, 0.25]).unwrap();
        let n0 = Normal::new(0.0, 1.0).unwrap();
        let n1 = Normal::new(2.0, 0.5).unwrap();
        let x = [0.3, 1.6];
        assert_approx_eq!(
            g.log_likelihood(&x),
            n0.ln_pdf(x[0]) + n1.ln_pdf(x[1]),
            1e-10
        );
        assert!(g.log_likelihood_checked(&[0.0]).is_err());
    }

    #[test]
    fn test_variance_floor_applied_on_set() {
        let mut g = GaussianComponent::new(2);
        g.set_variance_thresholds(0.5).unwrap();
        g.set_variance(&[0.1, 2.0]).unwrap();
        assert_eq!(g.variance(), &[0.5, 2.0]);

        // Raising the floor re-applies it to the stored variance
        g.set_variance_threshold_vector(&[0.5, 3.0]).unwrap();
        assert_eq!(g.variance(), &[0.5, 3.0]);
        assert_approx_eq!(
            g.g_norm(),
            2.0 * LN_TWO_PI + 0.5f64.ln() + 3.0f64.ln(),
            1e-12
        );
    }

    #[test]
    fn test_setters_validate_input() {
        let mut g = GaussianComponent::new(2);
        assert!(matches!(
            g.set_mean(&[1.0]),
            Err(EmError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            g.set_variance(&[1.0, -1.0]),
            Err(EmError::InvalidConfiguration { .. })
        ));
        assert!(g.set_mean(&[f64::NAN, 0.0]).is_err());
        assert!(g.set_variance_thresholds(-1.0).is_err());
        // Failed setters leave the component untouched
        assert_eq!(g, GaussianComponent::new(2));
    }

    #[test]
    fn test_is_similar_to() {
        let a = GaussianComponent::from_parameters(vec![1.0, 2.0], vec![1.0, 1.0]).unwrap();
        let b = GaussianComponent::from_parameters(vec![1.0, 2.0 + 1e-9], vec![1.0, 1.0]).unwrap();
        let c = GaussianComponent::from_parameters(vec![1.0, 2.5], vec![1.0, 1.0]).unwrap();
        assert!(a.is_similar_to(&b, 1e-5, 1e-8));
        assert!(!a.is_similar_to(&c, 1e-5, 1e-8));
    }
}
