//! Numerical constants and floating-point helpers shared by machines and trainers.
//!
//! Mixture likelihoods are evaluated in log space; [`log_sum_exp`] combines
//! log-probabilities without underflow.

use nalgebra::{Cholesky, DMatrix};

use crate::errors::{EmError, EmResult};

/// Numerical constants used across the crate.
pub mod constants {
    /// ln(2π), used by the Gaussian normalisation term
    pub const LN_TWO_PI: f64 = 1.8378770664093454835606594728112;

    /// Tolerance used when checking that responsibility mass sums to the sample count
    pub const MASS_TOLERANCE: f64 = 1e-6;

    /// Default variance floor and responsibility threshold (machine epsilon)
    pub const DEFAULT_THRESHOLD: f64 = f64::EPSILON;

    /// Smallest ridge added when a precision matrix fails to factorise
    pub const MATRIX_REGULARIZATION: f64 = 1e-10;
}

/// Approximate floating-point comparisons.
pub mod float_ops {
    /// `|a - b| <= a_epsilon + r_epsilon * |b|`, the usual numpy-style closeness test.
    #[inline]
    pub fn is_close(a: f64, b: f64, r_epsilon: f64, a_epsilon: f64) -> bool {
        if a == b {
            return true;
        }
        (a - b).abs() <= a_epsilon + r_epsilon * b.abs()
    }

    /// Element-wise [`is_close`] over two slices of equal length.
    pub fn slices_close(a: &[f64], b: &[f64], r_epsilon: f64, a_epsilon: f64) -> bool {
        a.len() == b.len()
            && a
                .iter()
                .zip(b.iter())
                .all(|(&x, &y)| is_close(x, y, r_epsilon, a_epsilon))
    }
}

/// Computes `ln(Σ exp(v))` over a slice.
///
/// Returns `-inf` for an empty slice or when every entry is `-inf`.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max_val = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max_val == f64::NEG_INFINITY || max_val.is_nan() {
        return max_val;
    }
    max_val
        + values
            .iter()
            .map(|&v| (v - max_val).exp())
            .sum::<f64>()
            .ln()
}

/// Squared Euclidean distance between two equal-length slices.
#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Inverse of a symmetric positive-definite matrix through its Cholesky factor.
///
/// A matrix that does not factorise is retried with a growing ridge on its
/// diagonal; `NumericalError` once every level fails.
pub fn spd_inverse(matrix: DMatrix<f64>, what: &str) -> EmResult<DMatrix<f64>> {
    if let Some(chol) = Cholesky::new(matrix.clone()) {
        return Ok(chol.inverse());
    }

    let n = matrix.nrows();
    let regularization_levels = [
        constants::MATRIX_REGULARIZATION,
        constants::MATRIX_REGULARIZATION * 100.0,
        1e-6,
        1e-4,
    ];
    for &level in &regularization_levels {
        let regularized = &matrix + DMatrix::<f64>::identity(n, n) * level;
        if let Some(chol) = Cholesky::new(regularized) {
            log::warn!("{} is not positive definite; regularised with {:e}", what, level);
            return Ok(chol.inverse());
        }
    }

    Err(EmError::NumericalError {
        reason: format!("{} is not positive definite even after regularisation", what),
    })
}
