//! Sufficient statistics of a Gaussian mixture.
//!
//! The E-step folds every sample into zeroth (`n`), first (`sum_px`) and second
//! (`sum_pxx`) order moments weighted by the component responsibilities. The
//! moments are additive: partial statistics accumulated over disjoint subsets of
//! the data can be merged in any order before the M-step.

use crate::{
    errors::{validate_all_finite, validate_dimension, EmError, EmResult},
    math_utils::{
        constants::MASS_TOLERANCE,
        float_ops::{is_close, slices_close},
    },
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Responsibility-weighted moments for a K-component, D-dimensional mixture.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GmmStats {
    /// Number of accumulated samples
    t: u64,
    /// Sum of the per-sample log-likelihoods
    log_likelihood: f64,
    /// Responsibility mass per component
    n: Vec<f64>,
    /// Responsibility-weighted sample sums, one row per component
    sum_px: Vec<Vec<f64>>,
    /// Responsibility-weighted squared sample sums, one row per component
    sum_pxx: Vec<Vec<f64>>,
    /// Feature dimensionality, kept even when there are no components
    n_inputs: usize,
}

impl GmmStats {
    /// Zeroed statistics for `n_gaussians` components of dimension `n_inputs`.
    pub fn new(n_gaussians: usize, n_inputs: usize) -> Self {
        Self {
            t: 0,
            log_likelihood: 0.0,
            n: vec![0.0; n_gaussians],
            sum_px: vec![vec![0.0; n_inputs]; n_gaussians],
            sum_pxx: vec![vec![0.0; n_inputs]; n_gaussians],
            n_inputs,
        }
    }

    /// Build statistics from pre-aggregated moments.
    ///
    /// Shapes must agree, masses must be non-negative and finite, and `Σ n`
    /// must equal `t` up to a relative tolerance. The dimensionality is taken
    /// from the first row of `sum_px`, or is 0 without components.
    pub fn from_parts(
        t: u64,
        log_likelihood: f64,
        n: Vec<f64>,
        sum_px: Vec<Vec<f64>>,
        sum_pxx: Vec<Vec<f64>>,
    ) -> EmResult<Self> {
        let n_inputs = sum_px.first().map_or(0, Vec::len);
        let stats = Self {
            t,
            log_likelihood,
            n,
            sum_px,
            sum_pxx,
            n_inputs,
        };
        stats.validate()?;
        Ok(stats)
    }

    /// Check shapes, masses and the `Σ n = T` invariant.
    pub fn validate(&self) -> EmResult<()> {
        let n_gaussians = self.n.len();
        validate_dimension(self.sum_px.len(), n_gaussians, "sum_px rows")?;
        validate_dimension(self.sum_pxx.len(), n_gaussians, "sum_pxx rows")?;
        let n_inputs = self.n_inputs();
        for (px, pxx) in self.sum_px.iter().zip(self.sum_pxx.iter()) {
            validate_dimension(px.len(), n_inputs, "sum_px columns")?;
            validate_dimension(pxx.len(), n_inputs, "sum_pxx columns")?;
            validate_all_finite(px, "sum_px")?;
            validate_all_finite(pxx, "sum_pxx")?;
        }
        validate_all_finite(&self.n, "n")?;
        if let Some(&mass) = self.n.iter().find(|&&m| m < 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "n".to_string(),
                value: mass,
                constraint: ">= 0".to_string(),
            });
        }
        let total: f64 = self.n.iter().sum();
        if !is_close(total, self.t as f64, MASS_TOLERANCE, MASS_TOLERANCE) {
            return Err(EmError::InvalidConfiguration {
                parameter: "sum(n)".to_string(),
                value: total,
                constraint: format!("equal to T = {}", self.t),
            });
        }
        Ok(())
    }

    /// Number of components K.
    pub fn n_gaussians(&self) -> usize {
        self.n.len()
    }

    /// Feature dimensionality D.
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// Resize and zero.
    pub fn resize(&mut self, n_gaussians: usize, n_inputs: usize) {
        *self = Self::new(n_gaussians, n_inputs);
    }

    /// Zero every accumulator, keeping the shape.
    pub fn init(&mut self) {
        self.t = 0;
        self.log_likelihood = 0.0;
        self.n.iter_mut().for_each(|v| *v = 0.0);
        for row in self.sum_px.iter_mut().chain(self.sum_pxx.iter_mut()) {
            row.iter_mut().for_each(|v| *v = 0.0);
        }
    }

    /// Number of accumulated samples T.
    pub fn t(&self) -> u64 {
        self.t
    }

    /// Sum of per-sample log-likelihoods.
    pub fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    /// Zeroth order statistics.
    pub fn n(&self) -> &[f64] {
        &self.n
    }

    /// First order statistics of component `k`.
    pub fn sum_px(&self, k: usize) -> EmResult<&[f64]> {
        Self::row(&self.sum_px, k)
    }

    /// Second order statistics of component `k`.
    pub fn sum_pxx(&self, k: usize) -> EmResult<&[f64]> {
        Self::row(&self.sum_pxx, k)
    }

    /// All first order rows.
    pub(crate) fn sum_px_rows(&self) -> &[Vec<f64>] {
        &self.sum_px
    }

    /// All second order rows.
    pub(crate) fn sum_pxx_rows(&self) -> &[Vec<f64>] {
        &self.sum_pxx
    }

    fn row(rows: &[Vec<f64>], k: usize) -> EmResult<&[f64]> {
        rows.get(k)
            .map(Vec::as_slice)
            .ok_or_else(|| EmError::DimensionMismatch {
                what: "gaussian index".to_string(),
                expected: rows.len(),
                actual: k,
            })
    }

    /// First order statistics concatenated into a supervector of length K·D.
    pub fn sum_px_supervector(&self) -> Vec<f64> {
        self.sum_px.iter().flatten().copied().collect()
    }

    /// Fold one sample with its responsibilities into the accumulators.
    ///
    /// `responsibilities[k]` is the posterior of component k; `sample_log_likelihood`
    /// the mixture log-likelihood of the sample.
    pub(crate) fn accumulate(&mut self, x: &[f64], responsibilities: &[f64], sample_log_likelihood: f64) {
        self.t += 1;
        self.log_likelihood += sample_log_likelihood;
        for (k, &p) in responsibilities.iter().enumerate() {
            self.n[k] += p;
            let px = &mut self.sum_px[k];
            let pxx = &mut self.sum_pxx[k];
            for (d, &xd) in x.iter().enumerate() {
                let weighted = p * xd;
                px[d] += weighted;
                pxx[d] += weighted * xd;
            }
        }
    }

    /// Add `other` into `self`; shapes must agree.
    pub fn merge(&mut self, other: &GmmStats) -> EmResult<()> {
        validate_dimension(other.n_gaussians(), self.n_gaussians(), "number of gaussians")?;
        validate_dimension(other.n_inputs(), self.n_inputs(), "feature dimension")?;
        *self += other;
        Ok(())
    }

    /// Approximate equality of all moments.
    pub fn is_similar_to(&self, other: &Self, r_epsilon: f64, a_epsilon: f64) -> bool {
        self.t == other.t
            && self.n_inputs == other.n_inputs
            && is_close(self.log_likelihood, other.log_likelihood, r_epsilon, a_epsilon)
            && slices_close(&self.n, &other.n, r_epsilon, a_epsilon)
            && self.sum_px.len() == other.sum_px.len()
            && self
                .sum_px
                .iter()
                .zip(other.sum_px.iter())
                .chain(self.sum_pxx.iter().zip(other.sum_pxx.iter()))
                .all(|(a, b)| slices_close(a, b, r_epsilon, a_epsilon))
    }

    /// Deserialize statistics from JSON.
    #[cfg(feature = "serde")]
    pub fn from_reader<R: std::io::Read>(reader: R) -> EmResult<Self> {
        let stats: Self =
            serde_json::from_reader(reader).map_err(|e| EmError::SerializationError {
                format: "JSON".to_string(),
                reason: e.to_string(),
            })?;
        stats.validate()?;
        Ok(stats)
    }

    /// Serialize statistics as JSON.
    #[cfg(feature = "serde")]
    pub fn to_writer<W: std::io::Write>(&self, writer: W) -> EmResult<()> {
        serde_json::to_writer(writer, self).map_err(|e| EmError::SerializationError {
            format: "JSON".to_string(),
            reason: e.to_string(),
        })
    }
}

impl AddAssign<&GmmStats> for GmmStats {
    /// Shapes are assumed equal; use [`GmmStats::merge`] for a checked version.
    fn add_assign(&mut self, other: &GmmStats) {
        self.t += other.t;
        self.log_likelihood += other.log_likelihood;
        for (a, b) in self.n.iter_mut().zip(other.n.iter()) {
            *a += b;
        }
        for (row, other_row) in self
            .sum_px
            .iter_mut()
            .zip(other.sum_px.iter())
            .chain(self.sum_pxx.iter_mut().zip(other.sum_pxx.iter()))
        {
            for (a, b) in row.iter_mut().zip(other_row.iter()) {
                *a += b;
            }
        }
    }
}
