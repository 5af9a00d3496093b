//! Gaussian mixture model with diagonal covariances.
//!
//! [`GmmMachine`] owns its components exclusively and caches the log of the
//! mixing weights. All public setters validate shapes and values before anything
//! is written; trainers commit M-step results through crate-private paths once
//! their own checks have passed.

use crate::{
    errors::{validate_all_finite, validate_dimension, validate_samples, EmError, EmResult},
    gaussian::GaussianComponent,
    gmm_stats::GmmStats,
    kmeans::KMeansMachine,
    math_utils::{
        constants::MASS_TOLERANCE,
        float_ops::{is_close, slices_close},
        log_sum_exp,
    },
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Mixture of K diagonal Gaussians over D-dimensional features.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GmmMachine {
    gaussians: Vec<GaussianComponent>,
    weights: Vec<f64>,
    log_weights: Vec<f64>,
    n_inputs: usize,
}

impl GmmMachine {
    /// Uniform weights, zero means, unit variances.
    pub fn new(n_gaussians: usize, n_inputs: usize) -> Self {
        let weight = if n_gaussians > 0 {
            1.0 / n_gaussians as f64
        } else {
            0.0
        };
        let mut machine = Self {
            gaussians: vec![GaussianComponent::new(n_inputs); n_gaussians],
            weights: vec![weight; n_gaussians],
            log_weights: vec![0.0; n_gaussians],
            n_inputs,
        };
        machine.recompute_log_weights();
        machine
    }

    /// Build a mixture from explicit weights, means and variances (one row per component).
    pub fn from_parameters(
        weights: &[f64],
        means: &[Vec<f64>],
        variances: &[Vec<f64>],
    ) -> EmResult<Self> {
        let n_inputs = means.first().map_or(0, Vec::len);
        let mut machine = Self::new(weights.len(), n_inputs);
        machine.set_weights(weights)?;
        machine.set_means(means)?;
        machine.set_variances(variances)?;
        Ok(machine)
    }

    /// Seed a mixture from a trained K-Means machine.
    ///
    /// Means are the cluster centres; variances and weights are the per-cluster
    /// sample variances and the fraction of samples closest to each centre.
    pub fn from_kmeans(kmeans: &KMeansMachine, data: &[Vec<f64>]) -> EmResult<Self> {
        let (variances, weights) = kmeans.variances_and_weights_for_each_cluster(data)?;
        let mut machine = Self::new(kmeans.n_means(), kmeans.n_inputs());
        machine.set_means(kmeans.means())?;
        machine.set_variances(&variances)?;
        machine.set_weights(&weights)?;
        Ok(machine)
    }

    /// Number of components K.
    pub fn n_gaussians(&self) -> usize {
        self.gaussians.len()
    }

    /// Feature dimensionality D.
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// `(K, D)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.n_gaussians(), self.n_inputs)
    }

    /// Resize, resetting every parameter to its default.
    pub fn resize(&mut self, n_gaussians: usize, n_inputs: usize) {
        *self = Self::new(n_gaussians, n_inputs);
    }

    /// Mixing weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Cached `ln(weights)`; `-inf` for zero weights.
    pub fn log_weights(&self) -> &[f64] {
        &self.log_weights
    }

    /// Set the weights: length K, finite, non-negative, summing to one.
    pub fn set_weights(&mut self, weights: &[f64]) -> EmResult<()> {
        validate_dimension(weights.len(), self.n_gaussians(), "number of weights")?;
        validate_all_finite(weights, "weights")?;
        if let Some(&w) = weights.iter().find(|&&w| w < 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "weights".to_string(),
                value: w,
                constraint: ">= 0".to_string(),
            });
        }
        let total: f64 = weights.iter().sum();
        if !weights.is_empty() && !is_close(total, 1.0, MASS_TOLERANCE, MASS_TOLERANCE) {
            return Err(EmError::InvalidConfiguration {
                parameter: "sum(weights)".to_string(),
                value: total,
                constraint: "equal to 1".to_string(),
            });
        }
        self.weights.copy_from_slice(weights);
        self.recompute_log_weights();
        Ok(())
    }

    /// Refresh the log-weight cache from the weights.
    pub fn recompute_log_weights(&mut self) {
        for (lw, &w) in self.log_weights.iter_mut().zip(self.weights.iter()) {
            *lw = w.ln();
        }
    }

    /// Component `k`.
    pub fn gaussian(&self, k: usize) -> EmResult<&GaussianComponent> {
        let n_gaussians = self.n_gaussians();
        self.gaussians.get(k).ok_or(EmError::DimensionMismatch {
            what: "gaussian index".to_string(),
            expected: n_gaussians,
            actual: k,
        })
    }

    /// Mutable component `k`; its own setters keep it valid.
    pub fn gaussian_mut(&mut self, k: usize) -> EmResult<&mut GaussianComponent> {
        let n_gaussians = self.n_gaussians();
        self.gaussians.get_mut(k).ok_or(EmError::DimensionMismatch {
            what: "gaussian index".to_string(),
            expected: n_gaussians,
            actual: k,
        })
    }

    /// All components.
    pub fn gaussians(&self) -> &[GaussianComponent] {
        &self.gaussians
    }

    /// Means, one row per component.
    pub fn means(&self) -> Vec<Vec<f64>> {
        self.gaussians.iter().map(|g| g.mean().to_vec()).collect()
    }

    /// Variances, one row per component.
    pub fn variances(&self) -> Vec<Vec<f64>> {
        self.gaussians.iter().map(|g| g.variance().to_vec()).collect()
    }

    /// Variance floors, one row per component.
    pub fn variance_thresholds(&self) -> Vec<Vec<f64>> {
        self.gaussians
            .iter()
            .map(|g| g.variance_thresholds().to_vec())
            .collect()
    }

    /// Means concatenated into a supervector of length K·D.
    pub fn mean_supervector(&self) -> Vec<f64> {
        self.gaussians.iter().flat_map(|g| g.mean().iter().copied()).collect()
    }

    /// Variances concatenated into a supervector of length K·D.
    pub fn variance_supervector(&self) -> Vec<f64> {
        self.gaussians
            .iter()
            .flat_map(|g| g.variance().iter().copied())
            .collect()
    }

    /// Set all means; nothing is written unless every row is valid.
    pub fn set_means(&mut self, means: &[Vec<f64>]) -> EmResult<()> {
        self.validate_rows(means, "means")?;
        for (g, mean) in self.gaussians.iter_mut().zip(means.iter()) {
            g.commit_mean(mean);
        }
        Ok(())
    }

    /// Set all variances (floored); nothing is written unless every row is valid.
    pub fn set_variances(&mut self, variances: &[Vec<f64>]) -> EmResult<()> {
        self.validate_rows(variances, "variances")?;
        if let Some(&v) = variances.iter().flatten().find(|&&v| v < 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "variances".to_string(),
                value: v,
                constraint: ">= 0".to_string(),
            });
        }
        for (g, variance) in self.gaussians.iter_mut().zip(variances.iter()) {
            g.commit_variance(variance);
        }
        Ok(())
    }

    /// Set the means from a K·D supervector.
    pub fn set_mean_supervector(&mut self, supervector: &[f64]) -> EmResult<()> {
        validate_dimension(
            supervector.len(),
            self.n_gaussians() * self.n_inputs,
            "mean supervector length",
        )?;
        let rows = self.split_supervector(supervector);
        self.set_means(&rows)
    }

    /// Same variance floor for every component and dimension.
    pub fn set_variance_thresholds(&mut self, threshold: f64) -> EmResult<()> {
        let thresholds = vec![threshold; self.n_inputs];
        self.set_variance_threshold_vector(&thresholds)
    }

    /// Same per-dimension variance floor for every component.
    pub fn set_variance_threshold_vector(&mut self, thresholds: &[f64]) -> EmResult<()> {
        let rows = vec![thresholds.to_vec(); self.n_gaussians()];
        self.set_variance_thresholds_per_component(&rows)
    }

    /// Individual variance floors per component.
    pub fn set_variance_thresholds_per_component(&mut self, thresholds: &[Vec<f64>]) -> EmResult<()> {
        self.validate_rows(thresholds, "variance thresholds")?;
        if let Some(&t) = thresholds.iter().flatten().find(|&&t| t < 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "variance_thresholds".to_string(),
                value: t,
                constraint: ">= 0".to_string(),
            });
        }
        for (g, row) in self.gaussians.iter_mut().zip(thresholds.iter()) {
            g.set_variance_threshold_vector(row)?;
        }
        Ok(())
    }

    /// Floor every component's variance at its thresholds.
    pub fn apply_variance_thresholds(&mut self) {
        for g in self.gaussians.iter_mut() {
            g.apply_variance_thresholds();
        }
    }

    /// Log-likelihood of one sample under the mixture.
    pub fn log_likelihood(&self, x: &[f64]) -> EmResult<f64> {
        validate_dimension(x.len(), self.n_inputs, "sample length")?;
        let mut buffer = vec![0.0; self.n_gaussians()];
        Ok(self.log_weighted_likelihoods(x, &mut buffer))
    }

    /// Average log-likelihood over a set of samples.
    pub fn average_log_likelihood(&self, data: &[Vec<f64>]) -> EmResult<f64> {
        validate_samples(data, self.n_inputs)?;
        let mut buffer = vec![0.0; self.n_gaussians()];
        let total: f64 = data
            .iter()
            .map(|x| self.log_weighted_likelihoods(x, &mut buffer))
            .sum();
        Ok(total / data.len() as f64)
    }

    /// Accumulate the sufficient statistics of one sample into `stats`.
    pub fn acc_statistics(&self, x: &[f64], stats: &mut GmmStats) -> EmResult<()> {
        validate_dimension(x.len(), self.n_inputs, "sample length")?;
        self.validate_stats_shape(stats)?;
        let mut buffer = vec![0.0; self.n_gaussians()];
        self.acc_statistics_unchecked(x, stats, &mut buffer);
        Ok(())
    }

    /// Accumulate a whole set of samples; nothing is added unless all samples are valid.
    pub fn acc_statistics_batch(&self, data: &[Vec<f64>], stats: &mut GmmStats) -> EmResult<()> {
        validate_samples(data, self.n_inputs)?;
        self.validate_stats_shape(stats)?;
        let mut buffer = vec![0.0; self.n_gaussians()];
        for x in data {
            self.acc_statistics_unchecked(x, stats, &mut buffer);
        }
        Ok(())
    }

    /// Fresh statistics of a set of samples against this mixture.
    pub fn compute_statistics(&self, data: &[Vec<f64>]) -> EmResult<GmmStats> {
        let mut stats = GmmStats::new(self.n_gaussians(), self.n_inputs);
        self.acc_statistics_batch(data, &mut stats)?;
        Ok(stats)
    }

    /// Approximate equality of weights and components.
    pub fn is_similar_to(&self, other: &Self, r_epsilon: f64, a_epsilon: f64) -> bool {
        self.shape() == other.shape()
            && slices_close(&self.weights, &other.weights, r_epsilon, a_epsilon)
            && self
                .gaussians
                .iter()
                .zip(other.gaussians.iter())
                .all(|(a, b)| a.is_similar_to(b, r_epsilon, a_epsilon))
    }

    /// Deserialize a mixture from JSON, re-validating every parameter.
    #[cfg(feature = "serde")]
    pub fn from_reader<R: std::io::Read>(reader: R) -> EmResult<Self> {
        let raw: Self = serde_json::from_reader(reader).map_err(|e| EmError::SerializationError {
            format: "JSON".to_string(),
            reason: e.to_string(),
        })?;
        Self::rebuild(&raw)
    }

    /// Run deserialized parameters through the validated setters; the
    /// log-weight and per-component caches are recomputed, never trusted.
    #[cfg(feature = "serde")]
    pub(crate) fn rebuild(raw: &Self) -> EmResult<Self> {
        let mut machine = Self::new(raw.n_gaussians(), raw.n_inputs());
        machine.set_weights(&raw.weights)?;
        machine.set_means(&raw.means())?;
        machine.set_variance_thresholds_per_component(&raw.variance_thresholds())?;
        machine.set_variances(&raw.variances())?;
        Ok(machine)
    }

    /// Serialize the mixture as JSON.
    #[cfg(feature = "serde")]
    pub fn to_writer<W: std::io::Write>(&self, writer: W) -> EmResult<()> {
        serde_json::to_writer(writer, self).map_err(|e| EmError::SerializationError {
            format: "JSON".to_string(),
            reason: e.to_string(),
        })
    }

    /// Fills `buffer[k] = ln w_k + ln N(x | k)` and returns the mixture log-likelihood.
    pub(crate) fn log_weighted_likelihoods(&self, x: &[f64], buffer: &mut [f64]) -> f64 {
        for ((slot, g), &lw) in buffer
            .iter_mut()
            .zip(self.gaussians.iter())
            .zip(self.log_weights.iter())
        {
            *slot = lw + g.log_likelihood(x);
        }
        log_sum_exp(buffer)
    }

    /// E-step kernel: responsibilities of `x`, folded into `stats`.
    pub(crate) fn acc_statistics_unchecked(&self, x: &[f64], stats: &mut GmmStats, buffer: &mut [f64]) {
        let log_likelihood = self.log_weighted_likelihoods(x, buffer);
        for slot in buffer.iter_mut() {
            *slot = (*slot - log_likelihood).exp();
        }
        stats.accumulate(x, buffer, log_likelihood);
    }

    pub(crate) fn validate_stats_shape(&self, stats: &GmmStats) -> EmResult<()> {
        validate_dimension(stats.n_gaussians(), self.n_gaussians(), "number of gaussians")?;
        validate_dimension(stats.n_inputs(), self.n_inputs, "feature dimension")
    }

    /// Commit M-step results. Buffers were sized and computed by the trainer.
    pub(crate) fn commit(
        &mut self,
        weights: Option<&[f64]>,
        means: Option<&[Vec<f64>]>,
        variances: Option<&[Vec<f64>]>,
    ) {
        if let Some(weights) = weights {
            self.weights.copy_from_slice(weights);
            self.recompute_log_weights();
        }
        if let Some(means) = means {
            for (g, mean) in self.gaussians.iter_mut().zip(means.iter()) {
                g.commit_mean(mean);
            }
        }
        if let Some(variances) = variances {
            for (g, variance) in self.gaussians.iter_mut().zip(variances.iter()) {
                g.commit_variance(variance);
            }
        }
    }

    fn validate_rows(&self, rows: &[Vec<f64>], name: &str) -> EmResult<()> {
        validate_dimension(rows.len(), self.n_gaussians(), &format!("{} rows", name))?;
        for row in rows {
            validate_dimension(row.len(), self.n_inputs, &format!("{} columns", name))?;
            validate_all_finite(row, name)?;
        }
        Ok(())
    }

    fn split_supervector(&self, supervector: &[f64]) -> Vec<Vec<f64>> {
        if self.n_inputs == 0 {
            return vec![Vec::new(); self.n_gaussians()];
        }
        supervector
            .chunks(self.n_inputs)
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn two_component_machine() -> GmmMachine {
        GmmMachine::from_parameters(
            &[0.4, 0.6],
            &[vec![0.0, 0.0], vec![3.0, 3.0]],
            &[vec![1.0, 1.0], vec![0.5, 2.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_default_machine() {
        let gmm = GmmMachine::new(4, 3);
        assert_eq!(gmm.shape(), (4, 3));
        assert_eq!(gmm.weights(), &[0.25; 4]);
        for &lw in gmm.log_weights() {
            assert_approx_eq!(lw, 0.25f64.ln(), 1e-12);
        }
    }

    #[test]
    fn test_set_weights_validation_and_log_cache() {
        let mut gmm = GmmMachine::new(3, 1);
        gmm.set_weights(&[0.5, 0.5, 0.0]).unwrap();
        assert_eq!(gmm.log_weights()[2], f64::NEG_INFINITY);

        assert!(matches!(
            gmm.set_weights(&[0.5, 0.5]),
            Err(EmError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            gmm.set_weights(&[0.5, 0.6, -0.1]),
            Err(EmError::InvalidConfiguration { .. })
        ));
        assert!(gmm.set_weights(&[0.5, 0.2, 0.2]).is_err());
        // Rejected writes leave the previous weights in place
        assert_eq!(gmm.weights(), &[0.5, 0.5, 0.0]);
    }

    #[test]
    fn test_log_likelihood_is_mixture_of_components() {
        let gmm = two_component_machine();
        let x = [1.0, 2.0];
        let expected = (0.4 * gmm.gaussian(0).unwrap().log_likelihood(&x).exp()
            + 0.6 * gmm.gaussian(1).unwrap().log_likelihood(&x).exp())
        .ln();
        assert_approx_eq!(gmm.log_likelihood(&x).unwrap(), expected, 1e-12);
        assert!(gmm.log_likelihood(&[1.0]).is_err());
    }

    #[test]
    fn test_acc_statistics_mass_equals_sample_count() {
        let gmm = two_component_machine();
        let data = vec![
            vec![0.1, -0.2],
            vec![2.9, 3.2],
            vec![1.5, 1.5],
            vec![-1.0, 0.5],
        ];
        let stats = gmm.compute_statistics(&data).unwrap();
        assert_eq!(stats.t(), 4);
        assert_approx_eq!(stats.n().iter().sum::<f64>(), 4.0, 1e-12);
        assert!(stats.n().iter().all(|&n| n >= 0.0));
        assert_approx_eq!(
            stats.log_likelihood(),
            data.iter().map(|x| gmm.log_likelihood(x).unwrap()).sum::<f64>(),
            1e-10
        );

        let mut wrong = GmmStats::new(3, 2);
        assert!(gmm.acc_statistics(&data[0], &mut wrong).is_err());
    }

    #[test]
    fn test_supervectors_and_thresholds() {
        let mut gmm = two_component_machine();
        assert_eq!(gmm.mean_supervector(), vec![0.0, 0.0, 3.0, 3.0]);
        assert_eq!(gmm.variance_supervector(), vec![1.0, 1.0, 0.5, 2.0]);

        gmm.set_mean_supervector(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(gmm.means(), vec![vec![1.0, 2.0], vec![3.0, 4.0]]);
        assert!(gmm.set_mean_supervector(&[1.0]).is_err());

        gmm.set_variance_thresholds(0.8).unwrap();
        assert_eq!(gmm.variances(), vec![vec![1.0, 1.0], vec![0.8, 2.0]]);
    }

    #[test]
    fn test_gaussian_index_out_of_range() {
        let mut gmm = GmmMachine::new(2, 1);
        assert!(gmm.gaussian(2).is_err());
        assert!(gmm.gaussian_mut(5).is_err());
        gmm.gaussian_mut(1).unwrap().set_mean(&[4.0]).unwrap();
        assert_eq!(gmm.means()[1], vec![4.0]);
    }

    #[test]
    fn test_is_similar_to() {
        let a = two_component_machine();
        let mut b = a.clone();
        assert!(a.is_similar_to(&b, 1e-5, 1e-8));
        b.set_means(&[vec![0.0, 0.0], vec![3.0, 3.5]]).unwrap();
        assert!(!a.is_similar_to(&b, 1e-5, 1e-8));
        assert!(!a.is_similar_to(&GmmMachine::new(2, 3), 1e-5, 1e-8));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_json_round_trip_recomputes_caches() {
        let gmm = two_component_machine();
        let mut buffer = Vec::new();
        gmm.to_writer(&mut buffer).unwrap();
        let restored = GmmMachine::from_reader(buffer.as_slice()).unwrap();
        assert!(restored.is_similar_to(&gmm, 1e-12, 1e-12));

        let mut document: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        document["log_weights"] = serde_json::json!([0.0, 0.0]);
        document["gaussians"][1]["g_norm"] = serde_json::json!(-1000.0);
        let stale = serde_json::to_vec(&document).unwrap();
        let restored = GmmMachine::from_reader(stale.as_slice()).unwrap();
        assert_approx_eq!(restored.log_weights()[0], 0.4f64.ln(), 1e-12);
        assert_approx_eq!(restored.gaussians()[1].g_norm(), gmm.gaussians()[1].g_norm(), 1e-12);

        let mut document: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        document["weights"] = serde_json::json!([3.0, 4.0]);
        let tampered = serde_json::to_vec(&document).unwrap();
        assert!(matches!(
            GmmMachine::from_reader(tampered.as_slice()),
            Err(EmError::InvalidConfiguration { .. })
        ));
    }
}
