//! Maximum-likelihood re-estimation of GMM parameters.
//!
//! The M-step follows Bishop, "Pattern recognition and machine learning" (2006),
//! equations 9.24-9.26, with the computational form of the variance
//! `σ² = Σ P x² / n - μ²`. Denominators are floored at the responsibility
//! threshold so a collapsing component never divides by a vanishing mass.
//!
//! Update order: weights, thresholded masses, means, variances. The variance
//! reads the mean produced in the same call when means are updated.

use crate::{
    config::GmmTrainerConfig,
    em_training::EmTrainer,
    errors::{validate_dimension, EmError, EmResult},
    gmm_base_trainer::GmmBaseTrainer,
    gmm_machine::GmmMachine,
    gmm_stats::GmmStats,
};

/// ML M-step on top of a [`GmmBaseTrainer`].
#[derive(Debug, Clone, Default)]
pub struct MlGmmTrainer {
    base: GmmBaseTrainer,
    /// `max(n[k], threshold)`, allocated by `initialize`
    thresholded_n: Option<Vec<f64>>,
}

impl MlGmmTrainer {
    /// Wrap an existing base trainer.
    pub fn new(base: GmmBaseTrainer) -> Self {
        Self {
            base,
            thresholded_n: None,
        }
    }

    /// Build the base trainer from a policy.
    pub fn from_config(config: GmmTrainerConfig) -> EmResult<Self> {
        Ok(Self::new(GmmBaseTrainer::new(config)?))
    }

    /// The E-step accumulator.
    pub fn base(&self) -> &GmmBaseTrainer {
        &self.base
    }

    /// Mutable E-step accumulator (policy setters, external statistics).
    pub fn base_mut(&mut self) -> &mut GmmBaseTrainer {
        &mut self.base
    }

    /// Thresholded masses of the last M-step; `None` before `initialize`.
    pub fn thresholded_n(&self) -> Option<&[f64]> {
        self.thresholded_n.as_deref()
    }

    /// Reset the statistics for `gmm` and size the denominator cache to K.
    pub fn initialize(&mut self, gmm: &GmmMachine) {
        self.base.initialize(gmm);
        self.thresholded_n = Some(vec![0.0; gmm.n_gaussians()]);
    }

    /// Accumulate statistics of `data` (delegates to the base trainer).
    pub fn e_step(&mut self, gmm: &GmmMachine, data: &[Vec<f64>]) -> EmResult<()> {
        self.base.e_step(gmm, data)
    }

    /// Average log-likelihood of the last E-step.
    pub fn compute_likelihood(&self, gmm: &GmmMachine) -> EmResult<f64> {
        self.base.compute_likelihood(gmm)
    }

    /// Re-estimate the mixture from the accumulated statistics.
    ///
    /// Nothing is written to `gmm` unless every check passes. Statistics are
    /// only read, so repeated calls without an E-step give the same mixture.
    pub fn m_step(&mut self, gmm: &mut GmmMachine) -> EmResult<()> {
        let cache_len = self
            .thresholded_n
            .as_ref()
            .map(Vec::len)
            .ok_or_else(|| EmError::UninitializedTrainer {
                trainer: "MlGmmTrainer".to_string(),
            })?;
        validate_dimension(gmm.n_gaussians(), cache_len, "number of gaussians")?;
        let stats = self.base.gmm_stats();
        gmm.validate_stats_shape(stats)?;

        let config = *self.base.config();
        let weights = if config.update_weights {
            Some(ml_weights(stats)?)
        } else {
            None
        };

        let thresholded = thresholded_masses(stats, config.mean_var_update_responsibilities_threshold);
        let degenerate = thresholded.iter().filter(|&&n| n <= 0.0).count();
        if degenerate > 0 {
            log::warn!(
                "{} component(s) have no responsibility mass and a zero threshold; keeping their means and variances",
                degenerate
            );
        }

        let mut means = gmm.means();
        if config.update_means {
            for (k, mean) in means.iter_mut().enumerate() {
                let denominator = thresholded[k];
                if denominator > 0.0 {
                    for (m, &px) in mean.iter_mut().zip(stats.sum_px_rows()[k].iter()) {
                        *m = px / denominator;
                    }
                }
            }
        }

        let variances = if config.update_variances {
            let mut variances = gmm.variances();
            for (k, variance) in variances.iter_mut().enumerate() {
                let denominator = thresholded[k];
                if denominator > 0.0 {
                    for ((v, &pxx), &m) in variance
                        .iter_mut()
                        .zip(stats.sum_pxx_rows()[k].iter())
                        .zip(means[k].iter())
                    {
                        *v = pxx / denominator - m * m;
                    }
                }
            }
            Some(variances)
        } else {
            None
        };

        gmm.commit(
            weights.as_deref(),
            if config.update_means { Some(means.as_slice()) } else { None },
            variances.as_deref(),
        );
        self.thresholded_n = Some(thresholded);
        Ok(())
    }
}

impl PartialEq for MlGmmTrainer {
    /// Two trainers are equal when their base trainers hold equal state.
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base
    }
}

impl EmTrainer<GmmMachine> for MlGmmTrainer {
    fn initialize(&mut self, machine: &mut GmmMachine, _data: &[Vec<f64>]) -> EmResult<()> {
        MlGmmTrainer::initialize(self, machine);
        Ok(())
    }

    fn e_step(&mut self, machine: &GmmMachine, data: &[Vec<f64>]) -> EmResult<()> {
        MlGmmTrainer::e_step(self, machine, data)
    }

    fn m_step(&mut self, machine: &mut GmmMachine, _data: &[Vec<f64>]) -> EmResult<()> {
        MlGmmTrainer::m_step(self, machine)
    }

    fn compute_likelihood(&self, machine: &GmmMachine) -> EmResult<f64> {
        MlGmmTrainer::compute_likelihood(self, machine)
    }
}

/// `n[k] / T`; a zero mass gives a zero weight (log-weight `-inf`).
pub(crate) fn ml_weights(stats: &GmmStats) -> EmResult<Vec<f64>> {
    if stats.t() == 0 {
        return Err(EmError::InsufficientData {
            required: 1,
            actual: 0,
        });
    }
    let t = stats.t() as f64;
    Ok(stats.n().iter().map(|&n| n / t).collect())
}

/// `max(n[k], threshold)` for every component.
pub(crate) fn thresholded_masses(stats: &GmmStats, threshold: f64) -> Vec<f64> {
    stats.n().iter().map(|&n| n.max(threshold)).collect()
}
