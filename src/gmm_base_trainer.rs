//! E-step accumulator shared by the GMM trainers.
//!
//! [`GmmBaseTrainer`] owns the [`GmmStats`] of the current EM pass together with
//! the update policy. With the `parallel` feature the E-step splits the samples
//! across threads, accumulates partial statistics and sums them; the moments are
//! additive so the result does not depend on the split.

use crate::{
    config::GmmTrainerConfig,
    errors::{validate_samples, EmError, EmResult},
    gmm_machine::GmmMachine,
    gmm_stats::GmmStats,
};

/// Sufficient-statistics accumulator and update policy.
#[derive(Debug, Clone, PartialEq)]
pub struct GmmBaseTrainer {
    config: GmmTrainerConfig,
    stats: GmmStats,
    initialized: bool,
}

impl Default for GmmBaseTrainer {
    fn default() -> Self {
        Self {
            config: GmmTrainerConfig::default(),
            stats: GmmStats::new(0, 0),
            initialized: false,
        }
    }
}

impl GmmBaseTrainer {
    /// Trainer with a validated policy.
    pub fn new(config: GmmTrainerConfig) -> EmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::default()
        })
    }

    /// The update policy.
    pub fn config(&self) -> &GmmTrainerConfig {
        &self.config
    }

    /// Whether the M-step re-estimates the means.
    pub fn update_means(&self) -> bool {
        self.config.update_means
    }

    /// Whether the M-step re-estimates the variances.
    pub fn update_variances(&self) -> bool {
        self.config.update_variances
    }

    /// Whether the M-step re-estimates the weights.
    pub fn update_weights(&self) -> bool {
        self.config.update_weights
    }

    /// Floor of the mean/variance denominator.
    pub fn mean_var_update_responsibilities_threshold(&self) -> f64 {
        self.config.mean_var_update_responsibilities_threshold
    }

    /// Toggle mean re-estimation.
    pub fn set_update_means(&mut self, update: bool) {
        self.config.update_means = update;
    }

    /// Toggle variance re-estimation.
    pub fn set_update_variances(&mut self, update: bool) {
        self.config.update_variances = update;
    }

    /// Toggle weight re-estimation.
    pub fn set_update_weights(&mut self, update: bool) {
        self.config.update_weights = update;
    }

    /// Set the responsibility threshold; must be finite and non-negative.
    pub fn set_mean_var_update_responsibilities_threshold(&mut self, threshold: f64) -> EmResult<()> {
        let candidate = self.config.with_responsibilities_threshold(threshold);
        candidate.validate()?;
        self.config = candidate;
        Ok(())
    }

    /// Resize the statistics to the mixture and zero them.
    pub fn initialize(&mut self, gmm: &GmmMachine) {
        self.stats.resize(gmm.n_gaussians(), gmm.n_inputs());
        self.initialized = true;
    }

    /// Whether `initialize` has been called.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Zero the statistics and accumulate every sample of `data`.
    pub fn e_step(&mut self, gmm: &GmmMachine, data: &[Vec<f64>]) -> EmResult<()> {
        self.ensure_ready(gmm)?;
        if gmm.n_gaussians() == 0 {
            return Err(EmError::InvalidConfiguration {
                parameter: "n_gaussians".to_string(),
                value: 0.0,
                constraint: ">= 1".to_string(),
            });
        }
        validate_samples(data, gmm.n_inputs())?;

        self.stats.init();
        self.accumulate(gmm, data);
        log::debug!(
            "E-step accumulated {} samples into {} components",
            self.stats.t(),
            self.stats.n_gaussians()
        );
        Ok(())
    }

    /// Average log-likelihood of the last E-step, `log_likelihood / T`.
    pub fn compute_likelihood(&self, gmm: &GmmMachine) -> EmResult<f64> {
        self.ensure_ready(gmm)?;
        if self.stats.t() == 0 {
            return Err(EmError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        Ok(self.stats.log_likelihood() / self.stats.t() as f64)
    }

    /// Statistics of the last E-step.
    pub fn gmm_stats(&self) -> &GmmStats {
        &self.stats
    }

    /// Replace the statistics, e.g. with ones accumulated externally.
    ///
    /// The trainer counts as initialised for the statistics' shape afterwards.
    pub fn set_gmm_stats(&mut self, stats: GmmStats) -> EmResult<()> {
        stats.validate()?;
        self.stats = stats;
        self.initialized = true;
        Ok(())
    }

    fn ensure_ready(&self, gmm: &GmmMachine) -> EmResult<()> {
        if !self.initialized {
            return Err(EmError::UninitializedTrainer {
                trainer: "GmmBaseTrainer".to_string(),
            });
        }
        gmm.validate_stats_shape(&self.stats)
    }

    #[cfg(not(feature = "parallel"))]
    fn accumulate(&mut self, gmm: &GmmMachine, data: &[Vec<f64>]) {
        let mut buffer = vec![0.0; gmm.n_gaussians()];
        for x in data {
            gmm.acc_statistics_unchecked(x, &mut self.stats, &mut buffer);
        }
    }

    #[cfg(feature = "parallel")]
    fn accumulate(&mut self, gmm: &GmmMachine, data: &[Vec<f64>]) {
        use rayon::prelude::*;

        let (n_gaussians, n_inputs) = gmm.shape();
        let total = data
            .par_iter()
            .fold(
                || (GmmStats::new(n_gaussians, n_inputs), vec![0.0; n_gaussians]),
                |(mut partial, mut buffer), x| {
                    gmm.acc_statistics_unchecked(x, &mut partial, &mut buffer);
                    (partial, buffer)
                },
            )
            .map(|(partial, _)| partial)
            .reduce(
                || GmmStats::new(n_gaussians, n_inputs),
                |mut a, b| {
                    a += &b;
                    a
                },
            );
        self.stats = total;
    }
}
