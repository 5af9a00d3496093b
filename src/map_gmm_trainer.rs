//! Maximum-a-posteriori adaptation of a GMM towards a prior model.
//!
//! Reynolds, Quatieri & Dunn, "Speaker Verification Using Adapted Gaussian
//! Mixture Models" (2000): each component interpolates between the statistics of
//! the adaptation data and the prior (usually a UBM) with a coefficient
//! `alpha_k`. A component that saw no data keeps the prior parameters.

use std::sync::Arc;

use crate::{
    config::{GmmTrainerConfig, MapAdaptation},
    em_training::EmTrainer,
    errors::{validate_dimension, EmError, EmResult},
    gmm_base_trainer::GmmBaseTrainer,
    gmm_machine::GmmMachine,
    ml_gmm_trainer::{ml_weights, thresholded_masses},
};

/// MAP M-step against a shared prior mixture.
#[derive(Debug, Clone)]
pub struct MapGmmTrainer {
    base: GmmBaseTrainer,
    prior: Arc<GmmMachine>,
    adaptation: MapAdaptation,
    thresholded_n: Option<Vec<f64>>,
    alpha: Option<Vec<f64>>,
}

impl MapGmmTrainer {
    /// Trainer adapting towards `prior`.
    pub fn new(base: GmmBaseTrainer, prior: Arc<GmmMachine>, adaptation: MapAdaptation) -> EmResult<Self> {
        adaptation.validate()?;
        Ok(Self {
            base,
            prior,
            adaptation,
            thresholded_n: None,
            alpha: None,
        })
    }

    /// Build the base trainer from a policy.
    pub fn from_config(
        config: GmmTrainerConfig,
        prior: Arc<GmmMachine>,
        adaptation: MapAdaptation,
    ) -> EmResult<Self> {
        Self::new(GmmBaseTrainer::new(config)?, prior, adaptation)
    }

    /// The E-step accumulator.
    pub fn base(&self) -> &GmmBaseTrainer {
        &self.base
    }

    /// Mutable E-step accumulator.
    pub fn base_mut(&mut self) -> &mut GmmBaseTrainer {
        &mut self.base
    }

    /// The prior mixture.
    pub fn prior(&self) -> &Arc<GmmMachine> {
        &self.prior
    }

    /// Replace the prior; its shape is checked by `initialize` and `m_step`.
    pub fn set_prior(&mut self, prior: Arc<GmmMachine>) {
        self.prior = prior;
    }

    /// Adaptation coefficient rule.
    pub fn adaptation(&self) -> MapAdaptation {
        self.adaptation
    }

    /// Change the adaptation rule.
    pub fn set_adaptation(&mut self, adaptation: MapAdaptation) -> EmResult<()> {
        adaptation.validate()?;
        self.adaptation = adaptation;
        Ok(())
    }

    /// Per-component coefficients of the last M-step.
    pub fn alpha(&self) -> Option<&[f64]> {
        self.alpha.as_deref()
    }

    /// Thresholded masses of the last M-step.
    pub fn thresholded_n(&self) -> Option<&[f64]> {
        self.thresholded_n.as_deref()
    }

    /// Copy the prior into `gmm` and size the caches.
    pub fn initialize(&mut self, gmm: &mut GmmMachine) -> EmResult<()> {
        self.check_prior_shape(gmm)?;
        let prior = Arc::clone(&self.prior);
        gmm.commit(
            Some(prior.weights()),
            Some(prior.means().as_slice()),
            Some(prior.variances().as_slice()),
        );
        self.base.initialize(gmm);
        let k = gmm.n_gaussians();
        self.thresholded_n = Some(vec![0.0; k]);
        self.alpha = Some(vec![0.0; k]);
        Ok(())
    }

    /// Accumulate statistics of `data`.
    pub fn e_step(&mut self, gmm: &GmmMachine, data: &[Vec<f64>]) -> EmResult<()> {
        self.base.e_step(gmm, data)
    }

    /// Average log-likelihood of the last E-step.
    pub fn compute_likelihood(&self, gmm: &GmmMachine) -> EmResult<f64> {
        self.base.compute_likelihood(gmm)
    }

    /// Interpolate the accumulated statistics with the prior.
    pub fn m_step(&mut self, gmm: &mut GmmMachine) -> EmResult<()> {
        let cache_len = self
            .thresholded_n
            .as_ref()
            .map(Vec::len)
            .ok_or_else(|| EmError::UninitializedTrainer {
                trainer: "MapGmmTrainer".to_string(),
            })?;
        validate_dimension(gmm.n_gaussians(), cache_len, "number of gaussians")?;
        self.check_prior_shape(gmm)?;
        let stats = self.base.gmm_stats();
        gmm.validate_stats_shape(stats)?;

        let config = *self.base.config();
        let alpha: Vec<f64> = stats
            .n()
            .iter()
            .map(|&n| match self.adaptation {
                MapAdaptation::RelevanceFactor(r) if n + r > 0.0 => n / (n + r),
                MapAdaptation::RelevanceFactor(_) => 0.0,
                MapAdaptation::Alpha(a) => a,
            })
            .collect();

        let prior = &*self.prior;
        let weights = if config.update_weights {
            let ml = ml_weights(stats)?;
            let mut adapted: Vec<f64> = ml
                .iter()
                .zip(prior.weights().iter())
                .zip(alpha.iter())
                .map(|((&w, &wp), &a)| a * w + (1.0 - a) * wp)
                .collect();
            let total: f64 = adapted.iter().sum();
            if total <= 0.0 {
                return Err(EmError::NumericalError {
                    reason: "adapted weights have no mass".to_string(),
                });
            }
            adapted.iter_mut().for_each(|w| *w /= total);
            Some(adapted)
        } else {
            None
        };

        let thresholded = thresholded_masses(stats, config.mean_var_update_responsibilities_threshold);
        let prior_means = prior.means();

        let mut means = gmm.means();
        if config.update_means {
            for (k, mean) in means.iter_mut().enumerate() {
                let tn = thresholded[k];
                for (d, m) in mean.iter_mut().enumerate() {
                    let data_term = if tn > 0.0 {
                        stats.sum_px_rows()[k][d] / tn
                    } else {
                        prior_means[k][d]
                    };
                    *m = alpha[k] * data_term + (1.0 - alpha[k]) * prior_means[k][d];
                }
            }
        }

        let variances = if config.update_variances {
            let prior_variances = prior.variances();
            let mut variances = gmm.variances();
            for (k, variance) in variances.iter_mut().enumerate() {
                let tn = thresholded[k];
                for (d, v) in variance.iter_mut().enumerate() {
                    let prior_second = prior_variances[k][d] + prior_means[k][d] * prior_means[k][d];
                    let data_second = if tn > 0.0 {
                        stats.sum_pxx_rows()[k][d] / tn
                    } else {
                        prior_second
                    };
                    let m = means[k][d];
                    *v = alpha[k] * data_second + (1.0 - alpha[k]) * prior_second - m * m;
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
        log::debug!(
            "MAP M-step: mean adaptation coefficient {:.4}",
            alpha.iter().sum::<f64>() / alpha.len().max(1) as f64
        );
        self.thresholded_n = Some(thresholded);
        self.alpha = Some(alpha);
        Ok(())
    }

    fn check_prior_shape(&self, gmm: &GmmMachine) -> EmResult<()> {
        validate_dimension(gmm.n_gaussians(), self.prior.n_gaussians(), "prior number of gaussians")?;
        validate_dimension(gmm.n_inputs(), self.prior.n_inputs(), "prior feature dimension")
    }
}

impl PartialEq for MapGmmTrainer {
    fn eq(&self, other: &Self) -> bool {
        self.base == other.base && self.adaptation == other.adaptation && *self.prior == *other.prior
    }
}

impl EmTrainer<GmmMachine> for MapGmmTrainer {
    fn initialize(&mut self, machine: &mut GmmMachine, _data: &[Vec<f64>]) -> EmResult<()> {
        MapGmmTrainer::initialize(self, machine)
    }

    fn e_step(&mut self, machine: &GmmMachine, data: &[Vec<f64>]) -> EmResult<()> {
        MapGmmTrainer::e_step(self, machine, data)
    }

    fn m_step(&mut self, machine: &mut GmmMachine, _data: &[Vec<f64>]) -> EmResult<()> {
        MapGmmTrainer::m_step(self, machine)
    }

    fn compute_likelihood(&self, machine: &GmmMachine) -> EmResult<f64> {
        MapGmmTrainer::compute_likelihood(self, machine)
    }
}
