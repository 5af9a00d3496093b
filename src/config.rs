//! # Training Configuration
//!
//! Configuration structures controlling which parameters the GMM trainers
//! update, how the EM driver iterates, how MAP adaptation weighs the prior, and
//! how the ISV and K-Means trainers are initialised.

use crate::errors::{validate_parameter, EmResult};
use crate::math_utils::constants::DEFAULT_THRESHOLD;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Update policy shared by the GMM trainers.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GmmTrainerConfig {
    /// Re-estimate the component means in the M-step
    pub update_means: bool,
    /// Re-estimate the component variances in the M-step
    pub update_variances: bool,
    /// Re-estimate the mixing weights in the M-step
    pub update_weights: bool,
    /// Floor applied to the responsibility mass used as mean/variance denominator
    pub mean_var_update_responsibilities_threshold: f64,
}

impl Default for GmmTrainerConfig {
    fn default() -> Self {
        Self {
            update_means: true,
            update_variances: true,
            update_weights: true,
            mean_var_update_responsibilities_threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl GmmTrainerConfig {
    /// Create a policy from the three update flags with the default threshold.
    pub fn new(update_means: bool, update_variances: bool, update_weights: bool) -> Self {
        Self {
            update_means,
            update_variances,
            update_weights,
            ..Self::default()
        }
    }

    /// Only the means are re-estimated (the usual MAP speaker adaptation setting).
    pub fn means_only() -> Self {
        Self::new(true, false, false)
    }

    /// Builder-style setter for the responsibility threshold.
    pub fn with_responsibilities_threshold(mut self, threshold: f64) -> Self {
        self.mean_var_update_responsibilities_threshold = threshold;
        self
    }

    /// Check that the threshold is a finite non-negative number.
    pub fn validate(&self) -> EmResult<()> {
        validate_parameter(
            self.mean_var_update_responsibilities_threshold,
            0.0,
            f64::MAX,
            "mean_var_update_responsibilities_threshold",
        )
    }
}

/// Options of the generic EM driver ([`crate::em_training::train`]).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EmTrainingConfig {
    /// Maximum number of M-step/E-step rounds
    pub max_iterations: usize,
    /// Relative change of the average likelihood below which training stops.
    /// `None` runs exactly `max_iterations` rounds.
    pub convergence_threshold: Option<f64>,
    /// Call the trainer's `initialize` before the first E-step
    pub initialize: bool,
    /// Validate that the training data is non-empty and finite
    pub check_inputs: bool,
}

impl Default for EmTrainingConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            convergence_threshold: Some(1e-5),
            initialize: true,
            check_inputs: true,
        }
    }
}

impl EmTrainingConfig {
    /// Fixed number of iterations, no convergence check.
    pub fn fixed_iterations(max_iterations: usize) -> Self {
        Self {
            max_iterations,
            convergence_threshold: None,
            ..Self::default()
        }
    }

    /// Check the convergence threshold.
    pub fn validate(&self) -> EmResult<()> {
        if let Some(threshold) = self.convergence_threshold {
            validate_parameter(threshold, 0.0, f64::MAX, "convergence_threshold")?;
        }
        Ok(())
    }
}

/// How a MAP trainer weighs the adapted statistics against the prior model.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MapAdaptation {
    /// Reynolds adaptation: `alpha_k = n_k / (n_k + relevance_factor)`
    RelevanceFactor(f64),
    /// Fixed adaptation coefficient for every component
    Alpha(f64),
}

impl Default for MapAdaptation {
    fn default() -> Self {
        MapAdaptation::RelevanceFactor(4.0)
    }
}

impl MapAdaptation {
    /// Check the relevance factor (>= 0) or alpha (in [0, 1]).
    pub fn validate(&self) -> EmResult<()> {
        match *self {
            MapAdaptation::RelevanceFactor(r) => {
                validate_parameter(r, 0.0, f64::MAX, "relevance_factor")
            }
            MapAdaptation::Alpha(a) => validate_parameter(a, 0.0, 1.0, "alpha"),
        }
    }
}

/// Initialisation method for K-Means means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum KMeansInitialization {
    /// Means are random samples of the data (duplicates allowed)
    Random,
    /// Means are random samples with pairwise distinct values
    RandomNoDuplicate,
    /// k-means++ seeding
    KMeansPlusPlus,
}

impl Default for KMeansInitialization {
    fn default() -> Self {
        KMeansInitialization::RandomNoDuplicate
    }
}

/// Options of the ISV trainer.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IsvTrainerConfig {
    /// Relevance factor used to derive the diagonal `D = sqrt(Σ / r)`
    pub relevance_factor: f64,
    /// Seed of the RNG drawing the initial `U` subspace
    pub seed: Option<u64>,
}

impl Default for IsvTrainerConfig {
    fn default() -> Self {
        Self {
            relevance_factor: 4.0,
            seed: None,
        }
    }
}

impl IsvTrainerConfig {
    /// Relevance factor must be strictly positive.
    pub fn validate(&self) -> EmResult<()> {
        validate_parameter(self.relevance_factor, f64::MIN_POSITIVE, f64::MAX, "relevance_factor")
    }
}
