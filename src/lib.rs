//! # Mixture EM
//!
//! Expectation-maximisation training of diagonal-covariance Gaussian mixture
//! models, the building blocks of classic speaker and face verification systems.
//!
//! ## Key Features
//!
//! - **Sufficient statistics**: zeroth, first and second order moments per component,
//!   mergeable across batches and threads
//! - **Maximum likelihood**: the standard GMM M-step with a variance floor and a
//!   responsibility threshold that keeps collapsing components stable
//! - **MAP adaptation**: Reynolds relevance-factor adaptation of a UBM towards client data
//! - **K-Means**: Lloyd iterations with random, duplicate-free or k-means++ seeding,
//!   used to seed mixtures
//! - **ISV**: inter-session variability subspace training, client enrolment and
//!   linear scoring
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mixture_em::{
//!     train, EmTrainingConfig, GmmMachine, GmmTrainerConfig, KMeansInitialization,
//!     KMeansMachine, KMeansTrainer, MlGmmTrainer,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let data: Vec<Vec<f64>> = (0..200)
//!         .map(|i| {
//!             let centre = if i % 2 == 0 { 0.0 } else { 5.0 };
//!             vec![centre + (i as f64 * 0.37).sin(), centre + (i as f64 * 0.71).cos()]
//!         })
//!         .collect();
//!
//!     // Seed the mixture with K-Means
//!     let mut kmeans = KMeansMachine::new(2, 2);
//!     let mut kmeans_trainer = KMeansTrainer::new(KMeansInitialization::KMeansPlusPlus, Some(1));
//!     train(&mut kmeans_trainer, &mut kmeans, &data, &EmTrainingConfig::default())?;
//!     let mut gmm = GmmMachine::from_kmeans(&kmeans, &data)?;
//!
//!     // Refine it with maximum likelihood
//!     let mut trainer = MlGmmTrainer::from_config(GmmTrainerConfig::default())?;
//!     let summary = train(&mut trainer, &mut gmm, &data, &EmTrainingConfig::default())?;
//!     println!(
//!         "{} iterations, average log-likelihood {:.4}",
//!         summary.iterations, summary.final_likelihood
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Machines ([`GmmMachine`], [`KMeansMachine`], [`IsvBase`], [`IsvMachine`]) hold
//! model parameters. Trainers accumulate statistics in an E-step and rewrite a
//! machine in an M-step; every trainer that fits the generic loop implements
//! [`EmTrainer`] and can be driven by [`train`]. Trainers never leave a machine
//! half-updated: all checks run before the first parameter is written.
//!
//! ## Features
//!
//! - `parallel`: accumulate E-step statistics on the rayon thread pool
//! - `serde`: serialisation of models, statistics and configurations, with JSON
//!   `from_reader` / `to_writer` helpers

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod math_utils;
pub mod secure_rng;

// Models
pub mod gaussian;
pub mod gmm_machine;
pub mod gmm_stats;
pub mod isv_machine;
pub mod kmeans;

// Training
pub mod em_training;
pub mod gmm_base_trainer;
pub mod isv_trainer;
pub mod map_gmm_trainer;
pub mod ml_gmm_trainer;

pub use config::{
    EmTrainingConfig, GmmTrainerConfig, IsvTrainerConfig, KMeansInitialization, MapAdaptation,
};
pub use em_training::{train, EmTrainer, TrainingSummary};
pub use errors::{EmError, EmResult};
pub use gaussian::GaussianComponent;
pub use gmm_base_trainer::GmmBaseTrainer;
pub use gmm_machine::GmmMachine;
pub use gmm_stats::GmmStats;
pub use isv_machine::{IsvBase, IsvMachine};
pub use isv_trainer::IsvTrainer;
pub use kmeans::{KMeansMachine, KMeansTrainer};
pub use map_gmm_trainer::MapGmmTrainer;
pub use ml_gmm_trainer::MlGmmTrainer;
pub use secure_rng::SecureRng;
