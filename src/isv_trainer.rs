//! EM estimation of the ISV session subspace `U`.
//!
//! Training data is a list of identities, each a list of per-session
//! [`GmmStats`] accumulated against the UBM. Every E-step re-estimates the
//! latent factors from zero: the session factors `x_ih` given `z_i`, then the
//! speaker factors `z_i` given the new `x`. The accumulators
//!
//! ```text
//! acc_u_a1[c] = Σ_ih N_ih[c] (A_ih⁻¹ + x_ih x_ihᵀ)        (C blocks of rU x rU)
//! acc_u_a2    = Σ_ih (F_ih - N_ih ⊗ (m + D z_i)) x_ihᵀ     (CD x rU)
//! ```
//!
//! are all the M-step needs: `U_c = acc_u_a2_c acc_u_a1[c]⁻¹`.

use nalgebra::{DMatrix, DVector};

use crate::{
    config::IsvTrainerConfig,
    errors::{validate_data_length, validate_dimension, EmError, EmResult},
    gmm_stats::GmmStats,
    isv_machine::{IsvBase, IsvMachine},
    math_utils::spd_inverse,
    secure_rng::SecureRng,
};

/// Trainer of the ISV subspace and enroller of client models.
#[derive(Debug, Clone)]
pub struct IsvTrainer {
    config: IsvTrainerConfig,
    rng: SecureRng,
    /// Per identity: Σ_h N_ih
    n_id: Vec<Vec<f64>>,
    /// Per identity: Σ_h F_ih
    f_id: Vec<DVector<f64>>,
    x: Vec<Vec<DVector<f64>>>,
    z: Vec<DVector<f64>>,
    acc_u_a1: Vec<DMatrix<f64>>,
    acc_u_a2: DMatrix<f64>,
    initialized: bool,
}

impl Default for IsvTrainer {
    fn default() -> Self {
        Self {
            config: IsvTrainerConfig::default(),
            rng: SecureRng::new(),
            n_id: Vec::new(),
            f_id: Vec::new(),
            x: Vec::new(),
            z: Vec::new(),
            acc_u_a1: Vec::new(),
            acc_u_a2: DMatrix::zeros(0, 0),
            initialized: false,
        }
    }
}

impl IsvTrainer {
    /// Trainer with a validated relevance factor.
    pub fn new(config: IsvTrainerConfig) -> EmResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            rng: SecureRng::from_optional_seed(config.seed),
            ..Self::default()
        })
    }

    /// Trainer options.
    pub fn config(&self) -> &IsvTrainerConfig {
        &self.config
    }

    /// Relevance factor used to initialise `D`.
    pub fn relevance_factor(&self) -> f64 {
        self.config.relevance_factor
    }

    /// Per-Gaussian `rU x rU` accumulators.
    pub fn acc_u_a1(&self) -> &[DMatrix<f64>] {
        &self.acc_u_a1
    }

    /// `CD x rU` accumulator.
    pub fn acc_u_a2(&self) -> &DMatrix<f64> {
        &self.acc_u_a2
    }

    /// Replace the first accumulator; shape must match the current one.
    pub fn set_acc_u_a1(&mut self, acc: Vec<DMatrix<f64>>) -> EmResult<()> {
        validate_dimension(acc.len(), self.acc_u_a1.len(), "acc_u_a1 blocks")?;
        for (new, old) in acc.iter().zip(self.acc_u_a1.iter()) {
            validate_dimension(new.nrows(), old.nrows(), "acc_u_a1 rows")?;
            validate_dimension(new.ncols(), old.ncols(), "acc_u_a1 columns")?;
        }
        self.acc_u_a1 = acc;
        Ok(())
    }

    /// Replace the second accumulator; shape must match the current one.
    pub fn set_acc_u_a2(&mut self, acc: DMatrix<f64>) -> EmResult<()> {
        validate_dimension(acc.nrows(), self.acc_u_a2.nrows(), "acc_u_a2 rows")?;
        validate_dimension(acc.ncols(), self.acc_u_a2.ncols(), "acc_u_a2 columns")?;
        self.acc_u_a2 = acc;
        Ok(())
    }

    /// Session factors of the last E-step, per identity and session.
    pub fn x(&self) -> &[Vec<DVector<f64>>] {
        &self.x
    }

    /// Speaker factors of the last E-step, per identity.
    pub fn z(&self) -> &[DVector<f64>] {
        &self.z
    }

    /// Prepare training on `stats` (outer list: identities, inner: sessions).
    ///
    /// Draws `U` from a standard normal and sets `D = sqrt(σ²_ubm / r)`.
    pub fn initialize(&mut self, base: &mut IsvBase, stats: &[Vec<GmmStats>]) -> EmResult<()> {
        validate_training_set(base, stats)?;
        let (c_count, dim, ru) = base.shape();
        let cd = c_count * dim;

        self.n_id = stats
            .iter()
            .map(|sessions| {
                let mut n = vec![0.0; c_count];
                for s in sessions {
                    for (acc, &v) in n.iter_mut().zip(s.n().iter()) {
                        *acc += v;
                    }
                }
                n
            })
            .collect();
        self.f_id = stats
            .iter()
            .map(|sessions| {
                sessions
                    .iter()
                    .fold(DVector::zeros(cd), |acc, s| acc + DVector::from_vec(s.sum_px_supervector()))
            })
            .collect();
        self.x = stats
            .iter()
            .map(|sessions| vec![DVector::zeros(ru); sessions.len()])
            .collect();
        self.z = vec![DVector::zeros(cd); stats.len()];

        let mut draws = vec![0.0; cd * ru];
        self.rng.fill_normal(&mut draws);
        *base.u_mut() = DMatrix::from_vec(cd, ru, draws);
        let relevance_factor = self.config.relevance_factor;
        let d = base
            .ubm_variance_supervector()
            .map(|v| (v / relevance_factor).sqrt());
        *base.d_mut() = d;

        self.acc_u_a1 = vec![DMatrix::zeros(ru, ru); c_count];
        self.acc_u_a2 = DMatrix::zeros(cd, ru);
        self.initialized = true;
        log::debug!(
            "ISV trainer initialised: {} identities, C={}, D={}, rU={}",
            stats.len(),
            c_count,
            dim,
            ru
        );
        Ok(())
    }

    /// Re-estimate the latent factors and fill the `U` accumulators.
    pub fn e_step(&mut self, base: &IsvBase, stats: &[Vec<GmmStats>]) -> EmResult<()> {
        self.ensure_ready(base)?;
        validate_training_set(base, stats)?;
        validate_dimension(stats.len(), self.z.len(), "number of identities")?;
        for (sessions, x) in stats.iter().zip(self.x.iter()) {
            validate_dimension(sessions.len(), x.len(), "number of sessions")?;
        }

        let (c_count, dim, ru) = base.shape();
        self.acc_u_a1 = vec![DMatrix::zeros(ru, ru); c_count];
        self.acc_u_a2 = DMatrix::zeros(c_count * dim, ru);

        for (id, sessions) in stats.iter().enumerate() {
            let zero = DVector::zeros(c_count * dim);
            let (xs, covariances) = update_x(base, sessions, &zero)?;
            let z = update_z(base, sessions, &xs, &self.n_id[id], &self.f_id[id]);

            let offset = base.d().component_mul(&z);
            for ((s, x), covariance) in sessions.iter().zip(xs.iter()).zip(covariances.iter()) {
                let second_moment = covariance + x * x.transpose();
                for (c, acc) in self.acc_u_a1.iter_mut().enumerate() {
                    *acc += &second_moment * s.n()[c];
                }
                let centred = base.centred_first_order(s, Some(&offset));
                self.acc_u_a2 += centred * x.transpose();
            }
            self.x[id] = xs;
            self.z[id] = z;
        }
        Ok(())
    }

    /// `U_c = acc_u_a2_c acc_u_a1[c]⁻¹` for every Gaussian block.
    pub fn m_step(&mut self, base: &mut IsvBase) -> EmResult<()> {
        self.ensure_ready(base)?;
        let (c_count, dim, ru) = base.shape();

        let mut u = DMatrix::zeros(c_count * dim, ru);
        for c in 0..c_count {
            let inverse = spd_inverse(self.acc_u_a1[c].clone(), "U accumulator")?;
            let block = self.acc_u_a2.rows(c * dim, dim) * inverse;
            u.rows_mut(c * dim, dim).copy_from(&block);
        }
        base.set_u(u)
    }

    /// `n_iter` rounds of initialise-free E/M steps after `initialize`.
    pub fn train(&mut self, base: &mut IsvBase, stats: &[Vec<GmmStats>], n_iter: usize) -> EmResult<()> {
        self.initialize(base, stats)?;
        for iteration in 0..n_iter {
            self.e_step(base, stats)?;
            self.m_step(base)?;
            log::debug!("ISV iteration {} done", iteration + 1);
        }
        log::info!("ISV subspace trained with {} iterations", n_iter);
        Ok(())
    }

    /// Estimate a client's `z` from its enrolment sessions against a fixed base.
    ///
    /// Latent factors start at zero and are refined by `n_iter` rounds of
    /// session and speaker updates.
    pub fn enrol(&self, machine: &mut IsvMachine, stats: &[GmmStats], n_iter: usize) -> EmResult<()> {
        let base = machine.base().clone();
        validate_data_length(stats.len(), 1)?;
        for s in stats {
            base.validate_stats(s)?;
        }

        let cd = base.supervector_length();
        let mut n_id = vec![0.0; base.n_gaussians()];
        let mut f_id = DVector::zeros(cd);
        for s in stats {
            for (acc, &v) in n_id.iter_mut().zip(s.n().iter()) {
                *acc += v;
            }
            f_id += DVector::from_vec(s.sum_px_supervector());
        }

        let mut z = DVector::zeros(cd);
        for _ in 0..n_iter {
            let offset = base.d().component_mul(&z);
            let (xs, _) = update_x(&base, stats, &offset)?;
            z = update_z(&base, stats, &xs, &n_id, &f_id);
        }
        machine.set_z(z)
    }

    fn ensure_ready(&self, base: &IsvBase) -> EmResult<()> {
        if !self.initialized {
            return Err(EmError::UninitializedTrainer {
                trainer: "IsvTrainer".to_string(),
            });
        }
        let (c_count, dim, ru) = base.shape();
        validate_dimension(self.acc_u_a1.len(), c_count, "acc_u_a1 blocks")?;
        validate_dimension(self.acc_u_a2.nrows(), c_count * dim, "acc_u_a2 rows")?;
        validate_dimension(self.acc_u_a2.ncols(), ru, "subspace rank")
    }
}

fn validate_training_set(base: &IsvBase, stats: &[Vec<GmmStats>]) -> EmResult<()> {
    validate_data_length(stats.len(), 1)?;
    for sessions in stats {
        validate_data_length(sessions.len(), 1)?;
        for s in sessions {
            base.validate_stats(s)?;
        }
    }
    Ok(())
}

/// Session factors of one identity given its speaker offset `D z`.
fn update_x(
    base: &IsvBase,
    sessions: &[GmmStats],
    offset: &DVector<f64>,
) -> EmResult<(Vec<DVector<f64>>, Vec<DMatrix<f64>>)> {
    let mut xs = Vec::with_capacity(sessions.len());
    let mut covariances = Vec::with_capacity(sessions.len());
    for s in sessions {
        let centred = base.centred_first_order(s, Some(offset));
        let (x, covariance) = base.session_posterior(s.n(), &centred)?;
        xs.push(x);
        covariances.push(covariance);
    }
    Ok((xs, covariances))
}

/// Speaker factor of one identity given its session factors.
///
/// `D` is diagonal, so the posterior is element-wise:
/// `z = (d / σ) Fn / (1 + d² N / σ)` with `Fn = f - n ⊗ m - Σ_h N_h ⊗ (U x_h)`.
fn update_z(
    base: &IsvBase,
    sessions: &[GmmStats],
    xs: &[DVector<f64>],
    n_id: &[f64],
    f_id: &DVector<f64>,
) -> DVector<f64> {
    let dim = base.n_inputs().max(1);
    let mean = base.ubm_mean_supervector();
    let variance = base.ubm_variance_supervector();

    let mut residual = f_id.clone();
    for (i, value) in residual.iter_mut().enumerate() {
        *value -= n_id[i / dim] * mean[i];
    }
    for (s, x) in sessions.iter().zip(xs.iter()) {
        let ux = base.u() * x;
        for (i, value) in residual.iter_mut().enumerate() {
            *value -= s.n()[i / dim] * ux[i];
        }
    }

    DVector::from_fn(residual.len(), |i, _| {
        let d = base.d()[i];
        let n = n_id[i / dim];
        (d / variance[i]) * residual[i] / (1.0 + d * d * n / variance[i])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmm_machine::GmmMachine;
    use assert_approx_eq::assert_approx_eq;
    use std::sync::Arc;

    fn ubm() -> GmmMachine {
        GmmMachine::from_parameters(
            &[0.5, 0.5],
            &[vec![0.0, 0.0], vec![4.0, 4.0]],
            &[vec![1.0, 1.0], vec![1.0, 1.0]],
        )
        .unwrap()
    }

    /// Statistics of `samples` against the UBM.
    fn session(samples: &[[f64; 2]]) -> GmmStats {
        let data: Vec<Vec<f64>> = samples.iter().map(|s| s.to_vec()).collect();
        ubm().compute_statistics(&data).unwrap()
    }

    fn training_set() -> Vec<Vec<GmmStats>> {
        vec![
            vec![
                session(&[[0.3, 0.2], [0.5, 0.1], [4.2, 4.1]]),
                session(&[[0.6, 0.4], [4.4, 4.3]]),
            ],
            vec![
                session(&[[-0.4, -0.2], [3.7, 3.8], [3.6, 3.9]]),
                session(&[[-0.2, -0.5], [3.9, 3.5]]),
            ],
        ]
    }

    fn trainer() -> IsvTrainer {
        IsvTrainer::new(IsvTrainerConfig {
            relevance_factor: 4.0,
            seed: Some(5),
        })
        .unwrap()
    }

    #[test]
    fn test_initialize_sizes_accumulators() {
        let mut base = IsvBase::new(ubm(), 2).unwrap();
        let mut t = trainer();
        t.initialize(&mut base, &training_set()).unwrap();

        assert_eq!(t.acc_u_a1().len(), 2);
        assert_eq!(t.acc_u_a1()[0].shape(), (2, 2));
        assert_eq!(t.acc_u_a2().shape(), (4, 2));
        assert_eq!(t.x().len(), 2);
        assert_eq!(t.x()[0].len(), 2);
        assert_eq!(t.z()[1].len(), 4);
        // D = sqrt(1 / 4)
        assert!(base.d().iter().all(|&d| (d - 0.5).abs() < 1e-12));
        assert!(base.u().iter().any(|&u| u != 0.0));
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let mut a = IsvBase::new(ubm(), 2).unwrap();
        let mut b = IsvBase::new(ubm(), 2).unwrap();
        trainer().initialize(&mut a, &training_set()).unwrap();
        trainer().initialize(&mut b, &training_set()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_steps_require_initialize() {
        let mut base = IsvBase::new(ubm(), 2).unwrap();
        let mut t = trainer();
        assert!(matches!(
            t.e_step(&base, &training_set()),
            Err(EmError::UninitializedTrainer { .. })
        ));
        assert!(matches!(
            t.m_step(&mut base),
            Err(EmError::UninitializedTrainer { .. })
        ));
    }

    #[test]
    fn test_e_step_accumulators_are_symmetric_and_finite() {
        let mut base = IsvBase::new(ubm(), 2).unwrap();
        let mut t = trainer();
        let data = training_set();
        t.initialize(&mut base, &data).unwrap();
        t.e_step(&base, &data).unwrap();

        for block in t.acc_u_a1() {
            assert_approx_eq!(block[(0, 1)], block[(1, 0)], 1e-10);
            assert!(block[(0, 0)] > 0.0);
        }
        assert!(t.acc_u_a2().iter().all(|v| v.is_finite()));
        assert!(t.z().iter().flat_map(|z| z.iter()).all(|v| v.is_finite()));
    }

    #[test]
    fn test_m_step_updates_subspace() {
        let mut base = IsvBase::new(ubm(), 1).unwrap();
        let mut t = trainer();
        let data = training_set();
        t.initialize(&mut base, &data).unwrap();
        let initial = base.u().clone();
        t.e_step(&base, &data).unwrap();
        t.m_step(&mut base).unwrap();
        assert_ne!(base.u(), &initial);
        assert!(base.u().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_e_step_rejects_changed_training_set() {
        let mut base = IsvBase::new(ubm(), 1).unwrap();
        let mut t = trainer();
        let data = training_set();
        t.initialize(&mut base, &data).unwrap();
        assert!(matches!(
            t.e_step(&base, &data[..1]),
            Err(EmError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_enrol_and_score() {
        let mut base = IsvBase::new(ubm(), 1).unwrap();
        let mut t = trainer();
        t.train(&mut base, &training_set(), 3).unwrap();

        let base = Arc::new(base);
        let mut machine = IsvMachine::new(Arc::clone(&base));
        let enrolment = [
            session(&[[1.0, 1.1], [0.9, 1.2], [5.0, 5.1]]),
            session(&[[1.1, 0.8], [5.2, 4.9]]),
        ];
        t.enrol(&mut machine, &enrolment, 2).unwrap();
        assert!(machine.z().iter().all(|v| v.is_finite()));
        assert!(machine.z().iter().any(|&v| v != 0.0));

        let matching = session(&[[1.0, 1.0], [5.1, 5.0]]);
        let other = session(&[[-1.0, -1.0], [3.0, 3.0]]);
        assert!(machine.score(&matching).unwrap() > machine.score(&other).unwrap());
    }

    #[test]
    fn test_enrol_without_iterations_keeps_ubm() {
        let base = Arc::new(IsvBase::new(ubm(), 1).unwrap());
        let mut machine = IsvMachine::new(base);
        trainer()
            .enrol(&mut machine, &[session(&[[0.0, 0.0]])], 0)
            .unwrap();
        assert!(machine.z().iter().all(|&v| v == 0.0));
        assert!(trainer().enrol(&mut machine, &[], 1).is_err());
    }

    #[test]
    fn test_invalid_relevance_factor() {
        assert!(matches!(
            IsvTrainer::new(IsvTrainerConfig {
                relevance_factor: 0.0,
                seed: None
            }),
            Err(EmError::InvalidConfiguration { .. })
        ));
    }
}
