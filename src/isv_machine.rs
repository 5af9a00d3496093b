//! Inter-session variability (ISV) modelling.
//!
//! A client model is the UBM mean supervector `m` shifted by a speaker offset
//! `D z`; each recording additionally moves along the low-rank session subspace
//! `U x`:
//!
//! ```text
//! μ(client, session) = m + U x + D z
//! ```
//!
//! [`IsvBase`] holds `m` (through the UBM), `U` (CD x rU) and the diagonal `D`
//! (CD). [`IsvMachine`] adds an enrolled client's `z` and scores probe
//! statistics by linear scoring after removing the estimated session offset.
//!
//! Supervectors are laid out component-major: entry `c * D + d` is dimension `d`
//! of Gaussian `c`.

use std::sync::Arc;

use nalgebra::{DMatrix, DVector};

use crate::{
    errors::{validate_all_finite, validate_dimension, EmError, EmResult},
    gmm_machine::GmmMachine,
    gmm_stats::GmmStats,
    math_utils::{float_ops::slices_close, spd_inverse},
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// UBM plus the session subspace `U` and the speaker diagonal `D`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct IsvBase {
    ubm: GmmMachine,
    u: DMatrix<f64>,
    d: DVector<f64>,
}

impl IsvBase {
    /// Zero `U` of rank `ru` and zero `D` around `ubm`.
    pub fn new(ubm: GmmMachine, ru: usize) -> EmResult<Self> {
        if ru == 0 {
            return Err(EmError::InvalidConfiguration {
                parameter: "ru".to_string(),
                value: 0.0,
                constraint: ">= 1".to_string(),
            });
        }
        if let Some(&v) = ubm.variance_supervector().iter().find(|&&v| v <= 0.0) {
            return Err(EmError::InvalidConfiguration {
                parameter: "ubm variance".to_string(),
                value: v,
                constraint: "> 0".to_string(),
            });
        }
        let cd = ubm.n_gaussians() * ubm.n_inputs();
        Ok(Self {
            ubm,
            u: DMatrix::zeros(cd, ru),
            d: DVector::zeros(cd),
        })
    }

    /// The universal background model.
    pub fn ubm(&self) -> &GmmMachine {
        &self.ubm
    }

    /// Session subspace, CD x rU.
    pub fn u(&self) -> &DMatrix<f64> {
        &self.u
    }

    /// Speaker diagonal, length CD.
    pub fn d(&self) -> &DVector<f64> {
        &self.d
    }

    /// Replace `U`; must be CD x rU and finite.
    pub fn set_u(&mut self, u: DMatrix<f64>) -> EmResult<()> {
        validate_dimension(u.nrows(), self.supervector_length(), "U rows")?;
        validate_dimension(u.ncols(), self.dim_ru(), "U columns")?;
        validate_all_finite(u.as_slice(), "U")?;
        self.u = u;
        Ok(())
    }

    /// Replace `D`; must have length CD and be finite.
    pub fn set_d(&mut self, d: DVector<f64>) -> EmResult<()> {
        validate_dimension(d.len(), self.supervector_length(), "D length")?;
        validate_all_finite(d.as_slice(), "D")?;
        self.d = d;
        Ok(())
    }

    /// Change the subspace rank; `U` is reset to zero.
    pub fn resize(&mut self, ru: usize) -> EmResult<()> {
        if ru == 0 {
            return Err(EmError::InvalidConfiguration {
                parameter: "ru".to_string(),
                value: 0.0,
                constraint: ">= 1".to_string(),
            });
        }
        self.u = DMatrix::zeros(self.supervector_length(), ru);
        Ok(())
    }

    /// Number of Gaussians C.
    pub fn n_gaussians(&self) -> usize {
        self.ubm.n_gaussians()
    }

    /// Feature dimensionality D.
    pub fn n_inputs(&self) -> usize {
        self.ubm.n_inputs()
    }

    /// Rank of the session subspace.
    pub fn dim_ru(&self) -> usize {
        self.u.ncols()
    }

    /// `C * D`.
    pub fn supervector_length(&self) -> usize {
        self.n_gaussians() * self.n_inputs()
    }

    /// `(C, D, rU)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.n_gaussians(), self.n_inputs(), self.dim_ru())
    }

    /// Approximate equality of the UBM, `U` and `D`.
    pub fn is_similar_to(&self, other: &Self, r_epsilon: f64, a_epsilon: f64) -> bool {
        self.shape() == other.shape()
            && self.ubm.is_similar_to(&other.ubm, r_epsilon, a_epsilon)
            && slices_close(self.u.as_slice(), other.u.as_slice(), r_epsilon, a_epsilon)
            && slices_close(self.d.as_slice(), other.d.as_slice(), r_epsilon, a_epsilon)
    }

    /// Read a JSON document written by [`IsvBase::to_writer`].
    #[cfg(feature = "serde")]
    #[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
    pub fn from_reader<R: std::io::Read>(reader: R) -> EmResult<Self> {
        let raw: Self = serde_json::from_reader(reader).map_err(|e| EmError::SerializationError {
            format: "JSON".to_string(),
            reason: e.to_string(),
        })?;
        let ubm = GmmMachine::rebuild(&raw.ubm)?;
        let mut base = Self::new(ubm, raw.u.ncols())?;
        base.set_u(raw.u)?;
        base.set_d(raw.d)?;
        Ok(base)
    }

    /// Write the model as JSON.
    #[cfg(feature = "serde")]
    #[cfg_attr(docsrs, doc(cfg(feature = "serde")))]
    pub fn to_writer<W: std::io::Write>(&self, writer: W) -> EmResult<()> {
        serde_json::to_writer(writer, self).map_err(|e| EmError::SerializationError {
            format: "JSON".to_string(),
            reason: e.to_string(),
        })
    }

    pub(crate) fn u_mut(&mut self) -> &mut DMatrix<f64> {
        &mut self.u
    }

    pub(crate) fn d_mut(&mut self) -> &mut DVector<f64> {
        &mut self.d
    }

    pub(crate) fn ubm_mean_supervector(&self) -> DVector<f64> {
        DVector::from_vec(self.ubm.mean_supervector())
    }

    pub(crate) fn ubm_variance_supervector(&self) -> DVector<f64> {
        DVector::from_vec(self.ubm.variance_supervector())
    }

    pub(crate) fn validate_stats(&self, stats: &GmmStats) -> EmResult<()> {
        validate_dimension(stats.n_gaussians(), self.n_gaussians(), "number of gaussians")?;
        validate_dimension(stats.n_inputs(), self.n_inputs(), "feature dimension")
    }

    /// `F - N ⊗ (m + offset)` as a supervector.
    pub(crate) fn centred_first_order(&self, stats: &GmmStats, offset: Option<&DVector<f64>>) -> DVector<f64> {
        let dim = self.n_inputs();
        let mean = self.ubm_mean_supervector();
        let mut centred = DVector::from_vec(stats.sum_px_supervector());
        for (i, value) in centred.iter_mut().enumerate() {
            let shift = offset.map_or(0.0, |o| o[i]);
            *value -= stats.n()[i / dim.max(1)] * (mean[i] + shift);
        }
        centred
    }

    /// Posterior of a session factor: mean `x` and covariance `A⁻¹` with
    /// `A = I + Σ_c N_c U_cᵀ Σ_c⁻¹ U_c`.
    pub(crate) fn session_posterior(
        &self,
        n: &[f64],
        centred: &DVector<f64>,
    ) -> EmResult<(DVector<f64>, DMatrix<f64>)> {
        let (c_count, dim, ru) = self.shape();
        let inv_var = self.ubm_variance_supervector().map(|v| 1.0 / v);

        let mut precision = DMatrix::<f64>::identity(ru, ru);
        for c in 0..c_count {
            if n[c] == 0.0 {
                continue;
            }
            let u_c = self.u.rows(c * dim, dim);
            let weighted = DMatrix::from_fn(dim, ru, |i, j| u_c[(i, j)] * inv_var[c * dim + i]);
            precision += (u_c.transpose() * weighted) * n[c];
        }

        let covariance = spd_inverse(precision, "session posterior precision")?;
        let projected = self.u.transpose() * centred.component_mul(&inv_var);
        let x = &covariance * projected;
        Ok((x, covariance))
    }
}

/// Enrolled client: a shared [`IsvBase`] and the speaker factor `z`.
#[derive(Debug, Clone, PartialEq)]
pub struct IsvMachine {
    base: Arc<IsvBase>,
    z: DVector<f64>,
}

impl IsvMachine {
    /// Machine with `z = 0` (the UBM itself).
    pub fn new(base: Arc<IsvBase>) -> Self {
        let cd = base.supervector_length();
        Self {
            base,
            z: DVector::zeros(cd),
        }
    }

    /// The shared base.
    pub fn base(&self) -> &Arc<IsvBase> {
        &self.base
    }

    /// Speaker factor, length CD.
    pub fn z(&self) -> &DVector<f64> {
        &self.z
    }

    /// Replace `z`; must have length CD and be finite.
    pub fn set_z(&mut self, z: DVector<f64>) -> EmResult<()> {
        validate_dimension(z.len(), self.base.supervector_length(), "z length")?;
        validate_all_finite(z.as_slice(), "z")?;
        self.z = z;
        Ok(())
    }

    /// `(C, D, rU)` of the base.
    pub fn shape(&self) -> (usize, usize, usize) {
        self.base.shape()
    }

    /// `C * D`.
    pub fn supervector_length(&self) -> usize {
        self.base.supervector_length()
    }

    /// Client mean supervector `m + D z`.
    pub fn mean_supervector(&self) -> DVector<f64> {
        self.base.ubm_mean_supervector() + self.base.d().component_mul(&self.z)
    }

    /// Session factor of `stats`, with first-order statistics centred on the UBM.
    pub fn estimate_x(&self, stats: &GmmStats) -> EmResult<DVector<f64>> {
        self.base.validate_stats(stats)?;
        let centred = self.base.centred_first_order(stats, None);
        let (x, _) = self.base.session_posterior(stats.n(), &centred)?;
        Ok(x)
    }

    /// Session offset `U x` of `stats`.
    pub fn estimate_ux(&self, stats: &GmmStats) -> EmResult<DVector<f64>> {
        Ok(self.base.u() * self.estimate_x(stats)?)
    }

    /// Linear score of `stats` against this client, normalised by frame count.
    ///
    /// `Σ_cd (D z)_cd / σ_cd * (F_cd - N_c m_cd - N_c (U x)_cd) / T`
    pub fn score(&self, stats: &GmmStats) -> EmResult<f64> {
        self.base.validate_stats(stats)?;
        if stats.t() == 0 {
            return Err(EmError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        let ux = self.estimate_ux(stats)?;
        let dim = self.base.n_inputs().max(1);
        let mut probe = self.base.centred_first_order(stats, None);
        for (i, value) in probe.iter_mut().enumerate() {
            *value -= stats.n()[i / dim] * ux[i];
        }

        let offset = self.base.d().component_mul(&self.z);
        let variance = self.base.ubm_variance_supervector();
        let score: f64 = offset
            .iter()
            .zip(variance.iter())
            .zip(probe.iter())
            .map(|((&o, &v), &p)| o / v * p)
            .sum();
        Ok(score / stats.t() as f64)
    }
}
