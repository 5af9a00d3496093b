//! K-Means clustering used to seed Gaussian mixtures.
//!
//! [`KMeansMachine`] holds the cluster centres; [`KMeansTrainer`] runs Lloyd
//! iterations through the same E-step/M-step interface as the GMM trainers. The
//! "likelihood" of a K-Means pass is the average squared distance of each sample
//! to its closest mean, which decreases as training converges.

use crate::{
    config::KMeansInitialization,
    em_training::EmTrainer,
    errors::{validate_all_finite, validate_dimension, validate_samples, EmError, EmResult},
    math_utils::{float_ops::slices_close, squared_distance},
    secure_rng::SecureRng,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Cluster centres of a K-Means model.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KMeansMachine {
    means: Vec<Vec<f64>>,
    n_inputs: usize,
}

impl KMeansMachine {
    /// K zero means of dimension D.
    pub fn new(n_means: usize, n_inputs: usize) -> Self {
        Self {
            means: vec![vec![0.0; n_inputs]; n_means],
            n_inputs,
        }
    }

    /// Number of clusters K.
    pub fn n_means(&self) -> usize {
        self.means.len()
    }

    /// Feature dimensionality D.
    pub fn n_inputs(&self) -> usize {
        self.n_inputs
    }

    /// All cluster centres, one row per cluster.
    pub fn means(&self) -> &[Vec<f64>] {
        &self.means
    }

    /// Centre of cluster `i`.
    pub fn mean(&self, i: usize) -> EmResult<&[f64]> {
        self.means
            .get(i)
            .map(Vec::as_slice)
            .ok_or_else(|| EmError::DimensionMismatch {
                what: "cluster index".to_string(),
                expected: self.n_means(),
                actual: i,
            })
    }

    /// Replace every centre; shape must be K x D.
    pub fn set_means(&mut self, means: &[Vec<f64>]) -> EmResult<()> {
        validate_dimension(means.len(), self.n_means(), "number of means")?;
        for mean in means {
            validate_dimension(mean.len(), self.n_inputs, "mean length")?;
            validate_all_finite(mean, "mean")?;
        }
        self.means = means.to_vec();
        Ok(())
    }

    /// Replace the centre of cluster `i`.
    pub fn set_mean(&mut self, i: usize, mean: &[f64]) -> EmResult<()> {
        validate_dimension(mean.len(), self.n_inputs, "mean length")?;
        validate_all_finite(mean, "mean")?;
        let n_means = self.n_means();
        let slot = self.means.get_mut(i).ok_or_else(|| EmError::DimensionMismatch {
            what: "cluster index".to_string(),
            expected: n_means,
            actual: i,
        })?;
        slot.copy_from_slice(mean);
        Ok(())
    }

    /// Squared Euclidean distance between `x` and centre `i`.
    pub fn distance_from_mean(&self, x: &[f64], i: usize) -> EmResult<f64> {
        validate_dimension(x.len(), self.n_inputs, "sample length")?;
        Ok(squared_distance(x, self.mean(i)?))
    }

    /// Index of and squared distance to the closest centre.
    pub fn closest_mean(&self, x: &[f64]) -> EmResult<(usize, f64)> {
        validate_dimension(x.len(), self.n_inputs, "sample length")?;
        if self.means.is_empty() {
            return Err(EmError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }
        Ok(self.closest_unchecked(x))
    }

    /// Squared distance to the closest centre.
    pub fn min_distance(&self, x: &[f64]) -> EmResult<f64> {
        self.closest_mean(x).map(|(_, distance)| distance)
    }

    /// Average squared distance of `data` to the closest centres.
    pub fn average_min_distance(&self, data: &[Vec<f64>]) -> EmResult<f64> {
        validate_samples(data, self.n_inputs)?;
        let mut total = 0.0;
        for x in data {
            total += self.min_distance(x)?;
        }
        Ok(total / data.len() as f64)
    }

    /// Per-cluster variances and the fraction of samples assigned to each cluster.
    ///
    /// Variances are the biased sample variances of the members; an empty
    /// cluster gets zero variance and zero weight.
    pub fn variances_and_weights_for_each_cluster(
        &self,
        data: &[Vec<f64>],
    ) -> EmResult<(Vec<Vec<f64>>, Vec<f64>)> {
        validate_samples(data, self.n_inputs)?;
        if self.means.is_empty() {
            return Err(EmError::InsufficientData {
                required: 1,
                actual: 0,
            });
        }

        let k = self.n_means();
        let mut counts = vec![0.0; k];
        let mut sums = vec![vec![0.0; self.n_inputs]; k];
        let mut sums_sq = vec![vec![0.0; self.n_inputs]; k];
        for x in data {
            let (i, _) = self.closest_unchecked(x);
            counts[i] += 1.0;
            for ((s, sq), &xi) in sums[i].iter_mut().zip(sums_sq[i].iter_mut()).zip(x.iter()) {
                *s += xi;
                *sq += xi * xi;
            }
        }

        let total = data.len() as f64;
        let weights = counts.iter().map(|&c| c / total).collect();
        let variances = (0..k)
            .map(|i| {
                if counts[i] == 0.0 {
                    return vec![0.0; self.n_inputs];
                }
                sums[i]
                    .iter()
                    .zip(sums_sq[i].iter())
                    .map(|(&s, &sq)| {
                        let mean = s / counts[i];
                        (sq / counts[i] - mean * mean).max(0.0)
                    })
                    .collect()
            })
            .collect();
        Ok((variances, weights))
    }

    /// Approximate equality of the centres.
    pub fn is_similar_to(&self, other: &Self, r_epsilon: f64, a_epsilon: f64) -> bool {
        self.n_inputs == other.n_inputs
            && self.n_means() == other.n_means()
            && self
                .means
                .iter()
                .zip(other.means.iter())
                .all(|(a, b)| slices_close(a, b, r_epsilon, a_epsilon))
    }

    fn closest_unchecked(&self, x: &[f64]) -> (usize, f64) {
        let mut min_dist = f64::INFINITY;
        let mut best = 0;
        for (j, mean) in self.means.iter().enumerate() {
            let dist = squared_distance(x, mean);
            if dist < min_dist {
                min_dist = dist;
                best = j;
            }
        }
        (best, min_dist)
    }
}

/// Lloyd's algorithm with configurable seeding.
#[derive(Debug, Clone)]
pub struct KMeansTrainer {
    initialization: KMeansInitialization,
    rng: SecureRng,
    zeroth_order_stats: Vec<f64>,
    first_order_stats: Vec<Vec<f64>>,
    average_min_distance: f64,
    initialized: bool,
}

impl Default for KMeansTrainer {
    fn default() -> Self {
        Self::new(KMeansInitialization::default(), None)
    }
}

impl KMeansTrainer {
    /// Trainer with the given seeding method; `seed` makes it reproducible.
    pub fn new(initialization: KMeansInitialization, seed: Option<u64>) -> Self {
        Self {
            initialization,
            rng: SecureRng::from_optional_seed(seed),
            zeroth_order_stats: Vec::new(),
            first_order_stats: Vec::new(),
            average_min_distance: 0.0,
            initialized: false,
        }
    }

    /// Seeding method.
    pub fn initialization(&self) -> KMeansInitialization {
        self.initialization
    }

    /// Change the seeding method.
    pub fn set_initialization(&mut self, initialization: KMeansInitialization) {
        self.initialization = initialization;
    }

    /// Samples assigned to each cluster in the last E-step.
    pub fn zeroth_order_statistics(&self) -> &[f64] {
        &self.zeroth_order_stats
    }

    /// Per-cluster sums of the assigned samples.
    pub fn first_order_statistics(&self) -> &[Vec<f64>] {
        &self.first_order_stats
    }

    /// Average squared distance to the closest centre in the last E-step.
    pub fn average_min_distance(&self) -> f64 {
        self.average_min_distance
    }

    /// Pick the initial centres from `data` and size the accumulators.
    pub fn initialize(&mut self, machine: &mut KMeansMachine, data: &[Vec<f64>]) -> EmResult<()> {
        validate_samples(data, machine.n_inputs())?;
        let k = machine.n_means();
        if k == 0 {
            return Err(EmError::InvalidConfiguration {
                parameter: "n_means".to_string(),
                value: 0.0,
                constraint: ">= 1".to_string(),
            });
        }
        if data.len() < k {
            return Err(EmError::InsufficientData {
                required: k,
                actual: data.len(),
            });
        }

        let means = match self.initialization {
            KMeansInitialization::Random => (0..k)
                .map(|_| data[self.rng.usize(0..data.len())].clone())
                .collect(),
            KMeansInitialization::RandomNoDuplicate => self.pick_distinct(data, k)?,
            KMeansInitialization::KMeansPlusPlus => self.pick_plus_plus(data, k),
        };
        machine.set_means(&means)?;

        self.zeroth_order_stats = vec![0.0; k];
        self.first_order_stats = vec![vec![0.0; machine.n_inputs()]; k];
        self.average_min_distance = 0.0;
        self.initialized = true;
        log::debug!("K-Means initialised {} means with {:?}", k, self.initialization);
        Ok(())
    }

    /// Assign each sample to its closest centre and accumulate.
    pub fn e_step(&mut self, machine: &KMeansMachine, data: &[Vec<f64>]) -> EmResult<()> {
        self.ensure_ready(machine)?;
        validate_samples(data, machine.n_inputs())?;

        self.reset_accumulators();
        for x in data {
            let (i, distance) = machine.closest_unchecked(x);
            self.zeroth_order_stats[i] += 1.0;
            for (acc, &xi) in self.first_order_stats[i].iter_mut().zip(x.iter()) {
                *acc += xi;
            }
            self.average_min_distance += distance;
        }
        self.average_min_distance /= data.len() as f64;
        Ok(())
    }

    /// Move each centre to the mean of its members; empty clusters keep theirs.
    pub fn m_step(&mut self, machine: &mut KMeansMachine) -> EmResult<()> {
        self.ensure_ready(machine)?;
        let mut means = machine.means().to_vec();
        let mut empty = 0;
        for (i, mean) in means.iter_mut().enumerate() {
            let count = self.zeroth_order_stats[i];
            if count > 0.0 {
                for (m, &s) in mean.iter_mut().zip(self.first_order_stats[i].iter()) {
                    *m = s / count;
                }
            } else {
                empty += 1;
            }
        }
        if empty > 0 {
            log::warn!("{} K-Means cluster(s) received no samples", empty);
        }
        machine.set_means(&means)
    }

    /// Average squared distance of the last E-step.
    pub fn compute_likelihood(&self, machine: &KMeansMachine) -> EmResult<f64> {
        self.ensure_ready(machine)?;
        Ok(self.average_min_distance)
    }

    /// Zero the accumulators without changing their shape.
    pub fn reset_accumulators(&mut self) {
        self.zeroth_order_stats.iter_mut().for_each(|v| *v = 0.0);
        self.first_order_stats
            .iter_mut()
            .for_each(|row| row.iter_mut().for_each(|v| *v = 0.0));
        self.average_min_distance = 0.0;
    }

    fn ensure_ready(&self, machine: &KMeansMachine) -> EmResult<()> {
        if !self.initialized {
            return Err(EmError::UninitializedTrainer {
                trainer: "KMeansTrainer".to_string(),
            });
        }
        validate_dimension(self.zeroth_order_stats.len(), machine.n_means(), "number of means")?;
        let accumulated_dim = self.first_order_stats.first().map_or(machine.n_inputs(), Vec::len);
        validate_dimension(accumulated_dim, machine.n_inputs(), "feature dimension")
    }

    /// Random samples, rejecting values already chosen.
    fn pick_distinct(&mut self, data: &[Vec<f64>], k: usize) -> EmResult<Vec<Vec<f64>>> {
        let mut order: Vec<usize> = (0..data.len()).collect();
        for i in (1..order.len()).rev() {
            let j = self.rng.usize(0..i + 1);
            order.swap(i, j);
        }

        let mut means: Vec<Vec<f64>> = Vec::with_capacity(k);
        for &idx in &order {
            if means.len() == k {
                break;
            }
            if !means.iter().any(|m| m == &data[idx]) {
                means.push(data[idx].clone());
            }
        }
        if means.len() < k {
            return Err(EmError::InsufficientData {
                required: k,
                actual: means.len(),
            });
        }
        Ok(means)
    }

    /// k-means++: each new centre is drawn with probability proportional to its
    /// squared distance from the centres chosen so far.
    fn pick_plus_plus(&mut self, data: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
        let mut means: Vec<Vec<f64>> = Vec::with_capacity(k);
        if k == 0 {
            return means;
        }
        means.push(data[self.rng.usize(0..data.len())].clone());

        for _ in 1..k {
            let distances: Vec<f64> = data
                .iter()
                .map(|x| {
                    means
                        .iter()
                        .map(|m| squared_distance(x, m))
                        .fold(f64::INFINITY, f64::min)
                })
                .collect();
            let total: f64 = distances.iter().sum();

            let chosen = if total > 0.0 {
                let target = self.rng.f64() * total;
                let mut cumulative = 0.0;
                let mut chosen = distances.len() - 1;
                for (i, &dist) in distances.iter().enumerate() {
                    cumulative += dist;
                    if dist > 0.0 && cumulative >= target {
                        chosen = i;
                        break;
                    }
                }
                chosen
            } else {
                self.rng.usize(0..data.len())
            };
            means.push(data[chosen].clone());
        }
        means
    }
}

impl EmTrainer<KMeansMachine> for KMeansTrainer {
    fn initialize(&mut self, machine: &mut KMeansMachine, data: &[Vec<f64>]) -> EmResult<()> {
        KMeansTrainer::initialize(self, machine, data)
    }

    fn e_step(&mut self, machine: &KMeansMachine, data: &[Vec<f64>]) -> EmResult<()> {
        KMeansTrainer::e_step(self, machine, data)
    }

    fn m_step(&mut self, machine: &mut KMeansMachine, _data: &[Vec<f64>]) -> EmResult<()> {
        KMeansTrainer::m_step(self, machine)
    }

    fn compute_likelihood(&self, machine: &KMeansMachine) -> EmResult<f64> {
        KMeansTrainer::compute_likelihood(self, machine)
    }
}
