//! Generic expectation-maximisation loop.
//!
//! Any trainer exposing the four EM phases through [`EmTrainer`] can be driven
//! by [`train`]: ML and MAP mixture trainers as well as K-Means.

use crate::{
    config::EmTrainingConfig,
    errors::{validate_all_finite, validate_data_length, EmResult},
};

/// The four phases of an EM trainer for machine type `M`.
pub trait EmTrainer<M> {
    /// Prepare the trainer (and possibly the machine) for a training run.
    fn initialize(&mut self, machine: &mut M, data: &[Vec<f64>]) -> EmResult<()>;

    /// Accumulate statistics of `data` under the current machine.
    fn e_step(&mut self, machine: &M, data: &[Vec<f64>]) -> EmResult<()>;

    /// Update the machine from the accumulated statistics.
    fn m_step(&mut self, machine: &mut M, data: &[Vec<f64>]) -> EmResult<()>;

    /// Objective value of the last E-step.
    fn compute_likelihood(&self, machine: &M) -> EmResult<f64>;
}

/// Outcome of a [`train`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSummary {
    /// M-steps performed
    pub iterations: usize,
    /// Whether the relative change fell below the threshold
    pub converged: bool,
    /// Objective after the last E-step
    pub final_likelihood: f64,
    /// Objective after the initial E-step and after every iteration
    pub history: Vec<f64>,
}

/// Run EM until convergence or `max_iterations`.
///
/// Convergence is declared when `|(previous - current) / previous|` is at most
/// the configured threshold. Without a threshold exactly `max_iterations`
/// iterations run.
pub fn train<M, T>(
    trainer: &mut T,
    machine: &mut M,
    data: &[Vec<f64>],
    config: &EmTrainingConfig,
) -> EmResult<TrainingSummary>
where
    T: EmTrainer<M> + ?Sized,
{
    config.validate()?;
    if config.check_inputs {
        validate_data_length(data.len(), 1)?;
        for (i, sample) in data.iter().enumerate() {
            validate_all_finite(sample, &format!("sample {}", i))?;
        }
    }

    if config.initialize {
        trainer.initialize(machine, data)?;
    }
    trainer.e_step(machine, data)?;
    let mut previous = trainer.compute_likelihood(machine)?;
    let mut history = vec![previous];
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..config.max_iterations {
        trainer.m_step(machine, data)?;
        trainer.e_step(machine, data)?;
        let current = trainer.compute_likelihood(machine)?;
        history.push(current);
        iterations = iteration + 1;
        log::debug!("EM iteration {}: objective {:.10}", iterations, current);

        if let Some(threshold) = config.convergence_threshold {
            if relative_change(previous, current) <= threshold {
                converged = true;
                log::info!(
                    "EM converged after {} iterations (objective {:.10})",
                    iterations,
                    current
                );
                break;
            }
        }
        previous = current;
    }

    if !converged && config.convergence_threshold.is_some() {
        log::info!("EM stopped after {} iterations without converging", iterations);
    }

    Ok(TrainingSummary {
        iterations,
        converged,
        final_likelihood: *history.last().unwrap_or(&previous),
        history,
    })
}

fn relative_change(previous: f64, current: f64) -> f64 {
    if previous == current {
        0.0
    } else {
        ((previous - current) / previous).abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::EmError;

    /// Halves its objective each M-step.
    struct Halving {
        value: f64,
        initialized: bool,
        m_steps: usize,
    }

    impl EmTrainer<f64> for Halving {
        fn initialize(&mut self, machine: &mut f64, _data: &[Vec<f64>]) -> EmResult<()> {
            *machine = 1.0;
            self.initialized = true;
            Ok(())
        }

        fn e_step(&mut self, machine: &f64, _data: &[Vec<f64>]) -> EmResult<()> {
            self.value = *machine;
            Ok(())
        }

        fn m_step(&mut self, machine: &mut f64, _data: &[Vec<f64>]) -> EmResult<()> {
            *machine *= 0.5;
            self.m_steps += 1;
            Ok(())
        }

        fn compute_likelihood(&self, _machine: &f64) -> EmResult<f64> {
            Ok(1.0 + self.value)
        }
    }

    fn halving() -> Halving {
        Halving {
            value: 0.0,
            initialized: false,
            m_steps: 0,
        }
    }

    #[test]
    fn test_fixed_iterations() {
        let mut trainer = halving();
        let mut machine = 0.0;
        let summary = train(&mut trainer, &mut machine, &[vec![0.0]], &EmTrainingConfig::fixed_iterations(4)).unwrap();
        assert!(trainer.initialized);
        assert_eq!(summary.iterations, 4);
        assert!(!summary.converged);
        assert_eq!(summary.history.len(), 5);
        assert_eq!(machine, 1.0 / 16.0);
        assert_eq!(summary.final_likelihood, 1.0 + 1.0 / 16.0);
    }

    #[test]
    fn test_stops_on_convergence() {
        let mut trainer = halving();
        let mut machine = 0.0;
        let config = EmTrainingConfig {
            max_iterations: 100,
            convergence_threshold: Some(1e-3),
            ..EmTrainingConfig::default()
        };
        let summary = train(&mut trainer, &mut machine, &[vec![0.0]], &config).unwrap();
        assert!(summary.converged);
        assert!(summary.iterations < 100);
        assert_eq!(trainer.m_steps, summary.iterations);
    }

    #[test]
    fn test_skips_initialize_when_disabled() {
        let mut trainer = halving();
        let mut machine = 8.0;
        let config = EmTrainingConfig {
            initialize: false,
            ..EmTrainingConfig::fixed_iterations(1)
        };
        train(&mut trainer, &mut machine, &[vec![0.0]], &config).unwrap();
        assert!(!trainer.initialized);
        assert_eq!(machine, 4.0);
    }

    #[test]
    fn test_rejects_non_finite_input() {
        let mut trainer = halving();
        let mut machine = 0.0;
        let result = train(
            &mut trainer,
            &mut machine,
            &[vec![0.0], vec![f64::NAN]],
            &EmTrainingConfig::default(),
        );
        assert!(matches!(result, Err(EmError::NumericalError { .. })));
        assert!(!trainer.initialized);
    }
}
