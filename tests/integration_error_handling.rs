//! Integration tests for error handling and invalid inputs
//!
//! These tests validate that trainers report misuse through `EmError` and never
//! leave a machine partially updated.

use std::sync::Arc;

use mixture_em::{
    errors::EmError, train, EmTrainingConfig, GmmMachine, GmmStats, GmmTrainerConfig, IsvBase,
    IsvMachine, IsvTrainer, IsvTrainerConfig, KMeansMachine, KMeansTrainer, MapAdaptation,
    MapGmmTrainer, MlGmmTrainer,
};

fn two_component_gmm() -> GmmMachine {
    GmmMachine::from_parameters(
        &[0.5, 0.5],
        &[vec![0.0], vec![5.0]],
        &[vec![1.0], vec![1.0]],
    )
    .unwrap()
}

/// Test scenario: M-step called before the trainer was initialised
#[test]
fn test_m_step_before_initialize() {
    let mut gmm = two_component_gmm();
    let before = gmm.clone();
    let mut trainer = MlGmmTrainer::default();

    match trainer.m_step(&mut gmm) {
        Err(EmError::UninitializedTrainer { trainer }) => {
            assert_eq!(trainer, "MlGmmTrainer");
        }
        other => panic!("Expected UninitializedTrainer error, got {:?}", other),
    }
    assert_eq!(gmm, before, "failed M-step must not touch the mixture");
}

/// Test scenario: a trainer initialised for one mixture is used on another
#[test]
fn test_trainer_reused_on_different_mixture() {
    let small = two_component_gmm();
    let mut trainer = MlGmmTrainer::default();
    trainer.initialize(&small);
    trainer.e_step(&small, &[vec![0.1], vec![4.9]]).unwrap();

    let mut larger = GmmMachine::new(3, 1);
    let before = larger.clone();
    match trainer.m_step(&mut larger) {
        Err(EmError::DimensionMismatch { expected, actual, .. }) => {
            assert_eq!((expected, actual), (2, 3));
        }
        other => panic!("Expected DimensionMismatch error, got {:?}", other),
    }
    assert_eq!(larger, before);
}

/// Test scenario: samples with the wrong dimension or non-finite values
#[test]
fn test_invalid_samples() {
    let mut gmm = two_component_gmm();
    let mut trainer = MlGmmTrainer::default();

    let result = train(
        &mut trainer,
        &mut gmm,
        &[vec![0.0], vec![1.0, 2.0]],
        &EmTrainingConfig::default(),
    );
    assert!(matches!(result, Err(EmError::DimensionMismatch { .. })));

    let result = train(
        &mut trainer,
        &mut gmm,
        &[vec![0.0], vec![f64::INFINITY]],
        &EmTrainingConfig::default(),
    );
    assert!(matches!(result, Err(EmError::NumericalError { .. })));

    let result = train(&mut trainer, &mut gmm, &[], &EmTrainingConfig::default());
    assert!(matches!(result, Err(EmError::InsufficientData { .. })));
}

/// Test scenario: invalid configuration values are rejected up front
#[test]
fn test_invalid_configuration() {
    let bad_threshold = GmmTrainerConfig::default().with_responsibilities_threshold(-1.0);
    assert!(matches!(
        MlGmmTrainer::from_config(bad_threshold),
        Err(EmError::InvalidConfiguration { .. })
    ));

    let prior = Arc::new(two_component_gmm());
    assert!(MapGmmTrainer::from_config(
        GmmTrainerConfig::default(),
        Arc::clone(&prior),
        MapAdaptation::RelevanceFactor(-4.0),
    )
    .is_err());

    let config = EmTrainingConfig {
        convergence_threshold: Some(f64::NAN),
        ..EmTrainingConfig::default()
    };
    let mut gmm = two_component_gmm();
    let mut trainer = MlGmmTrainer::default();
    assert!(matches!(
        train(&mut trainer, &mut gmm, &[vec![0.0]], &config),
        Err(EmError::InvalidConfiguration { .. })
    ));

    assert!(IsvTrainer::new(IsvTrainerConfig {
        relevance_factor: -1.0,
        seed: None,
    })
    .is_err());
}

/// Test scenario: inconsistent external statistics
#[test]
fn test_inconsistent_statistics_rejected() {
    // Mass does not add up to the sample count
    let result = GmmStats::from_parts(
        10,
        0.0,
        vec![3.0, 3.0],
        vec![vec![0.0], vec![0.0]],
        vec![vec![0.0], vec![0.0]],
    );
    assert!(matches!(result, Err(EmError::InvalidConfiguration { .. })));

    let mut stats = GmmStats::new(2, 1);
    assert!(stats.merge(&GmmStats::new(2, 3)).is_err());
}

/// Test scenario: K-Means with fewer samples than clusters
#[test]
fn test_kmeans_insufficient_data() {
    let mut machine = KMeansMachine::new(5, 1);
    let mut trainer = KMeansTrainer::default();
    let result = train(
        &mut trainer,
        &mut machine,
        &[vec![0.0], vec![1.0]],
        &EmTrainingConfig::default(),
    );
    match result {
        Err(EmError::InsufficientData { required, actual }) => {
            assert!(actual < required);
        }
        other => panic!("Expected InsufficientData error, got {:?}", other),
    }
}

/// Test scenario: MAP prior and mixture disagree on shape
#[test]
fn test_map_prior_shape_mismatch() {
    let prior = Arc::new(GmmMachine::new(4, 1));
    let mut gmm = two_component_gmm();
    let before = gmm.clone();
    let mut trainer = MapGmmTrainer::from_config(
        GmmTrainerConfig::default(),
        prior,
        MapAdaptation::default(),
    )
    .unwrap();
    let result = train(&mut trainer, &mut gmm, &[vec![0.0]], &EmTrainingConfig::default());
    assert!(matches!(result, Err(EmError::DimensionMismatch { .. })));
    assert_eq!(gmm, before);
}

/// Test scenario: ISV misuse
#[test]
fn test_isv_errors() {
    let ubm = two_component_gmm();
    assert!(matches!(
        IsvBase::new(ubm.clone(), 0),
        Err(EmError::InvalidConfiguration { .. })
    ));

    let mut base = IsvBase::new(ubm.clone(), 1).unwrap();
    let mut trainer = IsvTrainer::new(IsvTrainerConfig::default()).unwrap();
    assert!(matches!(
        trainer.m_step(&mut base),
        Err(EmError::UninitializedTrainer { .. })
    ));

    // Statistics from a mixture of another shape
    let foreign = GmmMachine::new(3, 1)
        .compute_statistics(&[vec![0.0], vec![1.0]])
        .unwrap();
    assert!(matches!(
        trainer.initialize(&mut base, &[vec![foreign.clone()]]),
        Err(EmError::DimensionMismatch { .. })
    ));
    assert!(matches!(
        trainer.initialize(&mut base, &[]),
        Err(EmError::InsufficientData { .. })
    ));

    let machine = IsvMachine::new(Arc::new(base));
    assert!(matches!(
        machine.score(&foreign),
        Err(EmError::DimensionMismatch { .. })
    ));
}
