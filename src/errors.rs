//! Error types and validation functions for mixture model training.
//!
//! Every fallible operation in the crate returns [`EmResult`]. Errors are detected
//! before any model is mutated, so a failed call leaves machines and trainers in
//! the state they had before the call.

use thiserror::Error;

/// Error kinds raised by machines and trainers.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum EmError {
    /// Two objects disagree on a size (mixture vs. accumulator, sample vs. mixture, ...).
    #[error("Dimension mismatch for {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being compared
        what: String,
        /// Expected size
        expected: usize,
        /// Size actually provided
        actual: usize,
    },

    /// A configuration value is outside its valid domain.
    #[error("Invalid configuration: {parameter} = {value}, expected {constraint}")]
    InvalidConfiguration {
        /// Parameter name
        parameter: String,
        /// Invalid value provided
        value: f64,
        /// Valid range or constraint description
        constraint: String,
    },

    /// A trainer step was requested before `initialize`.
    #[error("Trainer not initialized: {trainer} requires initialize() before this step")]
    UninitializedTrainer {
        /// Trainer name
        trainer: String,
    },

    /// Not enough data (samples, sessions, identities) to perform the operation.
    #[error("Insufficient data: need at least {required}, got {actual}")]
    InsufficientData {
        /// Minimum required amount
        required: usize,
        /// Actual amount provided
        actual: usize,
    },

    /// Numerical failure such as a non positive-definite posterior precision.
    #[error("Numerical computation failed: {reason}")]
    NumericalError {
        /// Detailed reason for the failure
        reason: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization failed ({format}): {reason}")]
    SerializationError {
        /// Format that failed
        format: String,
        /// Underlying reason
        reason: String,
    },
}

/// Result type for training and scoring operations.
pub type EmResult<T> = Result<T, EmError>;

/// Validates that a size matches the expected one.
///
/// # Example
/// ```rust
/// use mixture_em::errors::validate_dimension;
///
/// assert!(validate_dimension(3, 3, "feature dimension").is_ok());
/// assert!(validate_dimension(2, 3, "feature dimension").is_err());
/// ```
pub fn validate_dimension(actual: usize, expected: usize, what: &str) -> EmResult<()> {
    if actual != expected {
        return Err(EmError::DimensionMismatch {
            what: what.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Validates that a collection has at least `min_required` elements.
pub fn validate_data_length(actual: usize, min_required: usize) -> EmResult<()> {
    if actual < min_required {
        Err(EmError::InsufficientData {
            required: min_required,
            actual,
        })
    } else {
        Ok(())
    }
}

/// Validates that a parameter is within `[min, max]` and not NaN.
///
/// # Example
/// ```rust
/// use mixture_em::errors::validate_parameter;
///
/// assert!(validate_parameter(0.5, 0.0, 1.0, "alpha").is_ok());
/// assert!(validate_parameter(1.5, 0.0, 1.0, "alpha").is_err());
/// assert!(validate_parameter(f64::NAN, 0.0, 1.0, "alpha").is_err());
/// ```
pub fn validate_parameter(value: f64, min: f64, max: f64, name: &str) -> EmResult<()> {
    if value.is_nan() {
        return Err(EmError::InvalidConfiguration {
            parameter: name.to_string(),
            value,
            constraint: "must not be NaN".to_string(),
        });
    }

    if value < min || value > max {
        let constraint = if max >= f64::MAX {
            format!(">= {}", min)
        } else {
            format!("[{}, {}]", min, max)
        };
        return Err(EmError::InvalidConfiguration {
            parameter: name.to_string(),
            value,
            constraint,
        });
    }

    Ok(())
}

/// Validates that all values in a slice are finite.
///
/// Returns immediately on the first non-finite value, reporting its index.
pub fn validate_all_finite(data: &[f64], name: &str) -> EmResult<()> {
    if let Some((i, &value)) = data.iter().enumerate().find(|(_, v)| !v.is_finite()) {
        return Err(EmError::NumericalError {
            reason: format!("{} contains non-finite value at index {}: {}", name, i, value),
        });
    }
    Ok(())
}

/// Validates a set of feature vectors: non-empty, all of length `n_inputs`, all finite.
pub fn validate_samples(data: &[Vec<f64>], n_inputs: usize) -> EmResult<()> {
    validate_data_length(data.len(), 1)?;
    for (i, sample) in data.iter().enumerate() {
        validate_dimension(sample.len(), n_inputs, "sample length")?;
        validate_all_finite(sample, &format!("sample {}", i))?;
    }
    Ok(())
}
