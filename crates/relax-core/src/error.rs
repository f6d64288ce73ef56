//! Error types for solver construction and runs.
//!
//! Fallible operations return `RelaxResult<T>`. Numeric degeneracies during
//! a run are not errors; constraints answer them with zero corrections.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RelaxError {
    /// Constraint weights must be finite and non-negative.
    #[error("weight must be finite and non-negative, got {0}")]
    InvalidWeight(f64),

    /// Collision radii must be finite and non-negative.
    #[error("radius must be finite and non-negative, got {0}")]
    InvalidRadius(f64),

    /// Target lengths must be finite and non-negative.
    #[error("target length must be finite and non-negative, got {0}")]
    InvalidLength(f64),

    /// Inverse masses must be finite and non-negative.
    #[error("inverse mass of particle {index} must be finite and non-negative, got {value}")]
    InvalidInverseMass { index: usize, value: f64 },

    /// Initial positions must be finite.
    #[error("position of particle {0} is not finite")]
    NonFinitePosition(usize),

    /// Grid domain is empty, inverted or not finite.
    #[error("invalid grid domain: {0}")]
    InvalidDomain(String),

    /// Every grid axis needs at least one bin.
    #[error("bin counts must be at least 1, got {nx}x{ny}x{nz}")]
    InvalidBinCount { nx: usize, ny: usize, nz: usize },

    /// Early-exit tolerances must be finite and non-negative.
    #[error("tolerance must be finite and non-negative, got {0}")]
    InvalidTolerance(f64),

    /// Grid refresh cadence must be at least one iteration.
    #[error("refresh interval must be at least 1")]
    InvalidRefreshInterval,

    /// Two buffers that describe the same particles disagree in size.
    #[error("length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// A handle refers past the end of the particle store.
    #[error("particle index {index} out of bounds (count: {count})")]
    IndexOutOfBounds { index: usize, count: usize },

    /// The constraint has no implementation for its numeric routine.
    #[error("not implemented: {0}")]
    Unimplemented(&'static str),
}

/// Convenience alias for `Result<T, RelaxError>`.
pub type RelaxResult<T> = Result<T, RelaxError>;

/// Rejects negative or non-finite constraint weights.
pub fn check_weight(weight: f64) -> RelaxResult<f64> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(weight)
    } else {
        Err(RelaxError::InvalidWeight(weight))
    }
}

/// Rejects negative or non-finite radii.
pub fn check_radius(radius: f64) -> RelaxResult<f64> {
    if radius.is_finite() && radius >= 0.0 {
        Ok(radius)
    } else {
        Err(RelaxError::InvalidRadius(radius))
    }
}
