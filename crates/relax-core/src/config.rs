use crate::error::{RelaxError, RelaxResult};
use crate::exec::Execution;

/// Solver settings.
///
/// ```
/// use relax_core::config::SolverConfig;
/// use relax_core::exec::Execution;
///
/// let config = SolverConfig::default()
///     .with_iterations(50)
///     .with_execution(Execution::Parallel)
///     .with_tolerance(1e-9)?;
/// assert_eq!(config.iterations, 50);
/// # Ok::<(), relax_core::RelaxError>(())
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SolverConfig {
    /// Fixed iteration budget for one run.
    pub iterations: usize,
    /// How the calculate phase is scheduled across constraints.
    pub execution: Execution,
    /// Stop early once no particle moves farther than this in one iteration.
    /// `None` runs the full budget.
    pub tolerance: Option<f64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            execution: Execution::Sequential,
            tolerance: None,
        }
    }
}

impl SolverConfig {
    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    /// Stop once an iteration moves no particle farther than `tolerance`.
    pub fn with_tolerance(mut self, tolerance: f64) -> RelaxResult<Self> {
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(RelaxError::InvalidTolerance(tolerance));
        }
        self.tolerance = Some(tolerance);
        Ok(self)
    }

    /// Always run the full iteration budget.
    pub fn without_tolerance(mut self) -> Self {
        self.tolerance = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runs_full_budget() {
        let config = SolverConfig::default();
        assert_eq!(config.iterations, 100);
        assert_eq!(config.execution, Execution::Sequential);
        assert_eq!(config.tolerance, None);
    }

    #[test]
    fn test_bad_tolerance_is_rejected() {
        for bad in [-1e-6, f64::NAN, f64::INFINITY] {
            let err = SolverConfig::default().with_tolerance(bad).unwrap_err();
            assert!(matches!(err, RelaxError::InvalidTolerance(_)), "{bad} gave {err:?}");
        }
    }

    #[test]
    fn test_tolerance_round_trip() {
        let config = SolverConfig::default().with_tolerance(0.0).unwrap();
        assert_eq!(config.tolerance, Some(0.0));
        assert_eq!(config.without_tolerance().tolerance, None);
    }
}
