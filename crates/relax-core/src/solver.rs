use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::SolverConfig;
use crate::constraints::Constraint;
use crate::error::RelaxResult;
use crate::particle::ParticleStore;

/// Lifecycle of a [`Solver`]. A finished solver may be run again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolverState {
    Idle,
    Iterating,
    Done,
}

/// Outcome of one [`Solver::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SolveReport {
    /// Iterations whose corrections were merged into the store.
    pub iterations: usize,
    /// Stopped by the cancel flag before the budget ran out.
    pub cancelled: bool,
    /// Stopped because the largest displacement fell under the tolerance.
    pub converged: bool,
    /// Largest particle displacement in the last completed iteration.
    pub max_displacement: f64,
}

/// Iterative relaxation of a particle set under weighted constraints.
///
/// Every iteration runs two phases. In the calculate phase each constraint
/// reads the positions and fills its own handle deltas; the constraints are
/// independent here and may run on several threads. In the apply phase each
/// constraint votes its deltas into the store, and the store moves every
/// particle to the weight-averaged vote. Positions are read-only during
/// calculate and updated only at the end of an iteration, so the outcome does
/// not depend on constraint order.
pub struct Solver {
    store: ParticleStore,
    config: SolverConfig,
    state: SolverState,
}

impl Solver {
    /// Idle solver over `store`.
    pub fn new(store: ParticleStore, config: SolverConfig) -> Self {
        Self {
            store,
            config,
            state: SolverState::Idle,
        }
    }

    /// Particles as of the last completed iteration.
    pub fn store(&self) -> &ParticleStore {
        &self.store
    }

    /// Edit positions or pins between runs.
    pub fn store_mut(&mut self) -> &mut ParticleStore {
        &mut self.store
    }

    /// Hand the relaxed particles back.
    pub fn into_store(self) -> ParticleStore {
        self.store
    }

    /// Settings used by the next run.
    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Change iterations, execution or tolerance between runs.
    pub fn config_mut(&mut self) -> &mut SolverConfig {
        &mut self.config
    }

    /// Where the solver is in its lifecycle.
    pub fn state(&self) -> SolverState {
        self.state
    }

    /// Run the configured number of iterations over `constraints`.
    ///
    /// Handles are checked against the store before the first iteration, so a
    /// bad index fails the run with the store untouched. An error from a
    /// constraint's calculate aborts the run before that iteration's apply;
    /// earlier iterations stay merged.
    pub fn run(&mut self, constraints: &mut [Box<dyn Constraint>]) -> RelaxResult<SolveReport> {
        self.run_inner(constraints, None)
    }

    /// Like [`Solver::run`], checking `cancel` before every iteration.
    ///
    /// The flag is only read between iterations. A cancelled run keeps every
    /// completed iteration and is not an error.
    pub fn run_with_cancel(
        &mut self,
        constraints: &mut [Box<dyn Constraint>],
        cancel: &AtomicBool,
    ) -> RelaxResult<SolveReport> {
        self.run_inner(constraints, Some(cancel))
    }

    fn run_inner(
        &mut self,
        constraints: &mut [Box<dyn Constraint>],
        cancel: Option<&AtomicBool>,
    ) -> RelaxResult<SolveReport> {
        let count = self.store.len();
        for c in constraints.iter() {
            c.validate(count)?;
        }

        tracing::debug!(
            particles = count,
            constraints = constraints.len(),
            iterations = self.config.iterations,
            parallel = self.config.execution.is_parallel(),
            "relaxation started"
        );

        self.state = SolverState::Iterating;
        let result = self.iterate(constraints, cancel);
        self.state = SolverState::Done;

        match &result {
            Ok(report) => tracing::debug!(
                iterations = report.iterations,
                cancelled = report.cancelled,
                converged = report.converged,
                max_displacement = report.max_displacement,
                "relaxation finished"
            ),
            Err(err) => tracing::warn!(error = %err, "relaxation aborted"),
        }
        result
    }

    fn iterate(
        &mut self,
        constraints: &mut [Box<dyn Constraint>],
        cancel: Option<&AtomicBool>,
    ) -> RelaxResult<SolveReport> {
        let mut report = SolveReport::default();
        let execution = self.config.execution;

        for iteration in 0..self.config.iterations {
            if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
                report.cancelled = true;
                break;
            }

            self.store.begin_iteration();
            let store = &self.store;
            for c in constraints.iter_mut() {
                c.refresh(store, iteration)?;
            }
            execution.try_for_each_mut(constraints, |c| c.calculate(store))?;

            for c in constraints.iter() {
                c.apply(&mut self.store);
            }
            let max_step = self.store.end_iteration();

            report.iterations = iteration + 1;
            report.max_displacement = max_step;
            tracing::trace!(iteration, max_step, "iteration merged");

            if self.config.tolerance.is_some_and(|tol| max_step <= tol) {
                report.converged = true;
                break;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::distance::Distance;
    use glam::DVec3;

    #[test]
    fn test_state_transitions() {
        let store = ParticleStore::from_positions(vec![DVec3::ZERO, DVec3::X]).unwrap();
        let mut solver = Solver::new(store, SolverConfig::default().with_iterations(3));
        assert_eq!(solver.state(), SolverState::Idle);

        let mut constraints: Vec<Box<dyn Constraint>> =
            vec![Box::new(Distance::new(0, 1, 2.0, 1.0).unwrap())];
        let report = solver.run(&mut constraints).unwrap();
        assert_eq!(solver.state(), SolverState::Done);
        assert_eq!(report.iterations, 3);
        assert!(!report.cancelled && !report.converged);
    }

    #[test]
    fn test_zero_iterations_is_a_no_op() {
        let store = ParticleStore::from_positions(vec![DVec3::ZERO, DVec3::X]).unwrap();
        let mut solver = Solver::new(store, SolverConfig::default().with_iterations(0));
        let mut constraints: Vec<Box<dyn Constraint>> =
            vec![Box::new(Distance::new(0, 1, 5.0, 1.0).unwrap())];
        let report = solver.run(&mut constraints).unwrap();
        assert_eq!(report, SolveReport::default());
        assert_eq!(solver.store().position(1), DVec3::X);
    }

    #[test]
    fn test_tolerance_stops_early() {
        let store = ParticleStore::from_positions(vec![DVec3::ZERO, DVec3::X]).unwrap();
        let config = SolverConfig::default()
            .with_iterations(100)
            .with_tolerance(1e-12)
            .unwrap();
        let mut solver = Solver::new(store, config);
        // already satisfied: the first iteration moves nothing
        let mut constraints: Vec<Box<dyn Constraint>> =
            vec![Box::new(Distance::new(0, 1, 1.0, 1.0).unwrap())];
        let report = solver.run(&mut constraints).unwrap();
        assert!(report.converged);
        assert_eq!(report.iterations, 1);
    }
}
