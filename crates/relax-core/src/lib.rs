//! Position-based relaxation of particle sets under weighted geometric
//! constraints.
//!
//! Build a [`ParticleStore`], box up constraints from [`constraints`] and hand
//! both to a [`Solver`]:
//!
//! ```
//! use relax_core::constraints::distance::Distance;
//! use relax_core::{Constraint, DVec3, ParticleStore, Solver, SolverConfig};
//!
//! let store = ParticleStore::from_positions(vec![DVec3::ZERO, DVec3::new(3.0, 0.0, 0.0)])?;
//! let mut constraints: Vec<Box<dyn Constraint>> = vec![Box::new(Distance::new(0, 1, 1.0, 1.0)?)];
//!
//! let mut solver = Solver::new(store, SolverConfig::default().with_iterations(10));
//! solver.run(&mut constraints)?;
//!
//! let store = solver.into_store();
//! assert!((store.position(0).distance(store.position(1)) - 1.0).abs() < 1e-9);
//! # Ok::<(), relax_core::RelaxError>(())
//! ```

pub mod config;
pub mod constraints;
pub mod error;
pub mod exec;
pub mod grid;
pub mod particle;
pub mod solver;

pub use config::SolverConfig;
pub use constraints::{Constraint, Handle};
pub use error::{RelaxError, RelaxResult};
pub use exec::Execution;
pub use glam::DVec3;
pub use grid::{Domain, SpatialGrid};
pub use particle::ParticleStore;
pub use solver::{SolveReport, Solver, SolverState};
