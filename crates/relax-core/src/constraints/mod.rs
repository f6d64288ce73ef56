pub mod collide;
pub mod cospherical;
pub mod dihedral;
pub mod distance;

use glam::DVec3;

use crate::error::{RelaxError, RelaxResult};
use crate::particle::ParticleStore;

/// A constraint's reference to one particle plus its scratch correction.
///
/// Owned by exactly one constraint. The delta is rewritten by every
/// `calculate` and must not be read before the first one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Handle {
    index: usize,
    delta: DVec3,
    /// Inactive handles are skipped by `apply`.
    active: bool,
}

impl Handle {
    /// Active handle on particle `index` with a zero delta.
    pub fn new(index: usize) -> Self {
        Self {
            index,
            delta: DVec3::ZERO,
            active: true,
        }
    }

    /// Particle this handle refers to.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn set_index(&mut self, index: usize) {
        self.index = index;
    }

    /// Correction from the last `calculate`.
    #[inline]
    pub fn delta(&self) -> DVec3 {
        self.delta
    }

    #[inline]
    pub fn set_delta(&mut self, delta: DVec3) {
        self.delta = delta;
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
}

impl From<usize> for Handle {
    fn from(index: usize) -> Self {
        Self::new(index)
    }
}

/// Unit of work in the two-phase solve.
///
/// `calculate` reads positions and writes only this constraint's own
/// handles, so many constraints can run it at once. `apply` pushes the
/// weighted deltas into the store and runs serially.
pub trait Constraint: Send + Sync {
    /// Compute a delta for every handle from the current positions.
    ///
    /// Degenerate geometry yields zero deltas, never an error.
    fn calculate(&mut self, store: &ParticleStore) -> RelaxResult<()>;

    fn handles(&self) -> &[Handle];

    fn weight(&self) -> f64;

    /// Vote every active handle's delta into the store with this
    /// constraint's weight.
    fn apply(&self, store: &mut ParticleStore) {
        let weight = self.weight();
        for h in self.handles().iter().filter(|h| h.is_active()) {
            store.accumulate(h.index(), h.delta(), weight);
        }
    }

    /// Called once per iteration before `calculate`. Collision constraints
    /// rebuild their broad phase here.
    fn refresh(&mut self, _store: &ParticleStore, _iteration: usize) -> RelaxResult<()> {
        Ok(())
    }

    /// Check that every handle refers to an existing particle.
    fn validate(&self, particle_count: usize) -> RelaxResult<()> {
        match self.handles().iter().find(|h| h.index() >= particle_count) {
            Some(h) => Err(RelaxError::IndexOutOfBounds {
                index: h.index(),
                count: particle_count,
            }),
            None => Ok(()),
        }
    }
}

/// Reset every handle to a zero, active delta.
pub(crate) fn zero_deltas(handles: &mut [Handle]) {
    for h in handles {
        h.delta = DVec3::ZERO;
        h.active = true;
    }
}
