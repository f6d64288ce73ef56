use glam::DVec3;

use super::{zero_deltas, Constraint, Handle};
use crate::error::{check_weight, RelaxError, RelaxResult};
use crate::particle::ParticleStore;

/// Holds two particles at a target distance.
///
/// The length error is split between the two ends by inverse mass, so a
/// pinned end leaves the whole correction to the other one.
#[derive(Clone, Debug)]
pub struct Distance {
    handles: [Handle; 2],
    target_length: f64,
    weight: f64,
}

impl Distance {
    /// Hold particles `i` and `j` at `target_length`.
    pub fn new(i: usize, j: usize, target_length: f64, weight: f64) -> RelaxResult<Self> {
        Ok(Self {
            handles: [Handle::new(i), Handle::new(j)],
            target_length: check_length(target_length)?,
            weight: check_weight(weight)?,
        })
    }

    /// Target length taken from the current positions.
    pub fn from_rest(i: usize, j: usize, store: &ParticleStore, weight: f64) -> RelaxResult<Self> {
        let count = store.len();
        let (Some(pi), Some(pj)) = (store.get(i), store.get(j)) else {
            return Err(RelaxError::IndexOutOfBounds { index: i.max(j), count });
        };
        Self::new(i, j, pi.distance(pj), weight)
    }

    /// Length the pair is pulled toward.
    pub fn target_length(&self) -> f64 {
        self.target_length
    }

    /// Rejects negative or non-finite lengths.
    pub fn set_target_length(&mut self, length: f64) -> RelaxResult<()> {
        self.target_length = check_length(length)?;
        Ok(())
    }

    /// Rejects negative or non-finite weights.
    pub fn set_weight(&mut self, weight: f64) -> RelaxResult<()> {
        self.weight = check_weight(weight)?;
        Ok(())
    }
}

impl Constraint for Distance {
    fn calculate(&mut self, store: &ParticleStore) -> RelaxResult<()> {
        zero_deltas(&mut self.handles);
        let (i, j) = (self.handles[0].index(), self.handles[1].index());
        let (Some(p_i), Some(p_j)) = (store.get(i), store.get(j)) else {
            return Ok(());
        };

        let w_i = store.inverse_mass(i);
        let w_j = store.inverse_mass(j);
        let w_sum = w_i + w_j;
        if w_sum < 1e-12 {
            return Ok(());
        }

        let diff = p_j - p_i;
        let dist = diff.length();
        if dist < 1e-12 {
            return Ok(());
        }

        // positive when stretched
        let error = dist - self.target_length;
        let correction: DVec3 = diff * (error / (dist * w_sum));

        self.handles[0].set_delta(correction * w_i);
        self.handles[1].set_delta(-correction * w_j);
        Ok(())
    }

    fn handles(&self) -> &[Handle] {
        &self.handles
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}

fn check_length(length: f64) -> RelaxResult<f64> {
    if length.is_finite() && length >= 0.0 {
        Ok(length)
    } else {
        Err(RelaxError::InvalidLength(length))
    }
}
