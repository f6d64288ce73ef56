use glam::DVec3;

use crate::error::{RelaxError, RelaxResult};

/// SoA particle storage.
///
/// Positions change only in [`end_iteration`](Self::end_iteration), which
/// merges every vote accumulated since [`begin_iteration`](Self::begin_iteration)
/// as a weighted mean.
#[derive(Clone, Debug)]
pub struct ParticleStore {
    position: Vec<DVec3>,
    /// 0.0 pins a particle in place.
    inverse_mass: Vec<f64>,
    /// Sum of weight * delta over this iteration's contributions.
    delta_sum: Vec<DVec3>,
    /// Sum of weights over this iteration's contributions.
    weight_sum: Vec<f64>,
}

impl ParticleStore {
    /// Particles with explicit inverse masses, one per position.
    pub fn new(positions: Vec<DVec3>, inverse_masses: Vec<f64>) -> RelaxResult<Self> {
        if positions.len() != inverse_masses.len() {
            return Err(RelaxError::LengthMismatch {
                expected: positions.len(),
                actual: inverse_masses.len(),
            });
        }
        if let Some(index) = positions.iter().position(|p| !p.is_finite()) {
            return Err(RelaxError::NonFinitePosition(index));
        }
        for (index, &value) in inverse_masses.iter().enumerate() {
            check_inverse_mass(index, value)?;
        }

        let count = positions.len();
        Ok(Self {
            position: positions,
            inverse_mass: inverse_masses,
            delta_sum: vec![DVec3::ZERO; count],
            weight_sum: vec![0.0; count],
        })
    }

    /// Every particle gets inverse mass 1.0.
    pub fn from_positions(positions: Vec<DVec3>) -> RelaxResult<Self> {
        let count = positions.len();
        Self::new(positions, vec![1.0; count])
    }

    /// Build from an interleaved `x0 y0 z0 x1 y1 z1 ...` buffer.
    pub fn from_flat(coords: &[f64], inverse_masses: Option<&[f64]>) -> RelaxResult<Self> {
        let positions: &[DVec3] =
            bytemuck::try_cast_slice(coords).map_err(|_| RelaxError::LengthMismatch {
                expected: coords.len() - coords.len() % 3,
                actual: coords.len(),
            })?;
        let inverse_masses = match inverse_masses {
            Some(w) => w.to_vec(),
            None => vec![1.0; positions.len()],
        };
        Self::new(positions.to_vec(), inverse_masses)
    }

    /// Number of particles.
    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    /// Position of particle `i`. Panics when out of range.
    #[inline]
    pub fn position(&self, i: usize) -> DVec3 {
        self.position[i]
    }

    /// Position of particle `i`, or `None` when out of range.
    #[inline]
    pub fn get(&self, i: usize) -> Option<DVec3> {
        self.position.get(i).copied()
    }

    /// Inverse mass of particle `i`. Panics when out of range.
    #[inline]
    pub fn inverse_mass(&self, i: usize) -> f64 {
        self.inverse_mass[i]
    }

    /// All positions in particle order.
    pub fn positions(&self) -> &[DVec3] {
        &self.position
    }

    /// Positions as an interleaved `x y z` buffer, in particle order.
    pub fn positions_flat(&self) -> &[f64] {
        bytemuck::cast_slice(&self.position)
    }

    pub fn inverse_masses(&self) -> &[f64] {
        &self.inverse_mass
    }

    /// Pin (0.0) or release a particle.
    pub fn set_inverse_mass(&mut self, i: usize, value: f64) -> RelaxResult<()> {
        if i >= self.len() {
            return Err(RelaxError::IndexOutOfBounds {
                index: i,
                count: self.len(),
            });
        }
        self.inverse_mass[i] = check_inverse_mass(i, value)?;
        Ok(())
    }

    /// Zero the accumulators.
    pub fn begin_iteration(&mut self) {
        self.delta_sum.fill(DVec3::ZERO);
        self.weight_sum.fill(0.0);
    }

    /// Add one weighted vote for particle `i`. Out of range indices are ignored.
    #[inline]
    pub fn accumulate(&mut self, i: usize, delta: DVec3, weight: f64) {
        let (Some(sum), Some(w)) = (self.delta_sum.get_mut(i), self.weight_sum.get_mut(i)) else {
            tracing::trace!(index = i, "ignoring contribution to missing particle");
            return;
        };
        *sum += delta * weight;
        *w += weight;
    }

    /// Move every particle to the weighted mean of its votes and reset the
    /// accumulators.
    ///
    /// Pinned particles and particles without votes keep their position. A
    /// merge that would leave a non-finite position is dropped.
    ///
    /// Returns the largest displacement applied.
    pub fn end_iteration(&mut self) -> f64 {
        let mut max_step = 0.0_f64;

        for i in 0..self.position.len() {
            let w = self.weight_sum[i];
            if w > 0.0 && self.inverse_mass[i] > 0.0 {
                let step = self.delta_sum[i] / w;
                let next = self.position[i] + step;
                if next.is_finite() {
                    self.position[i] = next;
                    max_step = max_step.max(step.length());
                } else {
                    tracing::warn!(index = i, "dropping non-finite correction");
                }
            }
            self.delta_sum[i] = DVec3::ZERO;
            self.weight_sum[i] = 0.0;
        }

        max_step
    }
}

fn check_inverse_mass(index: usize, value: f64) -> RelaxResult<f64> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(RelaxError::InvalidInverseMass { index, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(n: usize) -> ParticleStore {
        ParticleStore::from_positions((0..n).map(|i| DVec3::splat(i as f64)).collect()).unwrap()
    }

    #[test]
    fn test_new_rejects_bad_input() {
        assert_eq!(
            ParticleStore::new(vec![DVec3::ZERO; 2], vec![1.0]).unwrap_err(),
            RelaxError::LengthMismatch { expected: 2, actual: 1 }
        );
        assert_eq!(
            ParticleStore::new(vec![DVec3::ZERO, DVec3::new(f64::NAN, 0.0, 0.0)], vec![1.0; 2])
                .unwrap_err(),
            RelaxError::NonFinitePosition(1)
        );
        assert_eq!(
            ParticleStore::new(vec![DVec3::ZERO; 2], vec![1.0, -0.5]).unwrap_err(),
            RelaxError::InvalidInverseMass { index: 1, value: -0.5 }
        );
    }

    #[test]
    fn test_merge_without_votes_is_noop() {
        let mut s = store(3);
        s.begin_iteration();
        s.accumulate(1, DVec3::X, 1.0);
        let moved = s.end_iteration();
        assert_eq!(s.position(0), DVec3::ZERO);
        assert_eq!(s.position(1), DVec3::new(2.0, 1.0, 1.0));
        assert_eq!(s.position(2), DVec3::splat(2.0));
        assert_eq!(moved, 1.0);
    }

    #[test]
    fn test_weighted_mean_merge() {
        let d1 = DVec3::new(1.0, 0.0, 0.0);
        let d2 = DVec3::new(0.0, 3.0, 0.0);
        let (w1, w2) = (1.0, 3.0);
        let expected = (d1 * w1 + d2 * w2) / (w1 + w2);

        let mut a = store(1);
        a.begin_iteration();
        a.accumulate(0, d1, w1);
        a.accumulate(0, d2, w2);
        a.end_iteration();

        let mut b = store(1);
        b.begin_iteration();
        b.accumulate(0, d2, w2);
        b.accumulate(0, d1, w1);
        b.end_iteration();

        assert!((a.position(0) - expected).length() < 1e-12);
        assert!((a.position(0) - b.position(0)).length() < 1e-12);
    }

    #[test]
    fn test_zero_weight_votes_do_not_move() {
        let mut s = store(1);
        s.begin_iteration();
        s.accumulate(0, DVec3::X, 0.0);
        s.end_iteration();
        assert_eq!(s.position(0), DVec3::ZERO);
    }

    #[test]
    fn test_pinned_particle_stays() {
        let mut s = store(2);
        s.set_inverse_mass(0, 0.0).unwrap();
        s.begin_iteration();
        s.accumulate(0, DVec3::ONE, 1.0);
        s.accumulate(1, DVec3::ONE, 1.0);
        s.end_iteration();
        assert_eq!(s.position(0), DVec3::ZERO);
        assert_eq!(s.position(1), DVec3::splat(2.0));
    }

    #[test]
    fn test_accumulators_reset_between_iterations() {
        let mut s = store(1);
        s.begin_iteration();
        s.accumulate(0, DVec3::X, 1.0);
        s.end_iteration();
        s.begin_iteration();
        assert_eq!(s.end_iteration(), 0.0);
        assert_eq!(s.position(0), DVec3::X);
    }

    #[test]
    fn test_accumulate_out_of_range_is_ignored() {
        let mut s = store(1);
        s.begin_iteration();
        s.accumulate(5, DVec3::X, 1.0);
        s.end_iteration();
        assert_eq!(s.position(0), DVec3::ZERO);
    }

    #[test]
    fn test_non_finite_merge_is_dropped() {
        let mut s = store(1);
        s.begin_iteration();
        s.accumulate(0, DVec3::new(f64::INFINITY, 0.0, 0.0), 1.0);
        s.end_iteration();
        assert_eq!(s.position(0), DVec3::ZERO);
    }

    #[test]
    fn test_flat_round_trip() {
        let coords = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let s = ParticleStore::from_flat(&coords, None).unwrap();
        assert_eq!(s.len(), 2);
        assert_eq!(s.position(1), DVec3::new(3.0, 4.0, 5.0));
        assert_eq!(s.positions_flat(), &coords);
        assert_eq!(s.inverse_masses(), &[1.0, 1.0]);

        let pinned = ParticleStore::from_flat(&coords, Some(&[0.0, 1.0][..])).unwrap();
        assert_eq!(pinned.inverse_mass(0), 0.0);
    }

    #[test]
    fn test_flat_rejects_partial_triple() {
        let err = ParticleStore::from_flat(&[0.0, 1.0, 2.0, 3.0], None).unwrap_err();
        assert_eq!(err, RelaxError::LengthMismatch { expected: 3, actual: 4 });
    }
}
