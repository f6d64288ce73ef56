use glam::DVec3;

use super::{Constraint, Handle};
use crate::error::{check_radius, check_weight, RelaxError, RelaxResult};
use crate::exec::Execution;
use crate::grid::{bin_total, Domain, SpatialGrid};
use crate::particle::ParticleStore;

/// Upper bound per axis when bin counts are sized from the radius.
const AUTO_MAX_BINS: usize = 32;

const EPS: f64 = 1e-12;

/// What the handles of a [`Collide`] stand for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollideShape {
    /// Every handle is a sphere of diameter `radius`.
    Points,
    /// Consecutive handles form segments of a polyline, closed back to the
    /// first handle when `closed` is set. Segments sharing a handle never
    /// collide with each other.
    Polyline { closed: bool },
}

/// Keeps the particles (or polyline segments) of one constraint at least
/// `radius` apart.
///
/// Candidates come from a private [`SpatialGrid`] over the constraint's own
/// handles, rebuilt in `refresh`. Each overlapping pair is pushed apart along
/// its shortest connecting vector, split by inverse mass. A handle touched by
/// several contacts gets their average. Only handles that received a
/// correction are applied.
#[derive(Clone, Debug)]
pub struct Collide {
    shape: CollideShape,
    handles: Vec<Handle>,
    radius: f64,
    weight: f64,
    execution: Execution,
    /// Fixed bin counts, or `None` to size bins from the radius.
    bins: Option<[usize; 3]>,
    /// Rebuild the grid every `refresh_interval` iterations.
    refresh_interval: usize,
    grid: Option<SpatialGrid<usize>>,
    positions: Vec<DVec3>,
    counts: Vec<u32>,
    contacts: usize,
}

impl Collide {
    /// Particle-particle collision.
    pub fn points(radius: f64, weight: f64) -> RelaxResult<Self> {
        Self::with_shape(CollideShape::Points, radius, weight)
    }

    /// Segment-segment collision along a polyline.
    pub fn polyline(radius: f64, weight: f64, closed: bool) -> RelaxResult<Self> {
        Self::with_shape(CollideShape::Polyline { closed }, radius, weight)
    }

    /// Collision of the given shape with no handles yet.
    pub fn with_shape(shape: CollideShape, radius: f64, weight: f64) -> RelaxResult<Self> {
        Ok(Self {
            shape,
            handles: Vec::new(),
            radius: check_radius(radius)?,
            weight: check_weight(weight)?,
            execution: Execution::Sequential,
            bins: None,
            refresh_interval: 1,
            grid: None,
            positions: Vec::new(),
            counts: Vec::new(),
            contacts: 0,
        })
    }

    /// Append handles for `indices`, builder style.
    pub fn with_indices<I: IntoIterator<Item = usize>>(mut self, indices: I) -> Self {
        self.extend(indices);
        self
    }

    /// Fixed grid resolution instead of radius-sized bins.
    pub fn with_bin_counts(mut self, nx: usize, ny: usize, nz: usize) -> RelaxResult<Self> {
        bin_total(nx, ny, nz)?;
        self.bins = Some([nx, ny, nz]);
        Ok(self)
    }

    /// Rebuild the grid only every `interval` iterations.
    ///
    /// Between rebuilds the grid holds stale positions, so contacts between
    /// particles that moved far enough can be missed.
    pub fn with_refresh_interval(mut self, interval: usize) -> RelaxResult<Self> {
        if interval == 0 {
            return Err(RelaxError::InvalidRefreshInterval);
        }
        self.refresh_interval = interval;
        Ok(self)
    }

    /// Schedule the neighbor search sequentially or across threads.
    pub fn with_execution(mut self, execution: Execution) -> Self {
        self.execution = execution;
        self
    }

    /// Append one handle. Forces a grid rebuild.
    pub fn push(&mut self, index: usize) {
        self.handles.push(Handle::new(index));
        self.grid = None;
    }

    /// Append handles for `indices`. Forces a grid rebuild.
    pub fn extend<I: IntoIterator<Item = usize>>(&mut self, indices: I) {
        self.handles.extend(indices.into_iter().map(Handle::new));
        self.grid = None;
    }

    /// Replace every handle with `indices`.
    pub fn set_handles<I: IntoIterator<Item = usize>>(&mut self, indices: I) {
        self.handles.clear();
        self.extend(indices);
    }

    /// Points or polyline.
    pub fn shape(&self) -> CollideShape {
        self.shape
    }

    /// Minimum separation kept between points or segments.
    pub fn radius(&self) -> f64 {
        self.radius
    }

    /// Change the separation. Rejects negative or non-finite values.
    pub fn set_radius(&mut self, radius: f64) -> RelaxResult<()> {
        self.radius = check_radius(radius)?;
        self.grid = None;
        Ok(())
    }

    /// Rejects negative or non-finite weights.
    pub fn set_weight(&mut self, weight: f64) -> RelaxResult<()> {
        self.weight = check_weight(weight)?;
        Ok(())
    }

    /// Overlapping pairs found by the last `calculate`.
    pub fn contact_count(&self) -> usize {
        self.contacts
    }

    /// The broad phase built by the last refresh, if any.
    pub fn grid(&self) -> Option<&SpatialGrid<usize>> {
        self.grid.as_ref()
    }

    fn segment_count(&self) -> usize {
        let n = self.handles.len();
        match self.shape {
            CollideShape::Points => 0,
            CollideShape::Polyline { closed: true } if n >= 3 => n,
            CollideShape::Polyline { .. } => n.saturating_sub(1),
        }
    }

    /// Endpoint handle slots of segment `s`.
    #[inline]
    fn segment(&self, s: usize) -> (usize, usize) {
        (s, (s + 1) % self.handles.len())
    }

    /// Copy handle positions into scratch. False if any particle is missing.
    fn gather(&mut self, store: &ParticleStore) -> bool {
        self.positions.clear();
        for h in &self.handles {
            match store.get(h.index()) {
                Some(p) => self.positions.push(p),
                None => return false,
            }
        }
        true
    }

    fn rebuild(&mut self) -> RelaxResult<()> {
        let Some(bounds) = Domain::from_points(self.positions.iter().copied()) else {
            self.grid = None;
            return Ok(());
        };
        let domain = bounds.expanded(self.radius);
        let [nx, ny, nz] = self.bins.unwrap_or_else(|| auto_bins(domain, self.radius));
        let segments = self.segment_count();

        let mut grid = match self.grid.take() {
            Some(mut grid) => {
                grid.configure(domain, nx, ny, nz)?;
                grid
            }
            None => SpatialGrid::new(domain, nx, ny, nz)?,
        };

        match self.shape {
            CollideShape::Points => {
                for (slot, &p) in self.positions.iter().enumerate() {
                    grid.insert(p, slot);
                }
            }
            CollideShape::Polyline { .. } => {
                let n = self.positions.len();
                for s in 0..segments {
                    let a = self.positions[s];
                    let b = self.positions[(s + 1) % n];
                    grid.insert_box(a.min(b), a.max(b), s);
                }
            }
        }
        self.grid = Some(grid);
        Ok(())
    }

    /// Overlap candidates `(a, b)` with `a < b`, from the grid.
    fn candidates(&self) -> Vec<(usize, usize)> {
        let Some(grid) = self.grid.as_ref() else {
            return Vec::new();
        };
        let radius = self.radius;
        let positions = &self.positions;
        let handles = &self.handles;

        let per_item: Vec<Vec<usize>> = match self.shape {
            CollideShape::Points => self.execution.map_indices(positions.len(), |a| {
                let mut found = Vec::new();
                grid.query_sphere(positions[a], radius, |b| {
                    if b > a && handles[a].index() != handles[b].index() {
                        found.push(b);
                    }
                });
                found
            }),
            CollideShape::Polyline { .. } => {
                let n = positions.len();
                self.execution.map_indices(self.segment_count(), |a| {
                    let (a0, a1) = (positions[a], positions[(a + 1) % n]);
                    let pad = DVec3::splat(radius);
                    let mut found = Vec::new();
                    grid.query_box(a0.min(a1) - pad, a0.max(a1) + pad, |b| {
                        if b > a && !self.segments_touch(a, b) {
                            found.push(b);
                        }
                    });
                    // segments spanning several bins are reported once per bin
                    found.sort_unstable();
                    found.dedup();
                    found
                })
            }
        };

        per_item
            .into_iter()
            .enumerate()
            .flat_map(|(a, found)| found.into_iter().map(move |b| (a, b)))
            .collect()
    }

    /// True when two segments share an endpoint particle.
    fn segments_touch(&self, a: usize, b: usize) -> bool {
        let (a0, a1) = self.segment(a);
        let (b0, b1) = self.segment(b);
        let ends = [self.handles[a0].index(), self.handles[a1].index()];
        ends.contains(&self.handles[b0].index()) || ends.contains(&self.handles[b1].index())
    }

    /// Resolve one contact between up to four handle slots with the given
    /// gradient weights. `normal` points from the first `split` slots to the
    /// rest.
    fn push_apart(
        &mut self,
        store: &ParticleStore,
        slots: &[(usize, f64)],
        split: usize,
        normal: DVec3,
        depth: f64,
    ) {
        let mut inverse_mass = [0.0; 4];
        for (w, &(slot, _)) in inverse_mass.iter_mut().zip(slots) {
            *w = store.inverse_mass(self.handles[slot].index());
        }
        let denom: f64 = slots
            .iter()
            .zip(&inverse_mass)
            .map(|(&(_, g), &w)| w * g * g)
            .sum();
        if denom < EPS {
            return;
        }
        let lambda = depth / denom;
        for (k, (&(slot, g), &w)) in slots.iter().zip(&inverse_mass).enumerate() {
            let sign = if k < split { -1.0 } else { 1.0 };
            let delta = normal * (sign * lambda * w * g);
            let h = &mut self.handles[slot];
            h.set_delta(h.delta() + delta);
            self.counts[slot] += 1;
        }
    }
}

impl Constraint for Collide {
    fn refresh(&mut self, store: &ParticleStore, iteration: usize) -> RelaxResult<()> {
        if self.grid.is_some() && iteration % self.refresh_interval != 0 {
            return Ok(());
        }
        if self.radius <= 0.0 || !self.gather(store) {
            self.grid = None;
            return Ok(());
        }
        self.rebuild()
    }

    fn calculate(&mut self, store: &ParticleStore) -> RelaxResult<()> {
        for h in &mut self.handles {
            h.set_delta(DVec3::ZERO);
            h.set_active(false);
        }
        self.counts.clear();
        self.counts.resize(self.handles.len(), 0);
        self.contacts = 0;

        if self.radius <= 0.0 || self.handles.len() < 2 || !self.gather(store) {
            return Ok(());
        }
        if self.grid.is_none() {
            self.rebuild()?;
        }

        for (a, b) in self.candidates() {
            match self.shape {
                CollideShape::Points => {
                    let diff = self.positions[b] - self.positions[a];
                    let dist = diff.length();
                    if dist >= self.radius {
                        continue;
                    }
                    let normal = if dist > EPS { diff / dist } else { DVec3::X };
                    self.push_apart(store, &[(a, 1.0), (b, 1.0)], 1, normal, self.radius - dist);
                    self.contacts += 1;
                }
                CollideShape::Polyline { .. } => {
                    let (a0, a1) = self.segment(a);
                    let (b0, b1) = self.segment(b);
                    let (p0, p1) = (self.positions[a0], self.positions[a1]);
                    let (q0, q1) = (self.positions[b0], self.positions[b1]);
                    let (s, t) = closest_segment_params(p0, p1, q0, q1);
                    let diff = q0.lerp(q1, t) - p0.lerp(p1, s);
                    let dist = diff.length();
                    if dist >= self.radius {
                        continue;
                    }
                    let normal = if dist > EPS {
                        diff / dist
                    } else {
                        (p1 - p0).cross(q1 - q0).try_normalize().unwrap_or(DVec3::X)
                    };
                    let slots = [(a0, 1.0 - s), (a1, s), (b0, 1.0 - t), (b1, t)];
                    self.push_apart(store, &slots, 2, normal, self.radius - dist);
                    self.contacts += 1;
                }
            }
        }

        for (h, &count) in self.handles.iter_mut().zip(&self.counts) {
            if count > 0 {
                let delta = h.delta() / count as f64;
                h.set_delta(delta);
                h.set_active(delta != DVec3::ZERO);
            }
        }
        Ok(())
    }

    fn handles(&self) -> &[Handle] {
        &self.handles
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}

/// Bins about one collision diameter wide, capped per axis.
fn auto_bins(domain: Domain, radius: f64) -> [usize; 3] {
    let span = domain.span();
    let mut out = [1usize; 3];
    for (axis, n) in out.iter_mut().enumerate() {
        let cells = (span[axis] / radius).ceil();
        *n = if cells.is_finite() && cells >= 1.0 {
            (cells as usize).min(AUTO_MAX_BINS)
        } else {
            1
        };
    }
    out
}

/// Parameters `(s, t)` of the closest points `p0 + s (p1 - p0)` and
/// `q0 + t (q1 - q0)` between two segments, both clamped to `[0, 1]`.
///
/// Reference: Ericson, "Real-Time Collision Detection", 5.1.9.
pub fn closest_segment_params(p0: DVec3, p1: DVec3, q0: DVec3, q1: DVec3) -> (f64, f64) {
    let d1 = p1 - p0;
    let d2 = q1 - q0;
    let r = p0 - q0;
    let a = d1.length_squared();
    let e = d2.length_squared();
    let f = d2.dot(r);

    if a <= EPS && e <= EPS {
        return (0.0, 0.0);
    }
    if a <= EPS {
        return (0.0, (f / e).clamp(0.0, 1.0));
    }

    let c = d1.dot(r);
    if e <= EPS {
        return ((-c / a).clamp(0.0, 1.0), 0.0);
    }

    let b = d1.dot(d2);
    let denom = a * e - b * b;
    // parallel segments: any s works, start from 0
    let mut s = if denom > EPS {
        ((b * f - c * e) / denom).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let mut t = (b * s + f) / e;
    if t < 0.0 {
        t = 0.0;
        s = (-c / a).clamp(0.0, 1.0);
    } else if t > 1.0 {
        t = 1.0;
        s = ((b - c) / a).clamp(0.0, 1.0);
    }
    (s, t)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(points: Vec<DVec3>) -> ParticleStore {
        ParticleStore::from_positions(points).unwrap()
    }

    #[test]
    fn test_closest_params_crossing() {
        let (s, t) = closest_segment_params(
            DVec3::new(-1.0, 0.0, 0.0),
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, -1.0, 1.0),
            DVec3::new(0.0, 1.0, 1.0),
        );
        assert!((s - 0.5).abs() < 1e-12 && (t - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_closest_params_clamped() {
        let (s, t) = closest_segment_params(
            DVec3::ZERO,
            DVec3::X,
            DVec3::new(2.0, 1.0, 0.0),
            DVec3::new(3.0, 1.0, 0.0),
        );
        assert_eq!((s, t), (1.0, 0.0));
    }

    #[test]
    fn test_closest_params_parallel() {
        let (s, t) = closest_segment_params(
            DVec3::ZERO,
            DVec3::X,
            DVec3::new(0.0, 1.0, 0.0),
            DVec3::new(1.0, 1.0, 0.0),
        );
        let gap = DVec3::ZERO.lerp(DVec3::X, s).distance(DVec3::Y.lerp(DVec3::new(1.0, 1.0, 0.0), t));
        assert!((gap - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_points_separated_by_radius_are_inactive() {
        let s = store(vec![DVec3::ZERO, DVec3::new(0.5, 0.0, 0.0)]);
        let mut c = Collide::points(0.5, 1.0).unwrap().with_indices([0, 1]);
        c.calculate(&s).unwrap();
        assert_eq!(c.contact_count(), 0);
        assert!(c.handles().iter().all(|h| !h.is_active() && h.delta() == DVec3::ZERO));
    }

    #[test]
    fn test_overlapping_points_push_apart() {
        let s = store(vec![DVec3::ZERO, DVec3::new(0.2, 0.0, 0.0), DVec3::new(5.0, 0.0, 0.0)]);
        let mut c = Collide::points(0.5, 1.0).unwrap().with_indices([0, 1, 2]);
        c.calculate(&s).unwrap();

        assert_eq!(c.contact_count(), 1);
        let h = c.handles();
        assert!((h[0].delta() - DVec3::new(-0.15, 0.0, 0.0)).length() < 1e-12);
        assert!((h[1].delta() - DVec3::new(0.15, 0.0, 0.0)).length() < 1e-12);
        assert!(h[0].is_active() && h[1].is_active());
        assert!(!h[2].is_active());
    }

    #[test]
    fn test_coincident_points_split_by_inverse_mass() {
        let s = ParticleStore::new(vec![DVec3::ONE, DVec3::ONE], vec![1.0, 3.0]).unwrap();
        let mut c = Collide::points(1.0, 1.0).unwrap().with_indices([0, 1]);
        c.calculate(&s).unwrap();

        let d0 = c.handles()[0].delta();
        let d1 = c.handles()[1].delta();
        assert!(d0.dot(d1) < 0.0, "opposite directions");
        assert!(((d1 - d0).length() - 1.0).abs() < 1e-12);
        // mass-weighted center stays put: m0 d0 + m1 d1 = 0
        assert!((d0 * 1.0 + d1 / 3.0).length() < 1e-12);
    }

    #[test]
    fn test_pinned_pair_is_left_alone() {
        let s = ParticleStore::new(vec![DVec3::ZERO, DVec3::ZERO], vec![0.0, 0.0]).unwrap();
        let mut c = Collide::points(1.0, 1.0).unwrap().with_indices([0, 1]);
        c.calculate(&s).unwrap();
        assert!(c.handles().iter().all(|h| !h.is_active()));
    }

    #[test]
    fn test_many_contacts_are_averaged() {
        // middle particle is squeezed symmetrically, so its average is zero
        let s = store(vec![
            DVec3::new(-0.3, 0.0, 0.0),
            DVec3::ZERO,
            DVec3::new(0.3, 0.0, 0.0),
        ]);
        let mut c = Collide::points(0.4, 1.0).unwrap().with_indices([0, 1, 2]);
        c.calculate(&s).unwrap();
        assert_eq!(c.contact_count(), 2);
        assert!(c.handles()[1].delta().length() < 1e-12);
        assert!(!c.handles()[1].is_active());
        assert!(c.handles()[0].delta().x < 0.0);
        assert!(c.handles()[2].delta().x > 0.0);
    }

    #[test]
    fn test_crossing_segments_separate_to_radius() {
        let mut s = store(vec![
            DVec3::new(-1.0, 0.0, 0.0),
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, -1.0, 0.1),
            DVec3::new(0.0, 1.0, 0.1),
        ]);
        // 1-2 is the bridge between the two crossing segments
        let mut c = Collide::polyline(0.5, 1.0, false).unwrap().with_indices([0, 1, 2, 3]);
        c.refresh(&s, 0).unwrap();
        c.calculate(&s).unwrap();
        assert_eq!(c.contact_count(), 1);

        s.begin_iteration();
        c.apply(&mut s);
        s.end_iteration();

        let (p0, p1, q0, q1) = (s.position(0), s.position(1), s.position(2), s.position(3));
        let (u, v) = closest_segment_params(p0, p1, q0, q1);
        let gap = p0.lerp(p1, u).distance(q0.lerp(q1, v));
        assert!((gap - 0.5).abs() < 1e-9, "gap {gap}");
    }

    #[test]
    fn test_adjacent_segments_do_not_collide() {
        let s = store(vec![DVec3::ZERO, DVec3::X, DVec3::new(1.0, 0.1, 0.0)]);
        let mut c = Collide::polyline(0.5, 1.0, true).unwrap().with_indices([0, 1, 2]);
        c.calculate(&s).unwrap();
        assert_eq!(c.contact_count(), 0);
    }

    #[test]
    fn test_zero_radius_never_collides() {
        let s = store(vec![DVec3::ZERO, DVec3::ZERO]);
        let mut c = Collide::points(0.0, 1.0).unwrap().with_indices([0, 1]);
        c.refresh(&s, 0).unwrap();
        c.calculate(&s).unwrap();
        assert_eq!(c.contact_count(), 0);
        assert!(c.grid().is_none());
    }

    #[test]
    fn test_refresh_interval_keeps_grid_between_rebuilds() {
        let s = store(vec![DVec3::ZERO, DVec3::new(0.1, 0.0, 0.0)]);
        let mut c = Collide::points(0.5, 1.0)
            .unwrap()
            .with_indices([0, 1])
            .with_refresh_interval(3)
            .unwrap();
        c.refresh(&s, 0).unwrap();
        let built = c.grid().unwrap().domain();

        let moved = store(vec![DVec3::splat(10.0), DVec3::splat(10.1)]);
        c.refresh(&moved, 1).unwrap();
        assert_eq!(c.grid().unwrap().domain(), built);
        c.refresh(&moved, 3).unwrap();
        assert_ne!(c.grid().unwrap().domain(), built);
    }

    #[test]
    fn test_fixed_bins_and_validation() {
        let c = Collide::points(0.5, 1.0).unwrap().with_bin_counts(4, 4, 1).unwrap();
        let s = store(vec![DVec3::ZERO, DVec3::new(3.0, 3.0, 0.0)]);
        let mut c = c.with_indices([0, 1]);
        c.refresh(&s, 0).unwrap();
        assert_eq!(c.grid().unwrap().bin_counts(), [4, 4, 1]);

        assert!(Collide::points(-1.0, 1.0).is_err());
        assert!(Collide::points(1.0, -1.0).is_err());
        assert!(Collide::points(1.0, 1.0).unwrap().with_bin_counts(0, 1, 1).is_err());
        assert_eq!(
            Collide::points(1.0, 1.0)
                .unwrap()
                .with_bin_counts(1 << 40, 1 << 40, 1)
                .unwrap_err(),
            RelaxError::InvalidBinCount { nx: 1 << 40, ny: 1 << 40, nz: 1 }
        );
        assert_eq!(
            Collide::points(1.0, 1.0).unwrap().with_refresh_interval(0).unwrap_err(),
            RelaxError::InvalidRefreshInterval
        );
    }

    // only meaningful with `--features parallel`
    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_search_matches_sequential() {
        let points: Vec<DVec3> = (0..200)
            .map(|i| {
                let t = i as f64 * 0.37;
                DVec3::new(t.sin() * 2.0, t.cos() * 2.0, (i % 7) as f64 * 0.1)
            })
            .collect();
        let s = store(points);

        let mut seq = Collide::points(0.3, 1.0).unwrap().with_indices(0..200);
        let mut par = seq.clone().with_execution(Execution::Parallel);
        seq.calculate(&s).unwrap();
        par.calculate(&s).unwrap();

        assert_eq!(seq.contact_count(), par.contact_count());
        for (a, b) in seq.handles().iter().zip(par.handles()) {
            assert_eq!(a, b);
        }
    }
}
