use glam::{DMat4, DVec3, DVec4};

use super::{zero_deltas, Constraint, Handle};
use crate::error::{check_weight, RelaxResult};
use crate::particle::ParticleStore;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sphere {
    pub center: DVec3,
    pub radius: f64,
}

/// Pulls a runtime-sized set of particles onto a common sphere.
///
/// Each iteration fits a sphere through the current positions and moves every
/// particle radially onto its surface. Fewer than four particles, or a
/// coplanar/collinear set, has no unique sphere and produces no correction.
#[derive(Clone, Debug)]
pub struct Cospherical {
    handles: Vec<Handle>,
    weight: f64,
    /// Positions gathered for the fit, reused across iterations.
    scratch: Vec<DVec3>,
    last_fit: Option<Sphere>,
}

impl Cospherical {
    /// Empty constraint with room for four handles.
    pub fn new(weight: f64) -> RelaxResult<Self> {
        Self::with_capacity(4, weight)
    }

    /// Empty constraint with room for `capacity` handles.
    pub fn with_capacity(capacity: usize, weight: f64) -> RelaxResult<Self> {
        Ok(Self {
            handles: Vec::with_capacity(capacity),
            weight: check_weight(weight)?,
            scratch: Vec::with_capacity(capacity),
            last_fit: None,
        })
    }

    /// One handle per index, in order.
    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I, weight: f64) -> RelaxResult<Self> {
        let mut c = Self::new(weight)?;
        c.extend(indices);
        Ok(c)
    }

    /// Append one handle.
    pub fn push(&mut self, index: usize) {
        self.handles.push(Handle::new(index));
    }

    /// Append handles for `indices`.
    pub fn extend<I: IntoIterator<Item = usize>>(&mut self, indices: I) {
        self.handles.extend(indices.into_iter().map(Handle::new));
    }

    /// Replace the referenced particles.
    pub fn set_handles<I: IntoIterator<Item = usize>>(&mut self, indices: I) {
        self.handles.clear();
        self.extend(indices);
    }

    /// Number of handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when no handles are set.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Rejects negative or non-finite weights.
    pub fn set_weight(&mut self, weight: f64) -> RelaxResult<()> {
        self.weight = check_weight(weight)?;
        Ok(())
    }

    /// Sphere found by the most recent `calculate`, if any.
    pub fn last_fit(&self) -> Option<Sphere> {
        self.last_fit
    }
}

impl Constraint for Cospherical {
    fn calculate(&mut self, store: &ParticleStore) -> RelaxResult<()> {
        zero_deltas(&mut self.handles);
        self.last_fit = None;

        self.scratch.clear();
        for h in &self.handles {
            match store.get(h.index()) {
                Some(p) => self.scratch.push(p),
                None => return Ok(()),
            }
        }

        let Some(sphere) = fit_sphere(&self.scratch) else {
            return Ok(());
        };
        self.last_fit = Some(sphere);

        for (h, &p) in self.handles.iter_mut().zip(&self.scratch) {
            let radial = p - sphere.center;
            let len = radial.length();
            if len > 1e-12 {
                h.set_delta(radial * (sphere.radius / len - 1.0));
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

/// Algebraic least-squares sphere fit.
///
/// Solves `|p|² = 2 c·p + d` for the center `c` and `d = r² - |c|²` through
/// the 4x4 normal equations. Points are centered on their centroid and
/// scaled to unit RMS spread first so the system stays well conditioned.
///
/// Returns `None` for fewer than four points or a singular configuration.
pub fn fit_sphere(points: &[DVec3]) -> Option<Sphere> {
    let n = points.len();
    if n < 4 {
        return None;
    }

    let centroid = points.iter().copied().sum::<DVec3>() / n as f64;
    let spread =
        (points.iter().map(|p| p.distance_squared(centroid)).sum::<f64>() / n as f64).sqrt();
    if spread < 1e-12 {
        return None;
    }
    let scale = 1.0 / spread;

    let mut normal = DMat4::ZERO;
    let mut rhs = DVec4::ZERO;
    for &p in points {
        let q = (p - centroid) * scale;
        let row = DVec4::new(2.0 * q.x, 2.0 * q.y, 2.0 * q.z, 1.0);
        normal += mat4_outer(row, row);
        rhs += row * q.length_squared();
    }

    // Entries grow with n; compare against n^4 to stay scale free.
    let det = normal.determinant();
    if !det.is_finite() || det.abs() < 1e-10 * (n as f64).powi(4) {
        return None;
    }
    let u = normal.inverse() * rhs;

    let center = u.truncate();
    let r_sq = u.w + center.length_squared();
    if !(r_sq > 0.0) || !center.is_finite() {
        return None;
    }

    Some(Sphere {
        center: centroid + center * spread,
        radius: r_sq.sqrt() * spread,
    })
}

/// Outer product `a * b^T`.
fn mat4_outer(a: DVec4, b: DVec4) -> DMat4 {
    DMat4::from_cols(a * b.x, a * b.y, a * b.z, a * b.w)
}
