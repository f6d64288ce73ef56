use std::f64::consts::{PI, TAU};

use glam::DVec3;

use super::{zero_deltas, Constraint, Handle};
use crate::error::{check_weight, RelaxResult};
use crate::particle::ParticleStore;

const START: usize = 0;
const END: usize = 1;
const LEFT: usize = 2;
const RIGHT: usize = 3;

/// Smallest face height accepted, relative to the hinge edge length.
const DEGENERATE: f64 = 1e-12;

/// Dihedral angle constraint between two triangles sharing an edge.
///
/// ```text
///      left
///      /  \
///  start--end
///      \  /
///     right
/// ```
///
/// The angle is measured in `[0, 2π)` with a flat configuration at `π`.
/// Corrections are distributed over the four vertices by the cotangent
/// weights of the two faces, scaled by the inverse mean apex height.
///
/// The measurement wraps at 0 / 2π and the constraint is unstable for
/// targets at that boundary.
///
/// Reference: Tachi, "Freeform Rigid-Foldable Structure using Bidirectionally
/// Flat-Foldable Planar Quadrilateral Mesh", IASS 2013.
#[derive(Clone, Debug)]
pub struct Dihedral {
    handles: [Handle; 4],
    /// Always in `[0, 2π)`.
    target_angle: f64,
    weight: f64,
}

impl Dihedral {
    /// Hinge over edge `start -> end` with apexes `left` and `right`. The
    /// target angle is wrapped into `[0, 2π)`.
    pub fn new(
        start: usize,
        end: usize,
        left: usize,
        right: usize,
        target_angle: f64,
        weight: f64,
    ) -> RelaxResult<Self> {
        Ok(Self {
            handles: [
                Handle::new(start),
                Handle::new(end),
                Handle::new(left),
                Handle::new(right),
            ],
            target_angle: wrap_angle(target_angle),
            weight: check_weight(weight)?,
        })
    }

    /// First vertex of the shared edge.
    pub fn start(&self) -> &Handle {
        &self.handles[START]
    }

    /// Second vertex of the shared edge.
    pub fn end(&self) -> &Handle {
        &self.handles[END]
    }

    /// Apex of the left face.
    pub fn left(&self) -> &Handle {
        &self.handles[LEFT]
    }

    /// Apex of the right face.
    pub fn right(&self) -> &Handle {
        &self.handles[RIGHT]
    }

    /// Point the four handles at other particles.
    pub fn set_handles(&mut self, start: usize, end: usize, left: usize, right: usize) {
        self.handles[START].set_index(start);
        self.handles[END].set_index(end);
        self.handles[LEFT].set_index(left);
        self.handles[RIGHT].set_index(right);
    }

    /// Target in `[0, 2π)`.
    pub fn target_angle(&self) -> f64 {
        self.target_angle
    }

    /// Stored as `angle mod 2π`.
    pub fn set_target_angle(&mut self, angle: f64) {
        self.target_angle = wrap_angle(angle);
    }

    /// Rejects negative or non-finite weights.
    pub fn set_weight(&mut self, weight: f64) -> RelaxResult<()> {
        self.weight = check_weight(weight)?;
        Ok(())
    }

    /// Current angle of the referenced particles, `None` when degenerate or
    /// out of range.
    pub fn measure(&self, store: &ParticleStore) -> Option<f64> {
        let [p0, p1, p2, p3] = self.positions(store)?;
        dihedral_angle(p0, p1, p2, p3)
    }

    fn positions(&self, store: &ParticleStore) -> Option<[DVec3; 4]> {
        Some([
            store.get(self.handles[START].index())?,
            store.get(self.handles[END].index())?,
            store.get(self.handles[LEFT].index())?,
            store.get(self.handles[RIGHT].index())?,
        ])
    }
}

impl Constraint for Dihedral {
    fn calculate(&mut self, store: &ParticleStore) -> RelaxResult<()> {
        zero_deltas(&mut self.handles);
        let Some([p0, p1, p2, p3]) = self.positions(store) else {
            return Ok(());
        };

        let v01 = p1 - p0;
        let v02 = p2 - p0;
        let v03 = p3 - p0;

        // face normals
        let n0 = v01.cross(v02);
        let n1 = v03.cross(v01);
        let n0_len = n0.length();
        let n1_len = n1.length();
        if is_degenerate(v01, n0_len, n1_len) {
            return Ok(());
        }

        // apex heights above the shared edge
        let h0 = v02.reject_from(v01).length();
        let h1 = v03.reject_from(v01).length();
        let h = 0.5 / (h0 + h1);

        let m0 = 1.0 / n0_len;
        let m1 = 1.0 / n1_len;
        let angle = signed_angle(n0, n1, v02, m0, m1);

        // projection magnitude and cotangent terms
        let m = (angle - self.target_angle) * h * 0.5;
        let c0 = v02.dot(v01) * m0;
        let c1 = (p1 - p2).dot(v01) * m0;
        let c2 = v03.dot(v01) * m1;
        let c3 = (p1 - p3).dot(v01) * m1;

        self.handles[START].set_delta(n0 * (m * c1) + n1 * (m * c3));
        self.handles[END].set_delta(n0 * (m * c0) + n1 * (m * c2));
        self.handles[LEFT].set_delta(n0 * -(m * (c0 + c1)));
        self.handles[RIGHT].set_delta(n1 * -(m * (c2 + c3)));
        Ok(())
    }

    fn handles(&self) -> &[Handle] {
        &self.handles
    }

    fn weight(&self) -> f64 {
        self.weight
    }
}

/// Dihedral angle at edge `p0 -> p1` between the faces through `p2` (left)
/// and `p3` (right), in `[0, 2π)` with flat at `π`.
///
/// Returns `None` for a zero-length edge or a face with no height over it.
pub fn dihedral_angle(p0: DVec3, p1: DVec3, p2: DVec3, p3: DVec3) -> Option<f64> {
    let v01 = p1 - p0;
    let v02 = p2 - p0;
    let n0 = v01.cross(v02);
    let n1 = (p3 - p0).cross(v01);
    let n0_len = n0.length();
    let n1_len = n1.length();
    if is_degenerate(v01, n0_len, n1_len) {
        return None;
    }
    Some(signed_angle(n0, n1, v02, 1.0 / n0_len, 1.0 / n1_len))
}

/// Zero-length hinge, or a face whose apex sits (almost) on the hinge line.
///
/// `|n| / |v01|²` is the apex height over the edge length, so the test does
/// not depend on the scale of the geometry.
#[inline]
fn is_degenerate(v01: DVec3, n0_len: f64, n1_len: f64) -> bool {
    let edge_sq = v01.length_squared();
    !(edge_sq > 0.0 && edge_sq.is_finite())
        || n0_len <= DEGENERATE * edge_sq
        || n1_len <= DEGENERATE * edge_sq
}

/// Angle between the face normals, negated when convex and shifted by π.
#[inline]
fn signed_angle(n0: DVec3, n1: DVec3, v02: DVec3, m0: f64, m1: f64) -> f64 {
    let mut angle = (n0.dot(n1) * m0 * m1).clamp(-1.0, 1.0).acos();
    if n1.dot(v02) < 0.0 {
        angle = -angle;
    }
    angle + PI
}

/// `angle mod 2π`, always in `[0, 2π)`.
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid rounds tiny negative inputs up to exactly 2π
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}
