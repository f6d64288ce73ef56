use glam::{DVec2, DVec3};

use crate::error::{RelaxError, RelaxResult};

/// Largest bin table a grid will allocate.
pub const MAX_BINS: usize = 1 << 24;

/// Axis-aligned box used as grid extents and query regions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Domain {
    min: DVec3,
    max: DVec3,
}

impl Domain {
    /// Box from `min` to `max`. Rejects non-finite or inverted bounds.
    pub fn new(min: DVec3, max: DVec3) -> RelaxResult<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(RelaxError::InvalidDomain(format!(
                "non-finite bounds {min} .. {max}"
            )));
        }
        if min.cmpgt(max).any() {
            return Err(RelaxError::InvalidDomain(format!(
                "inverted bounds {min} .. {max}"
            )));
        }
        Ok(Self { min, max })
    }

    /// Flat domain in the z = 0 plane.
    pub fn new_2d(min: DVec2, max: DVec2) -> RelaxResult<Self> {
        Self::new(min.extend(0.0), max.extend(0.0))
    }

    /// Bounding box of `points`, or `None` when empty or non-finite.
    pub fn from_points<I: IntoIterator<Item = DVec3>>(points: I) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
        Self::new(min, max).ok()
    }

    /// Lower corner.
    pub fn min(&self) -> DVec3 {
        self.min
    }

    /// Upper corner.
    pub fn max(&self) -> DVec3 {
        self.max
    }

    /// Extent along each axis.
    pub fn span(&self) -> DVec3 {
        self.max - self.min
    }

    /// Grow by `pad` on every side.
    pub fn expanded(&self, pad: f64) -> Self {
        Self {
            min: self.min - DVec3::splat(pad),
            max: self.max + DVec3::splat(pad),
        }
    }

    /// Inclusive containment test.
    pub fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }
}

/// Size of an `nx * ny * nz` bin table. Fails on a zero count or a table
/// larger than [`MAX_BINS`].
pub fn bin_total(nx: usize, ny: usize, nz: usize) -> RelaxResult<usize> {
    nx.checked_mul(ny)
        .and_then(|v| v.checked_mul(nz))
        .filter(|&total| total > 0 && total <= MAX_BINS)
        .ok_or(RelaxError::InvalidBinCount { nx, ny, nz })
}

#[derive(Clone, Debug)]
struct Entry<T> {
    item: T,
    min: DVec3,
    max: DVec3,
}

/// Uniform-bin broad phase over a fixed domain.
///
/// Points map to one bin by `floor((p - origin) / bin_size)`, clamped to the
/// valid range, so out-of-domain points land in the nearest edge bin. Boxes
/// land in every bin they overlap. Each entry keeps its bounds so queries
/// only report items whose bounds actually meet the query region.
///
/// A 2D grid is a grid with one bin along z.
#[derive(Clone, Debug)]
pub struct SpatialGrid<T> {
    domain: Domain,
    counts: [usize; 3],
    bin_size: DVec3,
    /// Zero on flat axes, so every coordinate maps to bin 0 there.
    inv_bin_size: DVec3,
    bins: Vec<Vec<Entry<T>>>,
    /// Bins that received an entry since the last clear.
    touched: Vec<usize>,
    item_count: usize,
}

impl<T: Copy> SpatialGrid<T> {
    /// Empty grid of `nx * ny * nz` bins over `domain`.
    pub fn new(domain: Domain, nx: usize, ny: usize, nz: usize) -> RelaxResult<Self> {
        let mut grid = Self {
            domain,
            counts: [1, 1, 1],
            bin_size: DVec3::ZERO,
            inv_bin_size: DVec3::ZERO,
            bins: Vec::new(),
            touched: Vec::new(),
            item_count: 0,
        };
        grid.configure(domain, nx, ny, nz)?;
        Ok(grid)
    }

    /// Empty grid with a single bin along z.
    pub fn new_2d(domain: Domain, nx: usize, ny: usize) -> RelaxResult<Self> {
        Self::new(domain, nx, ny, 1)
    }

    /// Redefine the bin geometry. Clears the grid.
    pub fn configure(&mut self, domain: Domain, nx: usize, ny: usize, nz: usize) -> RelaxResult<()> {
        let bin_total = bin_total(nx, ny, nz)?;
        let counts = [nx, ny, nz];
        let span = domain.span();
        if span.max_element() <= 0.0 {
            return Err(RelaxError::InvalidDomain("domain has zero extent".into()));
        }
        for (axis, &n) in counts.iter().enumerate() {
            if span[axis] == 0.0 && n > 1 {
                return Err(RelaxError::InvalidDomain(format!(
                    "flat axis {axis} cannot hold {n} bins"
                )));
            }
        }

        let n = DVec3::new(nx as f64, ny as f64, nz as f64);
        self.domain = domain;
        self.counts = counts;
        self.bin_size = span / n;
        self.inv_bin_size = DVec3::select(span.cmpgt(DVec3::ZERO), n / span, DVec3::ZERO);

        if self.bins.len() != bin_total {
            self.bins = (0..bin_total).map(|_| Vec::new()).collect();
            self.touched.clear();
            self.item_count = 0;
        } else {
            self.clear();
        }
        Ok(())
    }

    /// Empty every bin, keeping allocations.
    pub fn clear(&mut self) {
        for idx in self.touched.drain(..) {
            self.bins[idx].clear();
        }
        self.item_count = 0;
    }

    /// Insert a point item into the bin containing `point`.
    pub fn insert(&mut self, point: DVec3, item: T) {
        let [i, j, k] = self.bin_of(point);
        let idx = self.to_index(i, j, k);
        self.push(
            idx,
            Entry {
                item,
                min: point,
                max: point,
            },
        );
        self.item_count += 1;
    }

    /// Insert an item covering the box `min..max` into every bin it overlaps.
    pub fn insert_box(&mut self, min: DVec3, max: DVec3, item: T) {
        let (min, max) = (min.min(max), min.max(max));
        let lo = self.bin_of(min);
        let hi = self.bin_of(max);
        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                for i in lo[0]..=hi[0] {
                    let idx = self.to_index(i, j, k);
                    self.push(idx, Entry { item, min, max });
                }
            }
        }
        self.item_count += 1;
    }

    /// Call `f` for every item whose bounds meet the box `min..max`.
    ///
    /// Items inserted with [`insert_box`](Self::insert_box) that span
    /// several bins can be reported more than once.
    pub fn query_box<F: FnMut(T)>(&self, min: DVec3, max: DVec3, mut f: F) {
        let (min, max) = (min.min(max), min.max(max));
        self.visit_bins(min, max, |e| {
            if e.min.cmple(max).all() && e.max.cmpge(min).all() {
                f(e.item);
            }
        });
    }

    /// Call `f` for every item whose bounds come within `radius` of `center`.
    pub fn query_sphere<F: FnMut(T)>(&self, center: DVec3, radius: f64, mut f: F) {
        let r = DVec3::splat(radius.abs());
        let r_sq = radius * radius;
        self.visit_bins(center - r, center + r, |e| {
            if center.clamp(e.min, e.max).distance_squared(center) <= r_sq {
                f(e.item);
            }
        });
    }

    /// Items meeting the box, as a `Vec`.
    pub fn collect_box(&self, min: DVec3, max: DVec3) -> Vec<T> {
        let mut out = Vec::new();
        self.query_box(min, max, |item| out.push(item));
        out
    }

    /// Items within `radius` of `center`, as a `Vec`.
    pub fn collect_sphere(&self, center: DVec3, radius: f64) -> Vec<T> {
        let mut out = Vec::new();
        self.query_sphere(center, radius, |item| out.push(item));
        out
    }

    /// Clamped bin coordinates of `point`.
    pub fn bin_of(&self, point: DVec3) -> [usize; 3] {
        let t = (point - self.domain.min) * self.inv_bin_size;
        let mut out = [0usize; 3];
        for axis in 0..3 {
            // `as` saturates, and NaN becomes 0.
            let cell = t[axis].floor() as i64;
            out[axis] = cell.clamp(0, self.counts[axis] as i64 - 1) as usize;
        }
        out
    }

    /// Bins along x, y and z.
    pub fn bin_counts(&self) -> [usize; 3] {
        self.counts
    }

    /// Edge lengths of one bin.
    pub fn bin_size(&self) -> DVec3 {
        self.bin_size
    }

    /// Extents the bins cover.
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Number of inserted items (a box counts once).
    pub fn item_count(&self) -> usize {
        self.item_count
    }

    #[inline]
    fn to_index(&self, i: usize, j: usize, k: usize) -> usize {
        i + j * self.counts[0] + k * self.counts[0] * self.counts[1]
    }

    fn push(&mut self, idx: usize, entry: Entry<T>) {
        let bin = &mut self.bins[idx];
        if bin.is_empty() {
            self.touched.push(idx);
        }
        bin.push(entry);
    }

    fn visit_bins<F: FnMut(&Entry<T>)>(&self, min: DVec3, max: DVec3, mut f: F) {
        if self.item_count == 0 {
            return;
        }
        let lo = self.bin_of(min);
        let hi = self.bin_of(max);
        for k in lo[2]..=hi[2] {
            for j in lo[1]..=hi[1] {
                for i in lo[0]..=hi[0] {
                    self.bins[self.to_index(i, j, k)].iter().for_each(&mut f);
                }
            }
        }
    }
}
