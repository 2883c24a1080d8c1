//! Background grid layout and quadratic B-spline interpolation.
//!
//! The grid is rebuilt every step from the marker bounding box; nodes sit at
//! `origin + coord * bin_edge` and are addressed by a dense linear index.

use bevy::log::warn;
use bevy::math::{IVec3, UVec3};

use crate::config::{BoundingBox, MAX_GRID_NODES};
use crate::math::{GridCoord, Real, Vector};

use super::kernel::{bspline_gradients, bspline_weights};

/// MPM kernel size (3x3x3 B-spline)
pub const KERNEL_SIZE: usize = 3;
/// Number of nodes touched by one marker
pub const NEIGHBOR_COUNT: usize = KERNEL_SIZE * KERNEL_SIZE * KERNEL_SIZE;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct GridLayout {
    pub origin: Vector,
    pub bin_edge: Real,
    pub dims: UVec3,
}

impl Default for GridLayout {
    fn default() -> Self {
        Self {
            origin: Vector::ZERO,
            bin_edge: 1.0,
            dims: UVec3::ZERO,
        }
    }
}

impl GridLayout {
    /// Snaps the bounds of `points` to multiples of `bin_edge` and pads them by
    /// `padding` bins on every side. Bounds are clipped to `clip` first.
    ///
    /// A grid that would exceed [`MAX_GRID_NODES`] is cut down to a cube of
    /// bins centered on the per-axis median of the points; markers left
    /// outside it simply do not transfer.
    pub fn fit(
        points: impl IntoIterator<Item = Vector>,
        bin_edge: Real,
        padding: i32,
        clip: Option<&BoundingBox>,
    ) -> Self {
        let points: Vec<Vector> = points.into_iter().collect();
        let Some(bounds) = BoundingBox::from_points(points.iter().copied()) else {
            return Self {
                bin_edge,
                ..Self::default()
            };
        };
        let (min, max) = match clip {
            Some(clip) => (clip.clamp(bounds.min), clip.clamp(bounds.max)),
            None => (bounds.min, bounds.max),
        };

        let pad = padding as Real;
        let mut lo = (min / bin_edge).floor() - pad;
        let mut hi = (max / bin_edge).ceil() + pad;
        let extent = (hi - lo + Vector::ONE).max(Vector::ONE);
        let total = extent.x as f64 * extent.y as f64 * extent.z as f64;
        if total > MAX_GRID_NODES as f64 {
            let side = (MAX_GRID_NODES as f64).cbrt().floor() as Real;
            let center = (median(&points) / bin_edge).round();
            let start = (center - (side / 2.0).floor())
                .clamp(lo, (hi - side + 1.0).max(lo));
            let oversized = extent.cmpgt(Vector::splat(side));
            lo = Vector::select(oversized, start, lo);
            hi = Vector::select(oversized, start + side - 1.0, hi);
            warn!(
                "grid of {total:.0} nodes exceeds {MAX_GRID_NODES}, clipping to {} bins around {}",
                side,
                center * bin_edge
            );
        }
        let lo = lo.as_ivec3();
        let hi = hi.as_ivec3();
        let dims = (hi - lo + IVec3::ONE).max(IVec3::ONE).as_uvec3();

        Self {
            origin: lo.as_vec3() * bin_edge,
            bin_edge,
            dims,
        }
    }

    #[inline]
    pub fn num_nodes(&self) -> usize {
        self.dims.x as usize * self.dims.y as usize * self.dims.z as usize
    }

    #[inline]
    pub fn contains(&self, coord: GridCoord) -> bool {
        coord.cmpge(IVec3::ZERO).all() && coord.cmplt(self.dims.as_ivec3()).all()
    }

    #[inline]
    pub fn linear_index(&self, coord: GridCoord) -> Option<usize> {
        if !self.contains(coord) {
            return None;
        }
        let d = self.dims.as_ivec3();
        Some((coord.x + d.x * (coord.y + d.y * coord.z)) as usize)
    }

    #[inline]
    pub fn coord_of(&self, index: usize) -> GridCoord {
        let d = self.dims.as_ivec3();
        let i = index as i32;
        IVec3::new(i % d.x, (i / d.x) % d.y, i / (d.x * d.y))
    }

    #[inline]
    pub fn node_position(&self, coord: GridCoord) -> Vector {
        self.origin + coord.as_vec3() * self.bin_edge
    }

    /// Position in node units.
    #[inline]
    pub fn to_grid(&self, position: Vector) -> Vector {
        (position - self.origin) / self.bin_edge
    }

    /// Cell containing `position`.
    #[inline]
    pub fn cell_of(&self, position: Vector) -> GridCoord {
        self.to_grid(position).floor().as_ivec3()
    }

    pub fn interpolation(&self, position: Vector) -> GridInterpolation {
        GridInterpolation::compute(self.to_grid(position), self.bin_edge)
    }

    /// Interpolation onto a staggered sub-grid whose nodes are shifted by
    /// `shift` (in cell units) from the main nodes.
    pub fn staggered_interpolation(&self, position: Vector, shift: Vector) -> GridInterpolation {
        GridInterpolation::compute(self.to_grid(position) - shift, self.bin_edge)
    }
}

/// Component-wise median of a non-empty point set.
fn median(points: &[Vector]) -> Vector {
    let mid = points.len() / 2;
    let mut axis: Vec<Real> = Vec::with_capacity(points.len());
    let mut out = Vector::ZERO;
    for k in 0..3 {
        axis.clear();
        axis.extend(points.iter().map(|p| p[k]));
        let (_, value, _) = axis.select_nth_unstable_by(mid, Real::total_cmp);
        out[k] = *value;
    }
    out
}

/// Quadratic B-spline weights of one marker over its 3x3x3 node stencil.
#[derive(Copy, Clone, Debug)]
pub struct GridInterpolation {
    pub base: GridCoord,
    /// Per-axis weights, `weights[k].x` is the x-weight of stencil column `k`.
    pub weights: [Vector; KERNEL_SIZE],
    /// Per-axis weight derivatives, already divided by the bin edge.
    pub gradients: [Vector; KERNEL_SIZE],
    /// Fractional position relative to `base`, in cell units.
    pub fx: Vector,
    pub bin_edge: Real,
}

impl GridInterpolation {
    /// `xg` is the marker position in node units.
    #[inline]
    pub fn compute(xg: Vector, bin_edge: Real) -> Self {
        let base = (xg - 0.5).floor().as_ivec3();
        let fx = xg - base.as_vec3();

        let wx = bspline_weights(fx.x);
        let wy = bspline_weights(fx.y);
        let wz = bspline_weights(fx.z);
        let gx = bspline_gradients(fx.x);
        let gy = bspline_gradients(fx.y);
        let gz = bspline_gradients(fx.z);
        let inv = 1.0 / bin_edge;

        let mut weights = [Vector::ZERO; KERNEL_SIZE];
        let mut gradients = [Vector::ZERO; KERNEL_SIZE];
        for k in 0..KERNEL_SIZE {
            weights[k] = Vector::new(wx[k], wy[k], wz[k]);
            gradients[k] = Vector::new(gx[k], gy[k], gz[k]) * inv;
        }

        Self {
            base,
            weights,
            gradients,
            fx,
            bin_edge,
        }
    }

    /// Iterator over `(coord, weight, weight gradient, node - marker)` for the
    /// 27 stencil nodes.
    #[inline]
    pub fn iter_neighbors(&self) -> impl Iterator<Item = (GridCoord, Real, Vector, Vector)> + '_ {
        (0..NEIGHBOR_COUNT).map(move |idx| {
            let i = idx % KERNEL_SIZE;
            let j = (idx / KERNEL_SIZE) % KERNEL_SIZE;
            let k = idx / (KERNEL_SIZE * KERNEL_SIZE);
            let (w, g) = (&self.weights, &self.gradients);
            let weight = w[i].x * w[j].y * w[k].z;
            let gradient = Vector::new(
                g[i].x * w[j].y * w[k].z,
                w[i].x * g[j].y * w[k].z,
                w[i].x * w[j].y * g[k].z,
            );
            let shift = IVec3::new(i as i32, j as i32, k as i32);
            let distance = (shift.as_vec3() - self.fx) * self.bin_edge;
            (self.base + shift, weight, gradient, distance)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_pads_and_snaps() {
        let bbox = BoundingBox::new(Vector::splat(-10.0), Vector::splat(10.0));
        let layout = GridLayout::fit(
            [Vector::new(0.12, 0.0, 0.0), Vector::new(0.31, 0.2, 0.05)],
            0.1,
            2,
            Some(&bbox),
        );
        // x: floor(1.2)-2 = -1 .. ceil(3.1)+2 = 6
        assert_eq!(layout.dims.x, 8);
        assert!((layout.origin.x + 0.1).abs() < 1e-6);
        assert_eq!(layout.num_nodes(), (layout.dims.x * layout.dims.y * layout.dims.z) as usize);
    }

    #[test]
    fn far_outlier_does_not_blow_up_the_grid() {
        let mut points: Vec<Vector> = (0..27)
            .map(|i| Vector::new((i % 3) as Real, ((i / 3) % 3) as Real, (i / 9) as Real) * 0.05)
            .collect();
        points.push(Vector::splat(200.0));
        let layout = GridLayout::fit(points.iter().copied(), 0.1, 2, None);
        assert!(layout.num_nodes() <= MAX_GRID_NODES);
        let near = layout.cell_of(Vector::splat(0.05));
        assert!(layout.linear_index(near).is_some());
        let far = layout.cell_of(Vector::splat(200.0));
        assert!(layout.linear_index(far).is_none());
    }

    #[test]
    fn linear_index_round_trip() {
        let layout = GridLayout {
            origin: Vector::ZERO,
            bin_edge: 1.0,
            dims: UVec3::new(4, 5, 6),
        };
        let coord = IVec3::new(3, 1, 4);
        let index = layout.linear_index(coord).unwrap();
        assert_eq!(layout.coord_of(index), coord);
        assert!(layout.linear_index(IVec3::new(4, 0, 0)).is_none());
        assert!(layout.linear_index(IVec3::new(-1, 0, 0)).is_none());
    }

    #[test]
    fn interpolation_reproduces_linear_fields() {
        let interp = GridInterpolation::compute(Vector::new(3.3, 4.7, 5.05), 0.5);
        let mut total = 0.0;
        let mut first_moment = Vector::ZERO;
        let mut grad_sum = Vector::ZERO;
        for (_, w, g, d) in interp.iter_neighbors() {
            total += w;
            first_moment += w * d;
            grad_sum += g;
        }
        assert!((total - 1.0).abs() < 1e-5);
        assert!(first_moment.length() < 1e-5);
        assert!(grad_sum.length() < 1e-4);
    }
}
