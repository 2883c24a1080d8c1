//! Uniform hash grid for radius queries over point clouds.

use std::collections::HashMap;

use bevy::math::IVec3;
use rayon::prelude::*;

use crate::math::{GridCoord, Real, Vector};

pub type PackedCell = u64;

const AXIS_BITS: u32 = 21;
const AXIS_BIAS: i32 = 1 << (AXIS_BITS - 1);
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;

#[inline]
pub fn pack_coords(coord: GridCoord) -> PackedCell {
    let x = ((coord.x + AXIS_BIAS) as u64) & AXIS_MASK;
    let y = ((coord.y + AXIS_BIAS) as u64) & AXIS_MASK;
    let z = ((coord.z + AXIS_BIAS) as u64) & AXIS_MASK;
    (x << (2 * AXIS_BITS)) | (y << AXIS_BITS) | z
}

#[inline]
pub fn unpack_coords(id: PackedCell) -> GridCoord {
    let x = ((id >> (2 * AXIS_BITS)) & AXIS_MASK) as i32 - AXIS_BIAS;
    let y = ((id >> AXIS_BITS) & AXIS_MASK) as i32 - AXIS_BIAS;
    let z = (id & AXIS_MASK) as i32 - AXIS_BIAS;
    IVec3::new(x, y, z)
}

/// Points bucketed by cells of width `cell_width`.
///
/// With `cell_width >= radius`, all neighbors of a point lie in the 27 cells
/// around its own.
#[derive(Clone, Debug)]
pub struct NeighborGrid {
    cell_width: Real,
    cells: HashMap<PackedCell, Vec<u32>>,
}

impl NeighborGrid {
    pub fn new(cell_width: Real) -> Self {
        Self {
            cell_width,
            cells: HashMap::new(),
        }
    }

    pub fn build(cell_width: Real, points: &[Vector]) -> Self {
        let mut grid = Self::new(cell_width);
        grid.rebuild(points);
        grid
    }

    pub fn rebuild(&mut self, points: &[Vector]) {
        self.cells.values_mut().for_each(Vec::clear);
        for (i, p) in points.iter().enumerate() {
            let id = pack_coords(self.cell_of(*p));
            self.cells.entry(id).or_default().push(i as u32);
        }
        self.cells.retain(|_, bucket| !bucket.is_empty());
    }

    #[inline]
    pub fn cell_width(&self) -> Real {
        self.cell_width
    }

    #[inline]
    pub fn cell_of(&self, p: Vector) -> GridCoord {
        (p / self.cell_width).floor().as_ivec3()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Calls `f(j)` for every point within `radius` of `p`.
    pub fn for_each_within<F>(&self, points: &[Vector], p: Vector, radius: Real, mut f: F)
    where
        F: FnMut(usize),
    {
        let base = self.cell_of(p);
        let r2 = radius * radius;
        for dz in -1..=1 {
            for dy in -1..=1 {
                for dx in -1..=1 {
                    let id = pack_coords(base + IVec3::new(dx, dy, dz));
                    let Some(bucket) = self.cells.get(&id) else {
                        continue;
                    };
                    for &j in bucket {
                        let j = j as usize;
                        if (points[j] - p).length_squared() <= r2 {
                            f(j);
                        }
                    }
                }
            }
        }
    }

    /// All pairs `[i, j]` with `i < j` closer than `radius`, ordered by `i`
    /// then by discovery order.
    pub fn pairs(&self, points: &[Vector], radius: Real) -> Vec<[u32; 2]> {
        points
            .par_iter()
            .enumerate()
            .flat_map_iter(|(i, p)| {
                let mut local = Vec::new();
                self.for_each_within(points, *p, radius, |j| {
                    if j > i {
                        local.push([i as u32, j as u32]);
                    }
                });
                local.sort_unstable();
                local
            })
            .collect()
    }
}
