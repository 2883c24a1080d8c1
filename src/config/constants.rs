// Physical constants and numerical floors
use bevy::math::Vec3;

use crate::math::Real;

// Global physics
pub const GRAVITY: Vec3 = Vec3::new(0.0, -9.81, 0.0);

// Fluid defaults
pub const REST_DENSITY: Real = 1000.0;
pub const DEFAULT_KERNEL_RADIUS: Real = 0.04;

/// Densities are never allowed below this fraction of the rest density.
pub const DENSITY_FLOOR_RATIO: Real = 1e-3;
/// Tetrahedra smaller than this are treated as degenerate.
pub const MIN_TET_VOLUME: Real = 1e-12;
/// Singular values of deformation gradients are kept above this.
pub const MIN_SINGULAR_VALUE: Real = 1e-4;
/// Grid nodes lighter than this are treated as empty.
pub const MIN_GRID_MASS: Real = 1e-12;

/// Upper bound on background grid nodes; larger fits are clipped around the
/// marker median.
pub const MAX_GRID_NODES: usize = 1 << 24;

/// Grid padding (in bins) around the marker bounding box.
pub const GRID_PADDING: i32 = 2;
