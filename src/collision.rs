//! Contact generation for container point clouds.
//!
//! Detection is an external stage to the containers: they only declare what
//! they want found ([`ContactQuery`]) and consume the resulting [`ContactSet`].

use rayon::prelude::*;

use crate::core::{BoundaryContact, NeighborGrid, RigidBodySet, RigidShape};
use crate::math::{Real, Vector};

/// Number of collision families; a mask has one bit per family.
pub const NUM_FAMILIES: u8 = 16;

/// Collision family of a body or container, and the families it collides with.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CollisionFilter {
    pub family: u8,
    pub mask: u16,
}

impl Default for CollisionFilter {
    fn default() -> Self {
        Self {
            family: 0,
            mask: u16::MAX,
        }
    }
}

#[inline]
fn family_bit(family: u8) -> u16 {
    1u16.checked_shl(family.into()).unwrap_or(0)
}

impl CollisionFilter {
    pub fn new(family: u8) -> Self {
        Self {
            family,
            ..Self::default()
        }
    }

    /// Stops generating contacts against members of `family`.
    pub fn without(mut self, family: u8) -> Self {
        self.mask &= !family_bit(family);
        self
    }

    /// Both sides have to accept the other's family.
    #[inline]
    pub fn collides_with(&self, other: &CollisionFilter) -> bool {
        self.mask & family_bit(other.family) != 0 && other.mask & family_bit(self.family) != 0
    }
}

/// What a container needs from the collision stage this step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ContactQuery {
    /// Report point pairs closer than this, `None` for no pair search.
    pub pair_radius: Option<Real>,
    /// Radius of each point against rigid shapes.
    pub point_radius: Real,
    /// Contacts are reported this far before actual overlap.
    pub envelope: Real,
    /// Bodies outside this filter are ignored.
    pub filter: CollisionFilter,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContactSet {
    /// Point pairs `[i, j]` with `i < j`.
    pub pairs: Vec<[u32; 2]>,
    pub boundary: Vec<BoundaryContact>,
}

impl ContactSet {
    pub fn clear(&mut self) {
        self.pairs.clear();
        self.boundary.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.boundary.is_empty()
    }
}

pub trait ContactDetector: Send + Sync {
    fn detect(&mut self, points: &[Vector], query: &ContactQuery, bodies: &RigidBodySet)
    -> ContactSet;
}

/// Hash-grid pair search plus analytic point-versus-shape tests.
#[derive(Clone, Debug)]
pub struct SpatialHashDetector {
    grid: NeighborGrid,
}

impl Default for SpatialHashDetector {
    fn default() -> Self {
        Self {
            grid: NeighborGrid::new(1.0),
        }
    }
}

impl SpatialHashDetector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContactDetector for SpatialHashDetector {
    fn detect(
        &mut self,
        points: &[Vector],
        query: &ContactQuery,
        bodies: &RigidBodySet,
    ) -> ContactSet {
        let pairs = match query.pair_radius {
            Some(radius) if radius > 0.0 && !points.is_empty() => {
                if self.grid.cell_width() != radius {
                    self.grid = NeighborGrid::new(radius);
                }
                self.grid.rebuild(points);
                self.grid.pairs(points, radius)
            }
            _ => Vec::new(),
        };

        let shapes: Vec<_> = bodies
            .iter()
            .filter(|(_, body)| query.filter.collides_with(&body.filter))
            .filter_map(|(handle, body)| body.shape.map(|shape| (handle, body, shape)))
            .collect();

        let boundary = if shapes.is_empty() {
            Vec::new()
        } else {
            points
                .par_iter()
                .enumerate()
                .flat_map_iter(|(i, p)| {
                    shapes.iter().filter_map(move |(handle, body, shape)| {
                        let (normal, gap, contact_point) = match *shape {
                            RigidShape::Plane { normal } => {
                                let n = (body.rotation * normal).normalize_or_zero();
                                let height = n.dot(*p - body.position);
                                (n, height - query.point_radius, *p - n * height)
                            }
                            RigidShape::Sphere { radius } => {
                                let diff = *p - body.position;
                                let dist = diff.length();
                                if dist <= Real::EPSILON {
                                    return None;
                                }
                                let n = diff / dist;
                                (
                                    n,
                                    dist - radius - query.point_radius,
                                    body.position + n * radius,
                                )
                            }
                        };
                        (gap < query.envelope).then_some(BoundaryContact {
                            body: *handle,
                            point: i as u32,
                            normal,
                            depth: -gap,
                            contact_point,
                        })
                    })
                })
                .collect()
        };

        ContactSet { pairs, boundary }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RigidBody;

    fn query() -> ContactQuery {
        ContactQuery {
            pair_radius: Some(0.1),
            point_radius: 0.05,
            envelope: 0.01,
            filter: CollisionFilter::default(),
        }
    }

    #[test]
    fn plane_contacts_report_depth_and_normal() {
        let mut bodies = RigidBodySet::new();
        let ground = bodies.insert(
            RigidBody::fixed(Vector::ZERO).with_shape(RigidShape::Plane { normal: Vector::Y }),
        );
        let points = [Vector::new(0.3, 0.04, 0.0), Vector::new(0.0, 1.0, 0.0)];
        let contacts = SpatialHashDetector::new().detect(&points, &query(), &bodies);

        assert_eq!(contacts.boundary.len(), 1);
        let c = contacts.boundary[0];
        assert_eq!(c.body, ground);
        assert_eq!(c.point, 0);
        assert_eq!(c.normal, Vector::Y);
        assert!((c.depth - 0.01).abs() < 1e-6);
        assert!((c.contact_point - Vector::new(0.3, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn sphere_contacts_point_outwards() {
        let mut bodies = RigidBodySet::new();
        bodies.insert(
            RigidBody::fixed(Vector::ZERO).with_shape(RigidShape::Sphere { radius: 1.0 }),
        );
        let points = [Vector::new(0.0, 0.0, 1.04)];
        let contacts = SpatialHashDetector::new().detect(&points, &query(), &bodies);
        assert_eq!(contacts.boundary.len(), 1);
        assert!((contacts.boundary[0].normal - Vector::Z).length() < 1e-6);
    }

    #[test]
    fn masked_families_are_skipped() {
        let mut bodies = RigidBodySet::new();
        let plane = RigidShape::Plane { normal: Vector::Y };
        let ground = bodies.insert(RigidBody::fixed(Vector::ZERO).with_shape(plane));
        let tray = bodies
            .insert(RigidBody::fixed(Vector::ZERO).with_shape(plane).with_family(3));
        let points = [Vector::new(0.0, 0.04, 0.0)];

        let everything = SpatialHashDetector::new().detect(&points, &query(), &bodies);
        assert_eq!(everything.boundary.len(), 2);

        let masked = ContactQuery {
            filter: CollisionFilter::new(1).without(3),
            ..query()
        };
        let contacts = SpatialHashDetector::new().detect(&points, &masked, &bodies);
        assert_eq!(contacts.boundary.len(), 1);
        assert_eq!(contacts.boundary[0].body, ground);

        // the body side can refuse as well
        bodies.get_mut(tray).unwrap().filter = CollisionFilter::new(3).without(1);
        let accepting = ContactQuery {
            filter: CollisionFilter::new(1),
            ..query()
        };
        let contacts = SpatialHashDetector::new().detect(&points, &accepting, &bodies);
        assert_eq!(contacts.boundary.len(), 1);
        assert!(!CollisionFilter::new(1).collides_with(&CollisionFilter::new(3).without(1)));
    }

    #[test]
    fn pairs_use_query_radius() {
        let points = [Vector::ZERO, Vector::new(0.09, 0.0, 0.0), Vector::new(0.3, 0.0, 0.0)];
        let contacts =
            SpatialHashDetector::new().detect(&points, &query(), &RigidBodySet::new());
        assert_eq!(contacts.pairs, vec![[0, 1]]);
        assert!(contacts.boundary.is_empty());
    }
}
