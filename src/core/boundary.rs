//! Point-versus-rigid-body contacts shared by every container.
//!
//! A container only has to say how the velocity of one of its points is read
//! from its columns (a [`PointStencil`]); row layout, bias, projection and the
//! force feedback to the bodies are handled here.

use indexmap::IndexMap;

use crate::config::ContactParams;
use crate::math::{Real, Vector, tangent_basis};

use super::assembly::SparseRow;
use super::handle::BodyHandle;
use super::projection::project_contact;
use super::rigid::RigidBodySet;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct BoundaryContact {
    pub body: BodyHandle,
    pub point: u32,
    /// Unit normal pointing from the body towards the point.
    pub normal: Vector,
    /// Penetration depth, negative while still separated inside the envelope.
    pub depth: Real,
    /// Contact location on the body surface.
    pub contact_point: Vector,
}

/// Maps a point's velocity onto global columns.
pub trait PointStencil {
    /// Calls `f(col, w)` for every 3-column block contributing to the point
    /// velocity, which is then `Σ w ∘ v[col..col + 3]`.
    fn for_each(&self, point: usize, f: &mut dyn FnMut(usize, Vector));
}

/// Points that own their three velocity columns directly.
#[derive(Copy, Clone, Debug)]
pub struct NodeStencil {
    pub dof_start: usize,
}

impl PointStencil for NodeStencil {
    #[inline]
    fn for_each(&self, point: usize, f: &mut dyn FnMut(usize, Vector)) {
        f(self.dof_start + point * 3, Vector::ONE);
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BodyWrench {
    pub force: Vector,
    pub torque: Vector,
}

/// Net contact reaction per rigid body, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct ContactForces {
    wrenches: IndexMap<BodyHandle, BodyWrench>,
}

impl ContactForces {
    pub fn clear(&mut self) {
        self.wrenches.clear();
    }

    pub fn add(&mut self, body: BodyHandle, force: Vector, torque: Vector) {
        let entry = self.wrenches.entry(body).or_default();
        entry.force += force;
        entry.torque += torque;
    }

    pub fn force(&self, body: BodyHandle) -> Option<Vector> {
        self.wrenches.get(&body).map(|w| w.force)
    }

    pub fn torque(&self, body: BodyHandle) -> Option<Vector> {
        self.wrenches.get(&body).map(|w| w.torque)
    }

    pub fn iter(&self) -> impl Iterator<Item = (BodyHandle, &BodyWrench)> {
        self.wrenches.iter().map(|(b, w)| (*b, w))
    }

    pub fn is_empty(&self) -> bool {
        self.wrenches.is_empty()
    }
}

/// Boundary contact rows of one container for the current step.
#[derive(Clone, Debug, Default)]
pub struct BoundaryRows {
    contacts: Vec<BoundaryContact>,
    mu: Vec<Real>,
    body_friction: Vec<Real>,
    rows_per_contact: usize,
}

impl BoundaryRows {
    /// Keeps the contacts whose body is still alive; the effective friction of
    /// a contact is the smaller of the container's and the body's.
    pub fn update(
        &mut self,
        contacts: &[BoundaryContact],
        bodies: &RigidBodySet,
        params: &ContactParams,
    ) {
        self.rows_per_contact = params.rows_per_contact();
        self.contacts.clear();
        self.mu.clear();
        self.body_friction.clear();
        for contact in contacts {
            let Some(body) = bodies.get(contact.body) else {
                continue;
            };
            self.contacts.push(*contact);
            self.mu.push(params.contact_mu.min(body.friction));
            self.body_friction.push(body.friction);
        }
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
        self.mu.clear();
        self.body_friction.clear();
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.contacts.len() * self.rows_per_contact
    }

    #[inline]
    pub fn rows_per_contact(&self) -> usize {
        self.rows_per_contact
    }

    pub fn contacts(&self) -> &[BoundaryContact] {
        &self.contacts
    }

    fn directions(&self, normal: Vector) -> [Vector; 3] {
        let (u, v) = tangent_basis(normal);
        [normal, u, v]
    }

    pub fn generate_sparsity(
        &self,
        rows: &mut [SparseRow],
        bodies: &RigidBodySet,
        stencil: &dyn PointStencil,
    ) {
        debug_assert_eq!(rows.len(), self.num_rows());
        for (contact, block) in self
            .contacts
            .iter()
            .zip(rows.chunks_mut(self.rows_per_contact.max(1)))
        {
            let body_col = bodies.column(contact.body);
            for row in block {
                if let Some(col) = body_col {
                    row.declare6(col);
                }
                stencil.for_each(contact.point as usize, &mut |col, _| row.declare3(col));
            }
        }
    }

    pub fn build_d(
        &self,
        rows: &mut [SparseRow],
        bodies: &RigidBodySet,
        stencil: &dyn PointStencil,
    ) {
        for (contact, block) in self
            .contacts
            .iter()
            .zip(rows.chunks_mut(self.rows_per_contact.max(1)))
        {
            let body = bodies.get(contact.body);
            let body_col = bodies.column(contact.body);
            let directions = self.directions(contact.normal);
            for (row, dir) in block.iter_mut().zip(directions) {
                if let (Some(body), Some(col)) = (body, body_col) {
                    let arm = contact.contact_point - body.position;
                    row.add3(col, -dir);
                    row.add3(col + 3, -arm.cross(dir));
                }
                stencil.for_each(contact.point as usize, &mut |col, w| row.add3(col, w * dir));
            }
        }
    }

    pub fn build_b(&self, b: &mut [Real], dt: Real, recovery_speed: Real) {
        let stride = self.rows_per_contact.max(1);
        for (contact, block) in self.contacts.iter().zip(b.chunks_mut(stride)) {
            block.fill(0.0);
            block[0] = (-contact.depth / dt).max(-recovery_speed);
        }
    }

    pub fn build_e(&self, e: &mut [Real], compliance: Real) {
        e[..self.num_rows()].fill(compliance);
    }

    pub fn project(&self, gamma: &mut [Real], cohesion: Real) {
        let stride = self.rows_per_contact.max(1);
        for (mu, block) in self.mu.iter().zip(gamma.chunks_mut(stride)) {
            project_contact(block, *mu, cohesion);
        }
    }

    /// Projects with a container-supplied friction per contact, still capped
    /// by the body's own friction.
    pub fn project_with(
        &self,
        gamma: &mut [Real],
        cohesion: Real,
        friction: impl Fn(&BoundaryContact) -> Real,
    ) {
        let stride = self.rows_per_contact.max(1);
        for ((contact, body_mu), block) in self
            .contacts
            .iter()
            .zip(&self.body_friction)
            .zip(gamma.chunks_mut(stride))
        {
            project_contact(block, friction(contact).min(*body_mu), cohesion);
        }
    }

    /// Adds the reaction of every contact on its body, as force and torque
    /// about the body origin.
    pub fn accumulate_forces(
        &self,
        rows: &[SparseRow],
        gamma: &[Real],
        bodies: &RigidBodySet,
        dt: Real,
        out: &mut ContactForces,
    ) {
        let stride = self.rows_per_contact.max(1);
        for ((contact, block), g) in self
            .contacts
            .iter()
            .zip(rows.chunks(stride))
            .zip(gamma.chunks(stride))
        {
            let Some(col) = bodies.column(contact.body) else {
                continue;
            };
            let mut force = Vector::ZERO;
            let mut torque = Vector::ZERO;
            for (row, g) in block.iter().zip(g) {
                force += row.value3_at(col) * *g;
                torque += row.value3_at(col + 3) * *g;
            }
            out.add(contact.body, force / dt, torque / dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rigid::{RigidBody, RigidShape};

    fn setup() -> (RigidBodySet, BodyHandle, BoundaryRows) {
        let mut bodies = RigidBodySet::new();
        let ground = bodies.insert(
            RigidBody::fixed(Vector::ZERO).with_shape(RigidShape::Plane { normal: Vector::Y }),
        );
        let contact = BoundaryContact {
            body: ground,
            point: 0,
            normal: Vector::Y,
            depth: 0.01,
            contact_point: Vector::new(1.0, 0.0, 0.0),
        };
        let mut rows = BoundaryRows::default();
        rows.update(&[contact], &bodies, &ContactParams::default().with_friction(0.4));
        (bodies, ground, rows)
    }

    #[test]
    fn rows_separate_point_from_body() {
        let (bodies, _, boundary) = setup();
        let stencil = NodeStencil { dof_start: 6 };
        let mut rows = vec![SparseRow::default(); boundary.num_rows()];
        boundary.generate_sparsity(&mut rows, &bodies, &stencil);
        boundary.build_d(&mut rows, &bodies, &stencil);

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].value3_at(6), Vector::Y);
        assert_eq!(rows[0].value3_at(0), -Vector::Y);
        // lever arm x cross normal y gives z
        assert_eq!(rows[0].value3_at(3), -Vector::Z);
    }

    #[test]
    fn container_friction_is_capped_by_body() {
        let (_, _, boundary) = setup();
        let project = |mu: Real| {
            let mut g = [1.0, 3.0, 0.0];
            boundary.project_with(&mut g, 0.0, |_| mu);
            g
        };
        let sticky = project(0.8);
        let slippery = project(0.05);
        assert!(sticky[1] > slippery[1] + 0.1);
        // the ground's own friction is 1
        assert_eq!(project(5.0), project(1.0));
    }

    #[test]
    fn bias_is_capped_by_recovery_speed() {
        let (_, _, boundary) = setup();
        let mut b = vec![1.0; 3];
        boundary.build_b(&mut b, 0.001, 0.6);
        assert_eq!(b, vec![-0.6, 0.0, 0.0]);
        boundary.build_b(&mut b, 0.1, 0.6);
        assert!((b[0] + 0.1).abs() < 1e-6);
    }

    #[test]
    fn reaction_is_reported_per_body() {
        let (bodies, ground, boundary) = setup();
        let stencil = NodeStencil { dof_start: 6 };
        let mut rows = vec![SparseRow::default(); boundary.num_rows()];
        boundary.generate_sparsity(&mut rows, &bodies, &stencil);
        boundary.build_d(&mut rows, &bodies, &stencil);

        let mut forces = ContactForces::default();
        boundary.accumulate_forces(&rows, &[0.5, 0.0, 0.0], &bodies, 0.1, &mut forces);
        let force = forces.force(ground).unwrap();
        assert!((force - Vector::new(0.0, -5.0, 0.0)).length() < 1e-5);
        let torque = forces.torque(ground).unwrap();
        assert!((torque - Vector::new(0.0, 0.0, -5.0)).length() < 1e-5);
    }
}
