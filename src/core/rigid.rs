//! Rigid bodies the containers couple to.
//!
//! This is the minimal state the containers need from the enclosing multibody
//! system: pose and velocity to build coupling rows, and somewhere to send the
//! accumulated contact reactions.

use crate::collision::CollisionFilter;
use crate::math::{Matrix, Real, Rotation, Vector, diagonal_from_vec};

use super::handle::BodyHandle;

/// Analytic collision shape, expressed in the body frame.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RigidShape {
    /// Half-space below the plane through the body origin.
    Plane { normal: Vector },
    Sphere { radius: Real },
}

#[derive(Clone, Debug, PartialEq)]
pub struct RigidBody {
    pub position: Vector,
    pub rotation: Rotation,
    pub linear_velocity: Vector,
    pub angular_velocity: Vector,
    pub mass: Real,
    /// Principal moments of inertia in the body frame.
    pub inertia: Vector,
    pub fixed: bool,
    pub friction: Real,
    pub shape: Option<RigidShape>,
    pub filter: CollisionFilter,
}

impl RigidBody {
    pub fn fixed(position: Vector) -> Self {
        Self {
            position,
            rotation: Rotation::IDENTITY,
            linear_velocity: Vector::ZERO,
            angular_velocity: Vector::ZERO,
            mass: 0.0,
            inertia: Vector::ZERO,
            fixed: true,
            friction: 1.0,
            shape: None,
            filter: CollisionFilter::default(),
        }
    }

    pub fn dynamic(position: Vector, mass: Real, inertia: Vector) -> Self {
        Self {
            mass,
            inertia,
            fixed: false,
            ..Self::fixed(position)
        }
    }

    pub fn with_shape(mut self, shape: RigidShape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_velocity(mut self, linear: Vector, angular: Vector) -> Self {
        self.linear_velocity = linear;
        self.angular_velocity = angular;
        self
    }

    pub fn with_friction(mut self, friction: Real) -> Self {
        self.friction = friction;
        self
    }

    pub fn with_family(mut self, family: u8) -> Self {
        self.filter.family = family;
        self
    }

    pub fn without_collision_with(mut self, family: u8) -> Self {
        self.filter = self.filter.without(family);
        self
    }

    #[inline]
    pub fn inv_mass(&self) -> Real {
        if self.fixed || self.mass <= 0.0 {
            0.0
        } else {
            1.0 / self.mass
        }
    }

    /// Inverse inertia tensor in the world frame.
    pub fn world_inv_inertia(&self) -> Matrix {
        if self.fixed {
            return Matrix::ZERO;
        }
        let inv_local = Vector::new(
            inv_or_zero(self.inertia.x),
            inv_or_zero(self.inertia.y),
            inv_or_zero(self.inertia.z),
        );
        let r = Matrix::from_quat(self.rotation);
        r * diagonal_from_vec(inv_local) * r.transpose()
    }

    #[inline]
    pub fn to_world(&self, local_point: Vector) -> Vector {
        self.position + self.rotation * local_point
    }

    #[inline]
    pub fn to_local(&self, world_point: Vector) -> Vector {
        self.rotation.inverse() * (world_point - self.position)
    }

    #[inline]
    pub fn velocity_at(&self, world_point: Vector) -> Vector {
        self.linear_velocity + self.angular_velocity.cross(world_point - self.position)
    }

    /// Advances the pose with the current velocities.
    pub fn integrate(&mut self, dt: Real) {
        if self.fixed {
            return;
        }
        self.position += self.linear_velocity * dt;
        let w = self.angular_velocity;
        if w.length_squared() > 0.0 {
            let spin = Rotation::from_scaled_axis(w * dt);
            self.rotation = (spin * self.rotation).normalize();
        }
    }
}

#[inline]
fn inv_or_zero(value: Real) -> Real {
    if value > 0.0 { 1.0 / value } else { 0.0 }
}

#[derive(Clone, Debug)]
struct Slot {
    generation: u32,
    body: Option<RigidBody>,
}

/// Arena of rigid bodies with stable, generation-checked handles.
///
/// Every slot owns six global velocity columns (linear then angular), whether
/// it is occupied or not, so column offsets never move when bodies come and go.
#[derive(Clone, Debug, Default)]
pub struct RigidBodySet {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

pub const BODY_DOFS: usize = 6;

impl RigidBodySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, body: RigidBody) -> BodyHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.body = Some(body);
            BodyHandle::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                body: Some(body),
            });
            BodyHandle::new(index, 0)
        }
    }

    pub fn remove(&mut self, handle: BodyHandle) -> Option<RigidBody> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation() {
            return None;
        }
        let body = slot.body.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index() as u32);
        Some(body)
    }

    pub fn get(&self, handle: BodyHandle) -> Option<&RigidBody> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.body.as_ref())
    }

    pub fn get_mut(&mut self, handle: BodyHandle) -> Option<&mut RigidBody> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.generation == handle.generation())
            .and_then(|slot| slot.body.as_mut())
    }

    pub fn contains(&self, handle: BodyHandle) -> bool {
        self.get(handle).is_some()
    }

    /// First global column of the body, `None` for stale handles.
    pub fn column(&self, handle: BodyHandle) -> Option<usize> {
        self.get(handle).map(|_| handle.index() * BODY_DOFS)
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_dofs(&self) -> usize {
        self.slots.len() * BODY_DOFS
    }

    pub fn iter(&self) -> impl Iterator<Item = (BodyHandle, &RigidBody)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.body
                .as_ref()
                .map(|body| (BodyHandle::new(index as u32, slot.generation), body))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (BodyHandle, &mut RigidBody)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.body
                .as_mut()
                .map(|body| (BodyHandle::new(index as u32, generation), body))
        })
    }
}
