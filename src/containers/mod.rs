//! DOF containers and the closed set they are dispatched through.

pub mod fea;
pub mod flip;
pub mod fluid;
pub mod mpm;
pub mod rigid;

pub use fea::{FeaContainer, RigidAttachment, SurfaceMesh, Tetrahedron};
pub use flip::FlipContainer;
pub use fluid::FluidContainer;
pub use mpm::{Marker, MpmContainer};
pub use rigid::{NodeContact, RigidContainer};

use crate::collision::{ContactQuery, ContactSet};
use crate::core::{
    ContactForces, ContainerKind, ContainerOffsets, DofBlock, DofContainer, RigidBodySet,
    RowBlock, RowView, StepContext,
};
use crate::error::ConfigResult;
use crate::math::{Real, Vector};
use crate::solver::GridSolver;

/// Every container kind the system knows about.
pub enum AnyContainer {
    Rigid(RigidContainer),
    Fluid(FluidContainer),
    Mpm(MpmContainer),
    Flip(FlipContainer),
    Fea(FeaContainer),
}

macro_rules! dispatch {
    ($self:expr, $c:ident => $body:expr) => {
        match $self {
            AnyContainer::Rigid($c) => $body,
            AnyContainer::Fluid($c) => $body,
            AnyContainer::Mpm($c) => $body,
            AnyContainer::Flip($c) => $body,
            AnyContainer::Fea($c) => $body,
        }
    };
}

impl AnyContainer {
    pub fn rigid(&self) -> Option<&RigidContainer> {
        match self {
            AnyContainer::Rigid(c) => Some(c),
            _ => None,
        }
    }

    pub fn fluid(&self) -> Option<&FluidContainer> {
        match self {
            AnyContainer::Fluid(c) => Some(c),
            _ => None,
        }
    }

    pub fn mpm(&self) -> Option<&MpmContainer> {
        match self {
            AnyContainer::Mpm(c) => Some(c),
            _ => None,
        }
    }

    pub fn flip(&self) -> Option<&FlipContainer> {
        match self {
            AnyContainer::Flip(c) => Some(c),
            _ => None,
        }
    }

    pub fn fea(&self) -> Option<&FeaContainer> {
        match self {
            AnyContainer::Fea(c) => Some(c),
            _ => None,
        }
    }

    pub fn rigid_mut(&mut self) -> Option<&mut RigidContainer> {
        match self {
            AnyContainer::Rigid(c) => Some(c),
            _ => None,
        }
    }

    pub fn fluid_mut(&mut self) -> Option<&mut FluidContainer> {
        match self {
            AnyContainer::Fluid(c) => Some(c),
            _ => None,
        }
    }

    pub fn mpm_mut(&mut self) -> Option<&mut MpmContainer> {
        match self {
            AnyContainer::Mpm(c) => Some(c),
            _ => None,
        }
    }

    pub fn flip_mut(&mut self) -> Option<&mut FlipContainer> {
        match self {
            AnyContainer::Flip(c) => Some(c),
            _ => None,
        }
    }

    pub fn fea_mut(&mut self) -> Option<&mut FeaContainer> {
        match self {
            AnyContainer::Fea(c) => Some(c),
            _ => None,
        }
    }
}

impl DofContainer for AnyContainer {
    fn kind(&self) -> ContainerKind {
        dispatch!(self, c => c.kind())
    }

    fn initialize(&mut self, bodies: &RigidBodySet) -> ConfigResult<()> {
        dispatch!(self, c => c.initialize(bodies))
    }

    fn num_nodes(&self) -> usize {
        dispatch!(self, c => c.num_nodes())
    }

    fn positions(&self) -> &[Vector] {
        dispatch!(self, c => c.positions())
    }

    fn velocities(&self) -> &[Vector] {
        dispatch!(self, c => c.velocities())
    }

    fn positions_mut(&mut self) -> &mut [Vector] {
        dispatch!(self, c => c.positions_mut())
    }

    fn velocities_mut(&mut self) -> &mut [Vector] {
        dispatch!(self, c => c.velocities_mut())
    }

    fn contact_query(&self) -> ContactQuery {
        dispatch!(self, c => c.contact_query())
    }

    fn compute_dof(&mut self) {
        dispatch!(self, c => c.compute_dof())
    }

    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet) {
        dispatch!(self, c => c.update(ctx, contacts))
    }

    fn num_dofs(&self) -> usize {
        dispatch!(self, c => c.num_dofs())
    }

    fn num_constraints(&self) -> usize {
        dispatch!(self, c => c.num_constraints())
    }

    fn setup(&mut self, offsets: ContainerOffsets) {
        dispatch!(self, c => c.setup(offsets))
    }

    fn offsets(&self) -> ContainerOffsets {
        dispatch!(self, c => c.offsets())
    }

    fn num_non_zeros(&self, ctx: &StepContext) -> usize {
        dispatch!(self, c => c.num_non_zeros(ctx))
    }

    fn compute_mass(&self, dofs: &mut DofBlock) {
        dispatch!(self, c => c.compute_mass(dofs))
    }

    fn compute_inv_mass(&self, dofs: &mut DofBlock) {
        dispatch!(self, c => c.compute_inv_mass(dofs))
    }

    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock) {
        dispatch!(self, c => c.load_velocities(ctx, dofs))
    }

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock) {
        dispatch!(self, c => c.generate_sparsity(ctx, rows))
    }

    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock) {
        dispatch!(self, c => c.build_d(ctx, rows))
    }

    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock) {
        dispatch!(self, c => c.build_b(ctx, rows))
    }

    fn build_e(&self, ctx: &StepContext, rows: &mut RowBlock) {
        dispatch!(self, c => c.build_e(ctx, rows))
    }

    fn pre_solve(&mut self, ctx: &StepContext, dofs: &mut DofBlock, gamma: &mut [Real]) {
        dispatch!(self, c => c.pre_solve(ctx, dofs, gamma))
    }

    fn inner_solve(
        &mut self,
        ctx: &StepContext,
        dofs: &mut DofBlock,
        solver: &mut dyn GridSolver,
    ) {
        dispatch!(self, c => c.inner_solve(ctx, dofs, solver))
    }

    fn update_rhs(&mut self) -> bool {
        dispatch!(self, c => c.update_rhs())
    }

    fn project(&self, gamma: &mut [Real]) {
        dispatch!(self, c => c.project(gamma))
    }

    fn post_solve(&mut self, ctx: &StepContext, v: &[Real], gamma: &[Real]) {
        dispatch!(self, c => c.post_solve(ctx, v, gamma))
    }

    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView) {
        dispatch!(self, c => c.calculate_contact_forces(ctx, rows))
    }

    fn update_position(&mut self, ctx: &StepContext) {
        dispatch!(self, c => c.update_position(ctx))
    }

    fn contact_forces(&self) -> &ContactForces {
        dispatch!(self, c => c.contact_forces())
    }
}

impl From<RigidContainer> for AnyContainer {
    fn from(c: RigidContainer) -> Self {
        AnyContainer::Rigid(c)
    }
}

impl From<FluidContainer> for AnyContainer {
    fn from(c: FluidContainer) -> Self {
        AnyContainer::Fluid(c)
    }
}

impl From<MpmContainer> for AnyContainer {
    fn from(c: MpmContainer) -> Self {
        AnyContainer::Mpm(c)
    }
}

impl From<FlipContainer> for AnyContainer {
    fn from(c: FlipContainer) -> Self {
        AnyContainer::Flip(c)
    }
}

impl From<FeaContainer> for AnyContainer {
    fn from(c: FeaContainer) -> Self {
        AnyContainer::Fea(c)
    }
}

/// Old index to new index after dropping the entries with `keep[i] == false`.
pub(crate) fn removal_remap(keep: &[bool]) -> Vec<Option<usize>> {
    let mut next = 0;
    keep.iter()
        .map(|&k| {
            k.then(|| {
                next += 1;
                next - 1
            })
        })
        .collect()
}

pub(crate) fn retain_by<T>(items: &mut Vec<T>, keep: &[bool]) {
    let mut i = 0;
    items.retain(|_| {
        let k = keep[i];
        i += 1;
        k
    });
}

/// Unpacks solved velocities (three columns per node).
pub(crate) fn read_velocities(v: &[Real], out: &mut [Vector]) {
    for (i, vel) in out.iter_mut().enumerate() {
        *vel = Vector::from_slice(&v[i * 3..i * 3 + 3]);
    }
}

#[inline]
pub(crate) fn clamp_speed(v: Vector, max_speed: Real) -> Vector {
    v.clamp_length_max(max_speed)
}
