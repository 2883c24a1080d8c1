//! Granular contact between simplified rigid nodes.
//!
//! Each node is a translational point of diameter `kernel_radius`. Overlapping
//! pairs get one unilateral normal row (plus two friction rows when `mu > 0`),
//! projected onto a Coulomb cone whose apex is shifted by the cohesion.

use bevy::log::info;

use crate::collision::{ContactQuery, ContactSet};
use crate::config::RigidParams;
use crate::core::{
    BoundaryRows, ContactForces, ContainerKind, ContainerOffsets, DofBlock, DofContainer,
    NodeStencil, RigidBodySet, RowBlock, RowView, StepContext, check_offsets, project_contact,
    warm_start,
};
use crate::error::{ConfigError, ConfigResult};
use crate::math::{Real, Vector, tangent_basis};

use super::{clamp_speed, read_velocities, removal_remap, retain_by};

/// Node-node contact for the current step.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NodeContact {
    pub a: u32,
    pub b: u32,
    /// Unit normal from `a` to `b`.
    pub normal: Vector,
    pub depth: Real,
}

#[derive(Clone, Debug)]
pub struct RigidContainer {
    params: RigidParams,
    positions: Vec<Vector>,
    velocities: Vec<Vector>,
    contacts: Vec<NodeContact>,
    boundary: BoundaryRows,
    offsets: ContainerOffsets,
    gamma_old: Vec<Real>,
    forces: ContactForces,
}

impl RigidContainer {
    pub fn new(params: RigidParams) -> ConfigResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            positions: Vec::new(),
            velocities: Vec::new(),
            contacts: Vec::new(),
            boundary: BoundaryRows::default(),
            offsets: ContainerOffsets::default(),
            gamma_old: Vec::new(),
            forces: ContactForces::default(),
        })
    }

    pub fn params(&self) -> &RigidParams {
        &self.params
    }

    pub fn add_nodes(&mut self, positions: &[Vector], velocities: &[Vector]) -> ConfigResult<()> {
        if positions.len() != velocities.len() {
            return Err(ConfigError::LengthMismatch(positions.len(), velocities.len()));
        }
        self.positions.extend_from_slice(positions);
        self.velocities.extend_from_slice(velocities);
        self.gamma_old.clear();
        Ok(())
    }

    /// Drops nodes matching `predicate`; returns old index to new index.
    pub fn remove_nodes<F>(&mut self, mut predicate: F) -> Vec<Option<usize>>
    where
        F: FnMut(usize, Vector, Vector) -> bool,
    {
        let keep: Vec<bool> = (0..self.positions.len())
            .map(|i| !predicate(i, self.positions[i], self.velocities[i]))
            .collect();
        retain_by(&mut self.positions, &keep);
        retain_by(&mut self.velocities, &keep);
        self.contacts.clear();
        self.boundary.clear();
        self.gamma_old.clear();
        removal_remap(&keep)
    }

    pub fn contacts(&self) -> &[NodeContact] {
        &self.contacts
    }

    pub fn boundary(&self) -> &BoundaryRows {
        &self.boundary
    }

    fn stride(&self) -> usize {
        self.params.contact.rows_per_contact()
    }

    fn pair_rows(&self) -> usize {
        self.contacts.len() * self.stride()
    }

    fn stencil(&self) -> NodeStencil {
        NodeStencil {
            dof_start: self.offsets.dof_start,
        }
    }
}

impl DofContainer for RigidContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Rigid
    }

    fn initialize(&mut self, _bodies: &RigidBodySet) -> ConfigResult<()> {
        info!(
            "rigid container: {} nodes, diameter {}, mu {}",
            self.positions.len(),
            self.params.contact.kernel_radius,
            self.params.contact.contact_mu
        );
        Ok(())
    }

    fn num_nodes(&self) -> usize {
        self.positions.len()
    }

    fn positions(&self) -> &[Vector] {
        &self.positions
    }

    fn velocities(&self) -> &[Vector] {
        &self.velocities
    }

    fn positions_mut(&mut self) -> &mut [Vector] {
        &mut self.positions
    }

    fn velocities_mut(&mut self) -> &mut [Vector] {
        &mut self.velocities
    }

    fn contact_query(&self) -> ContactQuery {
        let c = &self.params.contact;
        ContactQuery {
            pair_radius: Some(c.kernel_radius + c.collision_envelope),
            point_radius: 0.5 * c.kernel_radius,
            envelope: c.collision_envelope,
            filter: c.collision_filter,
        }
    }

    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet) {
        let diameter = self.params.contact.kernel_radius;
        self.contacts.clear();
        for &[a, b] in &contacts.pairs {
            let d = self.positions[b as usize] - self.positions[a as usize];
            let dist = d.length();
            if dist <= Real::EPSILON {
                continue;
            }
            self.contacts.push(NodeContact {
                a,
                b,
                normal: d / dist,
                depth: diameter - dist,
            });
        }
        self.boundary
            .update(&contacts.boundary, ctx.bodies, &self.params.contact);
    }

    fn num_dofs(&self) -> usize {
        self.positions.len() * 3
    }

    fn num_constraints(&self) -> usize {
        self.pair_rows() + self.boundary.num_rows()
    }

    fn setup(&mut self, offsets: ContainerOffsets) {
        check_offsets(self.kind(), &offsets, self.counts());
        self.offsets = offsets;
    }

    fn offsets(&self) -> ContainerOffsets {
        self.offsets
    }

    fn compute_mass(&self, dofs: &mut DofBlock) {
        dofs.mass.fill(self.params.mass);
    }

    fn compute_inv_mass(&self, dofs: &mut DofBlock) {
        dofs.inv_mass.fill(1.0 / self.params.mass);
    }

    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock) {
        let impulse = ctx.gravity * self.params.mass * ctx.dt;
        for (i, v) in self.velocities.iter().enumerate() {
            dofs.set_velocity3(i, *v);
            dofs.add_impulse3(i, impulse);
        }
    }

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (pair_rows, boundary_rows) = rows.rows.split_at_mut(self.pair_rows());
        let start = self.offsets.dof_start;
        for (contact, block) in self.contacts.iter().zip(pair_rows.chunks_mut(self.stride())) {
            for row in block {
                row.declare3(start + contact.a as usize * 3);
                row.declare3(start + contact.b as usize * 3);
            }
        }
        self.boundary
            .generate_sparsity(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (pair_rows, boundary_rows) = rows.rows.split_at_mut(self.pair_rows());
        let start = self.offsets.dof_start;
        for (contact, block) in self.contacts.iter().zip(pair_rows.chunks_mut(self.stride())) {
            let (u, v) = tangent_basis(contact.normal);
            for (row, dir) in block.iter_mut().zip([contact.normal, u, v]) {
                row.add3(start + contact.a as usize * 3, -dir);
                row.add3(start + contact.b as usize * 3, dir);
            }
        }
        self.boundary.build_d(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (pair_b, boundary_b) = rows.b.split_at_mut(self.pair_rows());
        let recovery = self.params.contact.contact_recovery_speed;
        for (contact, block) in self.contacts.iter().zip(pair_b.chunks_mut(self.stride())) {
            block.fill(0.0);
            block[0] = (-contact.depth / ctx.dt).max(-recovery);
        }
        self.boundary.build_b(boundary_b, ctx.dt, recovery);
    }

    fn build_e(&self, _ctx: &StepContext, rows: &mut RowBlock) {
        rows.e.fill(self.params.contact.contact_compliance);
    }

    fn pre_solve(&mut self, _ctx: &StepContext, _dofs: &mut DofBlock, gamma: &mut [Real]) {
        warm_start(&self.gamma_old, gamma);
    }

    fn project(&self, gamma: &mut [Real]) {
        let c = &self.params.contact;
        let (pair_gamma, boundary_gamma) = gamma.split_at_mut(self.pair_rows());
        for block in pair_gamma.chunks_mut(self.stride()) {
            project_contact(block, c.contact_mu, c.contact_cohesion);
        }
        self.boundary.project(boundary_gamma, c.contact_cohesion);
    }

    fn post_solve(&mut self, _ctx: &StepContext, v: &[Real], gamma: &[Real]) {
        read_velocities(v, &mut self.velocities);
        self.gamma_old.clear();
        self.gamma_old.extend_from_slice(gamma);
    }

    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView) {
        self.forces.clear();
        let split = self.pair_rows();
        self.boundary.accumulate_forces(
            &rows.rows[split..],
            &rows.gamma[split..],
            ctx.bodies,
            ctx.dt,
            &mut self.forces,
        );
    }

    fn update_position(&mut self, ctx: &StepContext) {
        let max_speed = self.params.contact.max_velocity;
        for (x, v) in self.positions.iter_mut().zip(self.velocities.iter_mut()) {
            *v = clamp_speed(*v, max_speed);
            *x += *v * ctx.dt;
        }
    }

    fn contact_forces(&self) -> &ContactForces {
        &self.forces
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContactParams;
    use crate::core::{ContainerCounts, GlobalSystem, OffsetTable};

    fn container(mu: Real) -> RigidContainer {
        let params = RigidParams {
            contact: ContactParams::default()
                .with_kernel_radius(0.1)
                .with_friction(mu),
            mass: 2.0,
        };
        let mut c = RigidContainer::new(params).unwrap();
        c.add_nodes(
            &[Vector::ZERO, Vector::new(0.09, 0.0, 0.0)],
            &[Vector::ZERO, Vector::ZERO],
        )
        .unwrap();
        c
    }

    fn ctx(bodies: &RigidBodySet) -> StepContext<'_> {
        StepContext {
            dt: 0.01,
            time: 0.0,
            gravity: Vector::ZERO,
            bodies,
        }
    }

    #[test]
    fn overlapping_pair_yields_cone_rows() {
        let bodies = RigidBodySet::new();
        let ctx = ctx(&bodies);
        let mut c = container(0.5);
        let contacts = ContactSet {
            pairs: vec![[0, 1]],
            boundary: vec![],
        };
        c.update(&ctx, &contacts);
        assert_eq!(c.num_constraints(), 3);

        let table = OffsetTable::build(0, [c.counts()]);
        let offsets = *table.get(0).unwrap();
        c.setup(offsets);
        let mut system = GlobalSystem::new();
        system.reset(&table);
        let mut rows = system.row_block(&offsets);
        c.generate_sparsity(&ctx, &mut rows);
        c.build_d(&ctx, &mut rows);
        c.build_b(&ctx, &mut rows);

        assert_eq!(rows.rows[0].value3_at(0), -Vector::X);
        assert_eq!(rows.rows[0].value3_at(3), Vector::X);
        // depth 0.01 over dt 0.01 asks for 1 m/s, capped at the recovery speed
        assert!((rows.b[0] + 0.6).abs() < 1e-6);
        assert_eq!(rows.b[1], 0.0);
    }

    #[test]
    fn frictionless_pairs_use_single_rows() {
        let bodies = RigidBodySet::new();
        let ctx = ctx(&bodies);
        let mut c = container(0.0);
        c.update(
            &ctx,
            &ContactSet {
                pairs: vec![[0, 1]],
                boundary: vec![],
            },
        );
        assert_eq!(
            c.counts(),
            ContainerCounts {
                num_dofs: 6,
                num_rows: 1
            }
        );
    }

    #[test]
    fn mass_blocks_are_consistent() {
        let c = container(0.5);
        let mut mass = vec![0.0; 6];
        let mut inv = vec![0.0; 6];
        let mut v = vec![0.0; 6];
        let mut hf = vec![0.0; 6];
        let mut dofs = DofBlock {
            start: 0,
            v: &mut v,
            hf: &mut hf,
            mass: &mut mass,
            inv_mass: &mut inv,
        };
        c.compute_mass(&mut dofs);
        c.compute_inv_mass(&mut dofs);
        for (m, i) in dofs.mass.iter().zip(dofs.inv_mass.iter()) {
            assert!((m * i - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn remove_nodes_returns_remap() {
        let mut c = container(0.5);
        let remap = c.remove_nodes(|i, _, _| i == 0);
        assert_eq!(remap, vec![None, Some(0)]);
        assert_eq!(c.num_nodes(), 1);
        assert_eq!(c.positions()[0], Vector::new(0.09, 0.0, 0.0));
    }
}
