//! The coordinating outer loop.
//!
//! [`DofSystem`] owns the rigid bodies and every container, lays out the
//! global velocity vector and constraint rows each step and runs the cone
//! solver over them. Containers only see their own ranges.

use bevy::log::debug;
use bevy::prelude::Resource;

use crate::collision::{ContactDetector, ContactSet, SpatialHashDetector};
use crate::config::SolverParams;
use crate::containers::AnyContainer;
use crate::core::{
    BODY_DOFS, BodyHandle, ContainerId, DofContainer, GlobalSystem, OffsetTable, RigidBodySet,
    StepContext,
};
use crate::error::ConfigResult;
use crate::math::{Real, Vector};
use crate::solver::{Apgd, ConeProblem, ConjugateGradient, GridSolver, SolveReport};

/// Fixed steps run per call to [`DofSystem::advance`] at most.
const MAX_SUBSTEPS: usize = 4;

#[derive(Resource)]
pub struct DofSystem {
    params: SolverParams,
    bodies: RigidBodySet,
    containers: Vec<AnyContainer>,
    contacts: Vec<ContactSet>,
    detector: Box<dyn ContactDetector>,
    grid_solver: Box<dyn GridSolver>,
    table: OffsetTable,
    global: GlobalSystem,
    time: Real,
    accumulator: Real,
    last_report: SolveReport,
}

impl DofSystem {
    pub fn new(params: SolverParams) -> ConfigResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            bodies: RigidBodySet::new(),
            containers: Vec::new(),
            contacts: Vec::new(),
            detector: Box::new(SpatialHashDetector::new()),
            grid_solver: Box::new(ConjugateGradient::default()),
            table: OffsetTable::default(),
            global: GlobalSystem::new(),
            time: 0.0,
            accumulator: 0.0,
            last_report: SolveReport::default(),
        })
    }

    pub fn with_detector(mut self, detector: Box<dyn ContactDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_grid_solver(mut self, solver: Box<dyn GridSolver>) -> Self {
        self.grid_solver = solver;
        self
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    pub fn bodies(&self) -> &RigidBodySet {
        &self.bodies
    }

    pub fn bodies_mut(&mut self) -> &mut RigidBodySet {
        &mut self.bodies
    }

    pub fn time(&self) -> Real {
        self.time
    }

    /// Cone solver statistics of the last step.
    pub fn last_report(&self) -> SolveReport {
        self.last_report
    }

    /// Layout of the last step.
    pub fn offsets(&self) -> &OffsetTable {
        &self.table
    }

    pub fn global(&self) -> &GlobalSystem {
        &self.global
    }

    /// Initializes `container` against the current bodies and registers it
    /// after the existing ones.
    pub fn add_container(
        &mut self,
        container: impl Into<AnyContainer>,
    ) -> ConfigResult<ContainerId> {
        let mut container = container.into();
        container.initialize(&self.bodies)?;
        self.containers.push(container);
        Ok(ContainerId(self.containers.len() - 1))
    }

    pub fn container(&self, id: ContainerId) -> Option<&AnyContainer> {
        self.containers.get(id.index())
    }

    pub fn container_mut(&mut self, id: ContainerId) -> Option<&mut AnyContainer> {
        self.containers.get_mut(id.index())
    }

    pub fn containers(&self) -> &[AnyContainer] {
        &self.containers
    }

    /// Net contact force on `body` from every container, last step.
    pub fn body_contact_force(&self, body: BodyHandle) -> Vector {
        self.containers
            .iter()
            .filter_map(|c| c.body_contact_force(body))
            .sum()
    }

    pub fn body_contact_torque(&self, body: BodyHandle) -> Vector {
        self.containers
            .iter()
            .filter_map(|c| c.body_contact_torque(body))
            .sum()
    }

    /// Runs as many fixed steps as fit in `elapsed` plus the carried remainder.
    pub fn advance(&mut self, elapsed: Real) -> usize {
        let dt = self.params.dt;
        self.accumulator = (self.accumulator + elapsed).min(dt * MAX_SUBSTEPS as Real);
        let mut steps = 0;
        while self.accumulator >= dt {
            self.step();
            self.accumulator -= dt;
            steps += 1;
        }
        steps
    }

    pub fn step(&mut self) {
        self.step_dt(self.params.dt);
    }

    pub fn step_dt(&mut self, dt: Real) {
        let Self {
            params,
            bodies,
            containers,
            contacts,
            detector,
            grid_solver,
            table,
            global,
            time,
            last_report,
            ..
        } = self;

        for container in containers.iter_mut() {
            container.compute_dof();
        }

        contacts.resize_with(containers.len(), ContactSet::default);
        for (container, set) in containers.iter().zip(contacts.iter_mut()) {
            *set = detector.detect(container.positions(), &container.contact_query(), bodies);
        }

        let ctx = StepContext {
            dt,
            time: *time,
            gravity: params.gravity,
            bodies: &*bodies,
        };
        for (container, set) in containers.iter_mut().zip(contacts.iter()) {
            container.update(&ctx, set);
        }

        *table = OffsetTable::build(bodies.num_dofs(), containers.iter().map(|c| c.counts()));
        for (container, offsets) in containers.iter_mut().zip(table.iter()) {
            container.setup(*offsets);
        }
        global.reset(table);
        load_bodies(global, bodies, params.gravity, dt);

        for container in containers.iter_mut() {
            let offsets = container.offsets();
            {
                let mut dofs = global.dof_block(&offsets);
                container.compute_mass(&mut dofs);
                container.compute_inv_mass(&mut dofs);
                container.load_velocities(&ctx, &mut dofs);
            }
            {
                let mut rows = global.row_block(&offsets);
                container.generate_sparsity(&ctx, &mut rows);
                container.build_d(&ctx, &mut rows);
                container.build_b(&ctx, &mut rows);
                container.build_e(&ctx, &mut rows);
            }
            let (mut dofs, gamma) = global.dof_block_with_gamma(&offsets);
            container.pre_solve(&ctx, &mut dofs, gamma);
        }
        global.compute_free_velocity();
        global.compute_rhs();

        debug!(
            "step t={:.4}: {} dofs ({} rigid), {} rows, {} non-zeros, {} containers",
            *time,
            table.total_dofs(),
            table.rigid_dofs(),
            table.total_rows(),
            global.num_non_zeros(),
            containers.len()
        );

        let apgd = Apgd::new(params.max_iterations, params.tolerance);
        let mut gamma = std::mem::take(&mut global.gamma);
        {
            let mut problem = StepProblem {
                ctx,
                containers: &mut containers[..],
                global: &mut *global,
                grid_solver: grid_solver.as_mut(),
            };
            *last_report = apgd.solve(&mut problem, &mut gamma);
        }
        global.gamma = gamma;
        global.finalize_velocity();

        for container in containers.iter_mut() {
            let offsets = container.offsets();
            container.post_solve(
                &ctx,
                &global.v[offsets.dofs()],
                &global.gamma[offsets.rows()],
            );
            container.calculate_contact_forces(&ctx, global.row_view(&offsets));
            container.update_position(&ctx);
        }

        store_bodies(global, bodies, dt);
        *time += dt;
    }
}

/// Writes mass, inertia, velocity and gravity impulse of every live body.
fn load_bodies(global: &mut GlobalSystem, bodies: &RigidBodySet, gravity: Vector, dt: Real) {
    for (handle, body) in bodies.iter() {
        let slot = handle.index();
        let col = slot * BODY_DOFS;
        let inv_mass = body.inv_mass();
        global.mass[col..col + 3].fill(body.mass);
        global.inv_mass[col..col + 3].fill(inv_mass);
        global.mass[col + 3..col + 6].copy_from_slice(&body.inertia.to_array());
        global.body_inv_inertia[slot] = body.world_inv_inertia();
        body.linear_velocity
            .write_to_slice(&mut global.v[col..col + 3]);
        body.angular_velocity
            .write_to_slice(&mut global.v[col + 3..col + 6]);
        if inv_mass > 0.0 {
            (gravity * body.mass * dt).write_to_slice(&mut global.hf[col..col + 3]);
        }
    }
}

/// Reads solved body velocities back and advances the poses.
fn store_bodies(global: &GlobalSystem, bodies: &mut RigidBodySet, dt: Real) {
    for (handle, body) in bodies.iter_mut() {
        if body.fixed {
            continue;
        }
        let col = handle.index() * BODY_DOFS;
        body.linear_velocity = Vector::from_slice(&global.v[col..col + 3]);
        body.angular_velocity = Vector::from_slice(&global.v[col + 3..col + 6]);
        body.integrate(dt);
    }
}

/// The cone problem of one step, as seen by the solver.
struct StepProblem<'a, 'b> {
    ctx: StepContext<'a>,
    containers: &'b mut [AnyContainer],
    global: &'b mut GlobalSystem,
    grid_solver: &'b mut dyn GridSolver,
}

impl ConeProblem for StepProblem<'_, '_> {
    fn num_rows(&self) -> usize {
        self.global.num_rows()
    }

    fn apply_schur(&self, gamma: &[Real], out: &mut [Real]) {
        self.global.apply_schur(gamma, out);
    }

    fn rhs(&self) -> &[Real] {
        &self.global.rhs
    }

    fn project(&self, gamma: &mut [Real]) {
        for container in self.containers.iter() {
            let rows = container.offsets().rows();
            if !rows.is_empty() {
                container.project(&mut gamma[rows]);
            }
        }
    }

    fn begin_iteration(&mut self, _iteration: usize) -> bool {
        let mut changed = false;
        for container in self.containers.iter_mut() {
            let offsets = container.offsets();
            let mut dofs = self.global.dof_block(&offsets);
            container.inner_solve(&self.ctx, &mut dofs, self.grid_solver);
            changed |= container.update_rhs();
        }
        if changed {
            self.global.compute_free_velocity();
            self.global.compute_rhs();
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContactParams, FluidParams, RigidParams};
    use crate::containers::{FluidContainer, RigidContainer};
    use crate::core::{RigidBody, RigidShape};

    fn ground(system: &mut DofSystem) -> BodyHandle {
        system.bodies_mut().insert(
            RigidBody::fixed(Vector::ZERO).with_shape(RigidShape::Plane { normal: Vector::Y }),
        )
    }

    #[test]
    fn offsets_are_disjoint_and_cover_the_system() {
        let mut system = DofSystem::new(SolverParams::default()).unwrap();
        ground(&mut system);
        let mut granular = RigidContainer::new(RigidParams::default()).unwrap();
        granular
            .add_nodes(
                &[Vector::new(0.0, 0.01, 0.0), Vector::new(0.5, 0.01, 0.0)],
                &[Vector::ZERO; 2],
            )
            .unwrap();
        system.add_container(granular).unwrap();
        let mut fluid = FluidContainer::new(FluidParams::default()).unwrap();
        fluid
            .add_nodes(&[Vector::new(2.0, 1.0, 0.0)], &[Vector::ZERO])
            .unwrap();
        system.add_container(fluid).unwrap();
        system.step();

        let table = system.offsets();
        let mut dof_cursor = table.rigid_dofs();
        let mut row_cursor = 0;
        for offsets in table.iter() {
            assert_eq!(offsets.dof_start, dof_cursor);
            assert_eq!(offsets.row_start, row_cursor);
            dof_cursor += offsets.num_dofs;
            row_cursor += offsets.num_rows;
        }
        assert_eq!(dof_cursor, table.total_dofs());
        assert_eq!(row_cursor, table.total_rows());
        assert_eq!(system.global().num_rows(), table.total_rows());

        let ctx = StepContext {
            dt: system.params().dt,
            time: system.time(),
            gravity: system.params().gravity,
            bodies: system.bodies(),
        };
        let counted: usize = system
            .containers()
            .iter()
            .map(|c| c.num_non_zeros(&ctx))
            .sum();
        assert!(counted > 0);
        assert_eq!(counted, system.global().num_non_zeros());
    }

    #[test]
    fn nodes_can_be_moved_between_steps() {
        let mut system = DofSystem::new(SolverParams::default().with_gravity(Vector::ZERO)).unwrap();
        let mut granular = RigidContainer::new(RigidParams::default()).unwrap();
        granular
            .add_nodes(&[Vector::ZERO, Vector::X], &[Vector::ZERO; 2])
            .unwrap();
        let id = system.add_container(granular).unwrap();

        let container = system.container_mut(id).unwrap();
        assert!(container.set_position(1, Vector::new(0.0, 2.0, 0.0)));
        assert!(container.set_velocity(1, Vector::X));
        assert!(!container.set_position(2, Vector::ZERO));
        system.step();

        let dt = system.params().dt;
        let moved = system.container(id).unwrap().positions()[1];
        assert!((moved - Vector::new(dt, 2.0, 0.0)).length() < 1e-4, "{moved:?}");
    }

    #[test]
    fn free_body_falls_under_gravity() {
        let mut system = DofSystem::new(SolverParams::default()).unwrap();
        let body = system
            .bodies_mut()
            .insert(RigidBody::dynamic(Vector::new(0.0, 10.0, 0.0), 2.0, Vector::ONE));
        for _ in 0..10 {
            system.step();
        }
        let v = system.bodies().get(body).unwrap().linear_velocity;
        let expected = system.params().gravity * system.params().dt * 10.0;
        assert!((v - expected).length() < 1e-4);
    }

    #[test]
    fn resting_node_pushes_on_the_ground() {
        let params = SolverParams::default().with_max_iterations(200);
        let mut system = DofSystem::new(params).unwrap();
        let plane = ground(&mut system);
        let contact = ContactParams::default()
            .with_friction(0.0)
            .with_envelope(0.01);
        let node_mass = 0.5;
        let mut granular = RigidContainer::new(RigidParams {
            contact,
            mass: node_mass,
        })
        .unwrap();
        let resting = 0.5 * contact.kernel_radius;
        granular
            .add_nodes(&[Vector::new(0.0, resting, 0.0)], &[Vector::ZERO])
            .unwrap();
        system.add_container(granular).unwrap();
        for _ in 0..20 {
            system.step();
        }
        let force = system.body_contact_force(plane);
        let weight = system.params().gravity * node_mass;
        // the node's weight is carried by the plane
        assert!((force - weight).length() < 0.05 * weight.length(), "{force:?}");
    }

    #[test]
    fn advance_runs_whole_steps() {
        let mut system = DofSystem::new(SolverParams::default().with_dt(0.01)).unwrap();
        assert_eq!(system.advance(0.025), 2);
        assert_eq!(system.advance(0.006), 1);
        assert!((system.time() - 0.03).abs() < 1e-6);
    }
}
