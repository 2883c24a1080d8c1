//! SPH fluid with a regularized density constraint per node.
//!
//! Density comes from a cubic-spline summation over the pairs reported by the
//! collision stage, corrected with a Shepard normalization so that nodes near
//! free surfaces and walls are not under-dense. Each node contributes one
//! bilateral row `C_i = 1 - rho_i / rho0`. Viscosity and artificial pressure
//! are explicit and enter through the free impulse.

use bevy::log::{info, warn};

use crate::collision::{ContactQuery, ContactSet};
use crate::config::{DENSITY_FLOOR_RATIO, FluidParams};
use crate::core::{
    BoundaryRows, ContactForces, ContainerKind, ContainerOffsets, CubicSpline, DofBlock,
    DofContainer, NeighborGrid, NodeStencil, RigidBodySet, RowBlock, RowView, StepContext,
    check_offsets, project_unilateral, warm_start,
};
use crate::error::{ConfigError, ConfigResult};
use crate::math::{Matrix, Real, Vector, deviatoric_part, outer_product, symmetric_part};

use super::{clamp_speed, read_velocities, removal_remap, retain_by};

/// Neighbor pair with its kernel value and `∇_i W(x_i - x_j)`.
#[derive(Copy, Clone, Debug, PartialEq)]
struct FluidPair {
    i: u32,
    j: u32,
    w: Real,
    grad: Vector,
}

#[derive(Clone, Debug)]
pub struct FluidContainer {
    params: FluidParams,
    kernel: CubicSpline,
    mass: Real,
    positions: Vec<Vector>,
    velocities: Vec<Vector>,
    density: Vec<Real>,
    shear: Vec<Matrix>,
    shear_trace: Vec<Real>,
    explicit_accel: Vec<Vector>,
    pairs: Vec<FluidPair>,
    boundary: BoundaryRows,
    offsets: ContainerOffsets,
    gamma_old: Vec<Real>,
    forces: ContactForces,
}

impl FluidContainer {
    pub fn new(params: FluidParams) -> ConfigResult<Self> {
        params.validate()?;
        Ok(Self {
            kernel: CubicSpline::new(params.contact.kernel_radius),
            mass: params.mass,
            params,
            positions: Vec::new(),
            velocities: Vec::new(),
            density: Vec::new(),
            shear: Vec::new(),
            shear_trace: Vec::new(),
            explicit_accel: Vec::new(),
            pairs: Vec::new(),
            boundary: BoundaryRows::default(),
            offsets: ContainerOffsets::default(),
            gamma_old: Vec::new(),
            forces: ContactForces::default(),
        })
    }

    pub fn params(&self) -> &FluidParams {
        &self.params
    }

    /// Node mass in use, which differs from `params.mass` when it was derived
    /// from the initial cloud.
    pub fn mass(&self) -> Real {
        self.mass
    }

    pub fn density(&self) -> &[Real] {
        &self.density
    }

    pub fn shear(&self) -> &[Matrix] {
        &self.shear
    }

    pub fn shear_trace(&self) -> &[Real] {
        &self.shear_trace
    }

    pub fn add_nodes(&mut self, positions: &[Vector], velocities: &[Vector]) -> ConfigResult<()> {
        if positions.len() != velocities.len() {
            return Err(ConfigError::LengthMismatch(positions.len(), velocities.len()));
        }
        self.positions.extend_from_slice(positions);
        self.velocities.extend_from_slice(velocities);
        self.resize_state();
        self.gamma_old.clear();
        Ok(())
    }

    pub fn remove_nodes<F>(&mut self, mut predicate: F) -> Vec<Option<usize>>
    where
        F: FnMut(usize, Vector, Vector) -> bool,
    {
        let keep: Vec<bool> = (0..self.positions.len())
            .map(|i| !predicate(i, self.positions[i], self.velocities[i]))
            .collect();
        retain_by(&mut self.positions, &keep);
        retain_by(&mut self.velocities, &keep);
        retain_by(&mut self.density, &keep);
        retain_by(&mut self.shear, &keep);
        retain_by(&mut self.shear_trace, &keep);
        retain_by(&mut self.explicit_accel, &keep);
        self.pairs.clear();
        self.boundary.clear();
        self.gamma_old.clear();
        removal_remap(&keep)
    }

    fn resize_state(&mut self) {
        let n = self.positions.len();
        self.density.resize(n, self.params.rho);
        self.shear.resize(n, Matrix::ZERO);
        self.shear_trace.resize(n, 0.0);
        self.explicit_accel.resize(n, Vector::ZERO);
    }

    fn stencil(&self) -> NodeStencil {
        NodeStencil {
            dof_start: self.offsets.dof_start,
        }
    }

    /// Kernel summation followed by the Shepard correction.
    fn compute_density(&mut self) {
        let m = self.mass;
        let w0 = self.kernel.w(0.0);
        let mut raw = vec![m * w0; self.positions.len()];
        for p in &self.pairs {
            raw[p.i as usize] += m * p.w;
            raw[p.j as usize] += m * p.w;
        }

        let mut shepard: Vec<Real> = raw.iter().map(|rho| m / rho * w0).collect();
        for p in &self.pairs {
            shepard[p.i as usize] += m / raw[p.j as usize] * p.w;
            shepard[p.j as usize] += m / raw[p.i as usize] * p.w;
        }

        let floor = DENSITY_FLOOR_RATIO * self.params.rho;
        let mut floored = 0;
        for ((rho, raw), s) in self.density.iter_mut().zip(&raw).zip(&shepard) {
            *rho = raw / s;
            if !(*rho >= floor) {
                *rho = floor;
                floored += 1;
            }
        }
        if floored > 0 {
            warn!("{floored} fluid nodes hit the density floor");
        }
    }

    fn compute_shear(&mut self) {
        let m = self.mass;
        let mut grad_v = vec![Matrix::ZERO; self.positions.len()];
        for p in &self.pairs {
            let (i, j) = (p.i as usize, p.j as usize);
            let dv = self.velocities[j] - self.velocities[i];
            grad_v[i] += outer_product(dv * (m / self.density[j]), p.grad);
            // ∇_j W_ji = -grad, and v_i - v_j = -dv
            grad_v[j] += outer_product(dv * (m / self.density[i]), p.grad);
        }
        for ((s, tr), g) in self
            .shear
            .iter_mut()
            .zip(self.shear_trace.iter_mut())
            .zip(&grad_v)
        {
            *s = symmetric_part(g);
            *tr = s.x_axis.x + s.y_axis.y + s.z_axis.z;
        }
    }

    fn compute_explicit_forces(&mut self) {
        self.explicit_accel.fill(Vector::ZERO);
        let m = self.mass;

        if self.params.enable_viscosity && self.params.viscosity > 0.0 {
            let eta = self.params.viscosity;
            let stress: Vec<Matrix> = self
                .shear
                .iter()
                .zip(&self.density)
                .map(|(s, rho)| deviatoric_part(s) * (2.0 * eta / (rho * rho)))
                .collect();
            for p in &self.pairs {
                let (i, j) = (p.i as usize, p.j as usize);
                let a = (stress[i] + stress[j]) * p.grad * m;
                self.explicit_accel[i] += a;
                self.explicit_accel[j] -= a;
            }
        }

        if self.params.artificial_pressure {
            let k = self.params.artificial_pressure_k;
            let n = self.params.artificial_pressure_n;
            let w_dq = self.kernel.w(self.params.artificial_pressure_dq);
            if w_dq > 0.0 {
                for p in &self.pairs {
                    let s = k * (p.w / w_dq).powf(n);
                    let a = p.grad * (m * s);
                    self.explicit_accel[p.i as usize] -= a;
                    self.explicit_accel[p.j as usize] += a;
                }
            }
        }
    }

    fn density_rows(&self) -> usize {
        self.positions.len()
    }

    fn relaxation(&self, dt: Real) -> Real {
        1.0 + 4.0 * self.params.tau / dt
    }
}

impl DofContainer for FluidContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Fluid
    }

    fn initialize(&mut self, _bodies: &RigidBodySet) -> ConfigResult<()> {
        self.resize_state();
        if self.params.initialize_mass && !self.positions.is_empty() {
            let h = self.kernel.support();
            let grid = NeighborGrid::build(h, &self.positions);
            let densest = self
                .positions
                .iter()
                .map(|p| {
                    let mut sum = 0.0;
                    grid.for_each_within(&self.positions, *p, h, |j| {
                        sum += self.kernel.w((self.positions[j] - *p).length());
                    });
                    sum
                })
                .fold(0.0, Real::max);
            if densest > 0.0 {
                self.mass = self.params.rho / densest;
            }
        }
        info!(
            "fluid container: {} nodes, h {}, mass {:.4e}, rho0 {}",
            self.positions.len(),
            self.kernel.support(),
            self.mass,
            self.params.rho
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
            pair_radius: Some(c.kernel_radius),
            point_radius: 0.5 * c.kernel_radius,
            envelope: c.collision_envelope,
            filter: c.collision_filter,
        }
    }

    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet) {
        self.resize_state();
        self.pairs.clear();
        for &[i, j] in &contacts.pairs {
            let rij = self.positions[i as usize] - self.positions[j as usize];
            let r = rij.length();
            let w = self.kernel.w(r);
            if w <= 0.0 {
                continue;
            }
            self.pairs.push(FluidPair {
                i,
                j,
                w,
                grad: self.kernel.grad_w(rij),
            });
        }
        self.compute_density();
        self.compute_shear();
        self.compute_explicit_forces();
        self.boundary
            .update(&contacts.boundary, ctx.bodies, &self.params.contact);
    }

    fn num_dofs(&self) -> usize {
        self.positions.len() * 3
    }

    fn num_constraints(&self) -> usize {
        self.density_rows() + self.boundary.num_rows()
    }

    fn setup(&mut self, offsets: ContainerOffsets) {
        check_offsets(self.kind(), &offsets, self.counts());
        self.offsets = offsets;
    }

    fn offsets(&self) -> ContainerOffsets {
        self.offsets
    }

    fn compute_mass(&self, dofs: &mut DofBlock) {
        dofs.mass.fill(self.mass);
    }

    fn compute_inv_mass(&self, dofs: &mut DofBlock) {
        dofs.inv_mass.fill(1.0 / self.mass);
    }

    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock) {
        for (i, (v, a)) in self.velocities.iter().zip(&self.explicit_accel).enumerate() {
            dofs.set_velocity3(i, *v);
            dofs.add_impulse3(i, (ctx.gravity + *a) * (self.mass * ctx.dt));
        }
    }

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let start = self.offsets.dof_start;
        let (density_rows, boundary_rows) = rows.rows.split_at_mut(self.density_rows());
        for (i, row) in density_rows.iter_mut().enumerate() {
            row.declare3(start + i * 3);
        }
        for p in &self.pairs {
            let (i, j) = (p.i as usize, p.j as usize);
            density_rows[i].declare3(start + j * 3);
            density_rows[j].declare3(start + i * 3);
        }
        self.boundary
            .generate_sparsity(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let start = self.offsets.dof_start;
        let scale = self.mass / self.params.rho;
        let (density_rows, boundary_rows) = rows.rows.split_at_mut(self.density_rows());
        for p in &self.pairs {
            let (i, j) = (p.i as usize, p.j as usize);
            let g = p.grad * scale;
            density_rows[i].add3(start + i * 3, -g);
            density_rows[i].add3(start + j * 3, g);
            density_rows[j].add3(start + j * 3, g);
            density_rows[j].add3(start + i * 3, -g);
        }
        self.boundary.build_d(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (density_b, boundary_b) = rows.b.split_at_mut(self.density_rows());
        let k = 4.0 / (ctx.dt * self.relaxation(ctx.dt));
        for (b, rho) in density_b.iter_mut().zip(&self.density) {
            *b = k * (1.0 - rho / self.params.rho);
        }
        self.boundary.build_b(
            boundary_b,
            ctx.dt,
            self.params.contact.contact_recovery_speed,
        );
    }

    fn build_e(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (density_e, boundary_e) = rows.e.split_at_mut(self.density_rows());
        let e = 4.0 * self.params.epsilon / (ctx.dt * ctx.dt * self.relaxation(ctx.dt));
        density_e.fill(e);
        self.boundary
            .build_e(boundary_e, self.params.contact.contact_compliance);
    }

    fn pre_solve(&mut self, _ctx: &StepContext, _dofs: &mut DofBlock, gamma: &mut [Real]) {
        warm_start(&self.gamma_old, gamma);
    }

    fn project(&self, gamma: &mut [Real]) {
        let cohesion = self.params.contact.contact_cohesion;
        let (density_gamma, boundary_gamma) = gamma.split_at_mut(self.density_rows());
        if cohesion > 0.0 {
            for g in density_gamma {
                project_unilateral(g, -cohesion);
            }
        }
        self.boundary.project(boundary_gamma, cohesion);
    }

    fn post_solve(&mut self, _ctx: &StepContext, v: &[Real], gamma: &[Real]) {
        read_velocities(v, &mut self.velocities);
        self.gamma_old.clear();
        self.gamma_old.extend_from_slice(gamma);
    }

    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView) {
        self.forces.clear();
        let split = self.density_rows();
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
