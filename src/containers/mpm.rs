//! Material point method on a collocated background grid.
//!
//! Per step:
//! 1. `compute_dof` fits a padded grid around the markers.
//! 2. `update` transfers mass and APIC momentum to the nodes (P2G).
//! 3. `pre_solve` evaluates the fixed-corotated stress of every marker.
//! 4. The first `inner_solve` of the step solves the implicit elastic update
//!    `(M + dt² K) dv = dt f` with the injected grid solver and folds `M dv`
//!    into the free impulse. Boundary contact rows are then solved with
//!    everything else.
//! 5. `post_solve` transfers the solved grid velocities back (G2P), updates
//!    `Fe` and splits off the plastic part.

use bevy::log::{debug, info};
use rayon::prelude::*;

use crate::collision::{ContactQuery, ContactSet};
use crate::config::{GRID_PADDING, MIN_GRID_MASS, MpmParams};
use crate::core::{
    BoundaryRows, ContactForces, ContainerKind, ContainerOffsets, DofBlock, DofContainer,
    GridInterpolation, GridLayout, PointStencil, RigidBodySet, RowBlock, RowView, StepContext,
    check_offsets, inv_d, warm_start,
};
use crate::error::{ConfigError, ConfigResult};
use crate::materials::{CorotatedStress, hardening_scale, split_deformation};
use crate::math::{Matrix, Real, Vector, identity_matrix, outer_product};
use crate::solver::{GridSolver, LinearOperator};

use super::{clamp_speed, removal_remap, retain_by};

/// Deformation state carried by one marker.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Marker {
    /// APIC affine velocity matrix.
    pub affine: Matrix,
    pub fe: Matrix,
    pub fp: Matrix,
    /// `det(Fp)`, drives hardening.
    pub det_fp: Real,
    pub volume: Real,
}

impl Default for Marker {
    fn default() -> Self {
        Self {
            affine: Matrix::ZERO,
            fe: identity_matrix(),
            fp: identity_matrix(),
            det_fp: 1.0,
            volume: 0.0,
        }
    }
}

/// Marker velocities read from the grid nodes around each marker.
pub(crate) struct GridStencil<'a> {
    pub dof_start: usize,
    pub layout: &'a GridLayout,
    pub interpolations: &'a [GridInterpolation],
}

impl PointStencil for GridStencil<'_> {
    fn for_each(&self, point: usize, f: &mut dyn FnMut(usize, Vector)) {
        for (coord, w, _, _) in self.interpolations[point].iter_neighbors() {
            if w <= 0.0 {
                continue;
            }
            if let Some(node) = self.layout.linear_index(coord) {
                f(self.dof_start + node * 3, Vector::splat(w));
            }
        }
    }
}

/// `M + dt² K` restricted to the nodes that carry mass.
struct ImplicitOperator<'a> {
    layout: &'a GridLayout,
    interpolations: &'a [GridInterpolation],
    markers: &'a [Marker],
    stress: &'a [CorotatedStress],
    node_mass: &'a [Real],
    /// Grid node to active slot.
    slot_of: &'a [Option<usize>],
    active: usize,
    dt: Real,
}

impl ImplicitOperator<'_> {
    fn node_stencil<'b>(
        &'b self,
        interp: &'b GridInterpolation,
    ) -> impl Iterator<Item = (usize, Vector)> + 'b {
        interp.iter_neighbors().filter_map(|(coord, w, grad, _)| {
            if w <= 0.0 {
                return None;
            }
            let node = self.layout.linear_index(coord)?;
            self.slot_of[node].map(|slot| (slot, grad))
        })
    }
}

impl LinearOperator for ImplicitOperator<'_> {
    fn dim(&self) -> usize {
        self.active * 3
    }

    fn apply(&self, x: &[Real], out: &mut [Real]) {
        let contributions: Vec<Matrix> = self
            .interpolations
            .par_iter()
            .zip(self.markers.par_iter().zip(self.stress.par_iter()))
            .map(|(interp, (marker, stress))| {
                let mut grad_dx = Matrix::ZERO;
                for (slot, grad) in self.node_stencil(interp) {
                    let dx = Vector::from_slice(&x[slot * 3..slot * 3 + 3]);
                    grad_dx += outer_product(dx, grad);
                }
                let df = grad_dx * marker.fe;
                stress.differential(&df) * marker.fe.transpose() * marker.volume
            })
            .collect();

        out.fill(0.0);
        let dt2 = self.dt * self.dt;
        for (interp, k) in self.interpolations.iter().zip(&contributions) {
            for (slot, grad) in self.node_stencil(interp) {
                let kx = *k * grad * dt2;
                out[slot * 3] += kx.x;
                out[slot * 3 + 1] += kx.y;
                out[slot * 3 + 2] += kx.z;
            }
        }
        for (node, slot) in self.slot_of.iter().enumerate() {
            if let Some(slot) = slot {
                let m = self.node_mass[node];
                for k in 0..3 {
                    out[slot * 3 + k] += m * x[slot * 3 + k];
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct MpmContainer {
    params: MpmParams,
    positions: Vec<Vector>,
    velocities: Vec<Vector>,
    markers: Vec<Marker>,
    layout: GridLayout,
    interpolations: Vec<GridInterpolation>,
    node_mass: Vec<Real>,
    node_velocity: Vec<Vector>,
    node_force: Vec<Vector>,
    stress: Vec<CorotatedStress>,
    boundary: BoundaryRows,
    offsets: ContainerOffsets,
    gamma_old: Vec<Real>,
    forces: ContactForces,
    elastic_solved: bool,
    rhs_dirty: bool,
}

impl MpmContainer {
    pub fn new(params: MpmParams) -> ConfigResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            positions: Vec::new(),
            velocities: Vec::new(),
            markers: Vec::new(),
            layout: GridLayout::default(),
            interpolations: Vec::new(),
            node_mass: Vec::new(),
            node_velocity: Vec::new(),
            node_force: Vec::new(),
            stress: Vec::new(),
            boundary: BoundaryRows::default(),
            offsets: ContainerOffsets::default(),
            gamma_old: Vec::new(),
            forces: ContactForces::default(),
            elastic_solved: false,
            rhs_dirty: false,
        })
    }

    pub fn params(&self) -> &MpmParams {
        &self.params
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn node_mass(&self) -> &[Real] {
        &self.node_mass
    }

    pub fn node_velocity(&self) -> &[Vector] {
        &self.node_velocity
    }

    pub fn add_nodes(&mut self, positions: &[Vector], velocities: &[Vector]) -> ConfigResult<()> {
        if positions.len() != velocities.len() {
            return Err(ConfigError::LengthMismatch(positions.len(), velocities.len()));
        }
        self.positions.extend_from_slice(positions);
        self.velocities.extend_from_slice(velocities);
        self.markers
            .resize(self.positions.len(), Marker::default());
        self.gamma_old.clear();
        Ok(())
    }

    pub fn remove_nodes<F>(&mut self, mut predicate: F) -> Vec<Option<usize>>
    where
        F: FnMut(usize, Vector, &Marker) -> bool,
    {
        let keep: Vec<bool> = (0..self.positions.len())
            .map(|i| !predicate(i, self.positions[i], &self.markers[i]))
            .collect();
        retain_by(&mut self.positions, &keep);
        retain_by(&mut self.velocities, &keep);
        retain_by(&mut self.markers, &keep);
        self.interpolations.clear();
        self.stress.clear();
        self.boundary.clear();
        self.gamma_old.clear();
        removal_remap(&keep)
    }

    fn fit_grid(&mut self) {
        self.layout = GridLayout::fit(
            self.positions.iter().copied(),
            self.params.bin_edge,
            GRID_PADDING,
            self.params.bounding_box.as_ref(),
        );
        let layout = self.layout;
        self.interpolations = self
            .positions
            .par_iter()
            .map(|x| layout.interpolation(*x))
            .collect();
    }

    fn transfer_to_grid(&mut self) {
        let n = self.layout.num_nodes();
        self.node_mass.clear();
        self.node_mass.resize(n, 0.0);
        let mut momentum = vec![Vector::ZERO; n];
        let m = self.params.mass;

        for ((interp, v), marker) in self
            .interpolations
            .iter()
            .zip(&self.velocities)
            .zip(&self.markers)
        {
            for (coord, w, _, d) in interp.iter_neighbors() {
                let Some(node) = self.layout.linear_index(coord) else {
                    continue;
                };
                self.node_mass[node] += w * m;
                momentum[node] += (*v + marker.affine * d) * (w * m);
            }
        }

        self.node_velocity = self
            .node_mass
            .iter()
            .zip(&momentum)
            .map(|(mass, p)| {
                if *mass > MIN_GRID_MASS {
                    *p / *mass
                } else {
                    Vector::ZERO
                }
            })
            .collect();
    }

    fn stencil(&self) -> GridStencil<'_> {
        GridStencil {
            dof_start: self.offsets.dof_start,
            layout: &self.layout,
            interpolations: &self.interpolations,
        }
    }

    fn compute_stress(&mut self) {
        let (mu, lambda, xi) = (
            self.params.mu,
            self.params.lambda,
            self.params.hardening_coefficient,
        );
        self.stress = self
            .markers
            .par_iter()
            .map(|marker| {
                let scale = hardening_scale(xi, marker.det_fp);
                CorotatedStress::evaluate(&marker.fe, mu * scale, lambda * scale)
            })
            .collect();

        self.node_force.clear();
        self.node_force.resize(self.layout.num_nodes(), Vector::ZERO);
        for ((interp, marker), stress) in self
            .interpolations
            .iter()
            .zip(&self.markers)
            .zip(&self.stress)
        {
            let k = stress.piola * marker.fe.transpose() * marker.volume;
            for (coord, w, grad, _) in interp.iter_neighbors() {
                if w <= 0.0 {
                    continue;
                }
                if let Some(node) = self.layout.linear_index(coord) {
                    self.node_force[node] -= k * grad;
                }
            }
        }
    }
}

impl DofContainer for MpmContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Mpm
    }

    /// Marker volumes from the grid density of the initial cloud.
    fn initialize(&mut self, _bodies: &RigidBodySet) -> ConfigResult<()> {
        self.markers
            .resize(self.positions.len(), Marker::default());
        self.fit_grid();
        self.transfer_to_grid();

        let h3 = self.params.bin_edge.powi(3);
        let m = self.params.mass;
        for (interp, marker) in self.interpolations.iter().zip(self.markers.iter_mut()) {
            let mut density = 0.0;
            for (coord, w, _, _) in interp.iter_neighbors() {
                if let Some(node) = self.layout.linear_index(coord) {
                    density += self.node_mass[node] * w / h3;
                }
            }
            marker.volume = if density > 0.0 { m / density } else { h3 };
        }

        info!(
            "mpm container: {} markers, grid {:?} (bin edge {}), mu {:.3e}, lambda {:.3e}",
            self.positions.len(),
            self.layout.dims,
            self.params.bin_edge,
            self.params.mu,
            self.params.lambda
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
            pair_radius: None,
            point_radius: c.kernel_radius,
            envelope: c.collision_envelope,
            filter: c.collision_filter,
        }
    }

    fn compute_dof(&mut self) {
        self.fit_grid();
    }

    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet) {
        self.transfer_to_grid();
        self.boundary
            .update(&contacts.boundary, ctx.bodies, &self.params.contact);
        self.elastic_solved = false;
        self.rhs_dirty = false;
    }

    fn num_dofs(&self) -> usize {
        self.layout.num_nodes() * 3
    }

    fn num_constraints(&self) -> usize {
        self.boundary.num_rows()
    }

    fn setup(&mut self, offsets: ContainerOffsets) {
        check_offsets(self.kind(), &offsets, self.counts());
        self.offsets = offsets;
    }

    fn offsets(&self) -> ContainerOffsets {
        self.offsets
    }

    fn compute_mass(&self, dofs: &mut DofBlock) {
        for (node, m) in self.node_mass.iter().enumerate() {
            dofs.set_mass3(node, *m);
        }
    }

    fn compute_inv_mass(&self, dofs: &mut DofBlock) {
        for (node, m) in self.node_mass.iter().enumerate() {
            let inv = if *m > MIN_GRID_MASS { 1.0 / m } else { 0.0 };
            dofs.set_inv_mass3(node, inv);
        }
    }

    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock) {
        for (node, (v, m)) in self.node_velocity.iter().zip(&self.node_mass).enumerate() {
            dofs.set_velocity3(node, *v);
            if *m > MIN_GRID_MASS {
                dofs.add_impulse3(node, ctx.gravity * (m * ctx.dt));
            }
        }
    }

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock) {
        self.boundary
            .generate_sparsity(rows.rows, ctx.bodies, &self.stencil());
    }

    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock) {
        self.boundary.build_d(rows.rows, ctx.bodies, &self.stencil());
    }

    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock) {
        self.boundary
            .build_b(rows.b, ctx.dt, self.params.contact.contact_recovery_speed);
    }

    fn build_e(&self, _ctx: &StepContext, rows: &mut RowBlock) {
        self.boundary
            .build_e(rows.e, self.params.contact.contact_compliance);
    }

    fn pre_solve(&mut self, _ctx: &StepContext, _dofs: &mut DofBlock, gamma: &mut [Real]) {
        warm_start(&self.gamma_old, gamma);
        self.compute_stress();
    }

    fn inner_solve(
        &mut self,
        ctx: &StepContext,
        dofs: &mut DofBlock,
        solver: &mut dyn GridSolver,
    ) {
        if self.elastic_solved {
            return;
        }
        self.elastic_solved = true;

        let mut slot_of = vec![None; self.node_mass.len()];
        let mut active = 0;
        for (node, m) in self.node_mass.iter().enumerate() {
            if *m > MIN_GRID_MASS {
                slot_of[node] = Some(active);
                active += 1;
            }
        }
        if active == 0 {
            return;
        }

        let mut rhs = vec![0.0; active * 3];
        for (node, slot) in slot_of.iter().enumerate() {
            if let Some(slot) = slot {
                (self.node_force[node] * ctx.dt).write_to_slice(&mut rhs[slot * 3..slot * 3 + 3]);
            }
        }
        if rhs.iter().all(|r| *r == 0.0) {
            return;
        }

        let op = ImplicitOperator {
            layout: &self.layout,
            interpolations: &self.interpolations,
            markers: &self.markers,
            stress: &self.stress,
            node_mass: &self.node_mass,
            slot_of: &slot_of,
            active,
            dt: ctx.dt,
        };
        let mut dv = vec![0.0; active * 3];
        let report = solver.solve(&op, &rhs, &mut dv, self.params.contact.max_iterations);
        debug!(
            "mpm elastic solve: {} nodes, {} iterations, residual {:.3e}",
            active, report.iterations, report.residual
        );

        for (node, slot) in slot_of.iter().enumerate() {
            if let Some(slot) = slot {
                let dv = Vector::from_slice(&dv[slot * 3..slot * 3 + 3]);
                dofs.add_impulse3(node, dv * self.node_mass[node]);
            }
        }
        self.rhs_dirty = true;
    }

    fn update_rhs(&mut self) -> bool {
        std::mem::take(&mut self.rhs_dirty)
    }

    fn project(&self, gamma: &mut [Real]) {
        self.boundary
            .project(gamma, self.params.contact.contact_cohesion);
    }

    fn post_solve(&mut self, ctx: &StepContext, v: &[Real], gamma: &[Real]) {
        self.gamma_old.clear();
        self.gamma_old.extend_from_slice(gamma);

        let solved: Vec<Vector> = (0..self.layout.num_nodes())
            .map(|node| Vector::from_slice(&v[node * 3..node * 3 + 3]))
            .collect();
        let layout = &self.layout;
        let old = &self.node_velocity;
        let params = &self.params;
        let d_inv = inv_d(params.bin_edge);
        let dt = ctx.dt;

        self.velocities
            .par_iter_mut()
            .zip(self.markers.par_iter_mut())
            .zip(self.interpolations.par_iter())
            .for_each(|((vel, marker), interp)| {
                let mut v_pic = Vector::ZERO;
                let mut dv_flip = Vector::ZERO;
                let mut affine = Matrix::ZERO;
                let mut grad_v = Matrix::ZERO;
                for (coord, w, grad, d) in interp.iter_neighbors() {
                    let Some(node) = layout.linear_index(coord) else {
                        continue;
                    };
                    let vi = solved[node];
                    v_pic += vi * w;
                    dv_flip += (vi - old[node]) * w;
                    affine += outer_product(vi * w, d);
                    grad_v += outer_product(vi, grad);
                }
                *vel = (*vel + dv_flip) * params.alpha + v_pic * (1.0 - params.alpha);
                marker.affine = affine * d_inv;

                let fe_trial = (identity_matrix() + grad_v * dt) * marker.fe;
                let split = split_deformation(&fe_trial, &marker.fp, params.theta_c, params.theta_s);
                marker.fe = split.fe;
                marker.fp = split.fp;
                marker.det_fp = split.fp.determinant();
            });
        self.node_velocity = solved;
    }

    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView) {
        self.forces.clear();
        self.boundary
            .accumulate_forces(rows.rows, rows.gamma, ctx.bodies, ctx.dt, &mut self.forces);
    }

    fn update_position(&mut self, ctx: &StepContext) {
        let max_speed = self.params.contact.max_velocity;
        let bbox = self.params.bounding_box;
        for (x, v) in self.positions.iter_mut().zip(self.velocities.iter_mut()) {
            *v = clamp_speed(*v, max_speed);
            *x += *v * ctx.dt;
            if let Some(bbox) = &bbox {
                *x = bbox.clamp(*x);
            }
        }
    }

    fn contact_forces(&self) -> &ContactForces {
        &self.forces
    }
}
