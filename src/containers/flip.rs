//! FLIP fluid on a staggered (MAC) grid.
//!
//! Velocity component `a` of cell `c` lives on the lower `a`-face of the cell,
//! so every grid node owns three face DOFs, each with its own mass, density and
//! volume. Each cell that holds a marker gets one unilateral divergence row:
//! the fluid may expand freely but must not compress, and over-dense cells are
//! pushed apart at a bounded rate.
//!
//! Markers also track their volume ratio. Compression beyond `theta_c` (or
//! stretch beyond `theta_s`) is kept as plastic compaction, which hardens the
//! fluid: the tension a cell may sustain and the friction of marker contacts
//! both grow with `exp(hardening_coefficient * (1 - J_p))`.

use bevy::log::info;
use bevy::math::IVec3;
use rayon::prelude::*;

use crate::collision::{ContactQuery, ContactSet};
use crate::config::{FlipParams, GRID_PADDING, MIN_GRID_MASS, MIN_SINGULAR_VALUE};
use crate::core::{
    BoundaryRows, ContactForces, ContainerKind, ContainerOffsets, DofBlock, DofContainer,
    GridInterpolation, GridLayout, PointStencil, RigidBodySet, RowBlock, RowView, StepContext,
    check_offsets, project_unilateral, warm_start,
};
use crate::error::{ConfigError, ConfigResult};
use crate::materials::hardening_scale;
use crate::math::{GridCoord, Real, Vector};

use super::{clamp_speed, removal_remap, retain_by};

/// Face interpolations of one marker, one per velocity component.
type FaceInterpolation = [GridInterpolation; 3];

fn face_shift(axis: usize) -> Vector {
    (Vector::ONE - Vector::AXES[axis]) * 0.5
}

fn face_interpolation(layout: &GridLayout, x: Vector) -> FaceInterpolation {
    [0, 1, 2].map(|a| layout.staggered_interpolation(x, face_shift(a)))
}

/// Nodes owning the lower and upper `axis`-faces of `cell`.
fn face_nodes(layout: &GridLayout, cell: GridCoord, axis: usize) -> Option<(usize, usize)> {
    let lower = layout.linear_index(cell)?;
    let upper = layout.linear_index(cell + IVec3::AXES[axis])?;
    Some((lower, upper))
}

/// Marker velocities read from the faces around each marker.
struct FaceStencil<'a> {
    dof_start: usize,
    layout: &'a GridLayout,
    interpolations: &'a [FaceInterpolation],
}

impl PointStencil for FaceStencil<'_> {
    fn for_each(&self, point: usize, f: &mut dyn FnMut(usize, Vector)) {
        for (axis, interp) in self.interpolations[point].iter().enumerate() {
            for (coord, w, _, _) in interp.iter_neighbors() {
                if w <= 0.0 {
                    continue;
                }
                if let Some(node) = self.layout.linear_index(coord) {
                    f(self.dof_start + node * 3, Vector::AXES[axis] * w);
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct FlipContainer {
    params: FlipParams,
    positions: Vec<Vector>,
    velocities: Vec<Vector>,
    /// Total volume ratio of every marker.
    jacobian: Vec<Real>,
    /// Plastic part of the volume ratio.
    det_fp: Vec<Real>,
    layout: GridLayout,
    interpolations: Vec<FaceInterpolation>,
    face_mass: Vec<Vector>,
    face_velocity: Vec<Vector>,
    face_density: Vec<Vector>,
    face_volume: Vec<Vector>,
    /// Cells that hold at least one marker, in row order.
    fluid_cells: Vec<GridCoord>,
    cell_density: Vec<Real>,
    cell_hardening: Vec<Real>,
    boundary: BoundaryRows,
    offsets: ContainerOffsets,
    gamma_old: Vec<Real>,
    forces: ContactForces,
}

impl FlipContainer {
    pub fn new(params: FlipParams) -> ConfigResult<Self> {
        params.validate()?;
        Ok(Self {
            params,
            positions: Vec::new(),
            velocities: Vec::new(),
            jacobian: Vec::new(),
            det_fp: Vec::new(),
            layout: GridLayout::default(),
            interpolations: Vec::new(),
            face_mass: Vec::new(),
            face_velocity: Vec::new(),
            face_density: Vec::new(),
            face_volume: Vec::new(),
            fluid_cells: Vec::new(),
            cell_density: Vec::new(),
            cell_hardening: Vec::new(),
            boundary: BoundaryRows::default(),
            offsets: ContainerOffsets::default(),
            gamma_old: Vec::new(),
            forces: ContactForces::default(),
        })
    }

    pub fn params(&self) -> &FlipParams {
        &self.params
    }

    pub fn layout(&self) -> &GridLayout {
        &self.layout
    }

    pub fn fluid_cells(&self) -> &[GridCoord] {
        &self.fluid_cells
    }

    /// Density of every fluid cell, in row order.
    pub fn cell_density(&self) -> &[Real] {
        &self.cell_density
    }

    /// Hardening factor of every fluid cell, in row order.
    pub fn cell_hardening(&self) -> &[Real] {
        &self.cell_hardening
    }

    pub fn face_mass(&self) -> &[Vector] {
        &self.face_mass
    }

    pub fn face_velocity(&self) -> &[Vector] {
        &self.face_velocity
    }

    pub fn face_density(&self) -> &[Vector] {
        &self.face_density
    }

    pub fn face_volume(&self) -> &[Vector] {
        &self.face_volume
    }

    /// Plastic volume ratio of every marker.
    pub fn det_fp(&self) -> &[Real] {
        &self.det_fp
    }

    pub fn add_nodes(&mut self, positions: &[Vector], velocities: &[Vector]) -> ConfigResult<()> {
        if positions.len() != velocities.len() {
            return Err(ConfigError::LengthMismatch(positions.len(), velocities.len()));
        }
        self.positions.extend_from_slice(positions);
        self.velocities.extend_from_slice(velocities);
        self.jacobian.resize(self.positions.len(), 1.0);
        self.det_fp.resize(self.positions.len(), 1.0);
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
        retain_by(&mut self.jacobian, &keep);
        retain_by(&mut self.det_fp, &keep);
        self.interpolations.clear();
        self.boundary.clear();
        self.gamma_old.clear();
        removal_remap(&keep)
    }

    #[inline]
    fn divergence_rows(&self) -> usize {
        self.fluid_cells.len()
    }

    fn stencil(&self) -> FaceStencil<'_> {
        FaceStencil {
            dof_start: self.offsets.dof_start,
            layout: &self.layout,
            interpolations: &self.interpolations,
        }
    }

    /// Splats marker mass, momentum and volume onto the faces.
    fn transfer_to_grid(&mut self) {
        let n = self.layout.num_nodes();
        let m = self.params.mass;
        let rest_volume = m / self.params.rho;
        self.face_mass.clear();
        self.face_mass.resize(n, Vector::ZERO);
        self.face_volume.clear();
        self.face_volume.resize(n, Vector::ZERO);
        let mut momentum = vec![Vector::ZERO; n];

        for ((faces, v), det_fp) in self
            .interpolations
            .iter()
            .zip(&self.velocities)
            .zip(&self.det_fp)
        {
            let volume = rest_volume * det_fp;
            for (axis, interp) in faces.iter().enumerate() {
                for (coord, w, _, _) in interp.iter_neighbors() {
                    let Some(node) = self.layout.linear_index(coord) else {
                        continue;
                    };
                    self.face_mass[node][axis] += w * m;
                    self.face_volume[node][axis] += w * volume;
                    momentum[node][axis] += w * m * v[axis];
                }
            }
        }

        let inv_cell = 1.0 / self.params.bin_edge.powi(3);
        self.face_density = self.face_mass.iter().map(|mass| *mass * inv_cell).collect();
        self.face_velocity = self
            .face_mass
            .iter()
            .zip(&momentum)
            .map(|(mass, p)| {
                Vector::select(mass.cmpgt(Vector::splat(MIN_GRID_MASS)), *p / *mass, Vector::ZERO)
            })
            .collect();
    }

    /// Marks the cells holding markers, then averages density and plastic
    /// compaction over the six faces of each.
    fn compute_cell_state(&mut self) {
        let mut occupied = vec![false; self.layout.num_nodes()];
        self.fluid_cells.clear();
        for x in &self.positions {
            let cell = self.layout.cell_of(*x);
            let Some(node) = self.layout.linear_index(cell) else {
                continue;
            };
            if !occupied[node] {
                occupied[node] = true;
                self.fluid_cells.push(cell);
            }
        }
        self.fluid_cells.sort_unstable_by_key(|c| (c.z, c.y, c.x));

        let rho = self.params.rho;
        let xi = self.params.hardening_coefficient;
        self.cell_density.clear();
        self.cell_hardening.clear();
        for cell in &self.fluid_cells {
            let (mut density, mut mass, mut volume, mut faces) = (0.0, 0.0, 0.0, 0);
            for axis in 0..3 {
                let Some((lower, upper)) = face_nodes(&self.layout, *cell, axis) else {
                    continue;
                };
                for node in [lower, upper] {
                    density += self.face_density[node][axis];
                    mass += self.face_mass[node][axis];
                    volume += self.face_volume[node][axis];
                    faces += 1;
                }
            }
            self.cell_density
                .push(if faces > 0 { density / faces as Real } else { 0.0 });
            let det_fp = if mass > MIN_GRID_MASS {
                rho * volume / mass
            } else {
                1.0
            };
            self.cell_hardening.push(hardening_scale(xi, det_fp));
        }
    }

    /// Face columns `(lower, upper)` of `cell` along `axis`.
    fn face_columns(&self, cell: GridCoord, axis: usize) -> Option<(usize, usize)> {
        let start = self.offsets.dof_start;
        let (lower, upper) = face_nodes(&self.layout, cell, axis)?;
        Some((start + lower * 3 + axis, start + upper * 3 + axis))
    }

    /// Advances every marker's volume ratio with the divergence of its cell
    /// and moves the part outside the yield band into `det_fp`.
    fn update_volume_ratios(&mut self, dt: Real, solved: &[Vector]) {
        let layout = &self.layout;
        let inv_dx = 1.0 / self.params.bin_edge;
        let lower = (1.0 - self.params.theta_c).max(MIN_SINGULAR_VALUE);
        let upper = 1.0 + self.params.theta_s;
        self.jacobian
            .par_iter_mut()
            .zip(self.det_fp.par_iter_mut())
            .zip(self.positions.par_iter())
            .for_each(|((j, jp), x)| {
                let cell = layout.cell_of(*x);
                let mut divergence = 0.0;
                for axis in 0..3 {
                    if let Some((lo, hi)) = face_nodes(layout, cell, axis) {
                        divergence += (solved[hi][axis] - solved[lo][axis]) * inv_dx;
                    }
                }
                *j = (*j * (1.0 + dt * divergence)).max(MIN_SINGULAR_VALUE);
                let elastic = (*j / *jp).clamp(lower, upper);
                *jp = *j / elastic;
            });
    }
}

impl DofContainer for FlipContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Flip
    }

    fn initialize(&mut self, _bodies: &RigidBodySet) -> ConfigResult<()> {
        info!(
            "flip container: {} markers, bin edge {}, rest density {}",
            self.positions.len(),
            self.params.bin_edge,
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
            pair_radius: None,
            point_radius: c.kernel_radius,
            envelope: c.collision_envelope,
            filter: c.collision_filter,
        }
    }

    fn compute_dof(&mut self) {
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
            .map(|x| face_interpolation(&layout, *x))
            .collect();
    }

    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet) {
        self.transfer_to_grid();
        self.compute_cell_state();
        self.boundary
            .update(&contacts.boundary, ctx.bodies, &self.params.contact);
    }

    fn num_dofs(&self) -> usize {
        self.layout.num_nodes() * 3
    }

    fn num_constraints(&self) -> usize {
        self.divergence_rows() + self.boundary.num_rows()
    }

    fn setup(&mut self, offsets: ContainerOffsets) {
        check_offsets(self.kind(), &offsets, self.counts());
        self.offsets = offsets;
    }

    fn offsets(&self) -> ContainerOffsets {
        self.offsets
    }

    fn compute_mass(&self, dofs: &mut DofBlock) {
        for (node, m) in self.face_mass.iter().enumerate() {
            m.write_to_slice(&mut dofs.mass[node * 3..node * 3 + 3]);
        }
    }

    fn compute_inv_mass(&self, dofs: &mut DofBlock) {
        for (node, m) in self.face_mass.iter().enumerate() {
            let inv = Vector::select(
                m.cmpgt(Vector::splat(MIN_GRID_MASS)),
                m.recip(),
                Vector::ZERO,
            );
            inv.write_to_slice(&mut dofs.inv_mass[node * 3..node * 3 + 3]);
        }
    }

    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock) {
        for (node, (v, m)) in self.face_velocity.iter().zip(&self.face_mass).enumerate() {
            dofs.set_velocity3(node, *v);
            dofs.add_impulse3(node, ctx.gravity * *m * ctx.dt);
        }
    }

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (div_rows, boundary_rows) = rows.rows.split_at_mut(self.divergence_rows());
        for (row, cell) in div_rows.iter_mut().zip(&self.fluid_cells) {
            for axis in 0..3 {
                if let Some((lower, upper)) = self.face_columns(*cell, axis) {
                    row.declare(lower);
                    row.declare(upper);
                }
            }
        }
        self.boundary
            .generate_sparsity(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let inv_dx = 1.0 / self.params.bin_edge;
        let (div_rows, boundary_rows) = rows.rows.split_at_mut(self.divergence_rows());
        for (row, cell) in div_rows.iter_mut().zip(&self.fluid_cells) {
            for axis in 0..3 {
                if let Some((lower, upper)) = self.face_columns(*cell, axis) {
                    row.add(lower, -inv_dx);
                    row.add(upper, inv_dx);
                }
            }
        }
        self.boundary.build_d(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (div_b, boundary_b) = rows.b.split_at_mut(self.divergence_rows());
        let max_rate = self.params.contact.contact_recovery_speed / self.params.bin_edge;
        for (b, rho) in div_b.iter_mut().zip(&self.cell_density) {
            let excess = (rho / self.params.rho - 1.0).max(0.0);
            *b = (-excess / ctx.dt).max(-max_rate);
        }
        self.boundary.build_b(
            boundary_b,
            ctx.dt,
            self.params.contact.contact_recovery_speed,
        );
    }

    fn build_e(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (div_e, boundary_e) = rows.e.split_at_mut(self.divergence_rows());
        let e = if self.params.lambda > 0.0 {
            1.0 / (self.params.lambda * ctx.dt * ctx.dt * self.params.bin_edge.powi(3))
        } else {
            0.0
        };
        div_e.fill(e);
        self.boundary
            .build_e(boundary_e, self.params.contact.contact_compliance);
    }

    fn pre_solve(&mut self, _ctx: &StepContext, _dofs: &mut DofBlock, gamma: &mut [Real]) {
        warm_start(&self.gamma_old, gamma);
    }

    fn project(&self, gamma: &mut [Real]) {
        let (div_gamma, boundary_gamma) = gamma.split_at_mut(self.divergence_rows());
        let cohesion = self.params.contact.contact_cohesion;
        for (g, h) in div_gamma.iter_mut().zip(&self.cell_hardening) {
            project_unilateral(g, -cohesion * h);
        }
        let (mu, xi) = (self.params.mu, self.params.hardening_coefficient);
        self.boundary.project_with(boundary_gamma, cohesion, |contact| {
            let det_fp = self.det_fp.get(contact.point as usize).copied().unwrap_or(1.0);
            mu * hardening_scale(xi, det_fp)
        });
    }

    fn post_solve(&mut self, ctx: &StepContext, v: &[Real], gamma: &[Real]) {
        self.gamma_old.clear();
        self.gamma_old.extend_from_slice(gamma);

        let solved: Vec<Vector> = (0..self.layout.num_nodes())
            .map(|node| Vector::from_slice(&v[node * 3..node * 3 + 3]))
            .collect();
        let layout = &self.layout;
        let old = &self.face_velocity;
        let alpha = self.params.alpha;

        self.velocities
            .par_iter_mut()
            .zip(self.interpolations.par_iter())
            .for_each(|(vel, faces)| {
                let mut v_pic = Vector::ZERO;
                let mut dv_flip = Vector::ZERO;
                for (axis, interp) in faces.iter().enumerate() {
                    for (coord, w, _, _) in interp.iter_neighbors() {
                        let Some(node) = layout.linear_index(coord) else {
                            continue;
                        };
                        v_pic[axis] += w * solved[node][axis];
                        dv_flip[axis] += w * (solved[node][axis] - old[node][axis]);
                    }
                }
                *vel = (*vel + dv_flip) * alpha + v_pic * (1.0 - alpha);
            });
        self.update_volume_ratios(ctx.dt, &solved);
        self.face_velocity = solved;
    }

    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView) {
        self.forces.clear();
        let split = self.divergence_rows();
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
