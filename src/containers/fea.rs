//! Tetrahedral finite elements as compliant constraints.
//!
//! Every element carries six Green-strain rows and one volume row, measured
//! against the rest shape captured at `initialize`, or when the element is
//! added to an already initialized container. Nodes can be pinned to rigid
//! bodies with three bilateral coupling rows each.

use bevy::log::{info, warn};
use indexmap::IndexMap;
use rayon::prelude::*;

use crate::collision::{ContactQuery, ContactSet};
use crate::config::{FeaParams, MIN_TET_VOLUME};
use crate::core::{
    BodyHandle, BoundaryRows, ContactForces, ContainerKind, ContainerOffsets, DofBlock,
    DofContainer, NodeStencil, RigidBodySet, RowBlock, RowView, SparseRow, StepContext,
    check_offsets, warm_start,
};
use crate::error::{ConfigError, ConfigResult};
use crate::materials::{bulk_modulus, cofactor, lame_lambda_mu};
use crate::math::{Matrix, Real, Rotation, Vector, outer_product, pseudo_inverse, try_inverse};

use super::{clamp_speed, read_velocities};

/// Strain rows, then the volume row.
pub const ROWS_PER_ELEMENT: usize = 7;
pub const ROWS_PER_ATTACHMENT: usize = 3;

/// Green-strain components in row order.
const STRAIN_PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (0, 1), (0, 2), (1, 2)];

/// Faces of a tetrahedron as `(face, opposite vertex)`.
const TET_FACES: [([usize; 3], usize); 4] = [
    ([1, 2, 3], 0),
    ([0, 3, 2], 1),
    ([0, 1, 3], 2),
    ([0, 2, 1], 3),
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Tetrahedron {
    pub nodes: [u32; 4],
}

impl Tetrahedron {
    pub fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self {
            nodes: [a, b, c, d],
        }
    }
}

/// Pins a node to a point of a rigid body.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RigidAttachment {
    pub node: u32,
    pub body: BodyHandle,
    /// Attachment point in the body frame.
    pub local_point: Vector,
    /// Coupling frame relative to the body, fixed when attached.
    pub local_frame: Rotation,
}

impl RigidAttachment {
    pub fn new(node: u32, body: BodyHandle, local_point: Vector) -> Self {
        Self {
            node,
            body,
            local_point,
            local_frame: Rotation::IDENTITY,
        }
    }

    pub fn with_frame(mut self, local_frame: Rotation) -> Self {
        self.local_frame = local_frame;
        self
    }
}

/// Boundary of a tetrahedral mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SurfaceMesh {
    /// Faces referenced by a single element, wound so their normal points out.
    pub triangles: Vec<[u32; 3]>,
    pub nodes: Vec<u32>,
    pub elements: Vec<u32>,
}

/// Rest shape of one element.
#[derive(Copy, Clone, Debug, PartialEq)]
struct ElementRest {
    /// Inverse of the rest edge matrix.
    x0: Matrix,
    volume: Real,
}

impl ElementRest {
    /// `∂F/∂x_k` weights: `F = Σ_k x_k ⊗ h_k`.
    fn shape_gradients(&self) -> [Vector; 4] {
        let h1 = self.x0.row(0);
        let h2 = self.x0.row(1);
        let h3 = self.x0.row(2);
        [-(h1 + h2 + h3), h1, h2, h3]
    }
}

fn element_gradient(positions: &[Vector], element: &Tetrahedron, h: &[Vector; 4]) -> Matrix {
    element
        .nodes
        .iter()
        .zip(h)
        .fold(Matrix::ZERO, |f, (node, h)| {
            f + outer_product(positions[*node as usize], *h)
        })
}

/// Puts a quarter of the element mass on each of its nodes.
fn lump_mass(node_mass: &mut [Real], density: Real, element: &Tetrahedron, volume: Real) {
    let share = density * volume / 4.0;
    for node in element.nodes {
        node_mass[node as usize] += share;
    }
}

fn warn_degenerate(count: usize) {
    if count > 0 {
        warn!(
            "{count} degenerate tetrahedra, volume floored at {MIN_TET_VOLUME:e} and pseudo-inverse rest shape used"
        );
    }
}

/// Constraint values `[E00, E11, E22, E01, E02, E12, det F - 1]`.
fn element_constraints(f: &Matrix) -> [Real; ROWS_PER_ELEMENT] {
    let mut c = [0.0; ROWS_PER_ELEMENT];
    for (k, (a, b)) in STRAIN_PAIRS.iter().enumerate() {
        let delta = if a == b { 1.0 } else { 0.0 };
        c[k] = 0.5 * (f.col(*a).dot(f.col(*b)) - delta);
    }
    c[6] = f.determinant() - 1.0;
    c
}

#[derive(Clone, Debug)]
pub struct FeaContainer {
    params: FeaParams,
    lambda: Real,
    mu: Real,
    positions: Vec<Vector>,
    velocities: Vec<Vector>,
    elements: Vec<Tetrahedron>,
    rest: Vec<ElementRest>,
    node_mass: Vec<Real>,
    attachments: Vec<RigidAttachment>,
    /// Attachments whose body is alive this step.
    active_attachments: Vec<usize>,
    surface: SurfaceMesh,
    boundary: BoundaryRows,
    offsets: ContainerOffsets,
    gamma_old: Vec<Real>,
    gamma_old_rigid: Vec<Real>,
    gamma_old_boundary: Vec<Real>,
    forces: ContactForces,
    initialized: bool,
}

impl FeaContainer {
    pub fn new(params: FeaParams) -> ConfigResult<Self> {
        params.validate()?;
        let (lambda, mu) = lame_lambda_mu(params.youngs_modulus, params.poisson_ratio);
        Ok(Self {
            params,
            lambda,
            mu,
            positions: Vec::new(),
            velocities: Vec::new(),
            elements: Vec::new(),
            rest: Vec::new(),
            node_mass: Vec::new(),
            attachments: Vec::new(),
            active_attachments: Vec::new(),
            surface: SurfaceMesh::default(),
            boundary: BoundaryRows::default(),
            offsets: ContainerOffsets::default(),
            gamma_old: Vec::new(),
            gamma_old_rigid: Vec::new(),
            gamma_old_boundary: Vec::new(),
            forces: ContactForces::default(),
            initialized: false,
        })
    }

    pub fn params(&self) -> &FeaParams {
        &self.params
    }

    pub fn add_nodes(&mut self, positions: &[Vector], velocities: &[Vector]) -> ConfigResult<()> {
        if positions.len() != velocities.len() {
            return Err(ConfigError::LengthMismatch(positions.len(), velocities.len()));
        }
        self.positions.extend_from_slice(positions);
        self.velocities.extend_from_slice(velocities);
        self.node_mass.resize(self.positions.len(), 0.0);
        Ok(())
    }

    /// Appends elements. Once the container is initialized they are checked
    /// and measured against the current node positions right away.
    pub fn add_elements(&mut self, elements: &[Tetrahedron]) -> ConfigResult<()> {
        if !self.initialized {
            self.elements.extend_from_slice(elements);
            return Ok(());
        }
        let first = self.elements.len();
        for (k, element) in elements.iter().enumerate() {
            self.check_element(first + k, element)?;
        }
        let mut degenerate = 0;
        for element in elements {
            let rest = self.rest_shape(element, &mut degenerate);
            lump_mass(&mut self.node_mass, self.params.material_density, element, rest.volume);
            self.rest.push(rest);
            self.elements.push(*element);
        }
        warn_degenerate(degenerate);
        self.find_surface();
        self.gamma_old.clear();
        Ok(())
    }

    pub fn attach(&mut self, attachment: RigidAttachment) {
        self.attachments.push(attachment);
    }

    /// Pins `node` to the body point it currently coincides with, using the
    /// body axes as coupling frame.
    pub fn attach_at_current_position(
        &mut self,
        node: u32,
        body: BodyHandle,
        bodies: &RigidBodySet,
    ) -> ConfigResult<()> {
        let count = self.positions.len();
        let position = *self
            .positions
            .get(node as usize)
            .ok_or(ConfigError::ConstraintNodeOutOfRange {
                node: node as usize,
                count,
            })?;
        let rigid = bodies.get(body).ok_or(ConfigError::UnknownBody)?;
        self.attach(RigidAttachment::new(node, body, rigid.to_local(position)));
        Ok(())
    }

    pub fn elements(&self) -> &[Tetrahedron] {
        &self.elements
    }

    pub fn attachments(&self) -> &[RigidAttachment] {
        &self.attachments
    }

    pub fn node_mass(&self) -> &[Real] {
        &self.node_mass
    }

    pub fn surface(&self) -> &SurfaceMesh {
        &self.surface
    }

    pub fn element_volume(&self, element: usize) -> Real {
        self.rest[element].volume
    }

    /// Current strain and volume constraint values of `element`.
    pub fn element_residual(&self, element: usize) -> [Real; ROWS_PER_ELEMENT] {
        let h = self.rest[element].shape_gradients();
        let f = element_gradient(&self.positions, &self.elements[element], &h);
        element_constraints(&f)
    }

    /// Extracts the faces referenced by exactly one element.
    pub fn find_surface(&mut self) -> &SurfaceMesh {
        let mut faces: IndexMap<[u32; 3], ([u32; 3], u32, usize)> = IndexMap::new();
        for (e, element) in self.elements.iter().enumerate() {
            let n = element.nodes;
            for (face, opposite) in TET_FACES {
                let mut tri = face.map(|k| n[k]);
                let [a, b, c] = tri.map(|node| self.positions[node as usize]);
                let inward = self.positions[n[opposite] as usize] - a;
                if (b - a).cross(c - a).dot(inward) > 0.0 {
                    tri.swap(1, 2);
                }
                let mut key = tri;
                key.sort_unstable();
                faces
                    .entry(key)
                    .and_modify(|entry| entry.2 += 1)
                    .or_insert((tri, e as u32, 1));
            }
        }

        let mut surface = SurfaceMesh::default();
        for (tri, element, count) in faces.values() {
            if *count == 1 {
                surface.triangles.push(*tri);
                surface.nodes.extend_from_slice(tri);
                surface.elements.push(*element);
            }
        }
        surface.nodes.sort_unstable();
        surface.nodes.dedup();
        surface.elements.sort_unstable();
        surface.elements.dedup();
        self.surface = surface;
        &self.surface
    }

    #[inline]
    fn element_rows(&self) -> usize {
        self.elements.len() * ROWS_PER_ELEMENT
    }

    #[inline]
    fn attachment_rows(&self) -> usize {
        self.active_attachments.len() * ROWS_PER_ATTACHMENT
    }

    fn stencil(&self) -> NodeStencil {
        NodeStencil {
            dof_start: self.offsets.dof_start,
        }
    }

    /// World coupling frame axes and anchor of an attachment.
    fn coupling(
        &self,
        attachment: &RigidAttachment,
        bodies: &RigidBodySet,
    ) -> Option<(Matrix, Vector, Vector)> {
        let body = bodies.get(attachment.body)?;
        let frame = Matrix::from_quat(body.rotation * attachment.local_frame);
        let anchor = body.to_world(attachment.local_point);
        Some((frame, anchor, anchor - body.position))
    }

    fn check_element(&self, e: usize, element: &Tetrahedron) -> ConfigResult<()> {
        let count = self.positions.len();
        for node in element.nodes {
            if node as usize >= count {
                return Err(ConfigError::ElementIndexOutOfRange {
                    element: e,
                    node: node as usize,
                    count,
                });
            }
        }
        let n = element.nodes;
        if (0..4).any(|i| (i + 1..4).any(|j| n[i] == n[j])) {
            return Err(ConfigError::DegenerateElement(e));
        }
        Ok(())
    }

    fn validate_mesh(&self, bodies: &RigidBodySet) -> ConfigResult<()> {
        for (e, element) in self.elements.iter().enumerate() {
            self.check_element(e, element)?;
        }
        let count = self.positions.len();
        for attachment in &self.attachments {
            if attachment.node as usize >= count {
                return Err(ConfigError::ConstraintNodeOutOfRange {
                    node: attachment.node as usize,
                    count,
                });
            }
            if !bodies.contains(attachment.body) {
                return Err(ConfigError::UnknownBody);
            }
        }
        Ok(())
    }

    /// Rest shape of `element` in the current node positions.
    fn rest_shape(&self, element: &Tetrahedron, degenerate: &mut usize) -> ElementRest {
        let [p0, p1, p2, p3] = element.nodes.map(|n| self.positions[n as usize]);
        let dm = Matrix::from_cols(p1 - p0, p2 - p0, p3 - p0);
        let volume = dm.determinant().abs() / 6.0;
        let inverse = if volume > MIN_TET_VOLUME {
            try_inverse(&dm)
        } else {
            None
        };
        match inverse {
            Some(x0) => ElementRest { x0, volume },
            None => {
                *degenerate += 1;
                ElementRest {
                    x0: pseudo_inverse(&dm, MIN_TET_VOLUME).unwrap_or(Matrix::ZERO),
                    volume: volume.max(MIN_TET_VOLUME),
                }
            }
        }
    }

    fn compute_rest_shapes(&mut self) {
        let mut degenerate = 0;
        self.rest = self
            .elements
            .iter()
            .map(|element| self.rest_shape(element, &mut degenerate))
            .collect();
        warn_degenerate(degenerate);

        self.node_mass.clear();
        self.node_mass.resize(self.positions.len(), 0.0);
        let density = self.params.material_density;
        for (element, rest) in self.elements.iter().zip(&self.rest) {
            lump_mass(&mut self.node_mass, density, element, rest.volume);
        }
    }

    /// Compliance of the seven rows of an element, before the `1/dt²` factor.
    fn element_compliance(&self, volume: Real) -> [Real; ROWS_PER_ELEMENT] {
        let normal = 1.0 / (2.0 * self.mu * volume);
        let shear = 1.0 / (4.0 * self.mu * volume);
        let volumetric_stiffness = if self.lambda > 0.0 {
            self.lambda
        } else {
            bulk_modulus(self.params.youngs_modulus, self.params.poisson_ratio)
        };
        let volumetric = 1.0 / (volumetric_stiffness * volume);
        [normal, normal, normal, shear, shear, shear, volumetric]
    }
}

impl DofContainer for FeaContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Fea
    }

    /// Validates the mesh and captures the rest shape.
    fn initialize(&mut self, bodies: &RigidBodySet) -> ConfigResult<()> {
        self.validate_mesh(bodies)?;
        self.compute_rest_shapes();
        self.find_surface();
        self.initialized = true;
        info!(
            "fea container: {} nodes, {} elements, {} attachments, {} surface triangles, lambda {:.3e}, mu {:.3e}",
            self.positions.len(),
            self.elements.len(),
            self.attachments.len(),
            self.surface.triangles.len(),
            self.lambda,
            self.mu
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
            point_radius: c.kernel_radius * 0.5,
            envelope: c.collision_envelope,
            filter: c.collision_filter,
        }
    }

    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet) {
        self.active_attachments = self
            .attachments
            .iter()
            .enumerate()
            .filter(|(_, a)| ctx.bodies.contains(a.body))
            .map(|(k, _)| k)
            .collect();
        self.boundary
            .update(&contacts.boundary, ctx.bodies, &self.params.contact);
    }

    fn num_dofs(&self) -> usize {
        self.positions.len() * 3
    }

    fn num_constraints(&self) -> usize {
        self.element_rows() + self.attachment_rows() + self.boundary.num_rows()
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
            let inv = if *m > 0.0 { 1.0 / m } else { 0.0 };
            dofs.set_inv_mass3(node, inv);
        }
    }

    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock) {
        for (node, (v, m)) in self.velocities.iter().zip(&self.node_mass).enumerate() {
            dofs.set_velocity3(node, *v);
            dofs.add_impulse3(node, ctx.gravity * (m * ctx.dt));
        }
    }

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let start = self.offsets.dof_start;
        let (element_rows, tail) = rows.rows.split_at_mut(self.element_rows());
        let (attachment_rows, boundary_rows) = tail.split_at_mut(self.attachment_rows());

        element_rows
            .par_chunks_mut(ROWS_PER_ELEMENT)
            .zip(self.elements.par_iter())
            .for_each(|(block, element)| {
                for row in block {
                    for node in element.nodes {
                        row.declare3(start + node as usize * 3);
                    }
                }
            });

        for (block, k) in attachment_rows
            .chunks_mut(ROWS_PER_ATTACHMENT)
            .zip(&self.active_attachments)
        {
            let attachment = &self.attachments[*k];
            let body_col = ctx.bodies.column(attachment.body);
            for row in block {
                row.declare3(start + attachment.node as usize * 3);
                if let Some(col) = body_col {
                    row.declare6(col);
                }
            }
        }

        self.boundary
            .generate_sparsity(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let start = self.offsets.dof_start;
        let (element_rows, tail) = rows.rows.split_at_mut(self.element_rows());
        let (attachment_rows, boundary_rows) = tail.split_at_mut(self.attachment_rows());

        let positions = &self.positions;
        element_rows
            .par_chunks_mut(ROWS_PER_ELEMENT)
            .zip(self.elements.par_iter().zip(self.rest.par_iter()))
            .for_each(|(block, (element, rest))| {
                let h = rest.shape_gradients();
                let f = element_gradient(positions, element, &h);
                let cof = cofactor(&f);
                fill_element_rows(block, start, element, &f, &cof, &h);
            });

        for (block, k) in attachment_rows
            .chunks_mut(ROWS_PER_ATTACHMENT)
            .zip(&self.active_attachments)
        {
            let attachment = &self.attachments[*k];
            let node_col = start + attachment.node as usize * 3;
            let body_col = ctx.bodies.column(attachment.body);
            let Some((frame, _, arm)) = self.coupling(attachment, ctx.bodies) else {
                continue;
            };
            for (axis, row) in block.iter_mut().enumerate() {
                let dir = frame.col(axis);
                row.add3(node_col, dir);
                if let Some(col) = body_col {
                    row.add3(col, -dir);
                    row.add3(col + 3, -arm.cross(dir));
                }
            }
        }

        self.boundary.build_d(boundary_rows, ctx.bodies, &self.stencil());
    }

    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (element_b, tail) = rows.b.split_at_mut(self.element_rows());
        let (attachment_b, boundary_b) = tail.split_at_mut(self.attachment_rows());

        element_b
            .par_chunks_mut(ROWS_PER_ELEMENT)
            .enumerate()
            .for_each(|(e, b)| {
                for (b, c) in b.iter_mut().zip(self.element_residual(e)) {
                    *b = c / ctx.dt;
                }
            });

        let max_speed = self.params.rigid_constraint_recovery_speed;
        for (b, k) in attachment_b
            .chunks_mut(ROWS_PER_ATTACHMENT)
            .zip(&self.active_attachments)
        {
            let attachment = &self.attachments[*k];
            b.fill(0.0);
            let Some((frame, anchor, _)) = self.coupling(attachment, ctx.bodies) else {
                continue;
            };
            let offset = self.positions[attachment.node as usize] - anchor;
            for (axis, b) in b.iter_mut().enumerate() {
                *b = (frame.col(axis).dot(offset) / ctx.dt).clamp(-max_speed, max_speed);
            }
        }

        self.boundary.build_b(
            boundary_b,
            ctx.dt,
            self.params.contact.contact_recovery_speed,
        );
    }

    fn build_e(&self, ctx: &StepContext, rows: &mut RowBlock) {
        let (element_e, tail) = rows.e.split_at_mut(self.element_rows());
        let (attachment_e, boundary_e) = tail.split_at_mut(self.attachment_rows());

        let inv_dt2 = 1.0 / (ctx.dt * ctx.dt);
        for (e, rest) in element_e.chunks_mut(ROWS_PER_ELEMENT).zip(&self.rest) {
            for (e, c) in e.iter_mut().zip(self.element_compliance(rest.volume)) {
                *e = c * inv_dt2;
            }
        }
        attachment_e.fill(0.0);
        self.boundary
            .build_e(boundary_e, self.params.contact.contact_compliance);
    }

    fn pre_solve(&mut self, _ctx: &StepContext, _dofs: &mut DofBlock, gamma: &mut [Real]) {
        let (element_gamma, tail) = gamma.split_at_mut(self.element_rows());
        let (attachment_gamma, boundary_gamma) = tail.split_at_mut(self.attachment_rows());
        warm_start(&self.gamma_old, element_gamma);
        warm_start(&self.gamma_old_rigid, attachment_gamma);
        warm_start(&self.gamma_old_boundary, boundary_gamma);
    }

    /// Strain and coupling rows are bilateral; only boundary contacts are coned.
    fn project(&self, gamma: &mut [Real]) {
        let split = self.element_rows() + self.attachment_rows();
        self.boundary
            .project(&mut gamma[split..], self.params.contact.contact_cohesion);
    }

    fn post_solve(&mut self, _ctx: &StepContext, v: &[Real], gamma: &[Real]) {
        read_velocities(v, &mut self.velocities);
        let (element_gamma, tail) = gamma.split_at(self.element_rows());
        let (attachment_gamma, boundary_gamma) = tail.split_at(self.attachment_rows());
        self.gamma_old.clear();
        self.gamma_old.extend_from_slice(element_gamma);
        self.gamma_old_rigid.clear();
        self.gamma_old_rigid.extend_from_slice(attachment_gamma);
        self.gamma_old_boundary.clear();
        self.gamma_old_boundary.extend_from_slice(boundary_gamma);
    }

    /// Reports boundary contacts and coupling reactions on the bodies.
    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView) {
        self.forces.clear();
        let element_rows = self.element_rows();
        let split = element_rows + self.attachment_rows();

        for ((block, gamma), k) in rows.rows[element_rows..split]
            .chunks(ROWS_PER_ATTACHMENT)
            .zip(rows.gamma[element_rows..split].chunks(ROWS_PER_ATTACHMENT))
            .zip(&self.active_attachments)
        {
            let attachment = &self.attachments[*k];
            let Some(col) = ctx.bodies.column(attachment.body) else {
                continue;
            };
            let mut force = Vector::ZERO;
            let mut torque = Vector::ZERO;
            for (row, g) in block.iter().zip(gamma) {
                force += row.value3_at(col) * *g;
                torque += row.value3_at(col + 3) * *g;
            }
            self.forces
                .add(attachment.body, force / ctx.dt, torque / ctx.dt);
        }

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

/// Writes the strain and volume gradients of one element.
fn fill_element_rows(
    block: &mut [SparseRow],
    start: usize,
    element: &Tetrahedron,
    f: &Matrix,
    cof: &Matrix,
    h: &[Vector; 4],
) {
    for ((a, b), row) in STRAIN_PAIRS.iter().zip(block.iter_mut()) {
        let (fa, fb) = (f.col(*a), f.col(*b));
        for (node, hk) in element.nodes.iter().zip(h) {
            let grad = (fb * hk[*a] + fa * hk[*b]) * 0.5;
            row.add3(start + *node as usize * 3, grad);
        }
    }
    for (node, hk) in element.nodes.iter().zip(h) {
        block[6].add3(start + *node as usize * 3, *cof * *hk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RigidBody;

    fn unit_tet() -> (Vec<Vector>, Tetrahedron) {
        let positions = vec![
            Vector::new(0.0, 0.0, 0.0),
            Vector::new(1.0, 0.0, 0.0),
            Vector::new(0.0, 1.0, 0.0),
            Vector::new(0.0, 0.0, 1.0),
        ];
        (positions, Tetrahedron::new(0, 1, 2, 3))
    }

    fn container(positions: &[Vector], elements: &[Tetrahedron]) -> FeaContainer {
        let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
        fea.add_nodes(positions, &vec![Vector::ZERO; positions.len()])
            .unwrap();
        fea.add_elements(elements).unwrap();
        fea.initialize(&RigidBodySet::new()).unwrap();
        fea
    }

    /// Assembles this container's rows alone, with its DOFs at column 0.
    fn assemble(
        fea: &mut FeaContainer,
        bodies: &RigidBodySet,
    ) -> (Vec<SparseRow>, Vec<Real>, Vec<Real>) {
        let ctx = StepContext {
            dt: 0.01,
            time: 0.0,
            gravity: Vector::ZERO,
            bodies,
        };
        fea.update(&ctx, &ContactSet::default());
        fea.setup(ContainerOffsets {
            dof_start: bodies.num_dofs(),
            num_dofs: fea.num_dofs(),
            row_start: 0,
            num_rows: fea.num_constraints(),
        });
        let n = fea.num_constraints();
        let mut rows = vec![SparseRow::default(); n];
        let (mut b, mut e) = (vec![0.0; n], vec![0.0; n]);
        let mut block = RowBlock {
            start: 0,
            rows: &mut rows,
            b: &mut b,
            e: &mut e,
        };
        fea.generate_sparsity(&ctx, &mut block);
        fea.build_d(&ctx, &mut block);
        fea.build_b(&ctx, &mut block);
        fea.build_e(&ctx, &mut block);
        (rows, b, e)
    }

    #[test]
    fn rest_shape_has_zero_residual() {
        let (positions, tet) = unit_tet();
        let mut fea = container(&positions, &[tet]);
        assert!(fea.element_residual(0).iter().all(|c| c.abs() < 1e-6));
        assert!((fea.element_volume(0) - 1.0 / 6.0).abs() < 1e-6);

        let (rows, b, e) = assemble(&mut fea, &RigidBodySet::new());
        assert_eq!(rows.len(), ROWS_PER_ELEMENT);
        assert!(b.iter().all(|b| b.abs() < 1e-4));
        assert!(e.iter().all(|e| *e > 0.0));
    }

    #[test]
    fn node_mass_splits_element_mass() {
        let (positions, tet) = unit_tet();
        let fea = container(&positions, &[tet]);
        let total: Real = fea.node_mass().iter().sum();
        assert!((total - 1000.0 / 6.0).abs() < 1e-2);
        assert!((fea.node_mass()[2] - total / 4.0).abs() < 1e-3);
    }

    #[test]
    fn rows_match_finite_differences() {
        let (positions, tet) = unit_tet();
        let mut fea = container(&positions, &[tet]);
        // deform away from rest so every row has a non-trivial gradient
        fea.positions[1] = Vector::new(1.2, 0.1, -0.05);
        fea.positions[3] = Vector::new(0.1, -0.1, 0.9);
        let (rows, _, _) = assemble(&mut fea, &RigidBodySet::new());

        let direction: Vec<Vector> = vec![
            Vector::new(0.3, -0.2, 0.1),
            Vector::new(-0.1, 0.4, 0.2),
            Vector::new(0.2, 0.1, -0.3),
            Vector::new(-0.4, -0.1, 0.2),
        ];
        let mut v = vec![0.0; 12];
        for (k, d) in direction.iter().enumerate() {
            d.write_to_slice(&mut v[k * 3..k * 3 + 3]);
        }

        let eps = 1e-3;
        let base = fea.positions.clone();
        let shifted = |sign: Real| {
            let mut perturbed = fea.clone();
            for ((x, b), d) in perturbed.positions.iter_mut().zip(&base).zip(&direction) {
                *x = *b + *d * (sign * eps);
            }
            perturbed.element_residual(0)
        };
        let plus = shifted(1.0);
        let minus = shifted(-1.0);
        for (k, row) in rows.iter().enumerate() {
            let numeric = (plus[k] - minus[k]) / (2.0 * eps);
            let analytic = row.dot(&v);
            assert!(
                (numeric - analytic).abs() < 1e-2 * analytic.abs().max(1.0),
                "row {k}: {numeric} vs {analytic}"
            );
        }
    }

    #[test]
    fn surface_of_two_tets_is_outward() {
        let mut positions = unit_tet().0;
        positions.push(Vector::new(1.0, 1.0, 1.0));
        let elements = [Tetrahedron::new(0, 1, 2, 3), Tetrahedron::new(1, 2, 3, 4)];
        let fea = container(&positions, &elements);
        let surface = fea.surface();
        assert_eq!(surface.triangles.len(), 6);
        assert_eq!(surface.nodes, vec![0, 1, 2, 3, 4]);
        assert_eq!(surface.elements, vec![0, 1]);

        let centroid: Vector = positions.iter().copied().sum::<Vector>() / positions.len() as Real;
        for tri in &surface.triangles {
            let [a, b, c] = tri.map(|n| positions[n as usize]);
            let normal = (b - a).cross(c - a);
            assert!(normal.dot((a + b + c) / 3.0 - centroid) > 0.0, "{tri:?}");
        }
    }

    #[test]
    fn rejects_invalid_meshes() {
        let (positions, _) = unit_tet();
        let velocities = vec![Vector::ZERO; 4];
        let bodies = RigidBodySet::new();

        let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
        fea.add_nodes(&positions, &velocities).unwrap();
        fea.add_elements(&[Tetrahedron::new(0, 1, 2, 7)]).unwrap();
        assert_eq!(
            fea.initialize(&bodies),
            Err(ConfigError::ElementIndexOutOfRange {
                element: 0,
                node: 7,
                count: 4
            })
        );

        let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
        fea.add_nodes(&positions, &velocities).unwrap();
        fea.add_elements(&[Tetrahedron::new(0, 1, 1, 3)]).unwrap();
        assert_eq!(fea.initialize(&bodies), Err(ConfigError::DegenerateElement(0)));

        let mut other = RigidBodySet::new();
        let stale = other.insert(RigidBody::fixed(Vector::ZERO));
        let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
        fea.add_nodes(&positions, &velocities).unwrap();
        fea.attach(RigidAttachment::new(0, stale, Vector::ZERO));
        other.remove(stale);
        assert_eq!(fea.initialize(&other), Err(ConfigError::UnknownBody));
    }

    #[test]
    fn element_added_after_a_step_is_measured() {
        let (positions, tet) = unit_tet();
        let mut fea = container(&positions, &[tet]);
        let bodies = RigidBodySet::new();
        assemble(&mut fea, &bodies);

        fea.add_nodes(&[Vector::ONE], &[Vector::ZERO]).unwrap();
        fea.add_elements(&[Tetrahedron::new(1, 2, 3, 4)]).unwrap();
        assert_eq!(fea.node_mass().len(), 5);
        assert!((fea.element_volume(1) - 1.0 / 3.0).abs() < 1e-5);
        let density = fea.params().material_density;
        assert!((fea.node_mass()[4] - density / 12.0).abs() < 1e-2);
        assert!((fea.node_mass()[0] - density / 24.0).abs() < 1e-2);
        assert!(fea.element_residual(1).iter().all(|c| c.abs() < 1e-5));

        let (rows, b, _) = assemble(&mut fea, &bodies);
        assert_eq!(rows.len(), 2 * ROWS_PER_ELEMENT);
        assert!(b.iter().all(|b| b.abs() < 1e-3));
    }

    #[test]
    fn late_elements_are_validated() {
        let (positions, tet) = unit_tet();
        let mut fea = container(&positions, &[tet]);
        assert_eq!(
            fea.add_elements(&[Tetrahedron::new(0, 1, 2, 9)]),
            Err(ConfigError::ElementIndexOutOfRange {
                element: 1,
                node: 9,
                count: 4
            })
        );
        assert_eq!(fea.elements().len(), 1);
        assert_eq!(fea.node_mass().len(), 4);
    }

    #[test]
    fn attachment_rows_couple_node_and_body() {
        let (positions, tet) = unit_tet();
        let mut bodies = RigidBodySet::new();
        let body = bodies.insert(RigidBody::dynamic(Vector::new(0.0, -1.0, 0.0), 1.0, Vector::ONE));

        let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
        fea.add_nodes(&positions, &vec![Vector::ZERO; 4]).unwrap();
        fea.add_elements(&[tet]).unwrap();
        fea.attach_at_current_position(0, body, &bodies).unwrap();
        fea.initialize(&bodies).unwrap();

        let (rows, b, e) = assemble(&mut fea, &bodies);
        assert_eq!(rows.len(), ROWS_PER_ELEMENT + ROWS_PER_ATTACHMENT);
        let coupling = &rows[ROWS_PER_ELEMENT..];
        // node 0 sits one unit above the body origin
        assert_eq!(coupling[0].value3_at(6), Vector::X);
        assert_eq!(coupling[0].value3_at(0), -Vector::X);
        assert_eq!(coupling[0].value3_at(3), -Vector::Y.cross(Vector::X));
        assert!(b[ROWS_PER_ELEMENT..].iter().all(|b| b.abs() < 1e-6));
        assert!(e[ROWS_PER_ELEMENT..].iter().all(|e| *e == 0.0));
    }
}
