//! Global sparse system shared by all containers.
//!
//! Columns are generalized velocities (rigid bodies first, then containers),
//! rows are constraints. Containers never see the whole system: they receive
//! [`DofBlock`] and [`RowBlock`] views restricted to the ranges the
//! [`OffsetTable`] assigned them for the current step.

use rayon::prelude::*;

use crate::math::{Matrix, Real, Vector};

use super::offsets::{ContainerOffsets, OffsetTable};
use super::rigid::BODY_DOFS;

/// One Jacobian row, stored as parallel column/value arrays.
///
/// The column pattern is declared first (sparsity), values are accumulated
/// afterwards into declared columns only.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SparseRow {
    /// Global row index, used in diagnostics only.
    index: usize,
    cols: Vec<usize>,
    vals: Vec<Real>,
    cursor: usize,
}

impl SparseRow {
    pub fn with_index(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn clear(&mut self) {
        self.cols.clear();
        self.vals.clear();
        self.cursor = 0;
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.cols.len()
    }

    /// Adds `col` to the pattern; repeated declarations are merged.
    pub fn declare(&mut self, col: usize) {
        if !self.cols.contains(&col) {
            self.cols.push(col);
            self.vals.push(0.0);
        }
    }

    /// Declares the three consecutive columns of a point DOF.
    pub fn declare3(&mut self, col: usize) {
        for k in 0..3 {
            self.declare(col + k);
        }
    }

    /// Declares the six columns of a rigid body.
    pub fn declare6(&mut self, col: usize) {
        for k in 0..BODY_DOFS {
            self.declare(col + k);
        }
    }

    #[track_caller]
    fn slot(&mut self, col: usize) -> usize {
        if self.cols.get(self.cursor) == Some(&col) {
            return self.cursor;
        }
        match self.cols.iter().position(|&c| c == col) {
            Some(k) => k,
            None => panic!(
                "row {}: column {col} was never declared (declared columns {:?})",
                self.index, self.cols
            ),
        }
    }

    /// Accumulates `value` into a declared column.
    #[track_caller]
    pub fn add(&mut self, col: usize, value: Real) {
        let k = self.slot(col);
        self.vals[k] += value;
        self.cursor = k + 1;
    }

    #[track_caller]
    pub fn add3(&mut self, col: usize, value: Vector) {
        self.add(col, value.x);
        self.add(col + 1, value.y);
        self.add(col + 2, value.z);
    }

    pub fn value_at(&self, col: usize) -> Option<Real> {
        self.cols
            .iter()
            .position(|&c| c == col)
            .map(|k| self.vals[k])
    }

    /// Three consecutive values starting at `col`, zero where undeclared.
    pub fn value3_at(&self, col: usize) -> Vector {
        Vector::new(
            self.value_at(col).unwrap_or(0.0),
            self.value_at(col + 1).unwrap_or(0.0),
            self.value_at(col + 2).unwrap_or(0.0),
        )
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, Real)> + '_ {
        self.cols.iter().copied().zip(self.vals.iter().copied())
    }

    #[inline]
    pub fn dot(&self, x: &[Real]) -> Real {
        self.entries().map(|(c, v)| v * x[c]).sum()
    }

    /// `out += scale * rowᵀ`.
    #[inline]
    pub fn scatter(&self, scale: Real, out: &mut [Real]) {
        for (c, v) in self.entries() {
            out[c] += scale * v;
        }
    }
}

/// Exclusive view on one container's velocity columns.
pub struct DofBlock<'a> {
    pub start: usize,
    pub v: &'a mut [Real],
    /// Free impulse (external forces times the step).
    pub hf: &'a mut [Real],
    pub mass: &'a mut [Real],
    pub inv_mass: &'a mut [Real],
}

impl DofBlock<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.v.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    #[inline]
    pub fn velocity3(&self, node: usize) -> Vector {
        Vector::from_slice(&self.v[node * 3..node * 3 + 3])
    }

    #[inline]
    pub fn set_velocity3(&mut self, node: usize, value: Vector) {
        value.write_to_slice(&mut self.v[node * 3..node * 3 + 3]);
    }

    #[inline]
    pub fn add_impulse3(&mut self, node: usize, value: Vector) {
        let hf = &mut self.hf[node * 3..node * 3 + 3];
        hf[0] += value.x;
        hf[1] += value.y;
        hf[2] += value.z;
    }

    #[inline]
    pub fn set_mass3(&mut self, node: usize, mass: Real) {
        self.mass[node * 3..node * 3 + 3].fill(mass);
    }

    #[inline]
    pub fn set_inv_mass3(&mut self, node: usize, inv_mass: Real) {
        self.inv_mass[node * 3..node * 3 + 3].fill(inv_mass);
    }
}

/// Exclusive view on one container's constraint rows.
pub struct RowBlock<'a> {
    pub start: usize,
    pub rows: &'a mut [SparseRow],
    pub b: &'a mut [Real],
    pub e: &'a mut [Real],
}

impl RowBlock<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Read-only view on one container's rows and multipliers after the solve.
#[derive(Copy, Clone)]
pub struct RowView<'a> {
    pub start: usize,
    pub rows: &'a [SparseRow],
    pub gamma: &'a [Real],
}

#[derive(Clone, Debug, Default)]
pub struct GlobalSystem {
    rigid_slots: usize,
    pub v: Vec<Real>,
    pub hf: Vec<Real>,
    pub v_free: Vec<Real>,
    pub mass: Vec<Real>,
    pub inv_mass: Vec<Real>,
    /// World inverse inertia of each rigid slot.
    pub body_inv_inertia: Vec<Matrix>,
    pub rows: Vec<SparseRow>,
    pub b: Vec<Real>,
    pub e: Vec<Real>,
    pub gamma: Vec<Real>,
    pub rhs: Vec<Real>,
}

impl GlobalSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resizes every buffer to the layout of `table` and clears all values.
    pub fn reset(&mut self, table: &OffsetTable) {
        let n = table.total_dofs();
        let m = table.total_rows();
        self.rigid_slots = table.rigid_dofs() / BODY_DOFS;

        for buffer in [
            &mut self.v,
            &mut self.hf,
            &mut self.v_free,
            &mut self.mass,
            &mut self.inv_mass,
        ] {
            buffer.clear();
            buffer.resize(n, 0.0);
        }
        self.body_inv_inertia.clear();
        self.body_inv_inertia.resize(self.rigid_slots, Matrix::ZERO);

        self.rows.resize_with(m, SparseRow::default);
        for (index, row) in self.rows.iter_mut().enumerate() {
            row.clear();
            row.index = index;
        }
        for buffer in [&mut self.b, &mut self.e, &mut self.gamma, &mut self.rhs] {
            buffer.clear();
            buffer.resize(m, 0.0);
        }
    }

    #[inline]
    pub fn num_dofs(&self) -> usize {
        self.v.len()
    }

    #[inline]
    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Declared Jacobian entries over all rows.
    pub fn num_non_zeros(&self) -> usize {
        self.rows.iter().map(SparseRow::nnz).sum()
    }

    #[inline]
    pub fn rigid_slots(&self) -> usize {
        self.rigid_slots
    }

    pub fn dof_block(&mut self, offsets: &ContainerOffsets) -> DofBlock<'_> {
        let range = offsets.dofs();
        DofBlock {
            start: offsets.dof_start,
            v: &mut self.v[range.clone()],
            hf: &mut self.hf[range.clone()],
            mass: &mut self.mass[range.clone()],
            inv_mass: &mut self.inv_mass[range],
        }
    }

    pub fn row_block(&mut self, offsets: &ContainerOffsets) -> RowBlock<'_> {
        let range = offsets.rows();
        RowBlock {
            start: offsets.row_start,
            rows: &mut self.rows[range.clone()],
            b: &mut self.b[range.clone()],
            e: &mut self.e[range],
        }
    }

    /// Velocity block and multipliers of one container, borrowed together for
    /// `pre_solve`.
    pub fn dof_block_with_gamma(
        &mut self,
        offsets: &ContainerOffsets,
    ) -> (DofBlock<'_>, &mut [Real]) {
        let range = offsets.dofs();
        let block = DofBlock {
            start: offsets.dof_start,
            v: &mut self.v[range.clone()],
            hf: &mut self.hf[range.clone()],
            mass: &mut self.mass[range.clone()],
            inv_mass: &mut self.inv_mass[range],
        };
        (block, &mut self.gamma[offsets.rows()])
    }

    pub fn row_view(&self, offsets: &ContainerOffsets) -> RowView<'_> {
        let range = offsets.rows();
        RowView {
            start: offsets.row_start,
            rows: &self.rows[range.clone()],
            gamma: &self.gamma[range],
        }
    }

    /// `out = M⁻¹ x`, with full 3x3 inertia blocks for rigid rotations.
    pub fn apply_inv_mass(&self, x: &[Real], out: &mut [Real]) {
        let rigid_dofs = self.rigid_slots * BODY_DOFS;
        for slot in 0..self.rigid_slots {
            let c = slot * BODY_DOFS;
            for k in 0..3 {
                out[c + k] = self.inv_mass[c + k] * x[c + k];
            }
            let w = self.body_inv_inertia[slot] * Vector::from_slice(&x[c + 3..c + 6]);
            w.write_to_slice(&mut out[c + 3..c + 6]);
        }
        out[rigid_dofs..]
            .par_iter_mut()
            .zip(x[rigid_dofs..].par_iter())
            .zip(self.inv_mass[rigid_dofs..].par_iter())
            .for_each(|((o, xi), mi)| *o = mi * xi);
    }

    /// `v_free = v + M⁻¹ hf`.
    pub fn compute_free_velocity(&mut self) {
        let mut dv = vec![0.0; self.num_dofs()];
        self.apply_inv_mass(&self.hf, &mut dv);
        self.v_free
            .par_iter_mut()
            .zip(self.v.par_iter().zip(dv.par_iter()))
            .for_each(|(vf, (v, dv))| *vf = v + dv);
    }

    /// `out = D x`.
    pub fn mul(&self, x: &[Real], out: &mut [Real]) {
        out.par_iter_mut()
            .zip(self.rows.par_iter())
            .for_each(|(o, row)| *o = row.dot(x));
    }

    /// `out = Dᵀ gamma`.
    pub fn transpose_mul(&self, gamma: &[Real], out: &mut [Real]) {
        out.fill(0.0);
        for (row, g) in self.rows.iter().zip(gamma) {
            if *g != 0.0 {
                row.scatter(*g, out);
            }
        }
    }

    /// `out = (D M⁻¹ Dᵀ + E) gamma`.
    pub fn apply_schur(&self, gamma: &[Real], out: &mut [Real]) {
        let n = self.num_dofs();
        let mut impulse = vec![0.0; n];
        let mut dv = vec![0.0; n];
        self.transpose_mul(gamma, &mut impulse);
        self.apply_inv_mass(&impulse, &mut dv);
        self.mul(&dv, out);
        out.par_iter_mut()
            .zip(self.e.par_iter().zip(gamma.par_iter()))
            .for_each(|(o, (e, g))| *o += e * g);
    }

    /// `rhs = D v_free + b`.
    pub fn compute_rhs(&mut self) {
        let mut rhs = std::mem::take(&mut self.rhs);
        self.mul(&self.v_free, &mut rhs);
        rhs.par_iter_mut()
            .zip(self.b.par_iter())
            .for_each(|(r, b)| *r += b);
        self.rhs = rhs;
    }

    /// `v = v_free + M⁻¹ Dᵀ gamma`.
    pub fn finalize_velocity(&mut self) {
        let n = self.num_dofs();
        let mut impulse = vec![0.0; n];
        let mut dv = vec![0.0; n];
        self.transpose_mul(&self.gamma, &mut impulse);
        self.apply_inv_mass(&impulse, &mut dv);
        self.v
            .par_iter_mut()
            .zip(self.v_free.par_iter().zip(dv.par_iter()))
            .for_each(|(v, (vf, dv))| *v = vf + dv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::offsets::ContainerCounts;

    fn table() -> OffsetTable {
        OffsetTable::build(
            6,
            [ContainerCounts {
                num_dofs: 3,
                num_rows: 1,
            }],
        )
    }

    #[test]
    fn undeclared_columns_are_rejected() {
        let mut row = SparseRow::with_index(2);
        row.declare3(3);
        row.add(4, 2.0);
        assert_eq!(row.value_at(4), Some(2.0));
        let result = std::panic::catch_unwind(move || {
            let mut row = row;
            row.add(9, 1.0);
        });
        let payload = result.unwrap_err();
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("row 2"), "{message}");
        assert!(message.contains("column 9"), "{message}");
    }

    #[test]
    fn reset_numbers_rows() {
        let mut system = GlobalSystem::new();
        system.reset(&OffsetTable::build(
            0,
            [ContainerCounts {
                num_dofs: 3,
                num_rows: 4,
            }],
        ));
        assert_eq!(system.rows[3].index(), 3);
    }

    #[test]
    fn declarations_are_merged() {
        let mut row = SparseRow::default();
        row.declare3(0);
        row.declare3(0);
        assert_eq!(row.nnz(), 3);
    }

    #[test]
    fn schur_product_matches_hand_computation() {
        let table = table();
        let mut system = GlobalSystem::new();
        system.reset(&table);

        // body with mass 2, unit inertia; point with mass 4
        system.inv_mass[0..3].fill(0.5);
        system.body_inv_inertia[0] = Matrix::IDENTITY;
        system.inv_mass[6..9].fill(0.25);

        // separation along y between body and point, lever arm r = (1, 0, 0)
        let r = Vector::X;
        let n = Vector::Y;
        let row = &mut system.rows[0];
        row.declare6(0);
        row.declare3(6);
        row.add3(0, -n);
        row.add3(3, -r.cross(n));
        row.add3(6, n);
        system.e[0] = 0.1;

        let mut out = [0.0];
        system.apply_schur(&[2.0], &mut out);
        // (0.5 + |r x n|^2 + 0.25 + 0.1) * 2
        assert!((out[0] - 2.0 * (0.5 + 1.0 + 0.25 + 0.1)).abs() < 1e-5);
    }

    #[test]
    fn blocks_cover_only_their_range() {
        let table = table();
        let mut system = GlobalSystem::new();
        system.reset(&table);
        let offsets = *table.get(0).unwrap();
        let mut dofs = system.dof_block(&offsets);
        dofs.set_velocity3(0, Vector::ONE);
        assert_eq!(dofs.len(), 3);
        assert_eq!(&system.v[..6], &[0.0; 6]);
        assert_eq!(&system.v[6..], &[1.0; 3]);
    }
}
