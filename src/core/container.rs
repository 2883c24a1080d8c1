//! Lifecycle every DOF container implements.
//!
//! Per step the coordinating system calls, in this order:
//! `compute_dof`, `update`, `setup`, `compute_mass`, `compute_inv_mass`,
//! `load_velocities`, `generate_sparsity`, `build_d`, `build_b`, `build_e`,
//! `pre_solve`, then `inner_solve`, `update_rhs` and `project` once per solver
//! iteration, then `post_solve`, `calculate_contact_forces` and
//! `update_position`.

use crate::collision::{ContactQuery, ContactSet};
use crate::error::ConfigResult;
use crate::math::{Real, Vector};
use crate::solver::GridSolver;

use super::assembly::{DofBlock, RowBlock, RowView, SparseRow};
use super::boundary::ContactForces;
use super::handle::BodyHandle;
use super::offsets::{ContainerCounts, ContainerOffsets};
use super::rigid::RigidBodySet;

/// Read-only step data shared with every container.
#[derive(Copy, Clone)]
pub struct StepContext<'a> {
    pub dt: Real,
    pub time: Real,
    pub gravity: Vector,
    pub bodies: &'a RigidBodySet,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ContainerKind {
    Rigid,
    Fluid,
    Mpm,
    Flip,
    Fea,
}

pub trait DofContainer {
    fn kind(&self) -> ContainerKind;

    /// Data-dependent checks and one-time precomputation.
    fn initialize(&mut self, _bodies: &RigidBodySet) -> ConfigResult<()> {
        Ok(())
    }

    fn num_nodes(&self) -> usize;
    fn positions(&self) -> &[Vector];
    fn velocities(&self) -> &[Vector];
    fn positions_mut(&mut self) -> &mut [Vector];
    fn velocities_mut(&mut self) -> &mut [Vector];
    fn contact_query(&self) -> ContactQuery;

    /// Overwrites the position of node `i`. Returns `false` if there is no
    /// such node.
    fn set_position(&mut self, i: usize, position: Vector) -> bool {
        match self.positions_mut().get_mut(i) {
            Some(x) => {
                *x = position;
                true
            }
            None => false,
        }
    }

    fn set_velocity(&mut self, i: usize, velocity: Vector) -> bool {
        match self.velocities_mut().get_mut(i) {
            Some(v) => {
                *v = velocity;
                true
            }
            None => false,
        }
    }

    /// Sizes container-owned DOFs that depend on the current state (grids).
    fn compute_dof(&mut self) {}

    /// Ingests this step's contacts and refreshes per-step state.
    fn update(&mut self, ctx: &StepContext, contacts: &ContactSet);

    fn num_dofs(&self) -> usize;
    fn num_constraints(&self) -> usize;

    fn counts(&self) -> ContainerCounts {
        ContainerCounts {
            num_dofs: self.num_dofs(),
            num_rows: self.num_constraints(),
        }
    }

    /// Records the ranges assigned for this step.
    fn setup(&mut self, offsets: ContainerOffsets);
    fn offsets(&self) -> ContainerOffsets;

    /// Jacobian non-zeros of this container's rows at the current offsets,
    /// counted by declaring the sparsity into scratch rows.
    fn num_non_zeros(&self, ctx: &StepContext) -> usize {
        let n = self.num_constraints();
        let mut rows = vec![SparseRow::default(); n];
        let (mut b, mut e) = (vec![0.0; n], vec![0.0; n]);
        let mut block = RowBlock {
            start: self.offsets().row_start,
            rows: &mut rows,
            b: &mut b,
            e: &mut e,
        };
        self.generate_sparsity(ctx, &mut block);
        rows.iter().map(SparseRow::nnz).sum()
    }

    fn compute_mass(&self, dofs: &mut DofBlock);
    fn compute_inv_mass(&self, dofs: &mut DofBlock);
    /// Writes current velocities and the free impulse.
    fn load_velocities(&self, ctx: &StepContext, dofs: &mut DofBlock);

    fn generate_sparsity(&self, ctx: &StepContext, rows: &mut RowBlock);
    fn build_d(&self, ctx: &StepContext, rows: &mut RowBlock);
    fn build_b(&self, ctx: &StepContext, rows: &mut RowBlock);
    fn build_e(&self, ctx: &StepContext, rows: &mut RowBlock);

    fn pre_solve(&mut self, ctx: &StepContext, dofs: &mut DofBlock, gamma: &mut [Real]);

    fn inner_solve(
        &mut self,
        _ctx: &StepContext,
        _dofs: &mut DofBlock,
        _solver: &mut dyn GridSolver,
    ) {
    }

    /// Whether the free impulse changed since the last call.
    fn update_rhs(&mut self) -> bool {
        false
    }

    /// Makes the multipliers of this container feasible in place.
    fn project(&self, gamma: &mut [Real]);

    /// `v` holds this container's solved velocities.
    fn post_solve(&mut self, ctx: &StepContext, v: &[Real], gamma: &[Real]);

    fn calculate_contact_forces(&mut self, ctx: &StepContext, rows: RowView);

    fn update_position(&mut self, ctx: &StepContext);

    fn contact_forces(&self) -> &ContactForces;

    fn body_contact_force(&self, body: BodyHandle) -> Option<Vector> {
        self.contact_forces().force(body)
    }

    fn body_contact_torque(&self, body: BodyHandle) -> Option<Vector> {
        self.contact_forces().torque(body)
    }
}

/// Copies `gamma_old` into `gamma` when the row count is unchanged, otherwise
/// starts from zero.
pub fn warm_start(gamma_old: &[Real], gamma: &mut [Real]) {
    if gamma_old.len() == gamma.len() {
        gamma.copy_from_slice(gamma_old);
    } else {
        gamma.fill(0.0);
    }
}

/// Panics if `offsets` does not match what the container declared.
#[inline]
pub fn check_offsets(container: ContainerKind, offsets: &ContainerOffsets, counts: ContainerCounts) {
    assert!(
        offsets.num_dofs == counts.num_dofs && offsets.num_rows == counts.num_rows,
        "{container:?} container declared {counts:?} but was set up with {offsets:?}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warm_start_requires_matching_size() {
        let mut gamma = vec![9.0; 3];
        warm_start(&[1.0, 2.0, 3.0], &mut gamma);
        assert_eq!(gamma, vec![1.0, 2.0, 3.0]);
        warm_start(&[1.0, 2.0], &mut gamma);
        assert_eq!(gamma, vec![0.0; 3]);
    }

    #[test]
    #[should_panic]
    fn mismatched_offsets_panic() {
        check_offsets(
            ContainerKind::Fluid,
            &ContainerOffsets {
                dof_start: 0,
                num_dofs: 3,
                row_start: 0,
                num_rows: 2,
            },
            ContainerCounts {
                num_dofs: 3,
                num_rows: 1,
            },
        );
    }
}
