//! Linear solves for grid-level systems.
//!
//! Containers with an implicit grid update (MPM) receive a [`GridSolver`] as a
//! call parameter rather than holding one, so tests can pass a mock.

use bevy::log::debug;
use nalgebra::DVector;

use crate::math::Real;

/// Symmetric positive definite operator `out = A x`.
pub trait LinearOperator {
    fn dim(&self) -> usize;
    fn apply(&self, x: &[Real], out: &mut [Real]);
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SolveReport {
    pub iterations: usize,
    pub residual: Real,
    pub converged: bool,
}

pub trait GridSolver: Send + Sync {
    /// Solves `A x = rhs`, starting from the contents of `x`.
    fn solve(
        &mut self,
        op: &dyn LinearOperator,
        rhs: &[Real],
        x: &mut [Real],
        max_iterations: usize,
    ) -> SolveReport;
}

/// Unpreconditioned conjugate gradient with a relative residual criterion.
#[derive(Copy, Clone, Debug)]
pub struct ConjugateGradient {
    pub tolerance: Real,
}

impl Default for ConjugateGradient {
    fn default() -> Self {
        Self { tolerance: 1e-6 }
    }
}

impl GridSolver for ConjugateGradient {
    fn solve(
        &mut self,
        op: &dyn LinearOperator,
        rhs: &[Real],
        x: &mut [Real],
        max_iterations: usize,
    ) -> SolveReport {
        let n = op.dim();
        debug_assert_eq!(rhs.len(), n);
        debug_assert_eq!(x.len(), n);

        let b = DVector::from_column_slice(rhs);
        let mut solution = DVector::from_column_slice(x);
        let mut ax = DVector::zeros(n);
        op.apply(solution.as_slice(), ax.as_mut_slice());
        let mut r = &b - ax;
        let mut p = r.clone();
        let mut ap = DVector::zeros(n);

        let rhs_norm = b.norm().max(Real::MIN_POSITIVE);
        let mut rr = r.norm_squared();
        let mut report = SolveReport {
            iterations: 0,
            residual: rr.sqrt() / rhs_norm,
            converged: rr.sqrt() <= self.tolerance * rhs_norm,
        };

        while !report.converged && report.iterations < max_iterations {
            op.apply(p.as_slice(), ap.as_mut_slice());
            let pap = p.dot(&ap);
            if pap <= 0.0 {
                break;
            }
            let alpha = rr / pap;
            solution.axpy(alpha, &p, 1.0);
            r.axpy(-alpha, &ap, 1.0);
            let rr_new = r.norm_squared();
            // p = r + beta p
            p.axpy(1.0, &r, rr_new / rr);
            rr = rr_new;
            report.iterations += 1;
            report.residual = rr.sqrt() / rhs_norm;
            report.converged = rr.sqrt() <= self.tolerance * rhs_norm;
        }
        x.copy_from_slice(solution.as_slice());

        debug!(
            "grid solve: {} iterations, residual {:.3e}",
            report.iterations, report.residual
        );
        report
    }
}
