//! Accelerated projected gradient descent for the cone complementarity
//! problem `min ½ γᵀNγ + rᵀγ` subject to every container's feasible set.
//!
//! Nesterov acceleration with backtracking on the Lipschitz estimate and
//! gradient-based adaptive restart. The solver only sees the problem through
//! [`ConeProblem`]; containers take part via their solve-phase hooks.

use bevy::log::debug;
use nalgebra::DVector;

use crate::math::Real;

use super::grid_solver::SolveReport;

pub trait ConeProblem {
    fn num_rows(&self) -> usize;
    /// `out = N gamma`.
    fn apply_schur(&self, gamma: &[Real], out: &mut [Real]);
    fn rhs(&self) -> &[Real];
    /// Projects `gamma` onto the feasible set, block by block.
    fn project(&self, gamma: &mut [Real]);
    /// Runs the per-iteration container hooks. Returns `true` if the right-hand
    /// side was rebuilt.
    fn begin_iteration(&mut self, iteration: usize) -> bool;
}

#[derive(Copy, Clone, Debug)]
pub struct Apgd {
    pub max_iterations: usize,
    pub tolerance: Real,
}

impl Default for Apgd {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
        }
    }
}

impl Apgd {
    pub fn new(max_iterations: usize, tolerance: Real) -> Self {
        Self {
            max_iterations,
            tolerance,
        }
    }

    /// Residual `‖γ − Π(γ − h(Nγ + r))‖ / h`.
    fn residual(
        problem: &dyn ConeProblem,
        gamma: &DVector<Real>,
        n_gamma: &DVector<Real>,
        r: &DVector<Real>,
        h: Real,
    ) -> Real {
        let mut trial = gamma - (n_gamma + r) * h;
        problem.project(trial.as_mut_slice());
        (gamma - trial).norm() / h
    }

    /// Solves in place, using the contents of `gamma` as the warm start.
    pub fn solve(&self, problem: &mut dyn ConeProblem, gamma: &mut [Real]) -> SolveReport {
        let m = problem.num_rows();
        debug_assert_eq!(gamma.len(), m);
        let mut report = SolveReport::default();
        if m == 0 {
            problem.begin_iteration(0);
            report.converged = true;
            return report;
        }

        let mut x = DVector::from_column_slice(gamma);
        problem.project(x.as_mut_slice());

        // Lipschitz estimate from two nearby points.
        let shifted = x.add_scalar(-1.0);
        let mut n_x = DVector::zeros(m);
        let mut n_shifted = DVector::zeros(m);
        problem.apply_schur(x.as_slice(), n_x.as_mut_slice());
        problem.apply_schur(shifted.as_slice(), n_shifted.as_mut_slice());
        let mut lipschitz = (n_x - n_shifted).norm() / (m as Real).sqrt();
        if !(lipschitz > 0.0 && lipschitz.is_finite()) {
            lipschitz = 1.0;
        }
        let mut step = 1.0 / lipschitz;

        let mut x_prev = x.clone();
        let mut y = x.clone();
        let mut best = x;
        let mut best_residual = Real::INFINITY;
        let mut theta: Real = 1.0;

        let mut n_y = DVector::zeros(m);
        let mut grad = DVector::zeros(m);
        let mut candidate = DVector::zeros(m);
        let mut n_candidate = DVector::zeros(m);
        let mut r = DVector::from_column_slice(problem.rhs());

        for iteration in 0..self.max_iterations {
            if problem.begin_iteration(iteration) {
                // the objective moved, earlier iterates are no longer comparable
                r.copy_from_slice(problem.rhs());
                best_residual = Real::INFINITY;
            }

            problem.apply_schur(y.as_slice(), n_y.as_mut_slice());
            grad.copy_from(&n_y);
            grad += &r;
            let obj_y = 0.5 * y.dot(&n_y) + y.dot(&r);

            loop {
                candidate.copy_from(&y);
                candidate.axpy(-step, &grad, 1.0);
                problem.project(candidate.as_mut_slice());
                problem.apply_schur(candidate.as_slice(), n_candidate.as_mut_slice());

                let obj_candidate = 0.5 * candidate.dot(&n_candidate) + candidate.dot(&r);
                let d = &candidate - &y;
                let bound = obj_y + grad.dot(&d) + 0.5 * lipschitz * d.norm_squared();
                if obj_candidate <= bound + Real::EPSILON * obj_y.abs() || lipschitz > 1e30 {
                    break;
                }
                lipschitz *= 2.0;
                step = 1.0 / lipschitz;
            }

            let theta_new = 0.5 * (-theta * theta + theta * (theta * theta + 4.0).sqrt());
            let beta = theta * (1.0 - theta) / (theta * theta + theta_new);

            let residual = Self::residual(&*problem, &candidate, &n_candidate, &r, step);
            if residual < best_residual {
                best_residual = residual;
                best.copy_from(&candidate);
            }

            // adaptive restart when the momentum points uphill
            let uphill = grad.dot(&(&candidate - &x_prev));
            if uphill > 0.0 {
                y.copy_from(&candidate);
                theta = 1.0;
            } else {
                // y = candidate + beta (candidate - x_prev)
                y.copy_from(&candidate);
                y *= 1.0 + beta;
                y.axpy(-beta, &x_prev, 1.0);
                theta = theta_new;
            }
            x_prev.copy_from(&candidate);

            lipschitz *= 0.9;
            step = 1.0 / lipschitz;

            report.iterations = iteration + 1;
            report.residual = best_residual;
            if best_residual < self.tolerance {
                report.converged = true;
                break;
            }
        }

        gamma.copy_from_slice(best.as_slice());
        debug!(
            "apgd: {} rows, {} iterations, residual {:.3e}",
            m, report.iterations, report.residual
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two decoupled unilateral rows with a diagonal N.
    struct Diagonal {
        n: Vec<Real>,
        r: Vec<Real>,
        iterations: usize,
    }

    impl ConeProblem for Diagonal {
        fn num_rows(&self) -> usize {
            self.n.len()
        }

        fn apply_schur(&self, gamma: &[Real], out: &mut [Real]) {
            for i in 0..gamma.len() {
                out[i] = self.n[i] * gamma[i];
            }
        }

        fn rhs(&self) -> &[Real] {
            &self.r
        }

        fn project(&self, gamma: &mut [Real]) {
            gamma.iter_mut().for_each(|g| *g = g.max(0.0));
        }

        fn begin_iteration(&mut self, _iteration: usize) -> bool {
            self.iterations += 1;
            false
        }
    }

    #[test]
    fn solves_unilateral_diagonal_problem() {
        let mut problem = Diagonal {
            n: vec![2.0, 0.5],
            r: vec![-1.0, 0.3],
            iterations: 0,
        };
        let mut gamma = vec![0.0; 2];
        let report = Apgd::new(500, 1e-5).solve(&mut problem, &mut gamma);

        // row 0 pushes: 2γ - 1 = 0; row 1 is separating: γ = 0
        assert!((gamma[0] - 0.5).abs() < 1e-3, "{gamma:?}");
        assert!(gamma[1].abs() < 1e-6);
        assert!(report.residual < 1e-3);
        assert!(problem.iterations >= report.iterations);
    }

    #[test]
    fn empty_problem_still_runs_hooks() {
        let mut problem = Diagonal {
            n: vec![],
            r: vec![],
            iterations: 0,
        };
        let report = Apgd::default().solve(&mut problem, &mut []);
        assert!(report.converged);
        assert_eq!(problem.iterations, 1);
    }
}
