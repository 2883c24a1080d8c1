//! Elastic/plastic split of the deformation gradient.
//!
//! The trial elastic gradient is decomposed with an SVD; singular values
//! outside `[1 - theta_c, 1 + theta_s]` are clamped and the excess is moved
//! into the plastic gradient, so `Fe * Fp` is preserved. An inverted trial
//! gradient keeps its reflection in `Fe`; only magnitudes are clamped, so the
//! plastic part stays orientation preserving.

use bevy::log::warn;

use crate::config::MIN_SINGULAR_VALUE;
use crate::math::{Matrix, Real, Svd3, Vector, diagonal_from_vec, identity_matrix};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct DeformationSplit {
    /// Elastic gradient after the yield clamp.
    pub fe: Matrix,
    /// Plastic gradient after absorbing the clamp.
    pub fp: Matrix,
    /// Clamped singular values of `fe`, negative on an inverted axis.
    pub sigma: Vector,
    /// `fp_new - fp_old`.
    pub plastic_delta: Matrix,
    /// SVD factors of the clamped elastic gradient.
    pub rotation: Matrix,
    pub stretch: Matrix,
}

pub fn split_deformation(
    fe_trial: &Matrix,
    fp: &Matrix,
    theta_c: Real,
    theta_s: Real,
) -> DeformationSplit {
    let Some(svd) = Svd3::compute(fe_trial) else {
        warn!("non-finite elastic deformation gradient, resetting to identity");
        return DeformationSplit {
            fe: identity_matrix(),
            fp: *fp,
            sigma: Vector::ONE,
            plastic_delta: Matrix::ZERO,
            rotation: identity_matrix(),
            stretch: identity_matrix(),
        };
    };

    let lower = (1.0 - theta_c).max(MIN_SINGULAR_VALUE);
    let upper = 1.0 + theta_s;
    let sign = Vector::select(svd.sigma.cmplt(Vector::ZERO), Vector::NEG_ONE, Vector::ONE);
    let magnitude = svd.sigma.abs();
    let clamped = magnitude.clamp(Vector::splat(lower), Vector::splat(upper));
    let sigma = sign * clamped;

    let fe = svd.u * diagonal_from_vec(sigma) * svd.v.transpose();
    // Fp_new = Fe_new⁻¹ Fe_trial Fp = V diag(|sigma_trial| / clamped) Vᵀ Fp
    let ratio = magnitude.max(Vector::splat(MIN_SINGULAR_VALUE)) / clamped;
    let fp_new = svd.v * diagonal_from_vec(ratio) * svd.v.transpose() * *fp;

    DeformationSplit {
        fe,
        fp: fp_new,
        sigma,
        plastic_delta: fp_new - *fp,
        rotation: svd.rotation(),
        stretch: svd.v * diagonal_from_vec(clamped) * svd.v.transpose(),
    }
}

/// Exponential hardening factor applied to both Lamé parameters.
#[inline]
pub fn hardening_scale(hardening_coefficient: Real, det_fp: Real) -> Real {
    (hardening_coefficient * (1.0 - det_fp)).exp()
}
