//! Helper functions for materials
//!
//! Parameter conversions used by MPM and FEA.

/// Physics parameter conversions
pub mod physics {
    use crate::math::Real;

    /// Computes the Lamé parameters (lambda, mu) from Young's modulus and Poisson ratio
    #[inline]
    pub fn lame_lambda_mu(young_modulus: Real, poisson_ratio: Real) -> (Real, Real) {
        let lambda =
            young_modulus * poisson_ratio / ((1.0 + poisson_ratio) * (1.0 - 2.0 * poisson_ratio));
        let mu = shear_modulus(young_modulus, poisson_ratio);
        (lambda, mu)
    }

    /// Shear modulus (mu) from Young's modulus and Poisson ratio
    #[inline]
    pub fn shear_modulus(young_modulus: Real, poisson_ratio: Real) -> Real {
        young_modulus / (2.0 * (1.0 + poisson_ratio))
    }

    /// Bulk modulus from Young's modulus and Poisson ratio
    #[inline]
    pub fn bulk_modulus(young_modulus: Real, poisson_ratio: Real) -> Real {
        young_modulus / (3.0 * (1.0 - 2.0 * poisson_ratio))
    }
}
