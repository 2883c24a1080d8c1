//! Fixed-corotated hyperelasticity.

use crate::math::{Matrix, Real, Svd3, identity_matrix, matrix_trace};

/// `det(F) F⁻ᵀ`, computed from cross products so it stays defined for singular `F`.
#[inline]
pub fn cofactor(f: &Matrix) -> Matrix {
    Matrix::from_cols(
        f.y_axis.cross(f.z_axis),
        f.z_axis.cross(f.x_axis),
        f.x_axis.cross(f.y_axis),
    )
}

/// Stress state of one material point, with the rotation cached for the
/// linearized operator.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CorotatedStress {
    pub mu: Real,
    pub lambda: Real,
    pub rotation: Matrix,
    /// First Piola-Kirchhoff stress.
    pub piola: Matrix,
}

impl CorotatedStress {
    /// `P = 2 mu (F - R) + lambda (J - 1) J F⁻ᵀ`.
    pub fn evaluate(f: &Matrix, mu: Real, lambda: Real) -> Self {
        let rotation = Svd3::compute(f)
            .map(|svd| svd.rotation())
            .unwrap_or_else(identity_matrix);
        let j = f.determinant();
        let piola = (*f - rotation) * (2.0 * mu) + cofactor(f) * (lambda * (j - 1.0));
        Self {
            mu,
            lambda,
            rotation,
            piola,
        }
    }

    /// Stress increment for a deformation increment, with the rotation held
    /// fixed. The map is symmetric positive semi-definite.
    #[inline]
    pub fn differential(&self, df: &Matrix) -> Matrix {
        let volumetric = matrix_trace(&(self.rotation.transpose() * *df));
        *df * (2.0 * self.mu) + self.rotation * (self.lambda * volumetric)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::double_dot;
    use bevy::math::{Mat3, Quat, Vec3};

    #[test]
    fn cofactor_matches_inverse_transpose() {
        let f = Mat3::from_cols(
            Vec3::new(1.1, 0.2, 0.0),
            Vec3::new(-0.1, 0.9, 0.3),
            Vec3::new(0.0, 0.1, 1.2),
        );
        let expected = f.inverse().transpose() * f.determinant();
        let c = cofactor(&f);
        assert!((c.x_axis - expected.x_axis).length() < 1e-5);
        assert!((c.z_axis - expected.z_axis).length() < 1e-5);
    }

    #[test]
    fn rotation_is_stress_free() {
        let r = Mat3::from_quat(Quat::from_axis_angle(Vec3::new(1.0, 2.0, 0.5).normalize(), 0.7));
        let stress = CorotatedStress::evaluate(&r, 100.0, 50.0);
        assert!(stress.piola.x_axis.length() < 1e-3);
        assert!(stress.piola.y_axis.length() < 1e-3);
        assert!(stress.piola.z_axis.length() < 1e-3);
    }

    #[test]
    fn stretch_produces_tension() {
        let f = Mat3::from_diagonal(Vec3::new(1.1, 1.0, 1.0));
        let stress = CorotatedStress::evaluate(&f, 100.0, 0.0);
        assert!((stress.piola.x_axis.x - 20.0).abs() < 1e-3);
    }

    #[test]
    fn differential_is_positive() {
        let stress = CorotatedStress::evaluate(&Mat3::IDENTITY, 10.0, 5.0);
        let df = Mat3::from_cols(
            Vec3::new(0.1, -0.2, 0.0),
            Vec3::new(0.3, 0.0, 0.1),
            Vec3::new(0.0, 0.2, -0.1),
        );
        assert!(double_dot(&stress.differential(&df), &df) > 0.0);
    }
}
