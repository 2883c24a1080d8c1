use bevy::math::{IVec3, Mat3, Quat, Vec3};
use nalgebra::Matrix3;

pub type Real = f32;
pub const DIM: usize = 3;

pub type Vector = Vec3;
pub type Matrix = Mat3;
pub type Rotation = Quat;
pub type GridCoord = IVec3;

#[inline(always)]
pub fn identity_matrix() -> Matrix {
    Mat3::IDENTITY
}

#[inline(always)]
pub fn matrix_trace(m: &Matrix) -> Real {
    m.x_axis.x + m.y_axis.y + m.z_axis.z
}

#[inline(always)]
pub fn diagonal_from_vec(vec: Vector) -> Matrix {
    Matrix::from_diagonal(vec)
}

/// `a ⊗ b`, i.e. `m[i][j] = a[i] * b[j]`.
#[inline(always)]
pub fn outer_product(a: Vector, b: Vector) -> Matrix {
    Mat3::from_cols(a * b.x, a * b.y, a * b.z)
}

/// Frobenius inner product `a : b`.
#[inline(always)]
pub fn double_dot(a: &Matrix, b: &Matrix) -> Real {
    a.x_axis.dot(b.x_axis) + a.y_axis.dot(b.y_axis) + a.z_axis.dot(b.z_axis)
}

#[inline(always)]
pub fn matrix_is_finite(m: &Matrix) -> bool {
    m.x_axis.is_finite() && m.y_axis.is_finite() && m.z_axis.is_finite()
}

/// Symmetric part `(m + mᵀ) / 2`.
#[inline]
pub fn symmetric_part(m: &Matrix) -> Matrix {
    (*m + m.transpose()) * 0.5
}

/// Deviatoric part, removes the spherical (mean diagonal) component.
#[inline]
pub fn deviatoric_part(m: &Matrix) -> Matrix {
    let spherical = matrix_trace(m) / DIM as Real;
    *m - Matrix::from_diagonal(Vec3::splat(spherical))
}

/// Two unit tangents completing `normal` into a right-handed frame.
#[inline]
pub fn tangent_basis(normal: Vector) -> (Vector, Vector) {
    normal.any_orthonormal_pair()
}

pub fn to_nalgebra(m: &Matrix) -> Matrix3<Real> {
    Matrix3::new(
        m.x_axis.x, m.y_axis.x, m.z_axis.x, //
        m.x_axis.y, m.y_axis.y, m.z_axis.y, //
        m.x_axis.z, m.y_axis.z, m.z_axis.z,
    )
}

pub fn from_nalgebra(m: &Matrix3<Real>) -> Matrix {
    Mat3::from_cols(
        Vec3::new(m[(0, 0)], m[(1, 0)], m[(2, 0)]),
        Vec3::new(m[(0, 1)], m[(1, 1)], m[(2, 1)]),
        Vec3::new(m[(0, 2)], m[(1, 2)], m[(2, 2)]),
    )
}

/// Rotation-preserving singular value decomposition `m = U diag(sigma) Vᵀ`.
///
/// `U` and `V` are proper rotations; a reflection, if any, is folded into the
/// sign of the smallest singular value. Returns `None` when the input is not
/// finite or the iteration fails to converge.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Svd3 {
    pub u: Matrix,
    pub sigma: Vector,
    pub v: Matrix,
}

impl Svd3 {
    pub fn compute(m: &Matrix) -> Option<Self> {
        if !matrix_is_finite(m) {
            return None;
        }

        let svd = to_nalgebra(m).try_svd(true, true, Real::EPSILON, 200)?;
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return None;
        };

        let mut u = from_nalgebra(&u);
        let mut v = from_nalgebra(&v_t).transpose();
        let s = svd.singular_values;
        let mut sigma = Vec3::new(s[0], s[1], s[2]);

        if u.determinant() < 0.0 {
            u.z_axis = -u.z_axis;
            sigma.z = -sigma.z;
        }
        if v.determinant() < 0.0 {
            v.z_axis = -v.z_axis;
            sigma.z = -sigma.z;
        }

        Some(Self { u, sigma, v })
    }

    #[inline]
    pub fn rotation(&self) -> Matrix {
        self.u * self.v.transpose()
    }

    #[inline]
    pub fn recompose(&self) -> Matrix {
        self.u * diagonal_from_vec(self.sigma) * self.v.transpose()
    }

    /// Symmetric stretch `V diag(sigma) Vᵀ`, so that `m = R S`.
    #[inline]
    pub fn stretch(&self) -> Matrix {
        self.v * diagonal_from_vec(self.sigma) * self.v.transpose()
    }
}

pub fn try_inverse(m: &Matrix) -> Option<Matrix> {
    to_nalgebra(m).try_inverse().map(|inv| from_nalgebra(&inv))
}

pub fn pseudo_inverse(m: &Matrix, eps: Real) -> Option<Matrix> {
    to_nalgebra(m)
        .pseudo_inverse(eps)
        .ok()
        .map(|inv| from_nalgebra(&inv))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_mat_close(a: &Matrix, b: &Matrix, tol: Real) {
        for (ca, cb) in [(a.x_axis, b.x_axis), (a.y_axis, b.y_axis), (a.z_axis, b.z_axis)] {
            assert!((ca - cb).abs().max_element() < tol, "{a:?} != {b:?}");
        }
    }

    #[test]
    fn outer_product_matches_definition() {
        let m = outer_product(Vec3::new(1.0, 2.0, 3.0), Vec3::new(4.0, 5.0, 6.0));
        assert_eq!(m.col(1), Vec3::new(5.0, 10.0, 15.0));
        assert_eq!(m.row(2), Vec3::new(12.0, 15.0, 18.0));
    }

    #[test]
    fn nalgebra_round_trip_keeps_layout() {
        let m = Mat3::from_cols(
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(4.0, 5.0, 6.0),
            Vec3::new(7.0, 8.0, 10.0),
        );
        let n = to_nalgebra(&m);
        assert_eq!(n[(1, 0)], 2.0);
        assert_eq!(n[(0, 1)], 4.0);
        assert_mat_close(&from_nalgebra(&n), &m, 0.0);
    }

    #[test]
    fn svd_recomposes_with_proper_rotations() {
        let m = Mat3::from_cols(
            Vec3::new(1.2, 0.1, -0.3),
            Vec3::new(0.0, 0.8, 0.2),
            Vec3::new(0.4, -0.1, 1.1),
        );
        let svd = Svd3::compute(&m).unwrap();
        assert!((svd.u.determinant() - 1.0).abs() < 1e-4);
        assert!((svd.v.determinant() - 1.0).abs() < 1e-4);
        assert_mat_close(&svd.recompose(), &m, 1e-4);
        assert_mat_close(&(svd.rotation() * svd.stretch()), &m, 1e-4);
    }

    #[test]
    fn svd_of_reflection_moves_sign_into_sigma() {
        let m = Mat3::from_diagonal(Vec3::new(1.0, 1.0, -2.0));
        let svd = Svd3::compute(&m).unwrap();
        assert!(svd.sigma.min_element() < 0.0);
        assert_mat_close(&svd.recompose(), &m, 1e-4);
    }

    #[test]
    fn tangent_basis_is_orthonormal() {
        let n = Vec3::new(0.3, -0.2, 0.9).normalize();
        let (u, v) = tangent_basis(n);
        assert!(u.dot(n).abs() < 1e-6);
        assert!(v.dot(n).abs() < 1e-6);
        assert!(u.dot(v).abs() < 1e-6);
        assert!((u.length() - 1.0).abs() < 1e-6);
    }
}
