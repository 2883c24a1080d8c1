//! Smoothing and transfer kernels.

use std::f32::consts::PI;

use crate::math::{Real, Vector};

/// Compute the inverse dimension factor used by APIC transfers.
///
/// For the quadratic B-spline this is `4 / dx²`; keeping it in one place keeps
/// P2G and G2P consistent.
#[inline]
pub fn inv_d(cell_width: Real) -> Real {
    4.0 / (cell_width * cell_width)
}

/// 1D quadratic B-spline weights for the three nodes `base, base+1, base+2`,
/// where `fx` is the distance from `base` in cell units (`0.5 <= fx < 1.5`).
#[inline(always)]
pub fn bspline_weights(fx: Real) -> [Real; 3] {
    let a = 1.5 - fx;
    let b = fx - 1.0;
    let c = fx - 0.5;
    [0.5 * a * a, 0.75 - b * b, 0.5 * c * c]
}

/// Derivatives of [`bspline_weights`] with respect to `fx`.
#[inline(always)]
pub fn bspline_gradients(fx: Real) -> [Real; 3] {
    [fx - 1.5, -2.0 * (fx - 1.0), fx - 0.5]
}

/// Cubic spline smoothing kernel with compact support `h`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CubicSpline {
    h: Real,
    sigma: Real,
}

impl CubicSpline {
    pub fn new(h: Real) -> Self {
        Self {
            h,
            sigma: 8.0 / (PI * h * h * h),
        }
    }

    #[inline]
    pub fn support(&self) -> Real {
        self.h
    }

    #[inline]
    pub fn w(&self, r: Real) -> Real {
        let q = r / self.h;
        if q <= 0.5 {
            self.sigma * (6.0 * (q * q * q - q * q) + 1.0)
        } else if q <= 1.0 {
            let t = 1.0 - q;
            self.sigma * 2.0 * t * t * t
        } else {
            0.0
        }
    }

    /// Radial derivative `dW/dr`.
    #[inline]
    pub fn dw(&self, r: Real) -> Real {
        let q = r / self.h;
        let scale = self.sigma * 6.0 / self.h;
        if q <= 0.5 {
            scale * q * (3.0 * q - 2.0)
        } else if q <= 1.0 {
            let t = 1.0 - q;
            -scale * t * t
        } else {
            0.0
        }
    }

    /// `∇_i W(x_i - x_j)`, with `rij = x_i - x_j`.
    #[inline]
    pub fn grad_w(&self, rij: Vector) -> Vector {
        let r = rij.length();
        if r <= Real::EPSILON * self.h {
            return Vector::ZERO;
        }
        rij * (self.dw(r) / r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bspline_partition_of_unity() {
        for fx in [0.5, 0.75, 1.0, 1.3, 1.49] {
            let w = bspline_weights(fx);
            let g = bspline_gradients(fx);
            assert!((w.iter().sum::<Real>() - 1.0).abs() < 1e-6);
            assert!(g.iter().sum::<Real>().abs() < 1e-6);
        }
    }

    #[test]
    fn cubic_spline_is_continuous_and_compact() {
        let kernel = CubicSpline::new(0.1);
        let left = kernel.w(0.05 - 1e-6);
        let right = kernel.w(0.05 + 1e-6);
        assert!((left - right).abs() / left < 1e-3);
        assert_eq!(kernel.w(0.1001), 0.0);
        assert!(kernel.dw(0.03) < 0.0);
        assert_eq!(kernel.grad_w(Vector::ZERO), Vector::ZERO);
    }

    #[test]
    fn cubic_spline_integrates_to_one() {
        let h = 1.0;
        let kernel = CubicSpline::new(h);
        let n = 2000;
        let dr = h / n as Real;
        let integral: Real = (0..n)
            .map(|i| {
                let r = (i as Real + 0.5) * dr;
                4.0 * PI * r * r * kernel.w(r) * dr
            })
            .sum();
        assert!((integral - 1.0).abs() < 1e-3);
    }

    #[test]
    fn inv_d_matches_quadratic_bspline() {
        assert!((inv_d(0.5) - 16.0).abs() < 1e-6);
    }
}
