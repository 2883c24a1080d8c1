//! Feasibility projections applied to multipliers during the cone solve.

use crate::math::Real;

/// Projects a contact multiplier block onto the Coulomb cone.
///
/// `gamma` is either `[normal]` or `[normal, tangent_u, tangent_v]`. A positive
/// `cohesion` moves the cone apex to `-cohesion`, so the normal multiplier may
/// pull with up to that magnitude before the contact separates.
pub fn project_contact(gamma: &mut [Real], mu: Real, cohesion: Real) {
    debug_assert!(gamma.len() == 1 || gamma.len() == 3);

    let gn = gamma[0] + cohesion;
    if gamma.len() == 1 || mu <= 0.0 {
        gamma[0] = gn.max(0.0) - cohesion;
        gamma[1..].fill(0.0);
        return;
    }

    let (gu, gv) = (gamma[1], gamma[2]);
    let ft = (gu * gu + gv * gv).sqrt();

    if ft <= mu * gn {
        return;
    }
    if mu * ft <= -gn {
        gamma[0] = -cohesion;
        gamma[1] = 0.0;
        gamma[2] = 0.0;
        return;
    }

    let gn_new = (ft * mu + gn) / (mu * mu + 1.0);
    let scale = gn_new * mu / ft;
    gamma[0] = gn_new - cohesion;
    gamma[1] = gu * scale;
    gamma[2] = gv * scale;
}

/// Clamps a unilateral multiplier to `gamma >= lower`.
#[inline]
pub fn project_unilateral(gamma: &mut Real, lower: Real) {
    if *gamma < lower {
        *gamma = lower;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_cone(g: &[Real; 3], mu: Real, cohesion: Real) -> bool {
        let ft = (g[1] * g[1] + g[2] * g[2]).sqrt();
        ft <= mu * (g[0] + cohesion) + 1e-5
    }

    #[test]
    fn inside_cone_is_untouched() {
        let mut g = [1.0, 0.2, -0.1];
        project_contact(&mut g, 0.5, 0.0);
        assert_eq!(g, [1.0, 0.2, -0.1]);
    }

    #[test]
    fn polar_cone_maps_to_apex() {
        let mut g = [-1.0, 0.1, 0.0];
        project_contact(&mut g, 0.5, 0.0);
        assert_eq!(g, [0.0, 0.0, 0.0]);

        let mut g = [-1.0, 0.1, 0.0];
        project_contact(&mut g, 0.5, 0.3);
        assert_eq!(g, [-0.3, 0.0, 0.0]);
    }

    #[test]
    fn outside_cone_lands_on_surface() {
        let mut g = [1.0, 3.0, 4.0];
        project_contact(&mut g, 0.5, 0.0);
        assert!(in_cone(&g, 0.5, 0.0));
        let ft = (g[1] * g[1] + g[2] * g[2]).sqrt();
        assert!((ft - 0.5 * g[0]).abs() < 1e-5);
        // tangential direction is preserved
        assert!((g[1] / g[2] - 0.75).abs() < 1e-5);
    }

    #[test]
    fn projection_is_idempotent() {
        let samples = [
            ([2.0, 5.0, -1.0], 0.3, 0.0),
            ([-0.5, 0.2, 0.9], 0.8, 0.4),
            ([0.1, 0.0, 0.0], 0.0, 0.0),
            ([-3.0, 0.0, 0.0], 0.0, 1.0),
            ([0.7, -0.7, 0.7], 1.0, 0.2),
        ];
        for (g0, mu, cohesion) in samples {
            let mut once = g0;
            project_contact(&mut once, mu, cohesion);
            let mut twice = once;
            project_contact(&mut twice, mu, cohesion);
            for k in 0..3 {
                assert!((once[k] - twice[k]).abs() < 1e-5, "{once:?} vs {twice:?}");
            }
        }
    }

    #[test]
    fn frictionless_block_clamps_normal_only() {
        let mut g = [-2.0];
        project_contact(&mut g, 0.0, 0.5);
        assert_eq!(g, [-0.5]);
        let mut g = [0.25];
        project_contact(&mut g, 0.0, 0.0);
        assert_eq!(g, [0.25]);
    }

    #[test]
    fn unilateral_clamp() {
        let mut g = -0.2;
        project_unilateral(&mut g, 0.0);
        assert_eq!(g, 0.0);
        let mut g = 0.4;
        project_unilateral(&mut g, 0.0);
        assert_eq!(g, 0.4);
    }
}
