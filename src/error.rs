//! Configuration errors.
//!
//! Everything here is rejected before a container is initialized. Solve-phase
//! code never returns errors: once inputs validate, a step runs to completion.

use thiserror::Error;

use crate::math::Real;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("friction coefficient {0} outside [0, 1]")]
    FrictionOutOfRange(Real),

    #[error("{field} must be non-negative, got {value}")]
    Negative { field: &'static str, value: Real },

    #[error("{field} must be positive and finite, got {value}")]
    NonPositive { field: &'static str, value: Real },

    #[error("poisson ratio {0} outside (-1, 0.5)")]
    PoissonRatioOutOfRange(Real),

    #[error("yield bounds must satisfy 0 <= theta_c < 1 and theta_s >= 0, got theta_c={theta_c}, theta_s={theta_s}")]
    InvalidYieldBounds { theta_c: Real, theta_s: Real },

    #[error("FLIP/PIC blend {0} outside [0, 1]")]
    BlendOutOfRange(Real),

    #[error("bounding box is empty or inverted")]
    InvalidBoundingBox,

    #[error("solver needs at least one iteration")]
    ZeroIterations,

    #[error("element {element} references node {node}, but only {count} nodes exist")]
    ElementIndexOutOfRange {
        element: usize,
        node: usize,
        count: usize,
    },

    #[error("element {0} repeats a node")]
    DegenerateElement(usize),

    #[error("constraint references node {node}, but only {count} nodes exist")]
    ConstraintNodeOutOfRange { node: usize, count: usize },

    #[error("constraint references a body that is not in the body set")]
    UnknownBody,

    #[error("{0} positions but {1} velocities")]
    LengthMismatch(usize, usize),

    #[error("collision family {0} outside [0, 16)")]
    FamilyOutOfRange(u8),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Rejects friction coefficients outside `[0, 1]`.
pub fn check_friction(mu: Real) -> ConfigResult<()> {
    if (0.0..=1.0).contains(&mu) {
        Ok(())
    } else {
        Err(ConfigError::FrictionOutOfRange(mu))
    }
}

pub fn check_non_negative(field: &'static str, value: Real) -> ConfigResult<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::Negative { field, value })
    }
}

pub fn check_positive(field: &'static str, value: Real) -> ConfigResult<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::NonPositive { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friction_bounds() {
        assert!(check_friction(0.0).is_ok());
        assert!(check_friction(1.0).is_ok());
        assert_eq!(check_friction(1.5), Err(ConfigError::FrictionOutOfRange(1.5)));
        assert!(check_friction(-0.1).is_err());
        assert!(check_friction(Real::NAN).is_err());
    }

    #[test]
    fn messages_name_the_field() {
        let err = check_non_negative("contact_recovery_speed", -1.0).unwrap_err();
        assert!(err.to_string().contains("contact_recovery_speed"));
    }
}
