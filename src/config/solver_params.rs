use bevy::prelude::*;

use crate::config::constants::GRAVITY;
use crate::error::{ConfigError, ConfigResult};
use crate::math::{Real, Vector};

/// Parameters of the outer step and of the cone-complementarity iteration.
#[derive(Resource, Clone, Debug)]
pub struct SolverParams {
    /// Fixed time step in seconds.
    pub dt: Real,
    /// Upper bound on outer solver iterations per step.
    pub max_iterations: usize,
    /// Projected-gradient residual below which the solve stops early.
    pub tolerance: Real,
    pub gravity: Vector,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            dt: 1.0 / 120.0,
            max_iterations: 100,
            tolerance: 1e-6,
            gravity: GRAVITY,
        }
    }
}

impl SolverParams {
    pub fn with_dt(mut self, dt: Real) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: Real) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_gravity(mut self, gravity: Vector) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.dt > 0.0 && self.dt.is_finite()) {
            return Err(ConfigError::NonPositive {
                field: "dt",
                value: self.dt,
            });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        Ok(())
    }
}
