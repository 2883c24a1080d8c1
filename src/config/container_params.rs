//! Parameter packs for the DOF containers.
//!
//! Every container carries the shared [`ContactParams`] plus the fields of its
//! own physics. All of them are plain data: set them before the container is
//! built, `validate` runs in the container constructor.

use crate::collision::{CollisionFilter, NUM_FAMILIES};
use crate::config::constants::{DEFAULT_KERNEL_RADIUS, REST_DENSITY};
use crate::error::{
    ConfigError, ConfigResult, check_friction, check_non_negative, check_positive,
};
use crate::math::{Real, Vector};

/// Axis-aligned box, used to confine markers of grid-based containers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min: Vector,
    pub max: Vector,
}

impl BoundingBox {
    pub fn new(min: Vector, max: Vector) -> Self {
        Self { min, max }
    }

    pub fn from_points(points: impl IntoIterator<Item = Vector>) -> Option<Self> {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        Some(iter.fold(Self::new(first, first), |acc, p| Self {
            min: acc.min.min(p),
            max: acc.max.max(p),
        }))
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min.cmple(self.max).all()
    }

    #[inline]
    pub fn contains(&self, p: Vector) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    #[inline]
    pub fn clamp(&self, p: Vector) -> Vector {
        p.clamp(self.min, self.max)
    }
}

/// Contact and iteration settings common to every container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactParams {
    /// Interaction radius: SPH support radius, granular node diameter, marker radius.
    pub kernel_radius: Real,
    /// Extra distance at which contacts are already generated.
    pub collision_envelope: Real,
    /// Upper bound on the speed used to push overlapping points apart.
    pub contact_recovery_speed: Real,
    /// Tensile force tolerated before contacts separate.
    pub contact_cohesion: Real,
    /// Coulomb friction coefficient.
    pub contact_mu: Real,
    /// Regularization added to contact rows.
    pub contact_compliance: Real,
    /// Speed limit applied when positions are advanced.
    pub max_velocity: Real,
    /// Iteration cap for container-local solves (grid solve of MPM/FLIP).
    pub max_iterations: usize,
    /// Family of the container's points and the body families they touch.
    pub collision_filter: CollisionFilter,
}

impl Default for ContactParams {
    fn default() -> Self {
        Self {
            kernel_radius: DEFAULT_KERNEL_RADIUS,
            collision_envelope: 0.0,
            contact_recovery_speed: 0.6,
            contact_cohesion: 0.0,
            contact_mu: 0.1,
            contact_compliance: 0.0,
            max_velocity: 20.0,
            max_iterations: 50,
            collision_filter: CollisionFilter::default(),
        }
    }
}

impl ContactParams {
    pub fn with_kernel_radius(mut self, radius: Real) -> Self {
        self.kernel_radius = radius;
        self
    }

    pub fn with_friction(mut self, mu: Real) -> Self {
        self.contact_mu = mu;
        self
    }

    pub fn with_cohesion(mut self, cohesion: Real) -> Self {
        self.contact_cohesion = cohesion;
        self
    }

    pub fn with_recovery_speed(mut self, speed: Real) -> Self {
        self.contact_recovery_speed = speed;
        self
    }

    pub fn with_envelope(mut self, envelope: Real) -> Self {
        self.collision_envelope = envelope;
        self
    }

    pub fn with_family(mut self, family: u8) -> Self {
        self.collision_filter.family = family;
        self
    }

    pub fn without_collision_with(mut self, family: u8) -> Self {
        self.collision_filter = self.collision_filter.without(family);
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_positive("kernel_radius", self.kernel_radius)?;
        check_non_negative("collision_envelope", self.collision_envelope)?;
        check_non_negative("contact_recovery_speed", self.contact_recovery_speed)?;
        check_non_negative("contact_cohesion", self.contact_cohesion)?;
        check_non_negative("contact_compliance", self.contact_compliance)?;
        check_positive("max_velocity", self.max_velocity)?;
        check_friction(self.contact_mu)?;
        if self.max_iterations == 0 {
            return Err(ConfigError::ZeroIterations);
        }
        if self.collision_filter.family >= NUM_FAMILIES {
            return Err(ConfigError::FamilyOutOfRange(self.collision_filter.family));
        }
        Ok(())
    }

    /// Rows emitted per contact: the normal alone when frictionless.
    #[inline]
    pub fn rows_per_contact(&self) -> usize {
        if self.contact_mu == 0.0 { 1 } else { 3 }
    }
}

/// Simplified rigid ("granular") nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RigidParams {
    pub contact: ContactParams,
    pub mass: Real,
}

impl Default for RigidParams {
    fn default() -> Self {
        Self {
            contact: ContactParams::default(),
            mass: 1.0,
        }
    }
}

impl RigidParams {
    pub fn validate(&self) -> ConfigResult<()> {
        self.contact.validate()?;
        check_positive("mass", self.mass)
    }
}

/// SPH fluid nodes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FluidParams {
    pub contact: ContactParams,
    /// Reference density.
    pub rho: Real,
    pub mass: Real,
    /// Density constraint regularization.
    pub epsilon: Real,
    /// Density constraint relaxation time (seconds).
    pub tau: Real,
    pub viscosity: Real,
    pub enable_viscosity: bool,
    pub artificial_pressure: bool,
    pub artificial_pressure_k: Real,
    pub artificial_pressure_n: Real,
    /// Reference spacing at which the artificial pressure term is normalized.
    pub artificial_pressure_dq: Real,
    /// Derive node mass from the initial cloud instead of using `mass`.
    pub initialize_mass: bool,
}

impl Default for FluidParams {
    fn default() -> Self {
        Self {
            contact: ContactParams::default(),
            rho: REST_DENSITY,
            mass: REST_DENSITY * (DEFAULT_KERNEL_RADIUS * 0.5).powi(3),
            epsilon: 1e-8,
            tau: 0.02,
            viscosity: 0.0,
            enable_viscosity: false,
            artificial_pressure: false,
            artificial_pressure_k: 0.01,
            artificial_pressure_n: 4.0,
            artificial_pressure_dq: 0.2 * DEFAULT_KERNEL_RADIUS,
            initialize_mass: false,
        }
    }
}

impl FluidParams {
    pub fn with_viscosity(mut self, viscosity: Real) -> Self {
        self.viscosity = viscosity;
        self.enable_viscosity = viscosity > 0.0;
        self
    }

    pub fn with_artificial_pressure(mut self, k: Real, n: Real, dq: Real) -> Self {
        self.artificial_pressure = true;
        self.artificial_pressure_k = k;
        self.artificial_pressure_n = n;
        self.artificial_pressure_dq = dq;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.contact.validate()?;
        check_positive("rho", self.rho)?;
        check_positive("mass", self.mass)?;
        check_non_negative("epsilon", self.epsilon)?;
        check_non_negative("tau", self.tau)?;
        check_non_negative("viscosity", self.viscosity)?;
        if self.artificial_pressure {
            check_non_negative("artificial_pressure_k", self.artificial_pressure_k)?;
            check_positive("artificial_pressure_n", self.artificial_pressure_n)?;
            check_positive("artificial_pressure_dq", self.artificial_pressure_dq)?;
        }
        Ok(())
    }
}

fn check_yield_bounds(theta_c: Real, theta_s: Real) -> ConfigResult<()> {
    if !(0.0..1.0).contains(&theta_c) || !(theta_s >= 0.0) {
        return Err(ConfigError::InvalidYieldBounds { theta_c, theta_s });
    }
    Ok(())
}

/// Material point method markers on a collocated background grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MpmParams {
    pub contact: ContactParams,
    pub mass: Real,
    /// Lamé shear modulus.
    pub mu: Real,
    /// Lamé first parameter.
    pub lambda: Real,
    pub hardening_coefficient: Real,
    /// Critical compression.
    pub theta_c: Real,
    /// Critical stretch.
    pub theta_s: Real,
    /// FLIP share of the grid-to-particle velocity blend.
    pub alpha: Real,
    pub bin_edge: Real,
    pub bounding_box: Option<BoundingBox>,
}

impl Default for MpmParams {
    fn default() -> Self {
        let (lambda, mu) = crate::materials::lame_lambda_mu(1.4e5, 0.2);
        Self {
            contact: ContactParams::default(),
            mass: 0.01,
            mu,
            lambda,
            hardening_coefficient: 10.0,
            theta_c: 2.5e-2,
            theta_s: 7.5e-3,
            alpha: 0.95,
            bin_edge: 0.1,
            bounding_box: None,
        }
    }
}

impl MpmParams {
    pub fn with_lame(mut self, lambda: Real, mu: Real) -> Self {
        self.lambda = lambda;
        self.mu = mu;
        self
    }

    pub fn with_yield(mut self, theta_c: Real, theta_s: Real) -> Self {
        self.theta_c = theta_c;
        self.theta_s = theta_s;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.contact.validate()?;
        check_positive("mass", self.mass)?;
        check_non_negative("mu", self.mu)?;
        check_non_negative("lambda", self.lambda)?;
        check_non_negative("hardening_coefficient", self.hardening_coefficient)?;
        check_positive("bin_edge", self.bin_edge)?;
        check_yield_bounds(self.theta_c, self.theta_s)?;
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::BlendOutOfRange(self.alpha));
        }
        if self.bounding_box.is_some_and(|b| !b.is_valid()) {
            return Err(ConfigError::InvalidBoundingBox);
        }
        Ok(())
    }
}

/// FLIP markers on a staggered (face-centered) grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlipParams {
    pub contact: ContactParams,
    pub mass: Real,
    /// Reference density.
    pub rho: Real,
    /// Bulk stiffness of the pressure rows, `<= 0` for incompressible.
    pub lambda: Real,
    /// Friction of marker contacts against bodies, before hardening.
    pub mu: Real,
    /// Growth rate of friction and cohesion with plastic compaction.
    pub hardening_coefficient: Real,
    /// Critical compression of the elastic volume ratio.
    pub theta_c: Real,
    /// Critical stretch of the elastic volume ratio.
    pub theta_s: Real,
    pub alpha: Real,
    pub bin_edge: Real,
    pub bounding_box: Option<BoundingBox>,
}

impl Default for FlipParams {
    fn default() -> Self {
        Self {
            contact: ContactParams::default(),
            mass: 0.125,
            rho: REST_DENSITY,
            lambda: 0.0,
            mu: 0.1,
            hardening_coefficient: 10.0,
            theta_c: 2.5e-2,
            theta_s: 7.5e-3,
            alpha: 0.95,
            bin_edge: 0.1,
            bounding_box: None,
        }
    }
}

impl FlipParams {
    pub fn with_friction(mut self, mu: Real) -> Self {
        self.mu = mu;
        self
    }

    pub fn with_hardening(mut self, hardening_coefficient: Real) -> Self {
        self.hardening_coefficient = hardening_coefficient;
        self
    }

    pub fn with_yield(mut self, theta_c: Real, theta_s: Real) -> Self {
        self.theta_c = theta_c;
        self.theta_s = theta_s;
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.contact.validate()?;
        check_positive("mass", self.mass)?;
        check_positive("rho", self.rho)?;
        check_positive("bin_edge", self.bin_edge)?;
        check_friction(self.mu)?;
        check_non_negative("hardening_coefficient", self.hardening_coefficient)?;
        check_yield_bounds(self.theta_c, self.theta_s)?;
        if !(0.0..=1.0).contains(&self.alpha) {
            return Err(ConfigError::BlendOutOfRange(self.alpha));
        }
        if self.bounding_box.is_some_and(|b| !b.is_valid()) {
            return Err(ConfigError::InvalidBoundingBox);
        }
        Ok(())
    }
}

/// Tetrahedral finite elements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeaParams {
    pub contact: ContactParams,
    pub youngs_modulus: Real,
    pub poisson_ratio: Real,
    pub material_density: Real,
    pub rigid_constraint_recovery_speed: Real,
}

impl Default for FeaParams {
    fn default() -> Self {
        Self {
            contact: ContactParams::default(),
            youngs_modulus: 1e6,
            poisson_ratio: 0.3,
            material_density: 1000.0,
            rigid_constraint_recovery_speed: 10.0,
        }
    }
}

impl FeaParams {
    pub fn validate(&self) -> ConfigResult<()> {
        self.contact.validate()?;
        check_positive("youngs_modulus", self.youngs_modulus)?;
        check_positive("material_density", self.material_density)?;
        check_non_negative(
            "rigid_constraint_recovery_speed",
            self.rigid_constraint_recovery_speed,
        )?;
        if !(self.poisson_ratio > -1.0 && self.poisson_ratio < 0.5) {
            return Err(ConfigError::PoissonRatioOutOfRange(self.poisson_ratio));
        }
        Ok(())
    }
}
