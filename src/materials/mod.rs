//! Constitutive helpers shared by the continuum containers.
//!
//! * `utils` - Lamé conversions and sanity checks
//! * `elasticity` - fixed-corotated stress and its linearization
//! * `plasticity` - elastic/plastic split of the deformation gradient

pub mod elasticity;
pub mod plasticity;
pub mod utils;

pub use elasticity::{CorotatedStress, cofactor};
pub use plasticity::{DeformationSplit, hardening_scale, split_deformation};
pub use utils::physics::{bulk_modulus, lame_lambda_mu, shear_modulus};
