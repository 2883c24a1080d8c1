//! Configuration and parameters
//!
//! Constants, solver settings and per-container parameter packs.

pub mod constants;
pub mod container_params;
pub mod solver_params;

pub use constants::*;
pub use container_params::*;
pub use solver_params::*;
