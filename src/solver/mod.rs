// src/solver/mod.rs
pub mod apgd;
pub mod grid_solver;

pub use apgd::*;
pub use grid_solver::*;
