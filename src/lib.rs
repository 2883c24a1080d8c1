use bevy::prelude::*;

pub mod collision;
pub mod config;
pub mod containers;
pub mod core;
pub mod error;
pub mod materials;
pub mod math;
pub mod solver;
pub mod system;

// Public re-exports for clean API
pub use crate::collision::{
    CollisionFilter, ContactDetector, ContactQuery, ContactSet, SpatialHashDetector,
};
pub use crate::config::{
    BoundingBox, ContactParams, FeaParams, FlipParams, FluidParams, MpmParams, RigidParams,
    SolverParams,
};
pub use crate::containers::{
    AnyContainer, FeaContainer, FlipContainer, FluidContainer, MpmContainer, RigidAttachment,
    RigidContainer, SurfaceMesh, Tetrahedron,
};
pub use crate::core::{
    BodyHandle, ContainerId, ContainerKind, DofContainer, RigidBody, RigidBodySet, RigidShape,
};
pub use crate::error::{ConfigError, ConfigResult};
pub use crate::system::DofSystem;

/// Steps a [`DofSystem`] resource with the frame time on every `Update`.
pub struct DofPlugin {
    pub params: SolverParams,
}

impl Default for DofPlugin {
    fn default() -> Self {
        Self {
            params: SolverParams::default(),
        }
    }
}

impl Plugin for DofPlugin {
    fn build(&self, app: &mut App) {
        match DofSystem::new(self.params.clone()) {
            Ok(system) => {
                app.insert_resource(system);
            }
            Err(err) => error!("invalid solver parameters: {err}"),
        }
        app.insert_resource(self.params.clone())
            .add_systems(Update, step_dof_system);
    }
}

fn step_dof_system(time: Res<Time>, system: Option<ResMut<DofSystem>>) {
    if let Some(mut system) = system {
        system.advance(time.delta_secs());
    }
}
