// Headless granular pile: grains dropped onto a plane, settling reported once
// per second of simulated time.
use bevy::prelude::*;
use dof3d::math::{Real, Vector};
use dof3d::{
    ContactParams, DofContainer, DofPlugin, DofSystem, RigidBody, RigidContainer, RigidParams,
    RigidShape, SolverParams,
};
use rand::Rng;

const GRAIN_DIAMETER: Real = 0.02;
const COLUMNS: usize = 8;
const LAYERS: usize = 12;

fn spawn_pile(mut system: ResMut<DofSystem>) {
    let mut rng = rand::rng();
    system.bodies_mut().insert(
        RigidBody::fixed(Vector::ZERO)
            .with_shape(RigidShape::Plane { normal: Vector::Y })
            .with_friction(0.8),
    );

    let mut positions = Vec::new();
    for y in 0..LAYERS {
        for z in 0..COLUMNS {
            for x in 0..COLUMNS {
                let jitter = Vector::new(
                    rng.random_range(-0.1..=0.1),
                    0.0,
                    rng.random_range(-0.1..=0.1),
                );
                let cell = Vector::new(x as Real, y as Real + 0.5, z as Real);
                positions.push((cell + jitter) * GRAIN_DIAMETER * 1.05);
            }
        }
    }

    let params = RigidParams {
        contact: ContactParams::default()
            .with_kernel_radius(GRAIN_DIAMETER)
            .with_friction(0.5)
            .with_envelope(0.1 * GRAIN_DIAMETER),
        mass: 0.01,
    };
    let mut grains = match RigidContainer::new(params) {
        Ok(grains) => grains,
        Err(err) => {
            error!("invalid grain parameters: {err}");
            return;
        }
    };
    let velocities = vec![Vector::ZERO; positions.len()];
    if let Err(err) = grains.add_nodes(&positions, &velocities) {
        error!("{err}");
        return;
    }
    match system.add_container(grains) {
        Ok(_) => println!("Dropping {} grains", positions.len()),
        Err(err) => error!("{err}"),
    }
}

fn report(system: Res<DofSystem>, mut frame_count: Local<u32>) {
    *frame_count += 1;

    if *frame_count % 60 == 0 {
        for container in system.containers() {
            let positions = container.positions();
            let height = positions.iter().map(|p| p.y).fold(0.0, Real::max);
            let kinetic: Real = container
                .velocities()
                .iter()
                .map(|v| 0.5 * v.length_squared())
                .sum();
            println!(
                "t={:.2}s grains={} height={:.3} kinetic/m={:.4} iterations={}",
                system.time(),
                positions.len(),
                height,
                kinetic,
                system.last_report().iterations
            );
        }
    }

    if *frame_count > 300 {
        std::process::exit(0);
    }
}

fn main() {
    App::new()
        .add_plugins(MinimalPlugins)
        .add_plugins(DofPlugin {
            params: SolverParams::default().with_max_iterations(60),
        })
        .insert_resource(bevy::time::TimeUpdateStrategy::ManualDuration(
            std::time::Duration::from_secs_f64(1.0 / 60.0),
        ))
        .add_systems(Startup, spawn_pile)
        .add_systems(Update, report)
        .run();
}
