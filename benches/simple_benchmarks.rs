/// Simple custom benchmarking without criterion
/// Avoids Windows MSVC linker issues with rayon/criterion
use std::time::Instant;

use dof3d::collision::{CollisionFilter, ContactDetector, ContactQuery, SpatialHashDetector};
use dof3d::math::{Real, Vector};
use dof3d::{
    DofSystem, FluidContainer, FluidParams, MpmContainer, MpmParams, RigidBody, RigidBodySet,
    RigidContainer, RigidParams, RigidShape, SolverParams,
};
use rand::Rng;

fn time_it<F: FnMut()>(name: &str, iterations: usize, mut f: F) {
    // Warmup
    for _ in 0..5 {
        f();
    }

    let start = Instant::now();
    for _ in 0..iterations {
        f();
    }
    let elapsed = start.elapsed();

    let avg_ms = elapsed.as_secs_f64() * 1000.0 / iterations as f64;
    println!("{}: {:.3}ms avg ({} iterations)", name, avg_ms, iterations);
}

/// Jittered cube of roughly `count` points with the given spacing.
fn create_test_points(count: usize, spacing: Real) -> Vec<Vector> {
    let side = (count as f32).cbrt().ceil() as usize;
    let mut rng = rand::rng();
    let mut points = Vec::with_capacity(count);

    'fill: for z in 0..side {
        for y in 0..side {
            for x in 0..side {
                if points.len() >= count {
                    break 'fill;
                }
                let jitter = Vector::new(
                    rng.random_range(-0.05..=0.05),
                    rng.random_range(-0.05..=0.05),
                    rng.random_range(-0.05..=0.05),
                );
                let cell = Vector::new(x as Real, y as Real, z as Real + 1.0);
                points.push((cell + jitter) * spacing);
            }
        }
    }

    points
}

fn ground_system() -> DofSystem {
    let mut system = DofSystem::new(SolverParams::default().with_max_iterations(30))
        .expect("default solver params are valid");
    system
        .bodies_mut()
        .insert(RigidBody::fixed(Vector::ZERO).with_shape(RigidShape::Plane { normal: Vector::Y }));
    system
}

fn main() {
    println!("\n=== DOF3D Benchmarks ===\n");

    println!("--- Contact Detection ---");
    let bodies = RigidBodySet::new();
    for &count in &[1000, 5000, 20000] {
        let points = create_test_points(count, 0.02);
        let query = ContactQuery {
            pair_radius: Some(0.04),
            point_radius: 0.02,
            envelope: 0.0,
            filter: CollisionFilter::default(),
        };
        let mut detector = SpatialHashDetector::new();

        time_it(&format!("detect pairs (n={})", count), 20, || {
            detector.detect(&points, &query, &bodies);
        });
    }

    println!("\n--- Granular Step ---");
    for &count in &[500, 2000] {
        let mut system = ground_system();
        let points = create_test_points(count, 0.04);
        let mut granular = RigidContainer::new(RigidParams::default()).expect("valid params");
        granular
            .add_nodes(&points, &vec![Vector::ZERO; points.len()])
            .expect("matching lengths");
        system.add_container(granular).expect("valid container");

        time_it(&format!("granular step (n={})", count), 10, || {
            system.step();
        });
    }

    println!("\n--- Fluid Step ---");
    for &count in &[500, 2000] {
        let mut system = ground_system();
        let points = create_test_points(count, 0.02);
        let params = FluidParams {
            initialize_mass: true,
            ..FluidParams::default()
        };
        let mut fluid = FluidContainer::new(params).expect("valid params");
        fluid
            .add_nodes(&points, &vec![Vector::ZERO; points.len()])
            .expect("matching lengths");
        system.add_container(fluid).expect("valid container");

        time_it(&format!("fluid step (n={})", count), 10, || {
            system.step();
        });
    }

    println!("\n--- MPM Step ---");
    for &count in &[500, 2000] {
        let mut system = ground_system();
        let points = create_test_points(count, 0.05);
        let mut mpm = MpmContainer::new(MpmParams::default()).expect("valid params");
        mpm.add_nodes(&points, &vec![Vector::ZERO; points.len()])
            .expect("matching lengths");
        system.add_container(mpm).expect("valid container");

        time_it(&format!("mpm step (n={})", count), 5, || {
            system.step();
        });
    }

    println!("\n=== Benchmark Complete ===\n");
}
