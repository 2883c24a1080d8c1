use dof3d::math::{Real, Vector};
use dof3d::{
    BodyHandle, ConfigError, ContactParams, DofContainer, DofSystem, FeaContainer, FeaParams,
    FlipContainer, FlipParams, FluidContainer, FluidParams, MpmContainer, MpmParams, RigidBody,
    RigidContainer, RigidParams, RigidShape, SolverParams, Tetrahedron,
};

fn with_ground(params: SolverParams) -> (DofSystem, BodyHandle) {
    let mut system = DofSystem::new(params).unwrap();
    let ground = system
        .bodies_mut()
        .insert(RigidBody::fixed(Vector::ZERO).with_shape(RigidShape::Plane { normal: Vector::Y }));
    (system, ground)
}

fn block(n: [usize; 3], spacing: Real, origin: Vector) -> Vec<Vector> {
    let mut points = Vec::new();
    for z in 0..n[2] {
        for y in 0..n[1] {
            for x in 0..n[0] {
                points.push(origin + Vector::new(x as Real, y as Real, z as Real) * spacing);
            }
        }
    }
    points
}

fn min_pair_distance(points: &[Vector]) -> Real {
    let mut best = Real::INFINITY;
    for i in 0..points.len() {
        for j in i + 1..points.len() {
            best = best.min(points[i].distance(points[j]));
        }
    }
    best
}

#[test]
fn granular_pair_stops_sliding() {
    let (mut system, _) = with_ground(SolverParams::default());
    let contact = ContactParams::default()
        .with_friction(0.5)
        .with_cohesion(0.0)
        .with_envelope(0.005);
    let d = contact.kernel_radius;
    let mut granular = RigidContainer::new(RigidParams { contact, mass: 0.1 }).unwrap();
    granular
        .add_nodes(
            &[Vector::new(0.0, 0.5 * d, 0.0), Vector::new(d, 0.5 * d, 0.0)],
            &[Vector::new(0.0, 0.0, 0.1), Vector::new(0.0, 0.0, -0.1)],
        )
        .unwrap();
    let id = system.add_container(granular).unwrap();

    for _ in 0..200 {
        system.step();
    }

    let granular = system.container(id).and_then(|c| c.rigid()).unwrap();
    let [a, b] = [granular.velocities()[0], granular.velocities()[1]];
    let [pa, pb] = [granular.positions()[0], granular.positions()[1]];
    let normal = (pb - pa).normalize();
    let relative = b - a;
    let tangential = relative - normal * relative.dot(normal);
    assert!(tangential.length() < 1e-3, "relative tangential velocity {tangential:?}");
}

#[test]
fn single_tetrahedron_at_rest_keeps_zero_residual() {
    let mut system = DofSystem::new(SolverParams::default().with_gravity(Vector::ZERO)).unwrap();
    let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
    fea.add_nodes(
        &[
            Vector::new(0.0, 0.0, 0.0),
            Vector::new(0.1, 0.0, 0.0),
            Vector::new(0.0, 0.1, 0.0),
            Vector::new(0.0, 0.0, 0.1),
        ],
        &[Vector::ZERO; 4],
    )
    .unwrap();
    fea.add_elements(&[Tetrahedron::new(0, 1, 2, 3)]).unwrap();
    let id = system.add_container(fea).unwrap();

    for _ in 0..5 {
        system.step();
    }

    let fea = system.container(id).and_then(|c| c.fea()).unwrap();
    assert!(fea.element_residual(0).iter().all(|c| c.abs() < 1e-5));
    assert!(fea.velocities().iter().all(|v| v.length() < 1e-5));
}

#[test]
fn fluid_column_does_not_clump() {
    let (mut system, _) = with_ground(SolverParams::default());
    let h = 0.04;
    let spacing = 0.5 * h;
    let params = FluidParams {
        contact: ContactParams::default()
            .with_kernel_radius(h)
            .with_friction(0.0)
            .with_envelope(0.005),
        initialize_mass: true,
        ..FluidParams::default()
    }
    .with_artificial_pressure(0.01, 4.0, 0.2 * h);
    let points = block([4, 8, 4], spacing, Vector::new(0.0, 0.5 * h, 0.0));
    let mut fluid = FluidContainer::new(params).unwrap();
    fluid.add_nodes(&points, &vec![Vector::ZERO; points.len()]).unwrap();
    let id = system.add_container(fluid).unwrap();

    for _ in 0..50 {
        system.step();
    }

    let fluid = system.container(id).and_then(|c| c.fluid()).unwrap();
    let min = min_pair_distance(fluid.positions());
    assert!(min > 0.25 * spacing, "closest pair at {min}");
}

#[test]
fn every_kind_shares_one_layout() {
    let (mut system, _) = with_ground(SolverParams::default());

    let mut granular = RigidContainer::new(RigidParams::default()).unwrap();
    let grains = block([2, 2, 1], 0.04, Vector::new(1.0, 0.02, 0.0));
    granular.add_nodes(&grains, &vec![Vector::ZERO; grains.len()]).unwrap();
    system.add_container(granular).unwrap();

    let mut fluid = FluidContainer::new(FluidParams::default()).unwrap();
    let drops = block([2, 2, 2], 0.02, Vector::new(2.0, 0.02, 0.0));
    fluid.add_nodes(&drops, &vec![Vector::ZERO; drops.len()]).unwrap();
    system.add_container(fluid).unwrap();

    let mut mpm = MpmContainer::new(MpmParams::default()).unwrap();
    let markers = block([2, 2, 2], 0.05, Vector::new(3.0, 0.05, 0.0));
    mpm.add_nodes(&markers, &vec![Vector::ZERO; markers.len()]).unwrap();
    system.add_container(mpm).unwrap();

    let mut flip = FlipContainer::new(FlipParams::default()).unwrap();
    let cells = block([2, 2, 2], 0.05, Vector::new(4.0, 0.05, 0.0));
    flip.add_nodes(&cells, &vec![Vector::ZERO; cells.len()]).unwrap();
    system.add_container(flip).unwrap();

    let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
    fea.add_nodes(
        &[
            Vector::new(5.0, 0.5, 0.0),
            Vector::new(5.1, 0.5, 0.0),
            Vector::new(5.0, 0.6, 0.0),
            Vector::new(5.0, 0.5, 0.1),
        ],
        &[Vector::ZERO; 4],
    )
    .unwrap();
    fea.add_elements(&[Tetrahedron::new(0, 1, 2, 3)]).unwrap();
    system.add_container(fea).unwrap();

    system.step();

    let table = system.offsets();
    assert_eq!(table.len(), 5);
    let mut dofs = table.rigid_dofs();
    let mut rows = 0;
    for (offsets, container) in table.iter().zip(system.containers()) {
        assert_eq!(offsets.dof_start, dofs);
        assert_eq!(offsets.row_start, rows);
        assert_eq!(offsets.num_dofs, container.num_dofs());
        dofs += offsets.num_dofs;
        rows += offsets.num_rows;
    }
    assert_eq!(dofs, table.total_dofs());
    assert_eq!(rows, table.total_rows());

    let global = system.global();
    for (m, inv) in global.mass.iter().zip(&global.inv_mass).skip(table.rigid_dofs()) {
        if *inv > 0.0 {
            assert!((m * inv - 1.0).abs() < 1e-4);
        }
    }

    // the solved multipliers are already feasible
    let mut gamma = global.gamma.clone();
    for container in system.containers() {
        container.project(&mut gamma[container.offsets().rows()]);
    }
    for (projected, solved) in gamma.iter().zip(&global.gamma) {
        assert!((projected - solved).abs() <= 1e-6 * (1.0 + solved.abs()));
    }

    for container in system.containers() {
        assert!(container.positions().iter().all(|p| p.is_finite()));
    }
}

#[test]
fn mpm_block_lands_on_the_ground() {
    let (mut system, ground) = with_ground(SolverParams::default());
    let mut mpm = MpmContainer::new(MpmParams::default()).unwrap();
    let markers = block([4, 4, 4], 0.05, Vector::new(0.0, 0.06, 0.0));
    mpm.add_nodes(&markers, &vec![Vector::ZERO; markers.len()]).unwrap();
    let id = system.add_container(mpm).unwrap();

    let mut touched = false;
    for _ in 0..60 {
        system.step();
        touched |= system.body_contact_force(ground).y < 0.0;
    }

    let mpm = system.container(id).and_then(|c| c.mpm()).unwrap();
    assert!(mpm.positions().iter().all(|p| p.is_finite() && p.y > -0.05));
    assert!(touched);
}

#[test]
fn removed_bodies_resolve_to_none() {
    let mut system = DofSystem::new(SolverParams::default()).unwrap();
    let first = system.bodies_mut().insert(RigidBody::fixed(Vector::ZERO));
    system.bodies_mut().remove(first);
    let second = system.bodies_mut().insert(RigidBody::fixed(Vector::Y));

    assert!(system.bodies().get(first).is_none());
    assert_eq!(system.bodies().get(second).map(|b| b.position), Some(Vector::Y));
    assert_eq!(system.body_contact_force(first), Vector::ZERO);
}

#[test]
fn invalid_configuration_is_rejected_before_registration() {
    let contact = ContactParams::default().with_friction(1.5);
    assert_eq!(
        RigidContainer::new(RigidParams { contact, mass: 1.0 }).err(),
        Some(ConfigError::FrictionOutOfRange(1.5))
    );

    let contact = ContactParams::default().with_recovery_speed(-1.0);
    assert!(FluidContainer::new(FluidParams { contact, ..FluidParams::default() }).is_err());

    let mut system = DofSystem::new(SolverParams::default()).unwrap();
    let mut fea = FeaContainer::new(FeaParams::default()).unwrap();
    fea.add_nodes(&[Vector::ZERO, Vector::X, Vector::Y], &[Vector::ZERO; 3])
        .unwrap();
    fea.add_elements(&[Tetrahedron::new(0, 1, 2, 3)]).unwrap();
    assert!(matches!(
        system.add_container(fea),
        Err(ConfigError::ElementIndexOutOfRange { node: 3, .. })
    ));
    assert!(system.containers().is_empty());
}
