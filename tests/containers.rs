use glam::DVec3;

use weald::domain::container::{CONTAINERS_ACTIVE, CONTAINER_ACCESS};
use weald::domain::EntityLocation;
use weald::geometry::vec3_to_element;
use weald::ops::{EntityRef, OpClass, Operation};
use weald::prelude::*;
use weald::typeinfo::TypeRegistry;

fn ids(list: &[EntityId]) -> Element {
  Element::List(list.iter().map(|id| Element::Int(id.0 as i64)).collect())
}

fn reaches(world: &World, observer: EntityId, target: EntityId) -> bool {
  world.can_reach(observer, &EntityLocation::of(target), 0.0)
}

fn active(world: &World, observer: EntityId, container: EntityId) -> bool {
  world
    .entities()
    .get(observer)
    .and_then(|e| e.attr(CONTAINERS_ACTIVE))
    .and_then(Element::as_list)
    .map(|l| {
      l.iter()
        .filter_map(Element::as_int)
        .any(|i| i as u64 == container.0)
    })
    .unwrap_or(false)
}

fn set_access(world: &mut World, container: EntityId, observers: &[EntityId]) -> Vec<Operation> {
  let mut res = Vec::new();
  world.set_property(container, CONTAINER_ACCESS, ids(observers), &mut res);
  res
}

struct Fixture {
  world: World,
  t1: EntityId,
  t2: EntityId,
  t3: EntityId,
  t4: EntityId,
  t5: EntityId,
  t6: EntityId,
}

/// T1 (physical) holds container T2 and observer T3; T2 holds T4 and the
/// nested container T5, which holds T6. Everything at the origin.
fn fixture() -> Fixture {
  let mut world = World::new(TypeRegistry::with_root());
  let t1 = world
    .spawn("thing")
    .bbox(AxisBox::new(DVec3::splat(-512.0), DVec3::splat(512.0)))
    .pos(DVec3::ZERO)
    .attr("domain", "physical")
    .build()
    .unwrap();
  let t2 = world
    .spawn("thing")
    .parent(t1)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .attr("domain", "container")
    .build()
    .unwrap();
  let t3 = world
    .spawn("thing")
    .parent(t1)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .attr("perception_sight", 1i64)
    .attr("reach", 1.0)
    .build()
    .unwrap();
  let t4 = world
    .spawn("thing")
    .parent(t2)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  let t5 = world
    .spawn("thing")
    .parent(t2)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .attr("domain", "container")
    .build()
    .unwrap();
  let t6 = world
    .spawn("thing")
    .parent(t5)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  world.tick(1);
  world.drain_ops();
  Fixture {
    world,
    t1,
    t2,
    t3,
    t4,
    t5,
    t6,
  }
}

#[test]
fn access_gates_reach_and_visibility() {
  let Fixture {
    mut world,
    t2,
    t3,
    t4,
    t5,
    t6,
    ..
  } = fixture();

  // The container itself is reachable, its contents are not.
  assert!(world.is_visible_to(t3, t2));
  assert!(reaches(&world, t3, t2));
  assert!(!reaches(&world, t3, t4));
  assert!(!reaches(&world, t3, t5));
  assert!(!reaches(&world, t3, t6));

  // Open the outer container: its direct children come into reach.
  let res = set_access(&mut world, t2, &[t3]);
  assert!(reaches(&world, t3, t4));
  assert!(reaches(&world, t3, t5));
  assert!(!reaches(&world, t3, t6));
  assert!(active(&world, t3, t2));
  let appearances: Vec<&Operation> =
    res.iter().filter(|op| op.class == OpClass::Appearance).collect();
  assert_eq!(appearances.len(), 1);
  assert_eq!(appearances[0].to, Some(t3));
  assert_eq!(appearances[0].args.len(), 2);

  // Open the nested container too.
  let res = set_access(&mut world, t5, &[t3]);
  assert!(reaches(&world, t3, t6));
  assert!(active(&world, t3, t5));
  let appearances: Vec<&Operation> =
    res.iter().filter(|op| op.class == OpClass::Appearance).collect();
  assert_eq!(appearances.len(), 1);
  assert_eq!(appearances[0].args.len(), 1);

  // Revoking the nested access severs only the nested subscription.
  let res = set_access(&mut world, t5, &[]);
  assert!(!active(&world, t3, t5));
  assert!(!reaches(&world, t3, t6));
  assert!(reaches(&world, t3, t5));
  assert!(reaches(&world, t3, t2));
  let disappearances: Vec<&Operation> = res
    .iter()
    .filter(|op| op.class == OpClass::Disappearance)
    .collect();
  assert_eq!(disappearances.len(), 1);
  assert_eq!(disappearances[0].args.len(), 1);

  // Put it back, then revoke the outer one: the cascade takes the nested
  // subscription with it.
  set_access(&mut world, t5, &[t3]);
  let res = set_access(&mut world, t2, &[]);
  assert!(!active(&world, t3, t2));
  assert!(!active(&world, t3, t5));
  assert!(reaches(&world, t3, t2));
  assert!(!reaches(&world, t3, t5));
  assert!(!reaches(&world, t3, t6));
  let disappearances: Vec<&Operation> = res
    .iter()
    .filter(|op| op.class == OpClass::Disappearance)
    .collect();
  assert_eq!(disappearances.len(), 2);
  assert_eq!(disappearances[0].args.len(), 2);
  assert_eq!(disappearances[1].args.len(), 1);
}

#[test]
fn moving_away_severs_in_cascade() {
  let Fixture {
    mut world,
    t1,
    t2,
    t3,
    t4,
    t5,
    t6,
    ..
  } = fixture();
  set_access(&mut world, t2, &[t3]);
  set_access(&mut world, t5, &[t3]);
  assert!(reaches(&world, t3, t6));
  world.drain_ops();

  // Walk far out of reach of the container.
  world.dispatch(
    Operation::new(OpClass::Move).from(t3).to(t1).entity_arg(
      EntityRef::with_id(t3)
        .attr("pos", vec3_to_element(DVec3::new(510.0, 0.0, 500.0))),
    ),
  );

  assert!(!reaches(&world, t3, t2));
  assert!(!reaches(&world, t3, t4));
  assert!(!reaches(&world, t3, t5));
  assert!(!reaches(&world, t3, t6));
  assert!(!active(&world, t3, t2));
  assert!(!active(&world, t3, t5));

  let ops = world.drain_ops();
  let disappearances: Vec<&Operation> = ops
    .iter()
    .filter(|op| op.class == OpClass::Disappearance)
    .collect();
  // One op for the outer container's children, one for the nested one's.
  assert_eq!(disappearances.len(), 2);
  assert_eq!(disappearances[0].to, Some(t3));
  let mut outer = disappearances[0]
    .args
    .iter()
    .filter_map(|a| a.as_entity().and_then(|e| e.id))
    .collect::<Vec<_>>();
  outer.sort();
  assert_eq!(outer, vec![t4, t5]);
  assert_eq!(disappearances[1].args.len(), 1);
  assert_eq!(
    disappearances[1].args[0].as_entity().and_then(|e| e.id),
    Some(t6)
  );

  // Coming back does not resurrect the subscription by itself.
  world.dispatch(
    Operation::new(OpClass::Move).from(t3).to(t1).entity_arg(
      EntityRef::with_id(t3).attr("pos", vec3_to_element(DVec3::ZERO)),
    ),
  );
  assert!(reaches(&world, t3, t2));
  assert!(!reaches(&world, t3, t5));
  set_access(&mut world, t2, &[t3]);
  assert!(reaches(&world, t3, t5));
}

#[test]
fn reparenting_a_container_drops_its_subscribers() {
  let Fixture {
    mut world,
    t1,
    t2,
    t3,
    t5,
    t6,
    ..
  } = fixture();
  set_access(&mut world, t2, &[t3]);
  set_access(&mut world, t5, &[t3]);
  assert!(reaches(&world, t3, t6));
  world.drain_ops();

  // Lift the nested container out into the arena.
  world.dispatch(
    Operation::new(OpClass::Move).from(t3).to(t2).entity_arg(
      EntityRef::with_id(t5)
        .attr("pos", vec3_to_element(DVec3::ZERO))
        .attr("loc", Element::Int(t1.0 as i64)),
    ),
  );

  assert_eq!(world.entities().get(t5).unwrap().parent, Some(t1));
  // It is still reachable where it now stands, but the subscription into
  // it is gone.
  assert!(reaches(&world, t3, t5));
  assert!(!active(&world, t3, t5));
  assert!(!reaches(&world, t3, t6));
  // The outer subscription is untouched.
  assert!(active(&world, t3, t2));
}

#[test]
fn new_content_appears_to_subscribers() {
  let Fixture {
    mut world, t2, t3, ..
  } = fixture();
  set_access(&mut world, t2, &[t3]);
  world.drain_ops();

  let t9 = world
    .spawn("thing")
    .parent(t2)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  let ops = world.drain_ops();
  let appearances: Vec<&Operation> =
    ops.iter().filter(|op| op.class == OpClass::Appearance).collect();
  assert_eq!(appearances.len(), 1);
  assert_eq!(appearances[0].to, Some(t3));
  assert_eq!(
    appearances[0].args[0].as_entity().and_then(|e| e.id),
    Some(t9)
  );
}

#[test]
fn inventory_contents_are_owner_only() {
  let mut world = World::new(TypeRegistry::with_root());
  let arena = world
    .spawn("thing")
    .bbox(AxisBox::new(DVec3::splat(-128.0), DVec3::splat(128.0)))
    .pos(DVec3::ZERO)
    .attr("domain", "physical")
    .build()
    .unwrap();
  let carrier = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .attr("perception_sight", 1i64)
    .attr("reach", 1.0)
    .attr("domain", "inventory")
    .build()
    .unwrap();
  let watcher = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .attr("perception_sight", 1i64)
    .attr("reach", 1.0)
    .build()
    .unwrap();
  world.tick(1);
  world.drain_ops();

  let carried = world
    .spawn("thing")
    .parent(carrier)
    .bbox(AxisBox::unit())
    .build()
    .unwrap();

  assert!(world.is_visible_to(carrier, carried));
  assert!(reaches(&world, carrier, carried));
  assert!(!world.is_visible_to(watcher, carried));
  assert!(!reaches(&world, watcher, carried));

  // A pouch inside the inventory opens to its owner like any container.
  let pouch = world
    .spawn("thing")
    .parent(carrier)
    .bbox(AxisBox::unit())
    .attr("domain", "container")
    .build()
    .unwrap();
  let coin = world.spawn("thing").parent(pouch).build().unwrap();
  assert!(!reaches(&world, carrier, coin));
  set_access(&mut world, pouch, &[carrier]);
  assert!(reaches(&world, carrier, coin));
  assert!(world.is_visible_to(carrier, coin));
  assert!(!world.is_visible_to(watcher, coin));
}
