use std::sync::{Arc, Mutex};

use glam::DVec3;

use weald::element::Element;
use weald::geometry::{element_to_vec3, vec3_to_element, AxisBox};
use weald::minds::Mind;
use weald::ops::{self, EntityRef, OpClass, OpVector, Operation};
use weald::typeinfo::TypeRegistry;
use weald::world::World;
use weald::{EntityId, MindId};

/// A mind that remembers everything the world shows it.
#[derive(Clone, Default)]
struct RecordingMind {
  seen: Arc<Mutex<Vec<Operation>>>,
}

impl RecordingMind {
  fn ops(&self) -> Vec<Operation> {
    self.seen.lock().unwrap().clone()
  }
}

impl Mind for RecordingMind {
  fn operation(&mut self, op: &Operation, _res: &mut OpVector) {
    self.seen.lock().unwrap().push(op.clone());
  }
}

struct Fixture {
  world: World,
  arena: EntityId,
  body: EntityId,
  mind: MindId,
  recorder: RecordingMind,
}

fn fixture() -> Fixture {
  let mut world = World::new(TypeRegistry::with_root());
  let arena = world
    .spawn("thing")
    .bbox(AxisBox::new(DVec3::splat(-512.0), DVec3::splat(512.0)))
    .pos(DVec3::ZERO)
    .attr("domain", "physical")
    .build()
    .unwrap();
  let body = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::ZERO)
    .bbox(AxisBox::unit())
    .attr("perception_sight", 1i64)
    .attr("reach", 1.0)
    .build()
    .unwrap();
  let recorder = RecordingMind::default();
  let mind = world.attach_mind(body, Box::new(recorder.clone())).unwrap();
  world.tick(1);
  world.drain_ops();
  Fixture {
    world,
    arena,
    body,
    mind,
    recorder,
  }
}

fn thought(body: EntityId, inner: Operation) -> Operation {
  Operation::new(OpClass::Thought).from(body).to(body).op_arg(inner)
}

fn propel_of(op: &Operation) -> Option<DVec3> {
  op.first_entity_arg()
    .and_then(|arg| arg.get("_propel"))
    .and_then(element_to_vec3)
}

#[test]
fn propel_is_normalized() {
  let Fixture {
    mut world, body, ..
  } = fixture();

  // Magnitude above one is clamped to the unit sphere.
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Set).entity_arg(
      EntityRef::with_id(body)
        .attr("_propel", vec3_to_element(DVec3::new(2.0, 0.0, 0.0))),
    ),
  ));
  let ops = world.drain_ops();
  let set = ops.iter().find(|op| op.class == OpClass::Set).unwrap();
  assert_eq!(set.from, Some(body));
  assert_eq!(set.to, Some(body));
  let propel = propel_of(set).unwrap();
  assert!((propel - DVec3::new(1.0, 0.0, 0.0)).length() < 1e-9);

  // At or below one it passes through exactly.
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Set).entity_arg(
      EntityRef::with_id(body)
        .attr("_propel", vec3_to_element(DVec3::new(0.3, 0.0, 0.0))),
    ),
  ));
  let ops = world.drain_ops();
  let set = ops.iter().find(|op| op.class == OpClass::Set).unwrap();
  assert_eq!(propel_of(set), Some(DVec3::new(0.3, 0.0, 0.0)));
}

#[test]
fn set_whitelist_drops_other_attributes() {
  let Fixture {
    mut world, body, ..
  } = fixture();
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Set).entity_arg(
      EntityRef::with_id(body)
        .attr("_destination", vec3_to_element(DVec3::new(5.0, 0.0, 5.0)))
        .attr("admin", 1i64)
        .attr("mass", 99.0),
    ),
  ));
  let ops = world.drain_ops();
  let set = ops.iter().find(|op| op.class == OpClass::Set).unwrap();
  let arg = set.first_entity_arg().unwrap();
  assert!(arg.get("_destination").is_some());
  assert!(arg.get("admin").is_none());
  assert!(arg.get("mass").is_none());
}

#[test]
fn touch_out_of_reach_is_a_client_error() {
  let Fixture {
    mut world,
    arena,
    body,
    recorder,
    ..
  } = fixture();
  let target = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::new(10.0, 0.0, 0.0))
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  world.tick(1);
  world.drain_ops();
  let before = recorder.ops().len();

  world.dispatch(thought(
    body,
    Operation::new(OpClass::Touch)
      .entity_arg(EntityRef::with_id(target)),
  ));
  let ops = world.drain_ops();
  assert!(ops.iter().all(|op| op.class != OpClass::Sight));
  let errors: Vec<&Operation> =
    ops.iter().filter(|op| op.class == OpClass::Error).collect();
  assert_eq!(errors.len(), 1);
  assert_eq!(errors[0].to, Some(body));
  assert_eq!(
    ops::error_message(errors[0]),
    Some("Entity is too far away.")
  );

  // Deliver the error to the body and it lands with the mind.
  for op in ops {
    world.dispatch(op);
  }
  let seen = recorder.ops();
  let client_errors: Vec<&Operation> = seen[before..]
    .iter()
    .filter(|op| op.class == OpClass::Error)
    .collect();
  assert_eq!(client_errors.len(), 1);
}

#[test]
fn touch_in_reach_emits_sight() {
  let Fixture {
    mut world,
    arena,
    body,
    ..
  } = fixture();
  let target = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::new(0.5, 0.0, 0.0))
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  world.tick(1);
  world.drain_ops();

  world.dispatch(thought(
    body,
    Operation::new(OpClass::Touch).entity_arg(EntityRef::with_id(target)),
  ));
  let ops = world.drain_ops();
  let touch = ops.iter().find(|op| op.class == OpClass::Touch).unwrap();
  assert_eq!(touch.to, Some(target));
  let sight = ops.iter().find(|op| op.class == OpClass::Sight).unwrap();
  assert_eq!(sight.args[0].as_op().unwrap().class, OpClass::Touch);
}

#[test]
fn moves_are_rewritten_to_parents() {
  let Fixture {
    mut world,
    arena,
    body,
    ..
  } = fixture();
  let boulder = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::new(0.5, 0.0, 0.0))
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  world.tick(1);
  world.drain_ops();

  // Moving another entity goes to the target's parent.
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Move).entity_arg(
      EntityRef::with_id(boulder)
        .attr("pos", vec3_to_element(DVec3::new(1.0, 0.0, 0.0)))
        .attr("name", "sneaky rename"),
    ),
  ));
  let ops = world.drain_ops();
  let moved = ops.iter().find(|op| op.class == OpClass::Move).unwrap();
  assert_eq!(moved.to, Some(arena));
  assert_eq!(moved.from, Some(body));
  // The arg was sanitized down to the allowed keys.
  let arg = moved.first_entity_arg().unwrap();
  assert!(arg.get("pos").is_some());
  assert!(arg.get("name").is_none());

  // Moving yourself also goes to your parent.
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Move).entity_arg(
      EntityRef::with_id(body)
        .attr("pos", vec3_to_element(DVec3::new(1.0, 0.0, 1.0))),
    ),
  ));
  let ops = world.drain_ops();
  let moved = ops.iter().find(|op| op.class == OpClass::Move).unwrap();
  assert_eq!(moved.to, Some(arena));
  assert_eq!(moved.from, Some(body));
}

#[test]
fn move_of_unknown_target_is_unseen() {
  let Fixture {
    mut world, body, ..
  } = fixture();
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Move)
      .entity_arg(EntityRef::with_id(EntityId(4040))),
  ));
  let ops = world.drain_ops();
  let unseen = ops.iter().find(|op| op.class == OpClass::Unseen).unwrap();
  assert_eq!(unseen.to, Some(body));
  assert_eq!(
    unseen.args[0].as_entity().and_then(|e| e.id),
    Some(EntityId(4040))
  );
}

#[test]
fn constraints_reject_with_their_message() {
  let Fixture {
    mut world,
    arena,
    body,
    ..
  } = fixture();
  let boulder = world
    .spawn("thing")
    .parent(arena)
    .pos(DVec3::new(0.5, 0.0, 0.0))
    .bbox(AxisBox::unit())
    .build()
    .unwrap();
  let mut res = Vec::new();
  let constraint: Element = [
    (
      "predicate".to_owned(),
      Element::from("actor.strength >= 10"),
    ),
    ("message".to_owned(), Element::from("You are too weak.")),
  ]
  .into_iter()
  .collect();
  world.set_property(boulder, "move_constraint", constraint, &mut res);
  world.set_property(body, "strength", 5i64, &mut res);
  world.tick(1);
  world.drain_ops();

  let move_thought = || {
    thought(
      body,
      Operation::new(OpClass::Move).entity_arg(
        EntityRef::with_id(boulder)
          .attr("pos", vec3_to_element(DVec3::new(1.0, 0.0, 0.0))),
      ),
    )
  };

  world.dispatch(move_thought());
  let ops = world.drain_ops();
  let errors: Vec<&Operation> =
    ops.iter().filter(|op| op.class == OpClass::Error).collect();
  assert_eq!(errors.len(), 1);
  assert_eq!(ops::error_message(errors[0]), Some("You are too weak."));
  assert!(ops.iter().all(|op| op.class != OpClass::Move));

  // Strong enough now.
  let mut res = Vec::new();
  world.set_property(body, "strength", 20i64, &mut res);
  world.dispatch(move_thought());
  let ops = world.drain_ops();
  assert!(ops.iter().any(|op| op.class == OpClass::Move));
}

#[test]
fn world_ops_are_forwarded_except_leaky_ones() {
  let Fixture {
    mut world,
    body,
    recorder,
    ..
  } = fixture();
  let before = recorder.ops().len();

  world.dispatch(
    Operation::new(OpClass::Sight)
      .from(body)
      .to(body)
      .entity_arg(EntityRef::with_id(body)),
  );
  world.dispatch(Operation::new(OpClass::Get).from(body).to(body));
  world.process_all();

  let seen = recorder.ops();
  let new: Vec<&Operation> = seen[before..].iter().collect();
  assert!(new.iter().any(|op| op.class == OpClass::Sight));
  assert!(new.iter().all(|op| op.class != OpClass::Get));
}

#[test]
fn look_with_no_args_looks_at_parent() {
  let Fixture {
    mut world,
    arena,
    body,
    recorder,
    ..
  } = fixture();
  let before = recorder.ops().len();
  world.dispatch(thought(body, Operation::new(OpClass::Look)));
  world.process_all();

  let seen = recorder.ops();
  let sight = seen[before..]
    .iter()
    .find(|op| op.class == OpClass::Sight)
    .unwrap();
  let arg = sight.first_entity_arg().unwrap();
  assert_eq!(arg.id, Some(arena));
  // The wire form names the type and the location.
  assert_eq!(arg.get("parent").and_then(Element::as_str), Some("thing"));
}

#[test]
fn last_mind_out_stops_propulsion() {
  let Fixture {
    mut world,
    body,
    mind,
    ..
  } = fixture();
  world.detach_mind(body, mind);
  let ops = world.drain_ops();
  let set = ops.iter().find(|op| op.class == OpClass::Set).unwrap();
  assert_eq!(set.to, Some(body));
  assert_eq!(propel_of(set), Some(DVec3::ZERO));
}

#[test]
fn mind_op_with_to_set_is_dropped() {
  let Fixture {
    mut world,
    arena,
    body,
    ..
  } = fixture();
  world.dispatch(thought(
    body,
    Operation::new(OpClass::Talk).to(arena),
  ));
  let ops = world.drain_ops();
  assert!(ops.iter().all(|op| op.class != OpClass::Talk));
}
