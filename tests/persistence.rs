use std::time::Duration;

use glam::DVec3;

use weald::element::Element;
use weald::geometry::vec3_to_element;
use weald::metrics::Metrics;
use weald::ops::{OpClass, Operation};
use weald::persistence::{self, PersistenceManager};
use weald::property::{Modifier, ModifierKind};
use weald::store::{self, StoreHandle};
use weald::typeinfo::TypeRegistry;
use weald::world::World;
use weald::EntityId;

fn wait_for_store(manager: &PersistenceManager) {
  let mut spins = 0;
  while manager.store().pending_queries() > 0 {
    std::thread::sleep(Duration::from_millis(1));
    spins += 1;
    assert!(spins < 5000, "store driver never caught up");
  }
}

fn flush(manager: &mut PersistenceManager, world: &mut World) {
  let mut metrics = Metrics::new();
  manager.tick(world, &mut metrics);
  wait_for_store(manager);
}

fn types() -> TypeRegistry {
  let mut types = TypeRegistry::with_root();
  types
    .load_str(
      "crate_type parent=\"thing\" {\n  mass 1.0\n  solid true\n}",
      "test.kdl",
    )
    .unwrap();
  types
}

#[test]
fn snapshot_restore_roundtrip() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");

  let child;
  let grandchild;
  {
    let (store, _snapshot) = StoreHandle::open(&path).unwrap();
    let mut world = World::new(types());
    persistence::init_world(&mut world);
    let mut manager = PersistenceManager::new(store);

    child = world
      .spawn("crate_type")
      .pos(DVec3::new(3.0, 0.0, 4.0))
      .attr("mass", 4.0)
      .attr("_propel", vec3_to_element(DVec3::new(1.0, 0.0, 0.0)))
      .build()
      .unwrap();
    grandchild = world.spawn("thing").parent(child).build().unwrap();

    flush(&mut manager, &mut world);
    manager.into_store().shutdown();
  }

  // A fresh world from the same store.
  let (store, snapshot) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  let mut manager = PersistenceManager::new(store);
  let restored = manager.restore_world(&mut world, &snapshot).unwrap();
  assert_eq!(restored, 2);

  assert_eq!(world.attr(child, "mass"), Some(Element::Float(4.0)));
  assert_eq!(
    world.attr(child, "_propel"),
    Some(vec3_to_element(DVec3::new(1.0, 0.0, 0.0)))
  );
  let c = world.entities().get(child).unwrap();
  assert_eq!(c.parent, Some(EntityId::ROOT));
  assert_eq!(c.location.pos, DVec3::new(3.0, 0.0, 4.0));
  assert!(c.children.contains(&grandchild));
  assert_eq!(
    world.entities().get(grandchild).unwrap().parent,
    Some(child)
  );
  // The type default came back through the chain.
  assert_eq!(world.attr(child, "solid"), Some(Element::Int(1)));
  manager.into_store().shutdown();
}

#[test]
fn restore_is_idempotent() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");

  {
    let (store, _) = StoreHandle::open(&path).unwrap();
    let mut world = World::new(types());
    persistence::init_world(&mut world);
    let mut manager = PersistenceManager::new(store);
    let a = world
      .spawn("crate_type")
      .attr("mass", 17.0)
      .build()
      .unwrap();
    world.spawn("thing").parent(a).build().unwrap();
    flush(&mut manager, &mut world);
    manager.into_store().shutdown();
  }

  // Restore, flush untouched, and the tables must not change.
  let first = {
    let (store, snapshot) = StoreHandle::open(&path).unwrap();
    let mut world = World::new(types());
    let mut manager = PersistenceManager::new(store);
    manager.restore_world(&mut world, &snapshot).unwrap();
    flush(&mut manager, &mut world);
    let after = manager.store().snapshot();
    manager.into_store().shutdown();
    (snapshot, after)
  };
  assert_eq!(format!("{:?}", first.0), format!("{:?}", first.1));
}

#[test]
fn modified_properties_persist_their_base_value() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");
  let (store, _) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  persistence::init_world(&mut world);
  let mut manager = PersistenceManager::new(store);

  let e = world
    .spawn("crate_type")
    .attr("mass", 10.0)
    .build()
    .unwrap();
  world
    .entities_mut()
    .get_mut(e)
    .unwrap()
    .add_modifier("mass", Modifier::new(ModifierKind::Multiply, 2.0));
  assert_eq!(world.attr(e, "mass"), Some(Element::Float(20.0)));

  flush(&mut manager, &mut world);
  let snapshot = manager.store().snapshot();
  let blob = snapshot
    .properties
    .get(&(e.0, "mass".to_owned()))
    .expect("mass row missing");
  // The effective value is 20 but the stored value is the base.
  assert_eq!(
    store::decode_value_blob(blob).unwrap(),
    Element::Float(10.0)
  );
  manager.into_store().shutdown();
}

#[test]
fn ephemeral_entities_and_properties_stay_out() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");
  let (store, _) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  persistence::init_world(&mut world);
  let mut manager = PersistenceManager::new(store);

  let ghost = world.spawn("thing").ephemeral().build().unwrap();
  let solid = world.spawn("crate_type").build().unwrap();

  flush(&mut manager, &mut world);
  let snapshot = manager.store().snapshot();
  assert!(!snapshot.entities.contains_key(&ghost.0));
  assert!(snapshot.entities.contains_key(&solid.0));
  // Type defaults are owned by the type, not written per entity.
  assert!(snapshot
    .properties
    .get(&(solid.0, "mass".to_owned()))
    .is_none());
  manager.into_store().shutdown();
}

#[test]
fn destroyed_entities_drop_their_rows() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");
  let (store, _) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  persistence::init_world(&mut world);
  let mut manager = PersistenceManager::new(store);

  let doomed = world
    .spawn("crate_type")
    .attr("mass", 3.0)
    .build()
    .unwrap();
  flush(&mut manager, &mut world);
  assert!(manager.store().snapshot().entities.contains_key(&doomed.0));

  world.dispatch(Operation::new(OpClass::Delete).from(doomed).to(doomed));
  world.tick(1);
  flush(&mut manager, &mut world);
  let snapshot = manager.store().snapshot();
  assert!(!snapshot.entities.contains_key(&doomed.0));
  assert!(snapshot
    .properties
    .get(&(doomed.0, "mass".to_owned()))
    .is_none());
  manager.into_store().shutdown();
}

#[test]
fn character_links_flow_through() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");
  let (store, _) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  persistence::init_world(&mut world);
  let mut manager = PersistenceManager::new(store);

  let hero = world.spawn("crate_type").build().unwrap();
  world.character_added(hero, "account-77");
  flush(&mut manager, &mut world);
  assert_eq!(
    manager.store().snapshot().character_account.get(&hero.0),
    Some(&"account-77".to_owned())
  );

  world.character_deleted(hero);
  flush(&mut manager, &mut world);
  assert!(manager
    .store()
    .snapshot()
    .character_account
    .get(&hero.0)
    .is_none());
  manager.into_store().shutdown();
}

#[test]
fn updates_and_metrics_accumulate() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");
  let (store, _) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  persistence::init_world(&mut world);
  let mut manager = PersistenceManager::new(store);
  let mut metrics = Metrics::new();

  let e = world
    .spawn("crate_type")
    .attr("mass", 1.0)
    .build()
    .unwrap();
  manager.tick(&mut world, &mut metrics);
  wait_for_store(&manager);
  assert_eq!(metrics.get("storage_entity_inserts"), 1);
  assert_eq!(metrics.get("storage_property_inserts"), 1);

  let mut res = Vec::new();
  world.set_property(e, "mass", 2.0, &mut res);
  manager.tick(&mut world, &mut metrics);
  wait_for_store(&manager);
  assert_eq!(metrics.get("storage_entity_updates"), 1);
  assert_eq!(metrics.get("storage_property_updates"), 1);
  assert_eq!(
    store::decode_value_blob(
      manager
        .store()
        .snapshot()
        .properties
        .get(&(e.0, "mass".to_owned()))
        .unwrap()
    )
    .unwrap(),
    Element::Float(2.0)
  );

  // Untouched entities produce no further updates.
  manager.tick(&mut world, &mut metrics);
  wait_for_store(&manager);
  assert_eq!(metrics.get("storage_entity_updates"), 1);
  manager.into_store().shutdown();
}

#[test]
fn shutdown_honors_abort_flag() {
  use std::sync::atomic::AtomicBool;

  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("world.store");
  let (store, _) = StoreHandle::open(&path).unwrap();
  let mut world = World::new(types());
  persistence::init_world(&mut world);
  let mut manager = PersistenceManager::new(store);

  world.spawn("crate_type").attr("mass", 5.0).build().unwrap();
  let abort = AtomicBool::new(false);
  manager.shutdown(&mut world, &abort);
  assert_eq!(manager.store().pending_queries(), 0);
  manager.into_store().shutdown();
}
