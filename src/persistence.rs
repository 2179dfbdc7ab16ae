//! Queued write-back of entity state to the store, and startup restore.
//!
//! The manager watches the world's signal bus and sorts entities into
//! queues: `unstored` for rows that do not exist yet, `dirty` for rows
//! with modified state, `destroyed` for rows to drop, plus the
//! character/account link queues. Each tick drains the queues into store
//! commands under a pending-query bound.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use ahash::AHashMap;

use crate::entity::{EntityFlags, CLEAN_MASK};
use crate::geometry::Location;
use crate::metrics::Metrics;
use crate::ops::OpVector;
use crate::property::PropFlags;
use crate::store::{
  self, EntityRow, StoreCommand, StoreData, StoreError, StoreHandle,
};
use crate::world::{World, WorldSignal};
use crate::EntityId;

/// Stop flushing dirty entities once this many commands are in flight.
const PENDING_QUERY_LIMIT: usize = 200;
/// Dirty entities flushed per tick unless configured otherwise.
const DEFAULT_DIRTY_BUDGET: usize = 32;
/// Give up on a row after this many consecutive flush failures.
const MAX_ROW_FAILURES: u32 = 3;
/// Samples in the rolling QPS window.
const QPS_WINDOW: usize = 32;

pub struct PersistenceManager {
  store: StoreHandle,

  unstored: VecDeque<EntityId>,
  dirty: VecDeque<EntityId>,
  destroyed: VecDeque<EntityId>,
  added_characters: VecDeque<(EntityId, String)>,
  deleted_characters: VecDeque<EntityId>,

  insert_entity_count: i64,
  update_entity_count: i64,
  insert_property_count: i64,
  update_property_count: i64,

  insert_qps_ring: [i64; QPS_WINDOW],
  update_qps_ring: [i64; QPS_WINDOW],
  insert_qps_index: usize,
  update_qps_index: usize,
  insert_qps_sum: i64,
  update_qps_sum: i64,

  row_failures: AHashMap<EntityId, u32>,
  failure_count: i64,
  dirty_budget: usize,
}

impl PersistenceManager {
  pub fn new(store: StoreHandle) -> Self {
    Self {
      store,
      unstored: VecDeque::new(),
      dirty: VecDeque::new(),
      destroyed: VecDeque::new(),
      added_characters: VecDeque::new(),
      deleted_characters: VecDeque::new(),
      insert_entity_count: 0,
      update_entity_count: 0,
      insert_property_count: 0,
      update_property_count: 0,
      insert_qps_ring: [0; QPS_WINDOW],
      update_qps_ring: [0; QPS_WINDOW],
      insert_qps_index: 0,
      update_qps_index: 0,
      insert_qps_sum: 0,
      update_qps_sum: 0,
      row_failures: AHashMap::new(),
      failure_count: 0,
      dirty_budget: DEFAULT_DIRTY_BUDGET,
    }
  }

  /// Bound the number of dirty entities flushed per tick.
  pub fn set_flush_batch(&mut self, batch: usize) {
    self.dirty_budget = batch.max(1);
  }

  pub fn store(&self) -> &StoreHandle {
    &self.store
  }

  pub fn into_store(self) -> StoreHandle {
    self.store
  }

  /// Drain world signals into the queues, then flush under the budget.
  pub fn tick(&mut self, world: &mut World, metrics: &mut Metrics) {
    self.collect_signals(world);

    let old_inserts = self.insert_entity_count + self.insert_property_count;
    let old_updates = self.update_entity_count + self.update_property_count;

    while let Some(id) = self.destroyed.pop_front() {
      let _ = self.store.send(StoreCommand::DropEntity(id.0));
      let _ = self.store.send(StoreCommand::DropProperties(id.0));
    }

    while let Some(id) = self.unstored.pop_front() {
      let gone = world
        .entities()
        .get(id)
        .map(|e| e.is_destroyed())
        .unwrap_or(true);
      if gone {
        continue;
      }
      self.flush_entity(world, id, true);
    }

    while let Some((entity, account)) = self.added_characters.pop_front() {
      let _ = self.store.send(StoreCommand::LinkCharacter {
        entity: entity.0,
        account,
      });
    }
    while let Some(entity) = self.deleted_characters.pop_front() {
      let _ = self
        .store
        .send(StoreCommand::UnlinkCharacter { entity: entity.0 });
    }

    let mut flushed = 0;
    while let Some(id) = self.dirty.pop_front() {
      if flushed >= self.dirty_budget
        || self.store.pending_queries() > PENDING_QUERY_LIMIT
      {
        self.dirty.push_front(id);
        break;
      }
      flushed += 1;
      let Some(entity) = world.entities().get(id) else {
        continue;
      };
      if entity.is_destroyed() {
        self.destroyed.push_back(id);
        continue;
      }
      if !entity.flags.contains(CLEAN_MASK) {
        self.flush_entity(world, id, false);
      }
      if let Some(e) = world.entities_mut().get_mut(id) {
        e.flags.remove(EntityFlags::QUEUED);
      }
    }

    self.roll_qps(
      self.insert_entity_count + self.insert_property_count - old_inserts,
      self.update_entity_count + self.update_property_count - old_updates,
    );
    self.publish(metrics);
  }

  fn collect_signals(&mut self, world: &mut World) {
    for signal in world.drain_signals() {
      match signal {
        WorldSignal::Inserted(id) => self.entity_inserted(world, id),
        WorldSignal::Updated(id) | WorldSignal::Containered(id) => {
          self.entity_updated(world, id)
        }
        WorldSignal::BeingDeleted(id) => self.destroyed.push_back(id),
        WorldSignal::CharacterAdded { entity, account } => {
          self.added_characters.push_back((entity, account))
        }
        WorldSignal::CharacterDeleted { entity } => {
          self.deleted_characters.push_back(entity)
        }
      }
    }
  }

  fn entity_inserted(&mut self, world: &mut World, id: EntityId) {
    let Some(entity) = world.entities_mut().get_mut(id) else {
      return;
    };
    if entity.flags.contains(EntityFlags::EPHEMERAL) {
      return;
    }
    if entity.flags.contains(EntityFlags::CLEAN) {
      // Freshly restored; it only ever needs updates.
      return;
    }
    entity.flags.insert(EntityFlags::QUEUED);
    self.unstored.push_back(id);
  }

  fn entity_updated(&mut self, world: &mut World, id: EntityId) {
    let Some(entity) = world.entities_mut().get_mut(id) else {
      return;
    };
    if entity.flags.contains(EntityFlags::EPHEMERAL) {
      return;
    }
    if entity.is_destroyed() {
      self.destroyed.push_back(id);
      return;
    }
    if entity.flags.contains(EntityFlags::QUEUED) {
      return;
    }
    entity.flags.insert(EntityFlags::QUEUED);
    self.dirty.push_back(id);
  }

  /// Write one entity row plus its out-of-sync properties.
  fn flush_entity(&mut self, world: &mut World, id: EntityId, insert: bool) {
    match self.try_flush_entity(world, id, insert) {
      Ok(()) => {
        self.row_failures.remove(&id);
      }
      Err(err) => {
        self.failure_count += 1;
        let failures = self.row_failures.entry(id).or_insert(0);
        *failures += 1;
        if *failures >= MAX_ROW_FAILURES {
          tracing::warn!(entity = %id, %err, failures = *failures,
            "dropping entity from persistence after repeated failures");
          self.row_failures.remove(&id);
        } else {
          tracing::warn!(entity = %id, %err, "store write failed, will retry");
          let queue = if insert {
            &mut self.unstored
          } else {
            &mut self.dirty
          };
          queue.push_back(id);
        }
      }
    }
  }

  fn try_flush_entity(
    &mut self,
    world: &mut World,
    id: EntityId,
    insert: bool,
  ) -> Result<(), StoreError> {
    struct PropWrite {
      name: String,
      blob: Vec<u8>,
      was_seen: bool,
    }

    let (row, writes) = {
      let Some(entity) = world.entities().get(id) else {
        return Ok(());
      };
      let location = store::encode_element(&entity.location.to_element())?;
      let row = EntityRow {
        id: id.0,
        parent_id: entity.parent.map(|p| p.0),
        type_name: entity.type_name.to_string(),
        seq: entity.seq,
        location,
      };

      let mut writes = Vec::new();
      for (name, entry) in entity.properties() {
        if entry.flags.contains(PropFlags::EPHEM)
          || entry.flags.contains(PropFlags::CLASS_DEFAULT)
        {
          continue;
        }
        if !insert && entry.flags.contains(PropFlags::CLEAN) {
          continue;
        }
        // A modified property persists its base value so modifiers can be
        // re-derived after restore.
        let value = if entry.has_modifiers() {
          entry.base_value()
        } else {
          entry.value()
        };
        writes.push(PropWrite {
          name: name.to_string(),
          blob: store::encode_value_blob(value)?,
          was_seen: entry.flags.contains(PropFlags::SEEN),
        });
      }
      (row, writes)
    };

    if insert {
      self.store.send(StoreCommand::InsertEntity(row))?;
      self.insert_entity_count += 1;
    } else {
      self.store.send(StoreCommand::UpdateEntity {
        id: row.id,
        seq: row.seq,
        location: row.location,
        parent_id: row.parent_id,
      })?;
      self.update_entity_count += 1;
    }
    for write in &writes {
      self.store.send(StoreCommand::UpsertProperty {
        entity: id.0,
        name: write.name.clone(),
        blob: write.blob.clone(),
      })?;
      if write.was_seen {
        self.update_property_count += 1;
      } else {
        self.insert_property_count += 1;
      }
    }

    if let Some(entity) = world.entities_mut().get_mut(id) {
      for write in &writes {
        if let Some(entry) = entity.property_mut(&write.name) {
          entry.flags.insert(PropFlags::CLEAN | PropFlags::SEEN);
        }
      }
      entity.flags.remove(EntityFlags::QUEUED);
      entity.flags.insert(CLEAN_MASK);
    }
    Ok(())
  }

  fn roll_qps(&mut self, insert_queries: i64, update_queries: i64) {
    self.insert_qps_index = (self.insert_qps_index + 1) % QPS_WINDOW;
    self.insert_qps_sum -= self.insert_qps_ring[self.insert_qps_index];
    self.insert_qps_sum += insert_queries;
    self.insert_qps_ring[self.insert_qps_index] = insert_queries;

    self.update_qps_index = (self.update_qps_index + 1) % QPS_WINDOW;
    self.update_qps_sum -= self.update_qps_ring[self.update_qps_index];
    self.update_qps_sum += update_queries;
    self.update_qps_ring[self.update_qps_index] = update_queries;
  }

  fn publish(&self, metrics: &mut Metrics) {
    metrics.set("storage_write_failures", self.failure_count);
    metrics.set("storage_entity_inserts", self.insert_entity_count);
    metrics.set("storage_entity_updates", self.update_entity_count);
    metrics.set("storage_property_inserts", self.insert_property_count);
    metrics.set("storage_property_updates", self.update_property_count);
    metrics.set(
      r#"storage_qps{qtype="inserts",t="1"}"#,
      self.insert_qps_ring[self.insert_qps_index],
    );
    metrics.set(
      r#"storage_qps{qtype="updates",t="1"}"#,
      self.update_qps_ring[self.update_qps_index],
    );
    metrics.set(
      r#"storage_qps{qtype="inserts",t="32"}"#,
      self.insert_qps_sum / QPS_WINDOW as i64,
    );
    metrics.set(
      r#"storage_qps{qtype="updates",t="32"}"#,
      self.update_qps_sum / QPS_WINDOW as i64,
    );
  }

  // ---- startup restore --------------------------------------------------

  /// Rebuild the world from a snapshot: tree first, then properties.
  ///
  /// Children are materialized without type defaults; the property pass
  /// sets stored values (skipping ones equal to the effective default),
  /// installs the remaining type defaults, and finally registers each
  /// entity with its parent's domain.
  pub fn restore_world(
    &mut self,
    world: &mut World,
    snapshot: &StoreData,
  ) -> Result<usize, StoreError> {
    tracing::info!("starting restoring world from storage");
    let count = restore_children(world, snapshot, EntityId::ROOT)?;
    restore_properties(world, snapshot, EntityId::ROOT)?;
    if count > 0 {
      tracing::info!(entities = count, "completed restoring world from storage");
    } else {
      tracing::info!("no existing world found in storage");
    }
    // Restore traffic is not client traffic.
    world.clear_queues();
    Ok(count)
  }

  /// Flush everything and drive the store to completion, honoring `abort`.
  pub fn shutdown(&mut self, world: &mut World, abort: &AtomicBool) {
    let mut metrics = Metrics::new();
    self.tick(world, &mut metrics);
    let _ = self.store.flush();
    while self.store.pending_queries() > 0 {
      if abort.load(Ordering::SeqCst) {
        tracing::warn!(
          "aborted entity persisting; this might lead to lost entities"
        );
        return;
      }
      std::thread::sleep(std::time::Duration::from_millis(1));
    }
  }
}

fn restore_children(
  world: &mut World,
  snapshot: &StoreData,
  parent: EntityId,
) -> Result<usize, StoreError> {
  let mut count = 0;
  for row in snapshot.children_of(parent.0) {
    let id = EntityId(row.id);
    if !world.types().contains(&row.type_name) {
      tracing::error!(entity = %id, type_name = %row.type_name,
        "could not restore entity, most likely caused by this type missing");
      continue;
    }
    let built = world
      .spawn_restored(&row.type_name, id)
      .parent(parent)
      .build();
    if let Err(err) = built {
      tracing::error!(entity = %id, %err, "could not restore entity");
      continue;
    }
    let location = store::decode_element(&row.location)?;
    if let Some(entity) = world.entities_mut().get_mut(id) {
      entity.location = Location::from_element(&location);
      entity.seq = row.seq;
    }
    count += 1;
    count += restore_children(world, snapshot, id)?;
  }
  Ok(count)
}

fn restore_properties(
  world: &mut World,
  snapshot: &StoreData,
  id: EntityId,
) -> Result<(), StoreError> {
  let mut res = OpVector::new();
  let type_name = match world.entities().get(id) {
    Some(e) => e.type_name.clone(),
    None => return Ok(()),
  };

  let mut instance_names = Vec::new();
  for (name, blob) in snapshot.properties_of(id.0) {
    let value = store::decode_value_blob(blob)?;
    // Values equal to what the entity would resolve anyway are skipped.
    if let Some(existing) = world.attr(id, name) {
      if existing.loosely_equals(&value) {
        continue;
      }
    }
    if let Some(entity) = world.entities_mut().get_mut(id) {
      entity.install_restored(name, value);
    }
    world.apply_property(id, name, &mut res);
    instance_names.push(name.to_owned());
  }

  if id != EntityId::ROOT {
    let defaults = world
      .types()
      .effective_defaults(&type_name)
      .unwrap_or_default();
    for (name, value) in defaults {
      if instance_names.iter().any(|n| n == name.as_str()) {
        continue;
      }
      if let Some(entity) = world.entities_mut().get_mut(id) {
        entity.install_class_default(&name, value);
      }
      world.apply_property(id, &name, &mut res);
    }
  }

  // With properties in place the entity can join its parent's domain.
  let parent = world.entities().get(id).and_then(|e| e.parent);
  if let Some(parent) = parent {
    world.attach_to_domain(parent, id, &mut res);
  }
  world.enqueue_all(res);

  let children: Vec<EntityId> = world
    .entities()
    .get(id)
    .map(|e| e.children.iter().copied().collect())
    .unwrap_or_default();
  for child in children {
    restore_properties(world, snapshot, child)?;
  }
  Ok(())
}

/// Mark a fresh (non-restored) world's root as managed.
pub fn init_world(world: &mut World) {
  if let Some(root) = world.entities_mut().get_mut(EntityId::ROOT) {
    root.flags.insert(EntityFlags::CLEAN);
  }
}
