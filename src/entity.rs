//! Entities and the registry they live in.

use ahash::AHashMap;
use bitflags::bitflags;
use indexmap::{IndexMap, IndexSet};
use smol_str::SmolStr;

use crate::domain::DomainKind;
use crate::element::Element;
use crate::geometry::Location;
use crate::property::{Modifier, PropFlags, PropertyEntry};
use crate::router::RouterTable;
use crate::{EntityId, MindId};

bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct EntityFlags: u32 {
    /// Entity row is in sync with the store.
    const CLEAN = 1 << 0;
    /// Position is in sync with the store.
    const POS_CLEAN = 1 << 1;
    /// Orientation is in sync with the store.
    const ORIENT_CLEAN = 1 << 2;
    /// Already sitting in a persistence queue.
    const QUEUED = 1 << 3;
    /// Never persisted.
    const EPHEMERAL = 1 << 4;
    /// Terminal: no further operations are routed here.
    const DESTROYED = 1 << 5;
    /// Has sight perception; physical domains track it as an observer.
    const PERCEPTIVE = 1 << 6;
  }
}

/// All persistence-clean bits at once.
pub const CLEAN_MASK: EntityFlags = EntityFlags::CLEAN
  .union(EntityFlags::POS_CLEAN)
  .union(EntityFlags::ORIENT_CLEAN);

/// An addressable participant in the simulation.
pub struct Entity {
  pub id: EntityId,
  /// Stable string id, minted on first persist.
  pub stable_id: Option<String>,
  pub type_name: SmolStr,
  /// Bumps on every observable change; persistence records the seq it has
  /// flushed.
  pub seq: u64,
  pub flags: EntityFlags,
  pub parent: Option<EntityId>,
  pub children: IndexSet<EntityId>,
  pub location: Location,
  pub domain: Option<DomainKind>,
  pub minds: Vec<MindId>,
  pub routers: RouterTable,
  props: IndexMap<SmolStr, PropertyEntry>,
}

impl Entity {
  pub fn new(id: EntityId, type_name: impl Into<SmolStr>) -> Self {
    Self {
      id,
      stable_id: None,
      type_name: type_name.into(),
      seq: 0,
      flags: EntityFlags::empty(),
      parent: None,
      children: IndexSet::new(),
      location: Location::default(),
      domain: None,
      minds: Vec::new(),
      routers: RouterTable::default(),
      props: IndexMap::new(),
    }
  }

  pub fn is_destroyed(&self) -> bool {
    self.flags.contains(EntityFlags::DESTROYED)
  }

  pub fn is_perceptive(&self) -> bool {
    self.flags.contains(EntityFlags::PERCEPTIVE)
  }

  /// Record an observable change: bump `seq` and mark the row dirty.
  pub fn touch(&mut self) {
    self.seq += 1;
    self.flags.remove(EntityFlags::CLEAN);
  }

  /// One line for the logs.
  pub fn describe(&self) -> String {
    format!("entity {} ({})", self.id, self.type_name)
  }

  pub fn properties(&self) -> impl Iterator<Item = (&SmolStr, &PropertyEntry)> {
    self.props.iter()
  }

  pub fn property(&self, name: &str) -> Option<&PropertyEntry> {
    self.props.get(name)
  }

  pub fn property_mut(&mut self, name: &str) -> Option<&mut PropertyEntry> {
    self.props.get_mut(name)
  }

  /// Effective value of an installed property. Callers that also want type
  /// fall-through go through the world, which holds the registry.
  pub fn attr(&self, name: &str) -> Option<&Element> {
    self.props.get(name).map(PropertyEntry::value)
  }

  pub fn attr_float(&self, name: &str) -> Option<f64> {
    self.attr(name).and_then(Element::as_float)
  }

  pub fn attr_str(&self, name: &str) -> Option<&str> {
    self.attr(name).and_then(Element::as_str)
  }

  /// Set a property's base value, installing the entry on first write.
  /// Installing on a destroyed entity is a no-op.
  ///
  /// Returns whether anything was written. Does not bump `seq`; mutation
  /// sites decide what counts as an observable change.
  pub fn set_property(&mut self, name: &str, value: Element) -> bool {
    if self.is_destroyed() {
      return false;
    }
    match self.props.get_mut(name) {
      Some(entry) => {
        entry.set(value);
        entry.flags.remove(PropFlags::CLASS_DEFAULT);
        entry.flags.insert(PropFlags::INSTANCE);
      }
      None => {
        self.props.insert(SmolStr::new(name), PropertyEntry::new(value));
      }
    }
    true
  }

  /// Install a value owned by the type chain. Skipped if an instance value
  /// is already present.
  pub fn install_class_default(&mut self, name: &str, value: Element) {
    if self.is_destroyed() || self.props.contains_key(name) {
      return;
    }
    self.props.insert(
      SmolStr::new(name),
      PropertyEntry::with_flags(
        value,
        PropFlags::CLASS_DEFAULT | PropFlags::CLEAN,
      ),
    );
  }

  /// Install an entry restored from the store, already flagged as seen.
  pub fn install_restored(&mut self, name: &str, value: Element) {
    self.props.insert(
      SmolStr::new(name),
      PropertyEntry::with_flags(
        value,
        PropFlags::INSTANCE | PropFlags::CLEAN | PropFlags::SEEN,
      ),
    );
  }

  pub fn add_modifier(&mut self, name: &str, modifier: Modifier) -> usize {
    match self.props.get_mut(name) {
      Some(entry) => entry.add_modifier(modifier),
      None => {
        let mut entry = PropertyEntry::new(Element::None);
        let index = entry.add_modifier(modifier);
        self.props.insert(SmolStr::new(name), entry);
        index
      }
    }
  }

  pub fn remove_property(&mut self, name: &str) -> Option<PropertyEntry> {
    self.props.shift_remove(name)
  }
}

/// The id-keyed registry of live entities.
///
/// Parents own their children logically; the registry owns the storage. All
/// access funnels through ids so a dangling reference surfaces as a lookup
/// failure, never a crash.
#[derive(Default)]
pub struct Entities {
  map: AHashMap<EntityId, Entity>,
  next_id: u64,
}

impl Entities {
  pub fn new() -> Self {
    Self {
      map: AHashMap::new(),
      next_id: 1,
    }
  }

  pub fn allocate_id(&mut self) -> EntityId {
    let id = EntityId(self.next_id);
    self.next_id += 1;
    id
  }

  /// Make sure future allocations won't collide with an id restored from
  /// the store.
  pub fn reserve_id(&mut self, id: EntityId) {
    self.next_id = self.next_id.max(id.0 + 1);
  }

  pub fn insert(&mut self, entity: Entity) {
    self.reserve_id(entity.id);
    self.map.insert(entity.id, entity);
  }

  pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
    self.map.remove(&id)
  }

  pub fn contains(&self, id: EntityId) -> bool {
    self.map.contains_key(&id)
  }

  pub fn get(&self, id: EntityId) -> Option<&Entity> {
    self.map.get(&id)
  }

  pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
    self.map.get_mut(&id)
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&EntityId, &Entity)> {
    self.map.iter()
  }

  pub fn ids(&self) -> impl Iterator<Item = EntityId> + '_ {
    self.map.keys().copied()
  }

  /// Walk parent links from `id` up to the root, yielding each ancestor.
  pub fn ancestors(&self, id: EntityId) -> Vec<EntityId> {
    let mut out = Vec::new();
    let mut cursor = self.get(id).and_then(|e| e.parent);
    while let Some(parent) = cursor {
      if out.contains(&parent) {
        // Cycle; the graph invariant is broken, stop rather than spin.
        tracing::error!(entity = %id, "parent cycle detected");
        break;
      }
      out.push(parent);
      cursor = self.get(parent).and_then(|e| e.parent);
    }
    out
  }

  /// Whether `ancestor` is on `id`'s parent chain.
  pub fn is_ancestor_of(&self, ancestor: EntityId, id: EntityId) -> bool {
    self.ancestors(id).contains(&ancestor)
  }
}
