//! Containers: children visible to observers granted access, with nested
//! subscriptions that sever in cascade.
//!
//! Access is data-driven. `__container_access` on the container lists the
//! observers allowed in; `__containers_active` on an observer mirrors which
//! containers it currently holds an active subscription to. The core keeps
//! the two in lockstep: an observer appears in a container's access set
//! with reach to the container if and only if that container appears in
//! the observer's active set.

use glam::DVec3;

use crate::element::Element;
use crate::entity::Entities;
use crate::ops::OpVector;
use crate::property::PropFlags;
use crate::EntityId;

use super::physical::{appearance, disappearance};
use super::{can_reach, Domain, DomainKind, EntityLocation};

/// Property on a container: list of observer ids allowed to see and reach
/// its contents.
pub const CONTAINER_ACCESS: &str = "__container_access";
/// Property on an observer: list of containers it has active access to.
/// Maintained by the core, never settable by clients, never persisted.
pub const CONTAINERS_ACTIVE: &str = "__containers_active";

/// Whether `observer` holds an active subscription to `container`.
pub fn is_active(
  entities: &Entities,
  observer: EntityId,
  container: EntityId,
) -> bool {
  active_containers(entities, observer).contains(&container)
}

/// The observer's active container list.
pub fn active_containers(
  entities: &Entities,
  observer: EntityId,
) -> Vec<EntityId> {
  entities
    .get(observer)
    .and_then(|e| e.attr(CONTAINERS_ACTIVE))
    .and_then(Element::as_list)
    .map(|l| {
      l.iter()
        .filter_map(Element::as_int)
        .map(|i| EntityId(i as u64))
        .collect()
    })
    .unwrap_or_default()
}

fn write_active(
  entities: &mut Entities,
  observer: EntityId,
  containers: Vec<EntityId>,
) {
  if let Some(e) = entities.get_mut(observer) {
    let value = Element::List(
      containers.iter().map(|c| Element::Int(c.0 as i64)).collect(),
    );
    e.set_property(CONTAINERS_ACTIVE, value);
    if let Some(entry) = e.property_mut(CONTAINERS_ACTIVE) {
      entry.flags.insert(PropFlags::EPHEM);
    }
  }
}

/// Ids listed in a container's access property.
pub fn allowed_observers(
  entities: &Entities,
  container: EntityId,
) -> Vec<EntityId> {
  entities
    .get(container)
    .and_then(|e| e.attr(CONTAINER_ACCESS))
    .and_then(Element::as_list)
    .map(|l| {
      l.iter()
        .filter_map(Element::as_int)
        .map(|i| EntityId(i as u64))
        .collect()
    })
    .unwrap_or_default()
}

/// Every observer currently subscribed to `container`.
pub fn subscribers(entities: &Entities, container: EntityId) -> Vec<EntityId> {
  entities
    .iter()
    .filter(|(_, e)| {
      e.attr(CONTAINERS_ACTIVE)
        .and_then(Element::as_list)
        .map(|l| {
          l.iter()
            .filter_map(Element::as_int)
            .any(|i| i as u64 == container.0)
        })
        .unwrap_or(false)
    })
    .map(|(&id, _)| id)
    .collect()
}

/// Bring subscriptions in line with a freshly written access list: grant
/// access to newly listed observers that can reach the container, sever it
/// for delisted ones.
pub fn apply_access(
  entities: &mut Entities,
  container: EntityId,
  res: &mut OpVector,
) {
  let allowed = allowed_observers(entities, container);

  for observer in subscribers(entities, container) {
    if !allowed.contains(&observer) {
      sever(entities, observer, container, res);
    }
  }

  for observer in allowed {
    if is_active(entities, observer, container) {
      continue;
    }
    if !can_reach(entities, observer, &EntityLocation::of(container), 0.0) {
      continue;
    }
    let mut active = active_containers(entities, observer);
    active.push(container);
    write_active(entities, observer, active);

    let children = children_of(entities, container);
    if !children.is_empty() {
      res.push(appearance(container, observer, &children));
    }
  }
}

/// Revoke `observer`'s subscription to `container`, and in cascade every
/// active subscription on containers nested below it. Each severed
/// container contributes one Disappearance carrying its children.
pub fn sever(
  entities: &mut Entities,
  observer: EntityId,
  container: EntityId,
  res: &mut OpVector,
) {
  if !is_active(entities, observer, container) {
    return;
  }
  let mut active = active_containers(entities, observer);
  active.retain(|c| *c != container);
  write_active(entities, observer, active);

  let children = children_of(entities, container);
  if !children.is_empty() {
    res.push(disappearance(container, observer, &children));
  }

  for child in children {
    if is_active(entities, observer, child) {
      sever(entities, observer, child, res);
    }
  }
}

/// Re-check subscriptions after `moved` changed position or parent.
///
/// A re-parented container loses all its subscribers; a moved observer
/// loses the subscriptions it can no longer reach. Severing an ancestor
/// takes its descendants with it.
pub fn on_entity_moved(
  entities: &mut Entities,
  moved: EntityId,
  reparented: bool,
  res: &mut OpVector,
) {
  if reparented {
    for observer in subscribers(entities, moved) {
      sever(entities, observer, moved, res);
    }
  }
  for container in active_containers(entities, moved) {
    if !is_active(entities, moved, container) {
      // Already gone in a cascade from an earlier iteration.
      continue;
    }
    if !can_reach(entities, moved, &EntityLocation::of(container), 0.0) {
      sever(entities, moved, container, res);
    }
  }
}

/// Drop every subscription touching a despawning entity, both as container
/// and as observer.
pub fn on_entity_destroyed(
  entities: &mut Entities,
  destroyed: EntityId,
  res: &mut OpVector,
) {
  for observer in subscribers(entities, destroyed) {
    sever(entities, observer, destroyed, res);
  }
  for container in active_containers(entities, destroyed) {
    // The leaver gets no farewell traffic.
    let mut sink = OpVector::new();
    sever(entities, destroyed, container, &mut sink);
  }
}

fn children_of(entities: &Entities, container: EntityId) -> Vec<EntityId> {
  entities
    .get(container)
    .map(|e| e.children.iter().copied().collect())
    .unwrap_or_default()
}

/// The domain object itself is thin; the subscription state lives in
/// properties so it survives serialization of the entities that carry it.
pub struct ContainerDomain {
  owner: EntityId,
}

impl ContainerDomain {
  pub fn new(owner: EntityId) -> Self {
    Self { owner }
  }
}

impl Domain for ContainerDomain {
  fn kind(&self) -> DomainKind {
    DomainKind::Container
  }

  fn is_visible_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    _target: EntityId,
  ) -> bool {
    is_active(entities, observer, self.owner)
  }

  fn can_reach(
    &self,
    entities: &Entities,
    observer: EntityId,
    _target: &EntityLocation,
    _extra_radius: f64,
  ) -> bool {
    is_active(entities, observer, self.owner)
      && can_reach(entities, observer, &EntityLocation::of(self.owner), 0.0)
  }

  fn add_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  ) {
    for observer in subscribers(entities, self.owner) {
      res.push(appearance(self.owner, observer, &[entity]));
    }
  }

  fn remove_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  ) {
    for observer in subscribers(entities, self.owner) {
      res.push(disappearance(self.owner, observer, &[entity]));
    }
  }

  fn process_visibility_for_moved_entity(
    &mut self,
    _entities: &Entities,
    _entity: EntityId,
    _old_pos: DVec3,
    _res: &mut OpVector,
  ) {
    // Movement inside a container doesn't change who sees what.
  }

  fn tick(&mut self, _entities: &Entities, _now: u64, _res: &mut OpVector) {}

  fn get_visible_entities_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    out: &mut Vec<EntityId>,
  ) {
    if is_active(entities, observer, self.owner) {
      out.extend(children_of(entities, self.owner));
    }
  }
}
