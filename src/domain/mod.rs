//! Spatial models attached to entities.
//!
//! A domain governs visibility and reach among the children of the entity
//! it is attached to. The recursive queries live here as free functions
//! over the registry; the [`Domain`] objects carry per-domain state and
//! emit Appearance/Disappearance traffic.

pub mod container;
pub mod inventory;
pub mod physical;
pub mod void;

use glam::DVec3;

use crate::entity::Entities;
use crate::ops::OpVector;
use crate::EntityId;

pub use container::ContainerDomain;
pub use inventory::InventoryDomain;
pub use physical::PhysicalDomain;
pub use void::VoidDomain;

/// The spatial models the core ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
  /// Euclidean 3D space with distance-derived visibility.
  Physical,
  /// Children visible only to the owning entity.
  Inventory,
  /// Children visible to observers granted `__container_access`.
  Container,
  /// Children hidden from everyone.
  Void,
}

impl DomainKind {
  pub fn parse(name: &str) -> Option<DomainKind> {
    Some(match name {
      "physical" => DomainKind::Physical,
      "inventory" => DomainKind::Inventory,
      "container" => DomainKind::Container,
      "void" => DomainKind::Void,
      _ => return None,
    })
  }

  pub fn name(self) -> &'static str {
    match self {
      DomainKind::Physical => "physical",
      DomainKind::Inventory => "inventory",
      DomainKind::Container => "container",
      DomainKind::Void => "void",
    }
  }

  /// Instantiate the domain object for an owner entity.
  pub fn instantiate(self, owner: EntityId) -> Box<dyn Domain> {
    match self {
      DomainKind::Physical => Box::new(PhysicalDomain::new(owner)),
      DomainKind::Inventory => Box::new(InventoryDomain::new(owner)),
      DomainKind::Container => Box::new(ContainerDomain::new(owner)),
      DomainKind::Void => Box::new(VoidDomain::new(owner)),
    }
  }
}

/// A place an interaction is aimed at: an entity, optionally with an
/// explicit point (e.g. the destination of a move).
#[derive(Debug, Clone, Copy)]
pub struct EntityLocation {
  pub entity: EntityId,
  pub pos: Option<DVec3>,
}

impl EntityLocation {
  pub fn of(entity: EntityId) -> Self {
    Self { entity, pos: None }
  }

  pub fn at(entity: EntityId, pos: DVec3) -> Self {
    Self {
      entity,
      pos: Some(pos),
    }
  }
}

/// The contract every spatial model implements.
pub trait Domain {
  fn kind(&self) -> DomainKind;

  /// Whether `observer` perceives `target`, where `target` is a direct
  /// child of this domain's owner.
  fn is_visible_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    target: EntityId,
  ) -> bool;

  /// Whether `observer` can interact with `target`, a direct child of this
  /// domain's owner. `extra_radius` extends the reach, typically by the
  /// target's bounding sphere.
  fn can_reach(
    &self,
    entities: &Entities,
    observer: EntityId,
    target: &EntityLocation,
    extra_radius: f64,
  ) -> bool;

  /// A child just entered.
  fn add_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  );

  /// A child just left.
  fn remove_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  );

  /// A child moved within the domain; `old_pos` is where it was.
  fn process_visibility_for_moved_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    old_pos: DVec3,
    res: &mut OpVector,
  );

  /// Periodic re-evaluation; emits Appearance/Disappearance for visibility
  /// changes that happened without movement events.
  fn tick(&mut self, entities: &Entities, now: u64, res: &mut OpVector);

  /// Everything `observer` currently perceives in this domain.
  fn get_visible_entities_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    out: &mut Vec<EntityId>,
  );
}

/// The `visibility`/`admin` gate, applied on top of every domain rule:
/// private entities are perceived only by admin observers, protected ones
/// also by themselves.
pub fn sight_gate(
  entities: &Entities,
  observer: EntityId,
  target: EntityId,
) -> bool {
  let Some(t) = entities.get(target) else {
    return false;
  };
  let admin = |id: EntityId| {
    entities
      .get(id)
      .and_then(|e| e.attr_float("admin"))
      .map(|v| v != 0.0)
      .unwrap_or(false)
  };
  match t.attr_str("visibility") {
    Some("private") => admin(observer),
    Some("protected") => observer == target || admin(observer),
    _ => true,
  }
}

/// Position of `observer` expressed in `domain_owner`'s space: the position
/// of whichever of its ancestors (or itself) is a direct child of the
/// owner. `None` when the observer is not inside the owner at all.
pub fn position_relative_to(
  entities: &Entities,
  observer: EntityId,
  domain_owner: EntityId,
) -> Option<DVec3> {
  if observer == domain_owner {
    return Some(DVec3::ZERO);
  }
  let mut node = observer;
  loop {
    let entity = entities.get(node)?;
    let parent = entity.parent?;
    if parent == domain_owner {
      return Some(entity.location.pos);
    }
    node = parent;
  }
}

/// Whether `observer` perceives `target`, walking every domain on the path
/// from the target up through its ancestors.
pub fn is_visible_to(
  entities: &Entities,
  observer: EntityId,
  target: EntityId,
) -> bool {
  if observer == target {
    return true;
  }
  if !sight_gate(entities, observer, target) {
    return false;
  }
  let Some(t) = entities.get(target) else {
    return false;
  };
  let Some(parent) = t.parent else {
    // The root is perceivable by everything inside it.
    return true;
  };
  let visible_here = match entities.get(parent).and_then(|p| p.domain) {
    // A plain entity doesn't obstruct sight of its contents.
    None => true,
    Some(DomainKind::Physical) => {
      physical::sees(entities, parent, observer, target)
    }
    Some(DomainKind::Inventory) => observer == parent,
    Some(DomainKind::Container) => {
      container::is_active(entities, observer, parent)
    }
    Some(DomainKind::Void) => false,
  };
  visible_here && is_visible_to(entities, observer, parent)
}

/// Whether `observer` can interact with a location, walking the domain
/// chain the same way as [`is_visible_to`].
///
/// The two shapes of [`EntityLocation`] mean different things: with no
/// point, the question is whether the observer reaches the entity itself,
/// which its *parent's* domain decides; with a point, the question is
/// whether the observer reaches that spot *inside* the entity, which the
/// entity's own domain decides.
pub fn can_reach(
  entities: &Entities,
  observer: EntityId,
  target: &EntityLocation,
  extra_radius: f64,
) -> bool {
  if let Some(pos) = target.pos {
    let host = target.entity;
    return match entities.get(host).and_then(|h| h.domain) {
      None => can_reach(entities, observer, &EntityLocation::of(host), 0.0),
      Some(DomainKind::Physical) => {
        physical::reaches(entities, host, observer, pos, extra_radius)
      }
      Some(DomainKind::Inventory) => observer == host,
      Some(DomainKind::Container) => {
        container::is_active(entities, observer, host)
          && can_reach(entities, observer, &EntityLocation::of(host), 0.0)
      }
      Some(DomainKind::Void) => false,
    };
  }

  if observer == target.entity {
    return true;
  }
  let Some(t) = entities.get(target.entity) else {
    return false;
  };
  let Some(parent) = t.parent else {
    return false;
  };
  match entities.get(parent).and_then(|p| p.domain) {
    None => can_reach(entities, observer, &EntityLocation::of(parent), 0.0),
    Some(DomainKind::Physical) => physical::reaches(
      entities,
      parent,
      observer,
      t.location.pos,
      extra_radius,
    ),
    Some(DomainKind::Inventory) => observer == parent,
    Some(DomainKind::Container) => {
      container::is_active(entities, observer, parent)
        && can_reach(entities, observer, &EntityLocation::of(parent), 0.0)
    }
    Some(DomainKind::Void) => false,
  }
}
