//! Euclidean 3D space with distance-derived visibility.

use glam::DVec3;
use indexmap::{IndexMap, IndexSet};

use crate::entity::Entities;
use crate::geometry::vec3_to_element;
use crate::ops::{EntityRef, OpClass, OpVector, Operation};
use crate::EntityId;

use super::{
  position_relative_to, sight_gate, Domain, DomainKind, EntityLocation,
};

/// How far away an entity can be seen, per unit of bounding radius.
const VISIBILITY_SCALING_FACTOR: f64 = 100.0;

/// How far an entity can be seen from, in domain space.
pub fn visibility_radius(entities: &Entities, target: EntityId) -> f64 {
  let Some(t) = entities.get(target) else {
    return 0.0;
  };
  if let Some(explicit) = t.attr_float("visibility_distance") {
    return explicit;
  }
  t.location.bounding_radius() * VISIBILITY_SCALING_FACTOR
}

/// The distance rule plus the sight gate, for a target directly inside
/// `owner`'s domain.
pub fn sees(
  entities: &Entities,
  owner: EntityId,
  observer: EntityId,
  target: EntityId,
) -> bool {
  if observer == target {
    return true;
  }
  if !sight_gate(entities, observer, target) {
    return false;
  }
  // Being inside the domain entity is enough to perceive it.
  if target == owner {
    return position_relative_to(entities, observer, owner).is_some();
  }
  let Some(obs_pos) = position_relative_to(entities, observer, owner) else {
    return false;
  };
  let Some(t) = entities.get(target) else {
    return false;
  };
  let distance = (t.location.pos - obs_pos).length();
  distance <= visibility_radius(entities, target)
}

/// The reach rule for a point inside `owner`'s domain.
pub fn reaches(
  entities: &Entities,
  owner: EntityId,
  observer: EntityId,
  target_pos: DVec3,
  extra_radius: f64,
) -> bool {
  let Some(obs_pos) = position_relative_to(entities, observer, owner) else {
    return false;
  };
  let reach = entities
    .get(observer)
    .and_then(|o| o.attr_float("reach"))
    .unwrap_or(0.0);
  (target_pos - obs_pos).length() <= reach + extra_radius
}

/// A physical domain: tracks which perceptive children currently see what,
/// so visibility changes turn into Appearance/Disappearance traffic.
pub struct PhysicalDomain {
  owner: EntityId,
  children: IndexSet<EntityId>,
  /// Observer id to the set of entities it currently perceives.
  observers: IndexMap<EntityId, IndexSet<EntityId>>,
}

impl PhysicalDomain {
  pub fn new(owner: EntityId) -> Self {
    Self {
      owner,
      children: IndexSet::new(),
      observers: IndexMap::new(),
    }
  }

  /// The owner plus children, the candidates an observer might see, in
  /// deterministic order.
  fn candidates(&self) -> impl Iterator<Item = EntityId> + '_ {
    std::iter::once(self.owner).chain(self.children.iter().copied())
  }

  fn compute_visible_set(
    &self,
    entities: &Entities,
    observer: EntityId,
  ) -> IndexSet<EntityId> {
    self
      .candidates()
      .filter(|&c| sees(entities, self.owner, observer, c))
      .collect()
  }
}

impl Domain for PhysicalDomain {
  fn kind(&self) -> DomainKind {
    DomainKind::Physical
  }

  fn is_visible_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    target: EntityId,
  ) -> bool {
    sees(entities, self.owner, observer, target)
  }

  fn can_reach(
    &self,
    entities: &Entities,
    observer: EntityId,
    target: &EntityLocation,
    extra_radius: f64,
  ) -> bool {
    let pos = target
      .pos
      .or_else(|| entities.get(target.entity).map(|t| t.location.pos));
    match pos {
      Some(pos) => {
        reaches(entities, self.owner, observer, pos, extra_radius)
      }
      None => false,
    }
  }

  fn add_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  ) {
    self.children.insert(entity);

    for (&observer, seen) in self.observers.iter_mut() {
      if observer != entity && sees(entities, self.owner, observer, entity) {
        seen.insert(entity);
        res.push(appearance(self.owner, observer, &[entity]));
      }
    }

    let perceptive = entities
      .get(entity)
      .map(|e| e.is_perceptive())
      .unwrap_or(false);
    if perceptive {
      let seen = self.compute_visible_set(entities, entity);
      for &visible in &seen {
        res.push(appearance(self.owner, entity, &[visible]));
      }
      self.observers.insert(entity, seen);
    }
  }

  fn remove_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  ) {
    let _ = entities;
    self.children.shift_remove(&entity);
    self.observers.shift_remove(&entity);
    for (&observer, seen) in self.observers.iter_mut() {
      if seen.shift_remove(&entity) {
        res.push(disappearance(self.owner, observer, &[entity]));
      }
    }
  }

  fn process_visibility_for_moved_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    _old_pos: DVec3,
    res: &mut OpVector,
  ) {
    // Observers that currently see the mover get a Sight of the movement;
    // set differences wait for the next tick.
    let Some(moved) = entities.get(entity) else {
      return;
    };
    let arg = EntityRef::with_id(entity)
      .attr("pos", vec3_to_element(moved.location.pos))
      .attr(
        "orientation",
        crate::geometry::quat_to_element(moved.location.orientation),
      );
    let set =
      Operation::new(OpClass::Set).from(entity).to(entity).entity_arg(arg);
    for (&observer, seen) in self.observers.iter() {
      if seen.contains(&entity) {
        res.push(
          Operation::new(OpClass::Sight)
            .from(entity)
            .to(observer)
            .op_arg(set.clone()),
        );
      }
    }
  }

  fn tick(&mut self, entities: &Entities, _now: u64, res: &mut OpVector) {
    // Adopt children that became perceptive since insertion, and drop
    // observers that left or lost perception.
    for &child in &self.children {
      let perceptive = entities
        .get(child)
        .map(|e| e.is_perceptive())
        .unwrap_or(false);
      if perceptive && !self.observers.contains_key(&child) {
        self.observers.insert(child, IndexSet::new());
      } else if !perceptive {
        self.observers.shift_remove(&child);
      }
    }
    self.observers.retain(|id, _| {
      *id == self.owner || entities.get(*id).is_some()
    });

    let ids: Vec<EntityId> = self.observers.keys().copied().collect();
    for observer in ids {
      let fresh = self.compute_visible_set(entities, observer);
      let old = &self.observers[&observer];

      let appeared: Vec<EntityId> =
        fresh.iter().copied().filter(|e| !old.contains(e)).collect();
      let disappeared: Vec<EntityId> =
        old.iter().copied().filter(|e| !fresh.contains(e)).collect();

      if !appeared.is_empty() {
        res.push(appearance(self.owner, observer, &appeared));
      }
      if !disappeared.is_empty() {
        res.push(disappearance(self.owner, observer, &disappeared));
      }
      self.observers.insert(observer, fresh);
    }
  }

  fn get_visible_entities_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    out: &mut Vec<EntityId>,
  ) {
    match self.observers.get(&observer) {
      Some(seen) => out.extend(seen.iter().copied()),
      None => out.extend(self.compute_visible_set(entities, observer)),
    }
  }
}

/// One Appearance to `observer`, carrying all the entities that appeared.
pub(crate) fn appearance(
  from: EntityId,
  observer: EntityId,
  entities: &[EntityId],
) -> Operation {
  let mut op = Operation::new(OpClass::Appearance).from(from).to(observer);
  for &e in entities {
    op = op.entity_arg(EntityRef::with_id(e));
  }
  op
}

/// One Disappearance to `observer`, carrying everything that vanished.
pub(crate) fn disappearance(
  from: EntityId,
  observer: EntityId,
  entities: &[EntityId],
) -> Operation {
  let mut op =
    Operation::new(OpClass::Disappearance).from(from).to(observer);
  for &e in entities {
    op = op.entity_arg(EntityRef::with_id(e));
  }
  op
}
