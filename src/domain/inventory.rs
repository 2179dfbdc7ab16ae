//! Inventories: contents visible only to the owning entity.

use glam::DVec3;

use crate::entity::Entities;
use crate::ops::OpVector;
use crate::EntityId;

use super::physical::{appearance, disappearance};
use super::{Domain, DomainKind, EntityLocation};

pub struct InventoryDomain {
  owner: EntityId,
}

impl InventoryDomain {
  pub fn new(owner: EntityId) -> Self {
    Self { owner }
  }

  fn owner_perceptive(&self, entities: &Entities) -> bool {
    entities
      .get(self.owner)
      .map(|e| e.is_perceptive())
      .unwrap_or(false)
  }
}

impl Domain for InventoryDomain {
  fn kind(&self) -> DomainKind {
    DomainKind::Inventory
  }

  fn is_visible_for(
    &self,
    _entities: &Entities,
    observer: EntityId,
    _target: EntityId,
  ) -> bool {
    observer == self.owner
  }

  fn can_reach(
    &self,
    _entities: &Entities,
    observer: EntityId,
    _target: &EntityLocation,
    _extra_radius: f64,
  ) -> bool {
    // Whatever you carry is at hand.
    observer == self.owner
  }

  fn add_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  ) {
    if self.owner_perceptive(entities) {
      res.push(appearance(self.owner, self.owner, &[entity]));
    }
  }

  fn remove_entity(
    &mut self,
    entities: &Entities,
    entity: EntityId,
    res: &mut OpVector,
  ) {
    if self.owner_perceptive(entities) {
      res.push(disappearance(self.owner, self.owner, &[entity]));
    }
  }

  fn process_visibility_for_moved_entity(
    &mut self,
    _entities: &Entities,
    _entity: EntityId,
    _old_pos: DVec3,
    _res: &mut OpVector,
  ) {
    // Shuffling carried items never affects external visibility.
  }

  fn tick(&mut self, _entities: &Entities, _now: u64, _res: &mut OpVector) {}

  fn get_visible_entities_for(
    &self,
    entities: &Entities,
    observer: EntityId,
    out: &mut Vec<EntityId>,
  ) {
    if observer == self.owner {
      if let Some(owner) = entities.get(self.owner) {
        out.extend(owner.children.iter().copied());
      }
    }
  }
}
