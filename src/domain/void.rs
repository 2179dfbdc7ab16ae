//! The void: children exist but nothing perceives or reaches them.

use glam::DVec3;

use crate::entity::Entities;
use crate::ops::OpVector;
use crate::EntityId;

use super::{Domain, DomainKind, EntityLocation};

pub struct VoidDomain {
  owner: EntityId,
}

impl VoidDomain {
  pub fn new(owner: EntityId) -> Self {
    Self { owner }
  }

  pub fn owner(&self) -> EntityId {
    self.owner
  }
}

impl Domain for VoidDomain {
  fn kind(&self) -> DomainKind {
    DomainKind::Void
  }

  fn is_visible_for(
    &self,
    _entities: &Entities,
    _observer: EntityId,
    _target: EntityId,
  ) -> bool {
    false
  }

  fn can_reach(
    &self,
    _entities: &Entities,
    _observer: EntityId,
    _target: &EntityLocation,
    _extra_radius: f64,
  ) -> bool {
    false
  }

  fn add_entity(
    &mut self,
    _entities: &Entities,
    _entity: EntityId,
    _res: &mut OpVector,
  ) {
  }

  fn remove_entity(
    &mut self,
    _entities: &Entities,
    _entity: EntityId,
    _res: &mut OpVector,
  ) {
  }

  fn process_visibility_for_moved_entity(
    &mut self,
    _entities: &Entities,
    _entity: EntityId,
    _old_pos: DVec3,
    _res: &mut OpVector,
  ) {
  }

  fn tick(&mut self, _entities: &Entities, _now: u64, _res: &mut OpVector) {}

  fn get_visible_entities_for(
    &self,
    _entities: &Entities,
    _observer: EntityId,
    _out: &mut Vec<EntityId>,
  ) {
  }
}
