//! Default per-class operation handlers: what an entity does with an op
//! when no explicit router claimed it.

use crate::domain::container;
use crate::element::Element;
use crate::entity::EntityFlags;
use crate::geometry::{element_to_quat, element_to_vec3};
use crate::minds;
use crate::ops::{self, EntityRef, OpClass, OpVector, Operation};
use crate::property::PropFlags;
use crate::router::{OpError, RouterResult};
use crate::world::WorldSignal;
use crate::EntityId;

use super::World;

impl World {
  /// The handler table: class to behavior, domain-aware base as the
  /// fallback.
  pub(crate) fn handle_default(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    match op.class {
      OpClass::Move => self.handle_move(to, op, res),
      OpClass::Set => self.handle_set(to, op, res),
      OpClass::Create => self.handle_create(to, op, res),
      OpClass::Delete => self.handle_delete(to, op, res),
      OpClass::Look => self.handle_look(to, op, res),
      OpClass::Talk => self.handle_talk(to, op, res),
      OpClass::Get => self.handle_get(to, op, res),
      OpClass::Logout => self.handle_logout(to, op, res),
      OpClass::Thought => {
        Ok(minds::thought_operation(self, to, op, res))
      }
      OpClass::Relay => Ok(minds::relay_operation(self, to, op, res)),
      _ => {
        // Perception and everything else lands with the entity's minds.
        minds::deliver_to_minds(self, to, op, res);
        Ok(RouterResult::Handled)
      }
    }
  }

  /// A Move addressed to the entity performing it: the parent of the thing
  /// that moves. Applies the spatial change, hands the domain the movement
  /// and re-parents across domains when the arg names a new location.
  fn handle_move(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    let Some(arg) = op.first_entity_arg().cloned() else {
      tracing::error!(entity = %to, "move op has no entity argument");
      return Ok(RouterResult::Handled);
    };
    let Some(moved_id) = arg.id else {
      tracing::error!(entity = %to, "move arg has no id");
      return Ok(RouterResult::Handled);
    };
    let Some(moved) = self.entities().get(moved_id) else {
      if let Some(from) = op.from {
        res.push(ops::unseen(moved_id, from));
      }
      return Ok(RouterResult::Handled);
    };
    if moved.parent != Some(to) {
      return Err(OpError::InvalidOperation(format!(
        "move routed to {to}, which is not the parent of {moved_id}"
      )));
    }
    let old_pos = moved.location.pos;
    let new_parent = arg.loc().unwrap_or(to);
    if new_parent != to && !self.entities().contains(new_parent) {
      if let Some(from) = op.from {
        res.push(ops::unseen(new_parent, from));
      }
      return Ok(RouterResult::Handled);
    }

    if let Some(moved) = self.entities_mut().get_mut(moved_id) {
      if let Some(pos) = arg.get("pos").and_then(element_to_vec3) {
        moved.location.pos = pos;
        moved.flags.remove(EntityFlags::POS_CLEAN);
      }
      if let Some(q) = arg.get("orientation").and_then(element_to_quat) {
        moved.location.orientation = q;
        moved.flags.remove(EntityFlags::ORIENT_CLEAN);
      }
      if let Some(v) = arg.get("velocity").and_then(element_to_vec3) {
        moved.location.velocity = v;
      }
      moved.touch();
    }

    // Whoever currently sees the mover learns about the movement.
    if let Some(domain) = self.domains.get_mut(&to) {
      domain.process_visibility_for_moved_entity(
        &self.entities,
        moved_id,
        old_pos,
        res,
      );
    }

    if new_parent == to {
      container::on_entity_moved(&mut self.entities, moved_id, false, res);
    } else {
      // Across domains: leave the old one, enter the new, atomically from
      // the simulation's point of view.
      if let Some(domain) = self.domains.get_mut(&to) {
        domain.remove_entity(&self.entities, moved_id, res);
      }
      if let Some(old) = self.entities.get_mut(to) {
        old.children.shift_remove(&moved_id);
      }
      if let Some(new) = self.entities.get_mut(new_parent) {
        new.children.insert(moved_id);
      }
      if let Some(moved) = self.entities.get_mut(moved_id) {
        moved.parent = Some(new_parent);
      }
      if let Some(domain) = self.domains.get_mut(&new_parent) {
        domain.add_entity(&self.entities, moved_id, res);
      }
      self.signal(WorldSignal::Containered(moved_id));
      container::on_entity_moved(&mut self.entities, moved_id, true, res);
    }

    self.signal(WorldSignal::Updated(moved_id));
    Ok(RouterResult::Handled)
  }

  /// Apply attribute writes, then let observers see the change.
  fn handle_set(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    let Some(arg) = op.first_entity_arg().cloned() else {
      tracing::error!(entity = %to, "set op has no entity argument");
      return Ok(RouterResult::Handled);
    };
    let mut changed = false;
    for (name, value) in &arg.attrs {
      match name.as_str() {
        "id" => {}
        container::CONTAINERS_ACTIVE | "minds" => {
          tracing::warn!(entity = %to, property = name.as_str(),
            "attempt to set a core-maintained property, dropping");
        }
        _ => {
          changed |= self.set_property(to, name, value.clone(), res);
        }
      }
    }

    if changed {
      let sight_arg = arg.clone();
      let inner = Operation::new(OpClass::Set)
        .from(to)
        .to(to)
        .entity_arg(sight_arg);
      for observer in self.observers_of(to) {
        res.push(
          Operation::new(OpClass::Sight)
            .from(to)
            .to(observer)
            .op_arg(inner.clone()),
        );
      }
    }
    Ok(RouterResult::Handled)
  }

  /// Materialize a new entity. Ops naming a type that is not loaded yet
  /// are parked until the type resolves.
  fn handle_create(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    let Some(arg) = op.first_entity_arg().cloned() else {
      tracing::error!(entity = %to, "create op has no entity argument");
      return Ok(RouterResult::Handled);
    };
    let Some(type_name) =
      arg.get("parent").and_then(Element::as_str).map(str::to_owned)
    else {
      tracing::error!(entity = %to, "create arg names no type");
      return Ok(RouterResult::Handled);
    };
    if !self.types().contains(&type_name) {
      self.parked.park(&type_name, op.clone());
      return Ok(RouterResult::WillRedispatch);
    }

    let parent = arg
      .loc()
      .or_else(|| self.entities().get(to).and_then(|e| e.parent))
      .unwrap_or(EntityId::ROOT);

    let mut builder = self.spawn(&type_name).parent(parent);
    for (name, value) in &arg.attrs {
      if name == "parent" || name == "loc" {
        continue;
      }
      builder = builder.attr(name, value.clone());
    }
    let created = builder.build()?;

    // Everyone watching the newcomer sees the creation itself too.
    let created_ref = self.entity_as_ref(created);
    let inner = Operation::new(OpClass::Create)
      .from(to)
      .to(created)
      .entity_arg(created_ref);
    for observer in self.observers_of(created) {
      res.push(
        Operation::new(OpClass::Sight)
          .from(created)
          .to(observer)
          .op_arg(inner.clone()),
      );
    }
    Ok(RouterResult::Handled)
  }

  /// Destruction: children go to the root, observers get a Sight of the
  /// delete and a Disappearance, then the flag is terminal.
  fn handle_delete(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    if to == EntityId::ROOT {
      return Err(OpError::Fatal(
        "delete addressed to the world root".to_owned(),
      ));
    }
    let Some(entity) = self.entities().get(to) else {
      return Ok(RouterResult::Handled);
    };
    let parent = entity.parent;
    let children: Vec<EntityId> = entity.children.iter().copied().collect();

    // Observers see the delete before the entity winks out.
    let inner = Operation::new(OpClass::Delete)
      .from(op.from.unwrap_or(to))
      .to(to)
      .entity_arg(EntityRef::with_id(to));
    for observer in self.observers_of(to) {
      if observer == to {
        continue;
      }
      res.push(
        Operation::new(OpClass::Sight)
          .from(to)
          .to(observer)
          .op_arg(inner.clone()),
      );
    }

    // A parent is never deleted out from under live children; they are
    // re-homed at the root first.
    for child in children {
      if let Some(domain) = self.domains.get_mut(&to) {
        domain.remove_entity(&self.entities, child, res);
      }
      if let Some(c) = self.entities.get_mut(child) {
        c.parent = Some(EntityId::ROOT);
      }
      if let Some(root) = self.entities.get_mut(EntityId::ROOT) {
        root.children.insert(child);
      }
      self.signal(WorldSignal::Containered(child));
      container::on_entity_moved(&mut self.entities, child, true, res);
    }
    if let Some(e) = self.entities.get_mut(to) {
      e.children.clear();
    }

    self.signal(WorldSignal::BeingDeleted(to));
    container::on_entity_destroyed(&mut self.entities, to, res);

    if let Some(parent) = parent {
      if let Some(domain) = self.domains.get_mut(&parent) {
        domain.remove_entity(&self.entities, to, res);
      }
      if let Some(p) = self.entities.get_mut(parent) {
        p.children.shift_remove(&to);
      }
    }
    if let Some(e) = self.entities.get_mut(to) {
      e.flags.insert(EntityFlags::DESTROYED);
      e.touch();
    }
    self.signal(WorldSignal::Updated(to));
    Ok(RouterResult::Handled)
  }

  /// Show the looker what it is allowed to see.
  fn handle_look(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    let Some(looker) = op.from else {
      tracing::warn!(entity = %to, "look with no from");
      return Ok(RouterResult::Handled);
    };
    if self.is_visible_to(looker, to) {
      let seen = self.entity_as_ref(to);
      let mut sight =
        Operation::new(OpClass::Sight).from(to).to(looker).entity_arg(seen);
      sight.refno = op.serialno;
      res.push(sight);
    } else {
      res.push(ops::unseen(to, looker));
    }
    Ok(RouterResult::Handled)
  }

  /// Speech becomes Sound for everyone perceiving the speaker.
  fn handle_talk(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    let mut inner = op.clone();
    inner.to = Some(to);
    for observer in self.observers_of(to) {
      res.push(
        Operation::new(OpClass::Sound)
          .from(to)
          .to(observer)
          .op_arg(inner.clone()),
      );
    }
    Ok(RouterResult::Handled)
  }

  /// An Info reply with the entity's state. Never forwarded to minds.
  fn handle_get(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    let Some(asker) = op.from else {
      return Ok(RouterResult::Handled);
    };
    let seen = self.entity_as_ref(to);
    let mut info =
      Operation::new(OpClass::Info).from(to).to(asker).entity_arg(seen);
    info.refno = op.serialno;
    res.push(info);
    Ok(RouterResult::Handled)
  }

  /// Terminal Logout: notify the minds, then detach them all.
  fn handle_logout(
    &mut self,
    to: EntityId,
    op: &Operation,
    res: &mut OpVector,
  ) -> Result<RouterResult, OpError> {
    minds::deliver_to_minds(self, to, op, res);
    let mind_ids = self
      .entities()
      .get(to)
      .map(|e| e.minds.clone())
      .unwrap_or_default();
    for mind in mind_ids {
      minds::detach_mind(self, to, mind, res);
      self.minds.unregister(mind);
    }
    Ok(RouterResult::Handled)
  }

  /// The wire form of an entity: id plus the attribute subset the protocol
  /// sends in entity references.
  pub fn entity_as_ref(&self, id: EntityId) -> EntityRef {
    let mut out = EntityRef::with_id(id);
    let Some(entity) = self.entities().get(id) else {
      return out;
    };
    out
      .attrs
      .insert("parent".to_owned(), Element::from(entity.type_name.as_str()));
    if let Some(parent) = entity.parent {
      out
        .attrs
        .insert("loc".to_owned(), Element::Int(parent.0 as i64));
    }
    if let Element::Map(map) = entity.location.to_element() {
      out.attrs.extend(map);
    }
    for (name, entry) in entity.properties() {
      if entry.flags.contains(PropFlags::EPHEM) {
        continue;
      }
      out.attrs.insert(name.to_string(), entry.value().clone());
    }
    out
  }
}
