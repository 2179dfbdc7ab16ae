//! Minds: external controllers of entities, and the filter that turns
//! their intent into world operations.
//!
//! Everything a client (or AI) wants its body to do arrives as a Thought
//! wrapping an inner op. The filter validates, sanitizes and retargets the
//! inner op before it is allowed to exist `from` the body. In the other
//! direction, ops delivered to a minded entity are forwarded out, minus
//! the classes that would leak information.

use ahash::AHashMap;
use glam::DVec3;

use crate::domain::EntityLocation;
use crate::filter::{FilterSpec, QueryContext};
use crate::geometry::{element_to_vec3, vec3_to_element};
use crate::ops::{self, EntityRef, OpArg, OpClass, OpVector, Operation};
use crate::router::RouterResult;
use crate::world::World;
use crate::{EntityId, MindId};

/// An external controller. Client links and in-process AIs both implement
/// this; responses pushed into `res` are wrapped as Thoughts to the body.
pub trait Mind {
  fn operation(&mut self, op: &Operation, res: &mut OpVector);
}

/// Owns every connected mind and mints their ids.
#[derive(Default)]
pub struct MindRegistry {
  minds: AHashMap<MindId, Box<dyn Mind>>,
  next: u64,
}

impl MindRegistry {
  pub fn register(&mut self, mind: Box<dyn Mind>) -> MindId {
    self.next += 1;
    let id = MindId(self.next);
    self.minds.insert(id, mind);
    id
  }

  pub fn unregister(&mut self, id: MindId) -> Option<Box<dyn Mind>> {
    self.minds.remove(&id)
  }

  pub fn get_mut(&mut self, id: MindId) -> Option<&mut (dyn Mind + '_)> {
    match self.minds.get_mut(&id) {
      Some(m) => Some(m.as_mut()),
      None => None,
    }
  }

  pub fn contains(&self, id: MindId) -> bool {
    self.minds.contains_key(&id)
  }
}

/// Ops that are allowed through to minds. Relay and Get stay inside the
/// simulation; forwarding them would leak addressing and queried state.
pub fn world_to_mind(op: &Operation) -> bool {
  !matches!(op.class, OpClass::Relay | OpClass::Get)
}

/// Forward `op` to every mind of `body`, wrapping any synchronous
/// responses as Thoughts addressed back to the body.
pub fn deliver_to_minds(
  world: &mut World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  if !world_to_mind(op) {
    return;
  }
  let mind_ids = match world.entities().get(body) {
    Some(e) => e.minds.clone(),
    None => return,
  };
  for mind_id in mind_ids {
    let mut mres = OpVector::new();
    if let Some(mind) = world.minds.get_mut(mind_id) {
      mind.operation(op, &mut mres);
    }
    for inner in mres {
      res.push(
        Operation::new(OpClass::Thought).to(body).op_arg(inner),
      );
    }
  }
}

/// A Thought arrived at the body: filter each inner op through mind2body.
pub fn thought_operation(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) -> RouterResult {
  for arg in &op.args {
    let Some(inner) = arg.as_op() else {
      continue;
    };
    let mut mres = OpVector::new();
    mind_to_body(world, body, inner, &mut mres);

    // If the thought carried a serial, its first consequence is
    // effectively the same operation.
    if let Some(serial) = op.serialno {
      if let Some(first) = mres.first_mut() {
        if first.serialno.is_none() {
          first.serialno = Some(serial);
        }
      }
    }

    for mut out in mres {
      out.from = Some(body);
      res.push(out);
    }
  }
  RouterResult::Blocked
}

/// A Relay arrived: hand the inner op to the specifically addressed mind.
pub fn relay_operation(
  world: &mut World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) -> RouterResult {
  let describe = || {
    world
      .entities()
      .get(body)
      .map(|e| e.describe())
      .unwrap_or_else(|| format!("entity {body}"))
  };
  if op.to.is_none() {
    res.push(ops::client_error(op, "A relay op must have a 'to'.", body));
    return RouterResult::Blocked;
  }
  if op.from.is_none() {
    res.push(ops::client_error(op, "A relay op must have a 'from'.", body));
    return RouterResult::Blocked;
  }
  let Some(mind_id) = op.id else {
    res.push(ops::client_error(op, "A relay op must have an 'id'.", body));
    return RouterResult::Blocked;
  };

  let has_mind = world
    .entities()
    .get(body)
    .map(|e| e.minds.contains(&mind_id))
    .unwrap_or(false);
  if !has_mind {
    tracing::warn!(
      mind = %mind_id,
      entity = %describe(),
      "relay addressed a mind that is not attached"
    );
    return RouterResult::Blocked;
  }

  let mut mres = OpVector::new();
  if let Some(mind) = world.minds.get_mut(mind_id) {
    mind.operation(op, &mut mres);
  }
  for inner in mres {
    res.push(Operation::new(OpClass::Thought).to(body).op_arg(inner));
  }
  RouterResult::Blocked
}

/// Detach a mind from its body. When the last one leaves, any in-flight
/// propulsion is stopped.
pub fn detach_mind(
  world: &mut World,
  body: EntityId,
  mind: MindId,
  res: &mut OpVector,
) {
  let Some(entity) = world.entities_mut().get_mut(body) else {
    return;
  };
  entity.minds.retain(|m| *m != mind);
  entity.routers.remove_mind(mind);
  let stopped = entity.minds.is_empty();
  if stopped {
    let arg = EntityRef::with_id(body)
      .attr("_propel", vec3_to_element(DVec3::ZERO));
    res.push(
      Operation::new(OpClass::Set).from(body).to(body).entity_arg(arg),
    );
  }
}

/// Filter one mind-origin operation into world operations.
///
/// The op may be rewritten and retargeted; anything that fails validation
/// produces an Error or Unseen back to the body instead of a world op.
pub fn mind_to_body(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  let Some(entity) = world.entities().get(body) else {
    return;
  };
  if op.to.is_some() {
    tracing::error!(
      class = op.class.name(),
      entity = %entity.describe(),
      "operation from mind with TO set"
    );
    return;
  }
  if op.future_ms.is_some() && op.class != OpClass::Tick {
    tracing::error!(
      class = op.class.name(),
      entity = %entity.describe(),
      "operation from mind with FUTURE_MS set"
    );
  }
  match op.class {
    OpClass::Move => mind_move(world, body, op, res),
    OpClass::Set => mind_set(world, body, op, res),
    OpClass::Use => mind_use(world, body, op, res),
    OpClass::Touch => mind_touch(world, body, op, res),
    OpClass::Look => mind_look(world, body, op, res),
    OpClass::Create
    | OpClass::Delete
    | OpClass::Imaginary
    | OpClass::Talk
    | OpClass::Thought
    | OpClass::Think
    | OpClass::GoalInfo
    | OpClass::Wield => {
      let mut out = op.clone();
      out.to = Some(body);
      res.push(out);
    }
    _ => {
      tracing::warn!(
        class = op.class.name(),
        entity = %entity.describe(),
        "passing op from mind through to world"
      );
      let mut out = op.clone();
      out.to = Some(body);
      res.push(out);
    }
  }
}

fn mind_move(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  let describe = world.entities().get(body).map(|e| e.describe());
  let Some(arg) = op.first_entity_arg() else {
    tracing::error!(entity = ?describe, "move op from mind has no argument");
    return;
  };
  let Some(moved_id) = arg.id else {
    tracing::error!(entity = ?describe, "move op argument has no id");
    return;
  };
  if moved_id == body {
    move_self(world, body, op, arg, res);
  } else {
    move_other(world, body, op, arg, moved_id, res);
  }
}

/// Run one constraint property; pushes a ClientError and returns false on
/// rejection.
fn check_constraint(
  world: &World,
  holder: EntityId,
  name: &str,
  ctx: QueryContext,
  op: &Operation,
  body: EntityId,
  res: &mut OpVector,
) -> bool {
  let Some(value) =
    world.entities().get(holder).and_then(|e| e.attr(name))
  else {
    return true;
  };
  let spec = match FilterSpec::from_element(value) {
    Ok(spec) => spec,
    Err(err) => {
      tracing::warn!(%err, property = name, "unparseable constraint, ignoring");
      return true;
    }
  };
  let mut errors = Vec::new();
  if spec.matches(ctx, world.entities(), world.types(), &mut errors) {
    return true;
  }
  let message = errors
    .first()
    .map(String::as_str)
    .unwrap_or("You can't move this entity.");
  res.push(ops::client_error(op, message, body));
  false
}

fn move_self(
  world: &World,
  body: EntityId,
  op: &Operation,
  arg: &EntityRef,
  res: &mut OpVector,
) {
  let Some(entity) = world.entities().get(body) else {
    return;
  };
  let mut target_loc = entity.parent;
  if let Some(loc) = arg.loc() {
    target_loc = Some(loc);
  }
  let Some(target_loc) = target_loc else {
    // A parentless body has nowhere to move within.
    return;
  };
  if !world.entities().contains(target_loc) {
    res.push(ops::client_error(
      op,
      "Target parent entity doesn't exist.",
      body,
    ));
    return;
  }
  let ctx = QueryContext {
    target: body,
    actor: body,
    tool: Some(target_loc),
  };
  if !check_constraint(
    world,
    target_loc,
    "destination_constraint",
    ctx,
    op,
    body,
    res,
  ) {
    return;
  }

  let mut out = Operation::new(OpClass::Move).from(body);
  out.to = entity.parent;
  out.args.push(OpArg::Entity(sanitize_move_arg(body, arg)));
  res.push(out);
}

fn move_other(
  world: &World,
  body: EntityId,
  op: &Operation,
  arg: &EntityRef,
  other_id: EntityId,
  res: &mut OpVector,
) {
  let Some(other) = world.entities().get(other_id) else {
    res.push(ops::unseen(other_id, body));
    return;
  };

  let ctx = QueryContext {
    target: other_id,
    actor: body,
    tool: None,
  };
  if !check_constraint(world, body, "mover_constraint", ctx, op, body, res) {
    return;
  }
  if !check_constraint(world, other_id, "move_constraint", ctx, op, body, res)
  {
    return;
  }
  if let Some(parent) = other.parent {
    let ctx = QueryContext {
      target: other_id,
      actor: body,
      tool: Some(parent),
    };
    if !check_constraint(
      world,
      parent,
      "contain_constraint",
      ctx,
      op,
      body,
      res,
    ) {
      return;
    }
  }

  // Reach the entity where it currently is.
  if !world.can_reach(body, &EntityLocation::of(other_id), 0.0) {
    res.push(ops::client_error(op, "Entity is too far away.", body));
    return;
  }

  // Where is it going?
  let mut target_loc = other.parent;
  if let Some(loc) = arg.loc() {
    target_loc = Some(loc);
  }
  let Some(target_loc) = target_loc else {
    res.push(ops::client_error(
      op,
      "Target parent entity doesn't exist.",
      body,
    ));
    return;
  };
  if !world.entities().contains(target_loc) {
    res.push(ops::client_error(
      op,
      "Target parent entity doesn't exist.",
      body,
    ));
    return;
  }
  let ctx = QueryContext {
    target: other_id,
    actor: body,
    tool: Some(target_loc),
  };
  if !check_constraint(
    world,
    target_loc,
    "destination_constraint",
    ctx,
    op,
    body,
    res,
  ) {
    return;
  }

  // Reach the edge of the entity as placed at its destination.
  let target_pos = arg
    .get("pos")
    .and_then(element_to_vec3)
    .unwrap_or(other.location.pos);
  let radius = other.location.bounding_radius();
  if !world.can_reach(
    body,
    &EntityLocation::at(target_loc, target_pos),
    radius,
  ) {
    res.push(ops::client_error(op, "Target is too far away.", body));
    return;
  }

  let mut out = Operation::new(OpClass::Move).from(body);
  // The current location performs the move, even when it re-parents.
  out.to = other.parent;
  out.args.push(OpArg::Entity(sanitize_move_arg(other_id, arg)));
  res.push(out);
}

/// Only id, loc, pos, orientation and amount survive the filter.
fn sanitize_move_arg(id: EntityId, arg: &EntityRef) -> EntityRef {
  let mut out = EntityRef::with_id(id);
  for key in ["loc", "pos", "orientation", "amount"] {
    if let Some(value) = arg.get(key) {
      out.attrs.insert(key.to_owned(), value.clone());
    }
  }
  out
}

fn mind_set(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  let describe = world.entities().get(body).map(|e| e.describe());
  let Some(arg) = op.first_entity_arg() else {
    tracing::error!(entity = ?describe, "set op from mind has no argument");
    return;
  };

  let mut cleaned = EntityRef::with_id(body);
  for (name, value) in &arg.attrs {
    match name.as_str() {
      "_propel" => {
        let Some(mut propel) = element_to_vec3(value) else {
          // Malformed steering data is just ignored.
          continue;
        };
        let mag = propel.length();
        // Minds never get to set more than a normalized speed.
        if mag > 1.0 {
          propel /= mag;
        }
        cleaned
          .attrs
          .insert(name.clone(), vec3_to_element(propel));
      }
      "_direction" | "_destination" => {
        cleaned.attrs.insert(name.clone(), value.clone());
      }
      "id" => {}
      other => {
        tracing::error!(
          attribute = other,
          entity = ?describe,
          "set op from mind tried to set non-allowed property"
        );
      }
    }
  }

  let mut out = Operation::new(OpClass::Set).from(body).to(body);
  out.serialno = op.serialno;
  out.args.push(OpArg::Entity(cleaned));
  res.push(out);
}

fn mind_use(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  let describe = world.entities().get(body).map(|e| e.describe());
  let Some(first) = op.args.first() else {
    tracing::error!(entity = ?describe, "use op from mind has no arguments");
    return;
  };
  match first {
    OpArg::Op(inner) => {
      let Some(tool) = inner.first_entity_arg() else {
        tracing::error!(
          entity = ?describe,
          "inner use op has no entity argument"
        );
        return;
      };
      let Some(tool_id) = tool.id else {
        tracing::error!(entity = ?describe, "inner use arg has no id");
        return;
      };
      res.push(
        Operation::new(OpClass::Use)
          .from(body)
          .to(tool_id)
          .op_arg(inner.clone()),
      );
    }
    OpArg::Element(_) => {
      // A task invocation is aimed at the body itself.
      let mut out = Operation::new(OpClass::Use).from(body).to(body);
      out.args = op.args.clone();
      res.push(out);
    }
    OpArg::Entity(_) => {
      tracing::error!(
        entity = ?describe,
        "use op from mind carried a bare entity argument"
      );
    }
  }
}

fn mind_touch(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  let describe = world.entities().get(body).map(|e| e.describe());
  let Some(arg) = op.first_entity_arg() else {
    tracing::error!(entity = ?describe, "touch op from mind has no argument");
    return;
  };
  let Some(target_id) = arg.id else {
    tracing::error!(entity = ?describe, "touch op argument has no id");
    return;
  };

  let location = match arg.get("pos").and_then(element_to_vec3) {
    Some(pos) => EntityLocation::at(target_id, pos),
    None => EntityLocation::of(target_id),
  };
  if world.can_reach(body, &location, 0.0) {
    let mut touched = op.clone();
    touched.to = Some(target_id);
    res.push(touched.clone());
    // Everyone watching sees the touch.
    res.push(Operation::new(OpClass::Sight).from(body).op_arg(touched));
  } else {
    res.push(ops::client_error(op, "Entity is too far away.", body));
  }
}

fn mind_look(
  world: &World,
  body: EntityId,
  op: &Operation,
  res: &mut OpVector,
) {
  let mut out = op.clone();
  match op.first_entity_arg() {
    None => {
      let parent = world.entities().get(body).and_then(|e| e.parent);
      match parent {
        Some(parent) => out.to = Some(parent),
        // Nothing specified and nowhere to look: stay silent.
        None => return,
      }
    }
    Some(arg) => match arg.id {
      Some(id) => out.to = Some(id),
      None => {
        tracing::error!(entity = %body, "look op argument has no id");
        return;
      }
    },
  }
  res.push(out);
}
