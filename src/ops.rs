//! Typed messages routed between entities, and their decoded wire form.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::element::Element;
use crate::EntityId;

/// Every operation class the core routes.
///
/// The wire `parent` field maps onto these via [`OpClass::name`] and
/// [`OpClass::parse`].
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
pub enum OpClass {
  Action,
  Appearance,
  Create,
  Delete,
  Disappearance,
  Error,
  Get,
  GoalInfo,
  Imaginary,
  Info,
  Login,
  Logout,
  Look,
  Move,
  Relay,
  Set,
  Sight,
  Sound,
  Talk,
  Think,
  Thought,
  Tick,
  Touch,
  Unseen,
  Update,
  Use,
  Wield,
}

impl OpClass {
  pub fn name(self) -> &'static str {
    match self {
      OpClass::Action => "action",
      OpClass::Appearance => "appearance",
      OpClass::Create => "create",
      OpClass::Delete => "delete",
      OpClass::Disappearance => "disappearance",
      OpClass::Error => "error",
      OpClass::Get => "get",
      OpClass::GoalInfo => "goal_info",
      OpClass::Imaginary => "imaginary",
      OpClass::Info => "info",
      OpClass::Login => "login",
      OpClass::Logout => "logout",
      OpClass::Look => "look",
      OpClass::Move => "move",
      OpClass::Relay => "relay",
      OpClass::Set => "set",
      OpClass::Sight => "sight",
      OpClass::Sound => "sound",
      OpClass::Talk => "talk",
      OpClass::Think => "think",
      OpClass::Thought => "thought",
      OpClass::Tick => "tick",
      OpClass::Touch => "touch",
      OpClass::Unseen => "unseen",
      OpClass::Update => "update",
      OpClass::Use => "use",
      OpClass::Wield => "wield",
    }
  }

  pub fn parse(name: &str) -> Option<OpClass> {
    Some(match name {
      "action" => OpClass::Action,
      "appearance" => OpClass::Appearance,
      "create" => OpClass::Create,
      "delete" => OpClass::Delete,
      "disappearance" => OpClass::Disappearance,
      "error" => OpClass::Error,
      "get" => OpClass::Get,
      "goal_info" => OpClass::GoalInfo,
      "imaginary" => OpClass::Imaginary,
      "info" => OpClass::Info,
      "login" => OpClass::Login,
      "logout" => OpClass::Logout,
      "look" => OpClass::Look,
      "move" => OpClass::Move,
      "relay" => OpClass::Relay,
      "set" => OpClass::Set,
      "sight" => OpClass::Sight,
      "sound" => OpClass::Sound,
      "talk" => OpClass::Talk,
      "think" => OpClass::Think,
      "thought" => OpClass::Thought,
      "tick" => OpClass::Tick,
      "touch" => OpClass::Touch,
      "unseen" => OpClass::Unseen,
      "update" => OpClass::Update,
      "use" => OpClass::Use,
      "wield" => OpClass::Wield,
      _ => return None,
    })
  }
}

/// The decoded form of an entity mentioned in an op: an id plus whichever
/// attributes the sender chose to include.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EntityRef {
  pub id: Option<EntityId>,
  pub attrs: BTreeMap<String, Element>,
}

impl EntityRef {
  pub fn with_id(id: EntityId) -> Self {
    Self {
      id: Some(id),
      attrs: BTreeMap::new(),
    }
  }

  pub fn attr(mut self, name: &str, value: impl Into<Element>) -> Self {
    self.attrs.insert(name.to_owned(), value.into());
    self
  }

  pub fn get(&self, name: &str) -> Option<&Element> {
    self.attrs.get(name)
  }

  /// The new parent, when the reference asks for a re-location.
  pub fn loc(&self) -> Option<EntityId> {
    match self.attrs.get("loc")? {
      Element::Int(i) if *i >= 0 => Some(EntityId(*i as u64)),
      _ => None,
    }
  }
}

/// One argument of an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpArg {
  Entity(EntityRef),
  Op(Operation),
  Element(Element),
}

impl OpArg {
  pub fn as_entity(&self) -> Option<&EntityRef> {
    match self {
      OpArg::Entity(e) => Some(e),
      _ => None,
    }
  }

  pub fn as_op(&self) -> Option<&Operation> {
    match self {
      OpArg::Op(op) => Some(op),
      _ => None,
    }
  }

  pub fn as_element(&self) -> Option<&Element> {
    match self {
      OpArg::Element(e) => Some(e),
      _ => None,
    }
  }
}

/// A typed message between entities.
///
/// `serialno`/`refno` pair requests with replies; `id` addresses a specific
/// mind for [`OpClass::Relay`]; `future_ms` delays dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  pub class: OpClass,
  pub from: Option<EntityId>,
  pub to: Option<EntityId>,
  pub id: Option<MindAddress>,
  pub serialno: Option<u64>,
  pub refno: Option<u64>,
  pub future_ms: Option<u64>,
  pub args: Vec<OpArg>,
}

/// Relay addressing: which mind of the target entity the inner op is for.
pub type MindAddress = crate::MindId;

impl Operation {
  pub fn new(class: OpClass) -> Self {
    Self {
      class,
      from: None,
      to: None,
      id: None,
      serialno: None,
      refno: None,
      future_ms: None,
      args: Vec::new(),
    }
  }

  pub fn from(mut self, from: EntityId) -> Self {
    self.from = Some(from);
    self
  }

  pub fn to(mut self, to: EntityId) -> Self {
    self.to = Some(to);
    self
  }

  pub fn arg(mut self, arg: OpArg) -> Self {
    self.args.push(arg);
    self
  }

  pub fn entity_arg(self, entity: EntityRef) -> Self {
    self.arg(OpArg::Entity(entity))
  }

  pub fn op_arg(self, op: Operation) -> Self {
    self.arg(OpArg::Op(op))
  }

  pub fn future_ms(mut self, delay: u64) -> Self {
    self.future_ms = Some(delay);
    self
  }

  pub fn first_entity_arg(&self) -> Option<&EntityRef> {
    self.args.first().and_then(OpArg::as_entity)
  }

  pub fn first_op_arg(&self) -> Option<&Operation> {
    self.args.first().and_then(OpArg::as_op)
  }
}

/// Operations produced by a handler, destined for the dispatch queue.
pub type OpVector = Vec<Operation>;

/// A Sight op wrapping `inner`, addressed to `to`.
pub fn sight_of(inner: Operation, to: EntityId) -> Operation {
  Operation::new(OpClass::Sight)
    .from(inner.from.unwrap_or(EntityId::ROOT))
    .to(to)
    .op_arg(inner)
}

/// The reply sent to a mind whose op referenced something invalid. The
/// original op rides along as the second arg so clients can correlate.
pub fn client_error(original: &Operation, message: &str, to: EntityId) -> Operation {
  let mut detail = BTreeMap::new();
  detail.insert("message".to_owned(), Element::from(message));
  let mut op = Operation::new(OpClass::Error)
    .to(to)
    .arg(OpArg::Element(Element::Map(detail)))
    .op_arg(original.clone());
  op.refno = original.serialno;
  op
}

/// The reply for a target id that did not resolve.
pub fn unseen(unresolved: EntityId, to: EntityId) -> Operation {
  Operation::new(OpClass::Unseen)
    .to(to)
    .entity_arg(EntityRef::with_id(unresolved))
}

/// Pull the error message back out of a [`client_error`] op.
pub fn error_message(op: &Operation) -> Option<&str> {
  op.args
    .first()
    .and_then(OpArg::as_element)
    .and_then(|e| e.get("message"))
    .and_then(Element::as_str)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn class_names_roundtrip() {
    for class in [
      OpClass::Move,
      OpClass::GoalInfo,
      OpClass::Disappearance,
      OpClass::Use,
    ] {
      assert_eq!(OpClass::parse(class.name()), Some(class));
    }
    assert_eq!(OpClass::parse("teleport"), None);
  }

  #[test]
  fn error_carries_message_and_refno() {
    let mut orig = Operation::new(OpClass::Touch).from(EntityId(2));
    orig.serialno = Some(77);
    let err = client_error(&orig, "Entity is too far away.", EntityId(2));
    assert_eq!(error_message(&err), Some("Entity is too far away."));
    assert_eq!(err.refno, Some(77));
    assert_eq!(err.args[1].as_op().unwrap().class, OpClass::Touch);
  }
}
