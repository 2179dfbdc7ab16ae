//! Routing machinery: handler results, per-entity router maps, the
//! serial-response tracker, and the redispatch parking lot.

use ahash::AHashMap;
use smol_str::SmolStr;
use thiserror::Error;

use crate::ops::Operation;
use crate::{EntityId, MindId};

/// What a router did with an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterResult {
  /// Consumed; stop routing.
  Handled,
  /// Not interested; try the next router.
  Ignored,
  /// The handler scheduled a follow-up; suppress further routing now.
  WillRedispatch,
  /// Must not propagate further.
  Blocked,
}

impl RouterResult {
  /// Whether dispatch should stop after this result.
  pub fn stops_routing(self) -> bool {
    !matches!(self, RouterResult::Ignored)
  }
}

/// What an op can bind to in a from/to router map.
///
/// Minds are the common case: an external controller asks to receive ops
/// matching a given counterparty id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterBinding {
  Mind(MindId),
}

/// Per-entity router maps consulted before the default handlers.
#[derive(Debug, Default)]
pub struct RouterTable {
  by_from: AHashMap<EntityId, RouterBinding>,
  by_to: AHashMap<EntityId, RouterBinding>,
}

impl RouterTable {
  /// Register a router for ops whose `from` equals `id`. Double
  /// registration is an internal contract breach.
  pub fn register_from(
    &mut self,
    id: EntityId,
    binding: RouterBinding,
  ) -> Result<(), OpError> {
    if self.by_from.insert(id, binding).is_some() {
      return Err(OpError::InvalidOperation(format!(
        "from-router for {id} registered twice"
      )));
    }
    Ok(())
  }

  /// Register a router for ops whose `to` equals `id`.
  pub fn register_to(
    &mut self,
    id: EntityId,
    binding: RouterBinding,
  ) -> Result<(), OpError> {
    if self.by_to.insert(id, binding).is_some() {
      return Err(OpError::InvalidOperation(format!(
        "to-router for {id} registered twice"
      )));
    }
    Ok(())
  }

  pub fn unregister_from(&mut self, id: EntityId) -> Option<RouterBinding> {
    self.by_from.remove(&id)
  }

  pub fn unregister_to(&mut self, id: EntityId) -> Option<RouterBinding> {
    self.by_to.remove(&id)
  }

  pub fn match_from(&self, id: EntityId) -> Option<RouterBinding> {
    self.by_from.get(&id).copied()
  }

  pub fn match_to(&self, id: EntityId) -> Option<RouterBinding> {
    self.by_to.get(&id).copied()
  }

  /// Drop every binding that points at the given mind.
  pub fn remove_mind(&mut self, mind: MindId) {
    self
      .by_from
      .retain(|_, b| !matches!(b, RouterBinding::Mind(m) if *m == mind));
    self
      .by_to
      .retain(|_, b| !matches!(b, RouterBinding::Mind(m) if *m == mind));
  }
}

/// What to do when a reply with a tracked serial arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
  /// Wrap the reply as a Thought and hand it to the given mind's body.
  RelayToMind { body: EntityId, mind: MindId },
}

/// Tracks serials of outstanding requests so replies short-circuit normal
/// routing.
#[derive(Default)]
pub struct ResponseTracker {
  awaiting: AHashMap<u64, ResponseAction>,
}

impl ResponseTracker {
  pub fn await_serial(&mut self, serial: u64, action: ResponseAction) {
    self.awaiting.insert(serial, action);
  }

  /// Claim the action for a reply, consuming the registration.
  pub fn claim(&mut self, op: &Operation) -> Option<ResponseAction> {
    let refno = op.refno?;
    self.awaiting.remove(&refno)
  }

  pub fn pending(&self) -> usize {
    self.awaiting.len()
  }
}

/// Operations parked until a type resolves.
///
/// The "park op until the type loads" pattern from the redispatch contract:
/// a handler that cannot complete because an op references an unloaded type
/// leaves the op here; resolving the type drains the list back into the
/// dispatch queue.
#[derive(Default)]
pub struct ParkedOps {
  by_type: AHashMap<SmolStr, Vec<Operation>>,
}

impl ParkedOps {
  pub fn park(&mut self, type_name: &str, op: Operation) {
    self.by_type.entry(SmolStr::new(type_name)).or_default().push(op);
  }

  /// Take every op waiting on `type_name`, in park order.
  pub fn resolve(&mut self, type_name: &str) -> Vec<Operation> {
    self.by_type.remove(type_name).unwrap_or_default()
  }

  pub fn waiting_on(&self, type_name: &str) -> usize {
    self.by_type.get(type_name).map(Vec::len).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.by_type.is_empty()
  }
}

/// The error taxonomy of the dispatch boundary.
///
/// Handlers return these instead of panicking; the dispatch loop logs and
/// continues. Client-visible failures travel as Error/Unseen ops, not as
/// `OpError`.
#[derive(Debug, Error)]
pub enum OpError {
  /// Internal contract breach. Logged and dropped.
  #[error("invalid operation: {0}")]
  InvalidOperation(String),
  /// The op references a type that is not loaded yet; it has been parked.
  #[error("type not resolved yet: {0}")]
  TypeUnresolved(SmolStr),
  /// A store write failed; the entry stays queued for retry.
  #[error("persistence failure: {0}")]
  Persistence(String),
  /// World root corruption or schema mismatch; the process should exit.
  #[error("fatal: {0}")]
  Fatal(String),
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ops::OpClass;

  #[test]
  fn double_registration_is_invalid() {
    let mut table = RouterTable::default();
    let mind = RouterBinding::Mind(MindId(1));
    table.register_from(EntityId(9), mind).unwrap();
    assert!(matches!(
      table.register_from(EntityId(9), mind),
      Err(OpError::InvalidOperation(_))
    ));
  }

  #[test]
  fn tracker_claims_once() {
    let mut tracker = ResponseTracker::default();
    tracker.await_serial(
      7,
      ResponseAction::RelayToMind {
        body: EntityId(1),
        mind: MindId(2),
      },
    );
    let mut reply = Operation::new(OpClass::Info);
    reply.refno = Some(7);
    assert!(tracker.claim(&reply).is_some());
    assert!(tracker.claim(&reply).is_none());
  }

  #[test]
  fn parked_ops_drain_in_order() {
    let mut parked = ParkedOps::default();
    parked.park("golem", Operation::new(OpClass::Create));
    parked.park("golem", Operation::new(OpClass::Look));
    assert_eq!(parked.waiting_on("golem"), 2);
    let drained = parked.resolve("golem");
    assert_eq!(drained.len(), 2);
    assert_eq!(drained[0].class, OpClass::Create);
    assert!(parked.is_empty());
  }
}
