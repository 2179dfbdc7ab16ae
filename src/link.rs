//! The wire boundary: decoded operations in, addressed operations out.
//!
//! The core neither parses bytes nor encrypts; a transport hands it fully
//! decoded [`Operation`]s and receives the same. A [`Connection`] stands
//! for one client session: it can possess entities (attaching a mind whose
//! traffic flows back over the connection's channel) and it assigns
//! outgoing serials monotonically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::channel;

use crate::minds::Mind;
use crate::ops::{OpArg, OpClass, OpVector, Operation};
use crate::world::World;
use crate::{EntityId, MindId};

/// Build an operation from its decoded envelope parts. Transports call
/// this after their codec has taken the bytes apart; an unknown class name
/// yields `None`.
pub fn decode_envelope(
  class: &str,
  from: Option<EntityId>,
  to: Option<EntityId>,
  serialno: Option<u64>,
  refno: Option<u64>,
  future_ms: Option<u64>,
  args: Vec<OpArg>,
) -> Option<Operation> {
  let class = OpClass::parse(class)?;
  let mut op = Operation::new(class);
  op.from = from;
  op.to = to;
  op.serialno = serialno;
  op.refno = refno;
  op.future_ms = future_ms;
  op.args = args;
  Some(op)
}

/// A mind that forwards everything to the client over a channel, stamping
/// unserialled ops from the connection's counter.
struct ChannelMind {
  tx: channel::Sender<Operation>,
  serial: Arc<AtomicU64>,
}

impl Mind for ChannelMind {
  fn operation(&mut self, op: &Operation, _res: &mut OpVector) {
    let mut out = op.clone();
    if out.serialno.is_none() {
      out.serialno = Some(self.serial.fetch_add(1, Ordering::SeqCst) + 1);
    }
    // A gone client just stops receiving; disconnect handling detaches.
    let _ = self.tx.send(out);
  }
}

/// One client session at the boundary.
pub struct Connection {
  tx: channel::Sender<Operation>,
  serial: Arc<AtomicU64>,
  possessed: Vec<(EntityId, MindId)>,
}

impl Connection {
  /// Create a connection; the transport drains the returned receiver for
  /// ops addressed to the client.
  pub fn open() -> (Connection, channel::Receiver<Operation>) {
    let (tx, rx) = channel::unbounded();
    (
      Connection {
        tx,
        serial: Arc::new(AtomicU64::new(0)),
        possessed: Vec::new(),
      },
      rx,
    )
  }

  /// Take control of an entity. The attached mind relays world traffic to
  /// the client.
  pub fn possess(&mut self, world: &mut World, body: EntityId) -> Option<MindId> {
    let mind = world.attach_mind(
      body,
      Box::new(ChannelMind {
        tx: self.tx.clone(),
        serial: Arc::clone(&self.serial),
      }),
    )?;
    self.possessed.push((body, mind));
    // The client learns which entity it now speaks for.
    let announce = Operation::new(OpClass::Info)
      .from(body)
      .to(body)
      .entity_arg(world.entity_as_ref(body));
    self.send_to_client(announce);
    Some(mind)
  }

  pub fn possessed(&self) -> &[(EntityId, MindId)] {
    &self.possessed
  }

  /// A decoded op arrived from the transport. Only ops addressed to a
  /// possessed body are accepted.
  pub fn accept(&mut self, world: &mut World, mut op: Operation) {
    let Some(to) = op.to else {
      tracing::warn!(class = op.class.name(), "client op with no to, dropping");
      return;
    };
    if !self.possessed.iter().any(|(body, _)| *body == to) {
      tracing::warn!(class = op.class.name(), to = %to,
        "client op addressed to an entity it does not possess, dropping");
      return;
    }
    if op.from.is_none() {
      op.from = Some(to);
    }
    world.enqueue(op);
  }

  /// Deliver an op to the client, stamping a serial if it lacks one.
  pub fn send_to_client(&mut self, mut op: Operation) {
    if op.serialno.is_none() {
      op.serialno = Some(self.serial.fetch_add(1, Ordering::SeqCst) + 1);
    }
    let _ = self.tx.send(op);
  }

  /// The client went away: a terminal Logout per possessed body detaches
  /// the minds and cancels their in-flight intent.
  pub fn disconnect(self, world: &mut World) {
    for (body, mind) in &self.possessed {
      world.enqueue(
        Operation::new(OpClass::Logout)
          .from(*body)
          .to(*body)
          .entity_arg(crate::ops::EntityRef::with_id(*body)),
      );
      let _ = mind;
    }
  }
}
