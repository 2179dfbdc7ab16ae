//! The place all the entities live: registry, clock, dispatch loop and
//! signal bus, at the heart of the simulation.

mod handlers;

use ahash::AHashMap;
use crossbeam::channel;

use crate::builder::EntityBuilder;
use crate::domain::{self, Domain, DomainKind, EntityLocation};
use crate::element::Element;
use crate::entity::{Entities, EntityFlags};
use crate::filter::FilterSpec;
use crate::minds::{Mind, MindRegistry};
use crate::ops::{self, OpClass, OpVector, Operation};
use crate::property::PropFlags;
use crate::queue::DispatchQueue;
use crate::router::{
  OpError, ParkedOps, ResponseAction, ResponseTracker, RouterBinding,
};
use crate::typeinfo::TypeRegistry;
use crate::{EntityId, MindId};

/// Intra-process signals observed by persistence and other listeners.
/// Sent synchronously from inside the mutation that caused them, drained
/// from the main thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldSignal {
  Inserted(EntityId),
  Updated(EntityId),
  Containered(EntityId),
  BeingDeleted(EntityId),
  CharacterAdded {
    entity: EntityId,
    account: String,
  },
  CharacterDeleted {
    entity: EntityId,
  },
}

/// Default per-tick operation budget.
const DEFAULT_OP_BUDGET: usize = 100;

/// The top-level registry and dispatcher.
pub struct World {
  entities: Entities,
  pub(crate) domains: AHashMap<EntityId, Box<dyn Domain>>,
  queue: DispatchQueue,
  types: TypeRegistry,
  pub(crate) minds: MindRegistry,
  pub(crate) tracker: ResponseTracker,
  pub(crate) parked: ParkedOps,
  signal_tx: channel::Sender<WorldSignal>,
  signal_rx: channel::Receiver<WorldSignal>,
  now: u64,
  op_budget: usize,
  serial: u64,
  fatal: Option<String>,
}

impl World {
  /// A world with a fresh root entity and the given type registry.
  pub fn new(types: TypeRegistry) -> World {
    let (tx, rx) = channel::unbounded();
    let mut entities = Entities::new();
    let mut root = crate::entity::Entity::new(EntityId::ROOT, "world");
    root.flags.insert(crate::entity::CLEAN_MASK);
    entities.insert(root);

    Self {
      entities,
      domains: AHashMap::new(),
      queue: DispatchQueue::new(),
      types,
      minds: MindRegistry::default(),
      tracker: ResponseTracker::default(),
      parked: ParkedOps::default(),
      signal_tx: tx,
      signal_rx: rx,
      now: 0,
      op_budget: DEFAULT_OP_BUDGET,
      serial: 0,
      fatal: None,
    }
  }

  pub fn entities(&self) -> &Entities {
    &self.entities
  }

  pub fn entities_mut(&mut self) -> &mut Entities {
    &mut self.entities
  }

  pub fn types(&self) -> &TypeRegistry {
    &self.types
  }

  pub fn types_mut(&mut self) -> &mut TypeRegistry {
    &mut self.types
  }

  /// Monotonic simulation time, milliseconds.
  pub fn now(&self) -> u64 {
    self.now
  }

  pub fn set_op_budget(&mut self, budget: usize) {
    self.op_budget = budget;
  }

  /// Set when the simulation hit an irrecoverable state.
  pub fn fatal_error(&self) -> Option<&str> {
    self.fatal.as_deref()
  }

  pub fn queue_len(&self) -> usize {
    self.queue.len()
  }

  /// Discard all pending operations. Shutdown plumbing.
  pub fn clear_queues(&mut self) {
    self.queue.clear_queues();
  }

  /// Pull every queued op out in delivery order, without routing them.
  /// Lets callers at the boundary (and tests) inspect pending traffic.
  pub fn drain_ops(&mut self) -> Vec<Operation> {
    self.queue.drain_ordered()
  }

  /// How many ops are parked waiting on the given type.
  pub fn parked_on(&self, type_name: &str) -> usize {
    self.parked.waiting_on(type_name)
  }

  /// Record a character↔account association; persistence writes the link.
  pub fn character_added(&mut self, entity: EntityId, account: &str) {
    self.signal(WorldSignal::CharacterAdded {
      entity,
      account: account.to_owned(),
    });
  }

  pub fn character_deleted(&mut self, entity: EntityId) {
    self.signal(WorldSignal::CharacterDeleted { entity });
  }

  /// Set up a builder to spawn an entity of the given type.
  pub fn spawn<'w>(&'w mut self, type_name: &str) -> EntityBuilder<'w> {
    EntityBuilder::new(self, type_name)
  }

  /// Builder for an entity materialized from the store: fixed id, no type
  /// defaults, starts clean, not yet registered with any domain.
  pub(crate) fn spawn_restored<'w>(
    &'w mut self,
    type_name: &str,
    id: EntityId,
  ) -> EntityBuilder<'w> {
    EntityBuilder::new(self, type_name).id(id).restored()
  }

  pub(crate) fn signal(&self, signal: WorldSignal) {
    // The channel is unbounded and we hold both ends; send cannot fail.
    let _ = self.signal_tx.send(signal);
  }

  /// Everything signalled since the last drain, in emission order.
  pub fn drain_signals(&mut self) -> Vec<WorldSignal> {
    self.signal_rx.try_iter().collect()
  }

  /// Next outgoing serial number.
  pub fn next_serial(&mut self) -> u64 {
    self.serial += 1;
    self.serial
  }

  // ---- perception -------------------------------------------------------

  pub fn is_visible_to(&self, observer: EntityId, target: EntityId) -> bool {
    domain::is_visible_to(&self.entities, observer, target)
  }

  pub fn can_reach(
    &self,
    observer: EntityId,
    target: &EntityLocation,
    extra_radius: f64,
  ) -> bool {
    domain::can_reach(&self.entities, observer, target, extra_radius)
  }

  /// Perceptive entities that currently see `target`, in id order.
  pub fn observers_of(&self, target: EntityId) -> Vec<EntityId> {
    let mut out: Vec<EntityId> = self
      .entities
      .iter()
      .filter(|(_, e)| e.is_perceptive() && !e.is_destroyed())
      .map(|(&id, _)| id)
      .filter(|&id| domain::is_visible_to(&self.entities, id, target))
      .collect();
    out.sort();
    out
  }

  // ---- minds ------------------------------------------------------------

  /// Attach an external controller to an entity.
  pub fn attach_mind(
    &mut self,
    body: EntityId,
    mind: Box<dyn Mind>,
  ) -> Option<MindId> {
    if !self.entities.contains(body) {
      return None;
    }
    let id = self.minds.register(mind);
    if let Some(e) = self.entities.get_mut(body) {
      e.minds.push(id);
    }
    Some(id)
  }

  /// Detach a controller; the last one out stops the body's propulsion.
  pub fn detach_mind(&mut self, body: EntityId, mind: MindId) {
    let mut res = OpVector::new();
    crate::minds::detach_mind(self, body, mind, &mut res);
    self.minds.unregister(mind);
    self.enqueue_all(res);
  }

  /// Register a from-matching router on an entity: ops arriving at `body`
  /// whose `from` is `counterparty` go to `mind` instead of the default
  /// handlers.
  pub fn register_from_router(
    &mut self,
    body: EntityId,
    counterparty: EntityId,
    mind: MindId,
  ) -> Result<(), OpError> {
    let entity = self.entities.get_mut(body).ok_or_else(|| {
      OpError::InvalidOperation(format!("no entity {body}"))
    })?;
    entity.routers.register_from(counterparty, RouterBinding::Mind(mind))
  }

  /// Like [`World::register_from_router`], matching on `to` instead.
  pub fn register_to_router(
    &mut self,
    body: EntityId,
    addressee: EntityId,
    mind: MindId,
  ) -> Result<(), OpError> {
    let entity = self.entities.get_mut(body).ok_or_else(|| {
      OpError::InvalidOperation(format!("no entity {body}"))
    })?;
    entity.routers.register_to(addressee, RouterBinding::Mind(mind))
  }

  /// Send `inner` to `target_mind` (a mind of `target`) as a Relay. The
  /// serial is tracked so a reply carrying it as `refno` comes back to
  /// `reply_mind` wrapped as a Thought to `body`.
  pub fn relay(
    &mut self,
    body: EntityId,
    reply_mind: MindId,
    target: EntityId,
    target_mind: MindId,
    inner: Operation,
  ) -> u64 {
    let serial = self.next_serial();
    let mut op = Operation::new(OpClass::Relay)
      .from(body)
      .to(target)
      .op_arg(inner);
    op.serialno = Some(serial);
    op.id = Some(target_mind);
    self.tracker.await_serial(
      serial,
      ResponseAction::RelayToMind {
        body,
        mind: reply_mind,
      },
    );
    self.enqueue(op);
    serial
  }

  // ---- properties -------------------------------------------------------

  /// Effective value of a property, with type fall-through.
  pub fn attr(&self, id: EntityId, name: &str) -> Option<Element> {
    let entity = self.entities.get(id)?;
    match entity.attr(name) {
      Some(value) => Some(value.clone()),
      None => self.types.default_for(&entity.type_name, name).cloned(),
    }
  }

  /// Set a property through the world: installs, applies special behavior
  /// and fires the Updated signal. The workhorse behind Set ops.
  pub fn set_property(
    &mut self,
    id: EntityId,
    name: &str,
    value: impl Into<Element>,
    res: &mut OpVector,
  ) -> bool {
    let Some(entity) = self.entities.get_mut(id) else {
      return false;
    };
    if !entity.set_property(name, value.into()) {
      return false;
    }
    entity.touch();
    self.apply_property(id, name, res);
    self.signal(WorldSignal::Updated(id));
    true
  }

  /// Run the special behavior a property name carries, if any. One level
  /// of dispatch; plain data names fall straight through.
  pub(crate) fn apply_property(
    &mut self,
    id: EntityId,
    name: &str,
    res: &mut OpVector,
  ) {
    match name {
      "pos" | "orientation" | "velocity" | "scale" | "bbox" => {
        self.apply_location_attr(id, name);
      }
      "domain" => {
        let kind = self
          .entities
          .get(id)
          .and_then(|e| e.attr_str("domain"))
          .and_then(DomainKind::parse);
        match kind {
          Some(kind) => {
            if let Some(e) = self.entities.get_mut(id) {
              e.domain = Some(kind);
            }
            self.domains.insert(id, kind.instantiate(id));
          }
          None => {
            tracing::warn!(entity = %id, "unknown domain kind, ignoring");
          }
        }
      }
      "perception_sight" => {
        if let Some(e) = self.entities.get_mut(id) {
          let perceptive =
            e.attr_float("perception_sight").map(|v| v != 0.0).unwrap_or(false);
          e.flags.set(EntityFlags::PERCEPTIVE, perceptive);
        }
      }
      "mode" => {
        let known = matches!(
          self.entities.get(id).and_then(|e| e.attr_str("mode")),
          Some("fixed" | "planted" | "free") | None
        );
        if !known {
          tracing::warn!(entity = %id, "unknown mode value");
        }
      }
      "visibility" => {
        let known = matches!(
          self.entities.get(id).and_then(|e| e.attr_str("visibility")),
          Some("public" | "private" | "protected") | None
        );
        if !known {
          tracing::warn!(entity = %id, "unknown visibility value");
        }
      }
      crate::domain::container::CONTAINER_ACCESS => {
        domain::container::apply_access(&mut self.entities, id, res);
      }
      crate::domain::container::CONTAINERS_ACTIVE => {
        if let Some(entry) = self
          .entities
          .get_mut(id)
          .and_then(|e| e.property_mut(name))
        {
          entry.flags.insert(PropFlags::EPHEM);
        }
      }
      "minds" => {
        tracing::warn!(entity = %id, "minds is maintained by the core");
        if let Some(e) = self.entities.get_mut(id) {
          e.remove_property(name);
        }
      }
      "mover_constraint" | "move_constraint" | "contain_constraint"
      | "destination_constraint" => {
        let parse = self
          .entities
          .get(id)
          .and_then(|e| e.attr(name))
          .map(FilterSpec::from_element);
        if let Some(Err(err)) = parse {
          tracing::warn!(entity = %id, property = name, %err,
            "constraint does not parse and will be ignored");
        }
      }
      _ => {}
    }
  }

  /// Move a staged location attribute into the Location and drop the
  /// property entry; spatial state lives in one place only.
  fn apply_location_attr(&mut self, id: EntityId, name: &str) {
    use crate::geometry::{element_to_bbox, element_to_quat, element_to_vec3};
    let Some(entity) = self.entities.get_mut(id) else {
      return;
    };
    let Some(entry) = entity.remove_property(name) else {
      return;
    };
    let value = entry.value();
    match name {
      "pos" => {
        if let Some(v) = element_to_vec3(value) {
          entity.location.pos = v;
          entity.flags.remove(EntityFlags::POS_CLEAN);
        }
      }
      "orientation" => {
        if let Some(q) = element_to_quat(value) {
          entity.location.orientation = q;
          entity.flags.remove(EntityFlags::ORIENT_CLEAN);
        }
      }
      "velocity" => {
        if let Some(v) = element_to_vec3(value) {
          entity.location.velocity = v;
        }
      }
      "scale" => {
        if let Some(v) = element_to_vec3(value) {
          entity.location.scale = v;
        }
      }
      "bbox" => {
        if let Some(b) = element_to_bbox(value) {
          entity.location.bbox = Some(b);
        }
      }
      _ => {}
    }
  }

  pub(crate) fn apply_all_properties(
    &mut self,
    id: EntityId,
    res: &mut OpVector,
  ) {
    let names: Vec<smol_str::SmolStr> = match self.entities.get(id) {
      Some(e) => e.properties().map(|(name, _)| name.clone()).collect(),
      None => return,
    };
    for name in names {
      self.apply_property(id, &name, res);
    }
  }

  pub(crate) fn attach_to_domain(
    &mut self,
    parent: EntityId,
    child: EntityId,
    res: &mut OpVector,
  ) {
    if let Some(domain) = self.domains.get_mut(&parent) {
      domain.add_entity(&self.entities, child, res);
    }
  }

  /// Re-locate an entity: same-parent movement or a re-parent across
  /// domains, with all the visibility traffic that implies. Equivalent to
  /// routing a Move to the entity's current parent.
  pub fn set_location(
    &mut self,
    child: EntityId,
    new_parent: EntityId,
    pos: glam::DVec3,
    orientation: Option<glam::DQuat>,
  ) {
    let Some(parent) = self.entities.get(child).and_then(|e| e.parent) else {
      tracing::warn!(entity = %child, "set_location on a parentless entity");
      return;
    };
    let mut arg = crate::ops::EntityRef::with_id(child)
      .attr("pos", crate::geometry::vec3_to_element(pos))
      .attr("loc", Element::Int(new_parent.0 as i64));
    if let Some(q) = orientation {
      arg = arg.attr("orientation", crate::geometry::quat_to_element(q));
    }
    self.dispatch(
      Operation::new(OpClass::Move).from(child).to(parent).entity_arg(arg),
    );
  }

  // ---- types ------------------------------------------------------------

  /// A type just became available: drain every op parked on it back into
  /// the queue, in park order.
  pub fn resolve_type(&mut self, name: &str) {
    let drained = self.parked.resolve(name);
    if !drained.is_empty() {
      tracing::debug!(
        type_name = name,
        count = drained.len(),
        "type resolved, redispatching parked ops"
      );
    }
    for op in drained {
      self.queue.schedule(op, self.now);
    }
  }

  // ---- dispatch ---------------------------------------------------------

  /// Schedule `op` for `now + future_ms`.
  pub fn enqueue(&mut self, op: Operation) {
    self.queue.schedule(op, self.now);
  }

  pub fn enqueue_all(&mut self, ops: OpVector) {
    for op in ops {
      self.enqueue(op);
    }
  }

  /// Route one operation immediately; anything it produces is queued.
  pub fn dispatch(&mut self, op: Operation) {
    let mut res = OpVector::new();
    let class = op.class;
    if let Err(err) = self.route(op, &mut res) {
      match &err {
        OpError::Fatal(message) => {
          self.fatal = Some(message.clone());
          tracing::error!(%err, class = class.name(), "fatal error in dispatch");
        }
        _ => {
          tracing::error!(%err, class = class.name(), "error handling op, dropping");
        }
      }
    }
    for out in res {
      self.enqueue(out);
    }
  }

  fn route(&mut self, op: Operation, res: &mut OpVector) -> Result<(), OpError> {
    // A from that no longer resolves means the sender was reaped while the
    // op waited; drop it.
    if let Some(from) = op.from {
      if !self.entities.contains(from) {
        tracing::debug!(from = %from, class = op.class.name(),
          "dropping op from reaped entity");
        return Ok(());
      }
    }

    let Some(to) = op.to else {
      // Undirected perception ops fan out to whoever sees the sender.
      if matches!(op.class, OpClass::Sight | OpClass::Sound) {
        if let Some(from) = op.from {
          for observer in self.observers_of(from) {
            let mut copy = op.clone();
            copy.to = Some(observer);
            res.push(copy);
          }
        }
        return Ok(());
      }
      tracing::debug!(class = op.class.name(), "dropping undirected op");
      return Ok(());
    };

    // Replies to tracked serials short-circuit normal routing.
    if let Some(action) = self.tracker.claim(&op) {
      match action {
        ResponseAction::RelayToMind { body, mind } => {
          let mut mres = OpVector::new();
          if let Some(m) = self.minds.get_mut(mind) {
            m.operation(&op, &mut mres);
          }
          for inner in mres {
            res.push(
              Operation::new(OpClass::Thought).to(body).op_arg(inner),
            );
          }
        }
      }
      return Ok(());
    }

    let (destroyed, from_binding, to_binding) = match self.entities.get(to) {
      Some(target) => (
        target.is_destroyed(),
        op.from.and_then(|f| target.routers.match_from(f)),
        target.routers.match_to(to),
      ),
      None => {
        if let Some(from) = op.from {
          if from != to {
            res.push(ops::unseen(to, from));
          }
        }
        return Ok(());
      }
    };
    if destroyed {
      return Ok(());
    }

    // Explicit routers run before the default handlers.
    if let Some(RouterBinding::Mind(mind)) = from_binding {
      self.forward_to_mind(to, mind, &op, res);
      return Ok(());
    }
    if let Some(RouterBinding::Mind(mind)) = to_binding {
      self.forward_to_mind(to, mind, &op, res);
      return Ok(());
    }

    self.handle_default(to, &op, res).map(|_| ())
  }

  fn forward_to_mind(
    &mut self,
    body: EntityId,
    mind: MindId,
    op: &Operation,
    res: &mut OpVector,
  ) {
    let mut mres = OpVector::new();
    if let Some(m) = self.minds.get_mut(mind) {
      m.operation(op, &mut mres);
    }
    for inner in mres {
      res.push(Operation::new(OpClass::Thought).to(body).op_arg(inner));
    }
  }

  // ---- the loop ---------------------------------------------------------

  /// One cooperative iteration: advance the clock, drain due ops up to the
  /// budget, then run every domain's tick. Persistence ticks separately.
  pub fn tick(&mut self, dt_ms: u64) {
    self.now += dt_ms;
    self.reap();

    let mut processed = 0;
    while processed < self.op_budget {
      let Some(entry) = self.queue.pop_due(self.now) else {
        break;
      };
      self.dispatch(entry.op);
      processed += 1;
    }

    self.tick_domains();
  }

  /// Keep routing due ops until none remain (or an op storm is detected).
  /// Test and shutdown plumbing; the live loop uses [`World::tick`].
  pub fn process_all(&mut self) {
    let mut guard = 0usize;
    while let Some(entry) = self.queue.pop_due(self.now) {
      self.dispatch(entry.op);
      guard += 1;
      if guard > 100_000 {
        tracing::error!("op storm: 100k ops in one drain, giving up");
        break;
      }
    }
  }

  fn tick_domains(&mut self) {
    let mut ids: Vec<EntityId> = self.domains.keys().copied().collect();
    ids.sort();
    for id in ids {
      let mut res = OpVector::new();
      if let Some(domain) = self.domains.get_mut(&id) {
        domain.tick(&self.entities, self.now, &mut res);
      }
      self.enqueue_all(res);
    }
  }

  /// Drop entities whose destroyed flag was set in an earlier iteration.
  fn reap(&mut self) {
    let dead: Vec<EntityId> = self
      .entities
      .iter()
      .filter(|(_, e)| e.is_destroyed())
      .map(|(&id, _)| id)
      .collect();
    for id in dead {
      self.entities.remove(id);
      self.domains.remove(&id);
    }
  }
}
