//! The authoritative world simulation core of a networked multiplayer RPG
//! server.
//!
//! A [`World`](world::World) holds a forest of entities, routes typed
//! [`Operation`](ops::Operation)s between them through a priority dispatch
//! queue, and lets pluggable spatial [domains](domain) decide who perceives
//! and who can reach whom. Client intent enters through the
//! [mind filter](minds) and leaves through the [wire boundary](link);
//! entity state is written back asynchronously by the
//! [persistence manager](persistence).

pub mod builder;
pub mod config;
pub mod domain;
pub mod element;
pub mod entity;
pub mod filter;
pub mod geometry;
pub mod link;
pub mod metrics;
pub mod minds;
pub mod ops;
pub mod persistence;
pub mod property;
pub mod queue;
pub mod router;
pub mod store;
pub mod typeinfo;
pub mod world;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an entity, unique for the lifetime of a store.
///
/// Ids are assigned densely by the world and survive restarts; id 0 is
/// always the world root.
#[derive(
  Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityId(pub u64);

impl EntityId {
  pub const ROOT: EntityId = EntityId(0);
}

impl fmt::Display for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Debug for EntityId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "EntityId({})", self.0)
  }
}

impl From<u64> for EntityId {
  fn from(raw: u64) -> Self {
    EntityId(raw)
  }
}

/// Identifier of a mind (an external controller attached to an entity).
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  PartialOrd,
  Ord,
  Hash,
  Serialize,
  Deserialize,
)]
pub struct MindId(pub u64);

impl fmt::Display for MindId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

pub mod prelude {
  pub use crate::builder::EntityBuilder;
  pub use crate::config::Config;
  pub use crate::domain::DomainKind;
  pub use crate::element::Element;
  pub use crate::entity::{Entity, EntityFlags};
  pub use crate::geometry::{AxisBox, Location};
  pub use crate::minds::Mind;
  pub use crate::ops::{OpArg, OpClass, OpVector, Operation};
  pub use crate::persistence::PersistenceManager;
  pub use crate::property::{Modifier, ModifierKind, PropFlags};
  pub use crate::router::RouterResult;
  pub use crate::store::StoreHandle;
  pub use crate::typeinfo::TypeRegistry;
  pub use crate::world::World;
  pub use crate::{EntityId, MindId};
}
