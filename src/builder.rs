//! Building entities into the world.
//!
//! Obtained from [`World::spawn`]; attributes staged on the builder are
//! installed, applied and announced in one step when `build` is called.

use glam::DVec3;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::element::Element;
use crate::entity::{Entity, EntityFlags, CLEAN_MASK};
use crate::geometry::{bbox_to_element, vec3_to_element, AxisBox};
use crate::ops::OpVector;
use crate::router::OpError;
use crate::world::{World, WorldSignal};
use crate::EntityId;

/// Stages a new entity: its type, parent, and initial attributes.
#[must_use = "does nothing until .build() is called"]
pub struct EntityBuilder<'w> {
  world: &'w mut World,
  type_name: SmolStr,
  explicit_id: Option<EntityId>,
  stable_id: Option<String>,
  parent: Option<EntityId>,
  attrs: Vec<(SmolStr, Element)>,
  ephemeral: bool,
  restored: bool,
}

impl<'w> EntityBuilder<'w> {
  pub(crate) fn new(world: &'w mut World, type_name: &str) -> Self {
    Self {
      world,
      type_name: SmolStr::new(type_name),
      explicit_id: None,
      stable_id: None,
      parent: None,
      attrs: Vec::new(),
      ephemeral: false,
      restored: false,
    }
  }

  /// Use a fixed id instead of allocating one. Restore plumbing.
  pub fn id(mut self, id: EntityId) -> Self {
    self.explicit_id = Some(id);
    self
  }

  pub fn stable_id(mut self, stable_id: impl Into<String>) -> Self {
    self.stable_id = Some(stable_id.into());
    self
  }

  /// Attach under this parent; the world root if never called.
  pub fn parent(mut self, parent: EntityId) -> Self {
    self.parent = Some(parent);
    self
  }

  /// Stage an initial attribute. Applied in the order given, after type
  /// defaults.
  pub fn attr(mut self, name: &str, value: impl Into<Element>) -> Self {
    self.attrs.push((SmolStr::new(name), value.into()));
    self
  }

  pub fn pos(self, pos: DVec3) -> Self {
    self.attr("pos", vec3_to_element(pos))
  }

  pub fn bbox(self, bbox: AxisBox) -> Self {
    self.attr("bbox", bbox_to_element(bbox))
  }

  /// Never persist this entity.
  pub fn ephemeral(mut self) -> Self {
    self.ephemeral = true;
    self
  }

  /// Materialize from the store: keep the given id, skip type defaults
  /// (the restore pass applies properties itself) and start clean.
  pub(crate) fn restored(mut self) -> Self {
    self.restored = true;
    self
  }

  /// Insert the entity into the world. Fails with
  /// [`OpError::TypeUnresolved`] when the type is not loaded, so callers
  /// can park and retry.
  pub fn build(self) -> Result<EntityId, OpError> {
    let Self {
      world,
      type_name,
      explicit_id,
      stable_id,
      parent,
      attrs,
      ephemeral,
      restored,
    } = self;

    if !world.types().contains(&type_name) {
      return Err(OpError::TypeUnresolved(type_name));
    }

    let id = match explicit_id {
      Some(id) => {
        if world.entities().contains(id) {
          return Err(OpError::InvalidOperation(format!(
            "entity id {id} already in use"
          )));
        }
        id
      }
      None => world.entities_mut().allocate_id(),
    };
    let parent = parent.unwrap_or(EntityId::ROOT);
    if !world.entities().contains(parent) {
      return Err(OpError::InvalidOperation(format!(
        "parent {parent} does not exist"
      )));
    }

    let mut entity = Entity::new(id, type_name.clone());
    entity.stable_id =
      Some(stable_id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    entity.parent = Some(parent);
    if ephemeral {
      entity.flags.insert(EntityFlags::EPHEMERAL);
    }
    if restored {
      entity.flags.insert(CLEAN_MASK);
    } else {
      let defaults = world
        .types()
        .effective_defaults(&type_name)
        .map_err(|e| OpError::InvalidOperation(e.to_string()))?;
      for (name, value) in defaults {
        entity.install_class_default(&name, value);
      }
    }
    for (name, value) in &attrs {
      entity.set_property(name, value.clone());
    }

    world.entities_mut().insert(entity);
    if let Some(p) = world.entities_mut().get_mut(parent) {
      p.children.insert(id);
    }

    let mut res = OpVector::new();
    world.apply_all_properties(id, &mut res);

    if !restored {
      world.attach_to_domain(parent, id, &mut res);
    }
    world.signal(WorldSignal::Inserted(id));
    world.enqueue_all(res);
    Ok(id)
  }
}
