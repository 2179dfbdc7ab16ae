//! Spatial primitives: axis-aligned boxes, locations, and their wire forms.

use glam::{DQuat, DVec3};
use serde::{Deserialize, Serialize};

use crate::element::Element;

/// An axis-aligned box in entity-local space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisBox {
  pub min: DVec3,
  pub max: DVec3,
}

impl AxisBox {
  pub fn new(min: DVec3, max: DVec3) -> Self {
    Self { min, max }
  }

  /// The symmetric unit box `[-1,-1,-1]..[1,1,1]`.
  pub fn unit() -> Self {
    Self::new(DVec3::splat(-1.0), DVec3::splat(1.0))
  }

  pub fn size(&self) -> DVec3 {
    self.max - self.min
  }

  pub fn center(&self) -> DVec3 {
    (self.min + self.max) * 0.5
  }

  /// Radius of the smallest sphere containing the box.
  pub fn bounding_sphere_radius(&self) -> f64 {
    self.size().length() * 0.5
  }

  /// The box grown (or shrunk) by a per-axis scale factor.
  pub fn scaled(&self, scale: DVec3) -> AxisBox {
    AxisBox::new(self.min * scale, self.max * scale)
  }
}

/// Where an entity sits inside its parent.
///
/// The parent link itself lives on the entity; this carries the spatial
/// part. `bbox` is in local space and combines with `scale` to produce the
/// world-space extent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
  pub pos: DVec3,
  pub orientation: DQuat,
  pub velocity: DVec3,
  pub bbox: Option<AxisBox>,
  pub scale: DVec3,
}

impl Default for Location {
  fn default() -> Self {
    Self {
      pos: DVec3::ZERO,
      orientation: DQuat::IDENTITY,
      velocity: DVec3::ZERO,
      bbox: None,
      scale: DVec3::ONE,
    }
  }
}

impl Location {
  /// The bbox with scale applied, if any.
  pub fn scaled_bbox(&self) -> Option<AxisBox> {
    self.bbox.map(|b| b.scaled(self.scale))
  }

  /// Bounding sphere radius of the scaled bbox; entities without a bbox
  /// occupy a nominal quarter-unit sphere.
  pub fn bounding_radius(&self) -> f64 {
    self
      .scaled_bbox()
      .map(|b| b.bounding_sphere_radius())
      .unwrap_or(0.25)
  }

  /// Encode as the self-describing location map stored in the `entities`
  /// table and sent in entity references.
  pub fn to_element(&self) -> Element {
    let mut map = std::collections::BTreeMap::new();
    map.insert("pos".to_owned(), vec3_to_element(self.pos));
    map.insert("orientation".to_owned(), quat_to_element(self.orientation));
    if self.velocity != DVec3::ZERO {
      map.insert("velocity".to_owned(), vec3_to_element(self.velocity));
    }
    if let Some(bbox) = self.bbox {
      map.insert("bbox".to_owned(), bbox_to_element(bbox));
    }
    if self.scale != DVec3::ONE {
      map.insert("scale".to_owned(), vec3_to_element(self.scale));
    }
    Element::Map(map)
  }

  /// Read back what [`Location::to_element`] wrote. Unknown keys are
  /// ignored; malformed known keys leave the field at its default.
  pub fn from_element(element: &Element) -> Location {
    let mut loc = Location::default();
    if let Some(pos) = element.get("pos").and_then(element_to_vec3) {
      loc.pos = pos;
    }
    if let Some(q) = element.get("orientation").and_then(element_to_quat) {
      loc.orientation = q;
    }
    if let Some(v) = element.get("velocity").and_then(element_to_vec3) {
      loc.velocity = v;
    }
    if let Some(b) = element.get("bbox").and_then(element_to_bbox) {
      loc.bbox = Some(b);
    }
    if let Some(s) = element.get("scale").and_then(element_to_vec3) {
      loc.scale = s;
    }
    loc
  }
}

pub fn vec3_to_element(v: DVec3) -> Element {
  Element::List(vec![v.x.into(), v.y.into(), v.z.into()])
}

pub fn element_to_vec3(e: &Element) -> Option<DVec3> {
  let list = e.as_list()?;
  if list.len() != 3 {
    return None;
  }
  Some(DVec3::new(
    list[0].as_float()?,
    list[1].as_float()?,
    list[2].as_float()?,
  ))
}

pub fn quat_to_element(q: DQuat) -> Element {
  Element::List(vec![q.x.into(), q.y.into(), q.z.into(), q.w.into()])
}

pub fn element_to_quat(e: &Element) -> Option<DQuat> {
  let list = e.as_list()?;
  if list.len() != 4 {
    return None;
  }
  Some(DQuat::from_xyzw(
    list[0].as_float()?,
    list[1].as_float()?,
    list[2].as_float()?,
    list[3].as_float()?,
  ))
}

/// Boxes travel as a flat six-float corner list, `[min…, max…]`.
pub fn bbox_to_element(b: AxisBox) -> Element {
  Element::List(vec![
    b.min.x.into(),
    b.min.y.into(),
    b.min.z.into(),
    b.max.x.into(),
    b.max.y.into(),
    b.max.z.into(),
  ])
}

pub fn element_to_bbox(e: &Element) -> Option<AxisBox> {
  let list = e.as_list()?;
  if list.len() != 6 {
    return None;
  }
  let mut c = [0.0; 6];
  for (slot, el) in c.iter_mut().zip(list) {
    *slot = el.as_float()?;
  }
  Some(AxisBox::new(
    DVec3::new(c[0], c[1], c[2]),
    DVec3::new(c[3], c[4], c[5]),
  ))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bbox_sphere() {
    let b = AxisBox::unit();
    assert!((b.bounding_sphere_radius() - 3.0f64.sqrt()).abs() < 1e-9);
  }

  #[test]
  fn location_roundtrip() {
    let loc = Location {
      pos: DVec3::new(1.0, 2.0, 3.0),
      orientation: DQuat::from_xyzw(0.0, 1.0, 0.0, 0.0),
      velocity: DVec3::new(0.5, 0.0, 0.0),
      bbox: Some(AxisBox::unit()),
      scale: DVec3::new(2.0, 2.0, 2.0),
    };
    let back = Location::from_element(&loc.to_element());
    assert_eq!(loc, back);
  }

  #[test]
  fn malformed_vectors_rejected() {
    assert!(element_to_vec3(&Element::List(vec![1.0.into()])).is_none());
    assert!(element_to_vec3(&Element::from("nope")).is_none());
  }
}
