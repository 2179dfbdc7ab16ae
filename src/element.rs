//! The self-describing value that flows through properties, op arguments and
//! persistence blobs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A dynamically typed value.
///
/// Everything an entity can carry or an operation can mention bottoms out in
/// an `Element`. Maps are ordered so that encodings are canonical: encoding
/// the same element twice yields identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Element {
  #[default]
  None,
  Int(i64),
  Float(f64),
  String(String),
  List(Vec<Element>),
  Map(BTreeMap<String, Element>),
}

impl Element {
  /// Name of the carried kind, for diagnostics.
  pub fn kind(&self) -> &'static str {
    match self {
      Element::None => "none",
      Element::Int(_) => "int",
      Element::Float(_) => "float",
      Element::String(_) => "string",
      Element::List(_) => "list",
      Element::Map(_) => "map",
    }
  }

  pub fn is_none(&self) -> bool {
    matches!(self, Element::None)
  }

  pub fn as_int(&self) -> Option<i64> {
    match self {
      Element::Int(i) => Some(*i),
      _ => None,
    }
  }

  /// Numeric read; ints coerce to floats.
  pub fn as_float(&self) -> Option<f64> {
    match self {
      Element::Int(i) => Some(*i as f64),
      Element::Float(f) => Some(*f),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Element::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Element]> {
    match self {
      Element::List(l) => Some(l),
      _ => None,
    }
  }

  pub fn as_map(&self) -> Option<&BTreeMap<String, Element>> {
    match self {
      Element::Map(m) => Some(m),
      _ => None,
    }
  }

  /// Look up a key if this is a map.
  pub fn get(&self, key: &str) -> Option<&Element> {
    self.as_map().and_then(|m| m.get(key))
  }

  /// True when both sides are numeric and equal after coercion, or
  /// structurally equal otherwise. Used where restored values are compared
  /// against type defaults that may have been written with a different
  /// numeric kind.
  pub fn loosely_equals(&self, other: &Element) -> bool {
    match (self.as_float(), other.as_float()) {
      (Some(a), Some(b)) => a == b,
      _ => match (self, other) {
        (Element::List(a), Element::List(b)) => {
          a.len() == b.len()
            && a.iter().zip(b.iter()).all(|(x, y)| x.loosely_equals(y))
        }
        (Element::Map(a), Element::Map(b)) => {
          a.len() == b.len()
            && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
              ka == kb && va.loosely_equals(vb)
            })
        }
        _ => self == other,
      },
    }
  }
}

impl From<i64> for Element {
  fn from(v: i64) -> Self {
    Element::Int(v)
  }
}

impl From<f64> for Element {
  fn from(v: f64) -> Self {
    Element::Float(v)
  }
}

impl From<bool> for Element {
  fn from(v: bool) -> Self {
    Element::Int(v as i64)
  }
}

impl From<&str> for Element {
  fn from(v: &str) -> Self {
    Element::String(v.to_owned())
  }
}

impl From<String> for Element {
  fn from(v: String) -> Self {
    Element::String(v)
  }
}

impl From<Vec<Element>> for Element {
  fn from(v: Vec<Element>) -> Self {
    Element::List(v)
  }
}

impl From<BTreeMap<String, Element>> for Element {
  fn from(v: BTreeMap<String, Element>) -> Self {
    Element::Map(v)
  }
}

impl FromIterator<Element> for Element {
  fn from_iter<T: IntoIterator<Item = Element>>(iter: T) -> Self {
    Element::List(iter.into_iter().collect())
  }
}

impl FromIterator<(String, Element)> for Element {
  fn from_iter<T: IntoIterator<Item = (String, Element)>>(iter: T) -> Self {
    Element::Map(iter.into_iter().collect())
  }
}
