//! Per-entity attributes: flagged values with modifier chains.
//!
//! A property is plain data. Names with special behavior (`mode`, `bbox`,
//! `__container_access`, …) get it from the apply hooks in the world module;
//! there is exactly one level of dispatch and no deeper chains.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::element::Element;

bitflags! {
  /// Persistence and ownership flags on a property entry.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct PropFlags: u32 {
    /// Never written to the store.
    const EPHEM = 1 << 0;
    /// In sync with the store.
    const CLEAN = 1 << 1;
    /// A row for this property exists in the store.
    const SEEN = 1 << 2;
    /// Owned by the entity, not shared with type defaults.
    const INSTANCE = 1 << 3;
    /// Owned by the type; entities read it through the fall-through chain.
    const CLASS_DEFAULT = 1 << 4;
  }
}

/// How a modifier folds its operand into the value below it.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum ModifierKind {
  Add,
  Subtract,
  Prepend,
  Append,
  Multiply,
  /// Supplies the value only when the base is none.
  Default,
}

/// A layered transformation on top of a property's base value.
///
/// Chains apply strictly in registration order; two modifiers of the same
/// kind are not reordered or merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Modifier {
  pub kind: ModifierKind,
  pub operand: Element,
}

impl Modifier {
  pub fn new(kind: ModifierKind, operand: impl Into<Element>) -> Self {
    Self {
      kind,
      operand: operand.into(),
    }
  }

  /// Fold this modifier into `value`. Kind mismatches leave the value
  /// untouched and are reported by the caller.
  fn fold(&self, value: Element) -> Result<Element, Element> {
    match self.kind {
      ModifierKind::Default => {
        if value.is_none() {
          Ok(self.operand.clone())
        } else {
          Ok(value)
        }
      }
      ModifierKind::Add | ModifierKind::Subtract => {
        let sign = if self.kind == ModifierKind::Add { 1.0 } else { -1.0 };
        match (&value, &self.operand) {
          (Element::Int(a), Element::Int(b)) => {
            Ok(Element::Int(a + (sign as i64) * b))
          }
          _ => match (value.as_float(), self.operand.as_float()) {
            (Some(a), Some(b)) => Ok(Element::Float(a + sign * b)),
            _ => Err(value),
          },
        }
      }
      ModifierKind::Multiply => match (&value, &self.operand) {
        (Element::Int(a), Element::Int(b)) => Ok(Element::Int(a * b)),
        _ => match (value.as_float(), self.operand.as_float()) {
          (Some(a), Some(b)) => Ok(Element::Float(a * b)),
          _ => Err(value),
        },
      },
      ModifierKind::Prepend | ModifierKind::Append => {
        let prepend = self.kind == ModifierKind::Prepend;
        match (value, &self.operand) {
          (Element::String(s), Element::String(o)) => {
            Ok(Element::String(if prepend {
              format!("{o}{s}")
            } else {
              format!("{s}{o}")
            }))
          }
          (Element::List(mut l), Element::List(o)) => {
            if prepend {
              let mut out = o.clone();
              out.append(&mut l);
              Ok(Element::List(out))
            } else {
              l.extend(o.iter().cloned());
              Ok(Element::List(l))
            }
          }
          (other, _) => Err(other),
        }
      }
    }
  }
}

/// Combine a base value with a modifier chain into the effective value.
pub fn combine(base: &Element, modifiers: &[Modifier]) -> Element {
  let mut value = base.clone();
  for modifier in modifiers {
    match modifier.fold(value) {
      Ok(next) => value = next,
      Err(unchanged) => {
        tracing::warn!(
          kind = ?modifier.kind,
          operand = modifier.operand.kind(),
          value = unchanged.kind(),
          "modifier kind mismatch, skipping"
        );
        value = unchanged;
      }
    }
  }
  value
}

/// A property slot on an entity.
///
/// `base` is what writers set and what persists; `value` is what readers
/// see. The two differ only when modifiers are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
  value: Element,
  base: Element,
  pub flags: PropFlags,
  modifiers: Vec<Modifier>,
}

impl PropertyEntry {
  pub fn new(value: Element) -> Self {
    Self {
      base: value.clone(),
      value,
      flags: PropFlags::INSTANCE,
      modifiers: Vec::new(),
    }
  }

  pub fn with_flags(value: Element, flags: PropFlags) -> Self {
    Self {
      base: value.clone(),
      value,
      flags,
      modifiers: Vec::new(),
    }
  }

  /// The effective (post-modifier) value.
  pub fn value(&self) -> &Element {
    &self.value
  }

  /// The pre-modifier value. This is what the store records when modifiers
  /// are attached, so they can be re-derived on restore.
  pub fn base_value(&self) -> &Element {
    &self.base
  }

  pub fn has_modifiers(&self) -> bool {
    !self.modifiers.is_empty()
  }

  pub fn modifiers(&self) -> &[Modifier] {
    &self.modifiers
  }

  /// Set the base value, preserving any modifier chain, and mark the entry
  /// out of sync with the store.
  pub fn set(&mut self, value: Element) {
    self.base = value;
    self.recompute();
    self.flags.remove(PropFlags::CLEAN);
  }

  /// Attach a modifier at the end of the chain. Returns its position, which
  /// stays valid until an earlier modifier is removed.
  pub fn add_modifier(&mut self, modifier: Modifier) -> usize {
    self.modifiers.push(modifier);
    self.recompute();
    self.flags.remove(PropFlags::CLEAN);
    self.modifiers.len() - 1
  }

  pub fn remove_modifier(&mut self, index: usize) -> Option<Modifier> {
    if index >= self.modifiers.len() {
      return None;
    }
    let removed = self.modifiers.remove(index);
    self.recompute();
    self.flags.remove(PropFlags::CLEAN);
    Some(removed)
  }

  fn recompute(&mut self) {
    self.value = if self.modifiers.is_empty() {
      self.base.clone()
    } else {
      combine(&self.base, &self.modifiers)
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn chain_applies_in_registration_order() {
    let mut entry = PropertyEntry::new(Element::Int(10));
    entry.add_modifier(Modifier::new(ModifierKind::Add, 5i64));
    entry.add_modifier(Modifier::new(ModifierKind::Multiply, 2i64));
    assert_eq!(entry.value(), &Element::Int(30));
    assert_eq!(entry.base_value(), &Element::Int(10));

    // Writers preserve the chain.
    entry.set(Element::Int(1));
    assert_eq!(entry.value(), &Element::Int(12));
  }

  #[test]
  fn default_modifier_only_fills_none() {
    let combined = combine(
      &Element::None,
      &[Modifier::new(ModifierKind::Default, "fallback")],
    );
    assert_eq!(combined, Element::from("fallback"));

    let kept = combine(
      &Element::from("real"),
      &[Modifier::new(ModifierKind::Default, "fallback")],
    );
    assert_eq!(kept, Element::from("real"));
  }

  #[test]
  fn append_on_lists_and_strings() {
    let l = combine(
      &Element::List(vec![1i64.into()]),
      &[Modifier::new(
        ModifierKind::Append,
        Element::List(vec![2i64.into()]),
      )],
    );
    assert_eq!(l, Element::List(vec![1i64.into(), 2i64.into()]));

    let s = combine(
      &Element::from("head"),
      &[Modifier::new(ModifierKind::Prepend, "fore")],
    );
    assert_eq!(s, Element::from("forehead"));
  }

  #[test]
  fn mismatched_modifier_is_skipped() {
    let out = combine(
      &Element::from("text"),
      &[Modifier::new(ModifierKind::Add, 1i64)],
    );
    assert_eq!(out, Element::from("text"));
  }

  #[test]
  fn set_clears_clean() {
    let mut entry = PropertyEntry::with_flags(
      Element::Int(1),
      PropFlags::INSTANCE | PropFlags::CLEAN | PropFlags::SEEN,
    );
    entry.set(Element::Int(2));
    assert!(!entry.flags.contains(PropFlags::CLEAN));
    assert!(entry.flags.contains(PropFlags::SEEN));
  }
}
