//! The type hierarchy: named types with single-parent inheritance and
//! default property values, loaded from KDL ruleset documents.
//!
//! A ruleset looks like:
//!
//! ```kdl
//! thing {
//!   solid true
//! }
//! character parent="thing" {
//!   reach 1.0
//!   perception_sight 1
//! }
//! ```
//!
//! A property lookup on an entity that has no instance value falls through
//! its type's chain, nearest ancestor first.

use ahash::AHashMap;
use indexmap::IndexMap;
use kdl::{KdlDocument, KdlNode, KdlValue};
use miette::{Diagnostic, NamedSource, SourceSpan};
use smol_str::SmolStr;
use thiserror::Error;

use crate::element::Element;

/// One type definition.
#[derive(Debug, Clone)]
pub struct TypeInfo {
  pub name: SmolStr,
  pub parent: Option<SmolStr>,
  pub defaults: IndexMap<SmolStr, Element>,
}

/// How to handle a definition when another with the same name exists.
#[derive(Debug, Clone, Copy, Default)]
pub enum MergeMode {
  /// Fold new defaults over the old ones; defaults only the old node has
  /// are kept. This is the default behavior.
  #[default]
  Merge,
  /// Completely replace the old definition.
  Clobber,
}

/// A library of every known type.
pub struct TypeRegistry {
  types: AHashMap<SmolStr, TypeInfo>,
}

impl Default for TypeRegistry {
  fn default() -> Self {
    Self::new()
  }
}

impl TypeRegistry {
  pub fn new() -> Self {
    Self {
      types: AHashMap::new(),
    }
  }

  /// A registry preloaded with the root `thing` type, which everything else
  /// ultimately inherits from.
  pub fn with_root() -> Self {
    let mut reg = Self::new();
    reg.insert(
      TypeInfo {
        name: "thing".into(),
        parent: None,
        defaults: IndexMap::new(),
      },
      MergeMode::Merge,
    );
    reg
  }

  pub fn contains(&self, name: &str) -> bool {
    self.types.contains_key(name)
  }

  pub fn get(&self, name: &str) -> Option<&TypeInfo> {
    self.types.get(name)
  }

  pub fn insert(&mut self, info: TypeInfo, merge: MergeMode) {
    match self.types.get_mut(&info.name) {
      None => {
        self.types.insert(info.name.clone(), info);
      }
      Some(old) => match merge {
        MergeMode::Clobber => *old = info,
        MergeMode::Merge => {
          if info.parent.is_some() {
            old.parent = info.parent;
          }
          for (name, value) in info.defaults {
            old.defaults.insert(name, value);
          }
        }
      },
    }
  }

  /// Insert every definition from the given KDL source.
  pub fn load_str(
    &mut self,
    src: &str,
    filename: &str,
  ) -> Result<(), RulesetParseError> {
    let doc: KdlDocument = src.parse()?;
    for node in doc.nodes() {
      let (info, merge) = parse_type_node(node, filename, src)?;
      self.insert(info, merge);
    }
    Ok(())
  }

  /// The chain from `name` to its root, nearest first.
  pub fn chain(&self, name: &str) -> Result<Vec<&TypeInfo>, TypeLookupError> {
    let mut out = Vec::new();
    let mut path: Vec<SmolStr> = Vec::new();
    let mut cursor = SmolStr::new(name);
    loop {
      let info = self.types.get(&cursor).ok_or_else(|| {
        match path.last() {
          None => TypeLookupError::TypeNotFound(cursor.clone()),
          Some(child) => {
            TypeLookupError::ParentNotFound(child.clone(), cursor.clone())
          }
        }
      })?;
      if path.contains(&info.name) {
        path.push(info.name.clone());
        return Err(TypeLookupError::InheritanceLoop(path));
      }
      path.push(info.name.clone());
      out.push(info);
      match &info.parent {
        Some(parent) => cursor = parent.clone(),
        None => return Ok(out),
      }
    }
  }

  /// First default found for `prop` walking up from `name`.
  pub fn default_for(&self, name: &str, prop: &str) -> Option<&Element> {
    let chain = self.chain(name).ok()?;
    chain.iter().find_map(|info| info.defaults.get(prop))
  }

  /// All effective defaults for `name`, child definitions overriding parent
  /// ones, in root-to-leaf declaration order.
  pub fn effective_defaults(
    &self,
    name: &str,
  ) -> Result<IndexMap<SmolStr, Element>, TypeLookupError> {
    let chain = self.chain(name)?;
    let mut out = IndexMap::new();
    for info in chain.iter().rev() {
      for (prop, value) in &info.defaults {
        out.insert(prop.clone(), value.clone());
      }
    }
    Ok(out)
  }

  /// Whether `name` is `ancestor` or inherits from it.
  pub fn is_subtype(&self, name: &str, ancestor: &str) -> bool {
    self
      .chain(name)
      .map(|chain| chain.iter().any(|info| info.name == ancestor))
      .unwrap_or(false)
  }
}

fn parse_type_node(
  node: &KdlNode,
  filename: &str,
  text: &str,
) -> Result<(TypeInfo, MergeMode), RulesetParseError> {
  let mut parent = None;
  let mut merge = None;
  for entry in node.entries() {
    let key = match entry.name() {
      Some(key) => key,
      None => {
        return Err(deser_err(
          *entry.span(),
          RulesetErrorKind::TopLevelArgument,
          filename,
          text,
        ))
      }
    };
    match key.value() {
      "parent" => match entry.value().as_string() {
        Some(p) => parent = Some(SmolStr::new(p)),
        None => {
          return Err(deser_err(
            *entry.span(),
            RulesetErrorKind::BadParent,
            filename,
            text,
          ))
        }
      },
      "merge" => {
        let mode = entry.value().as_string().and_then(|m| {
          match m.to_lowercase().as_str() {
            "merge" => Some(MergeMode::Merge),
            "clobber" => Some(MergeMode::Clobber),
            _ => None,
          }
        });
        match mode {
          Some(mode) => merge = Some(mode),
          None => {
            return Err(deser_err(
              *entry.span(),
              RulesetErrorKind::BadMerge,
              filename,
              text,
            ))
          }
        }
      }
      _ => {
        return Err(deser_err(
          *entry.span(),
          RulesetErrorKind::InvalidKey,
          filename,
          text,
        ))
      }
    }
  }

  let mut defaults = IndexMap::new();
  if let Some(children) = node.children() {
    for prop in children.nodes() {
      let value = property_node_value(prop, filename, text)?;
      defaults.insert(SmolStr::new(prop.name().value()), value);
    }
  }

  Ok((
    TypeInfo {
      name: SmolStr::new(node.name().value()),
      parent,
      defaults,
    },
    merge.unwrap_or_default(),
  ))
}

fn property_node_value(
  node: &KdlNode,
  filename: &str,
  text: &str,
) -> Result<Element, RulesetParseError> {
  let args: Vec<&KdlValue> = node
    .entries()
    .iter()
    .filter(|e| e.name().is_none())
    .map(|e| e.value())
    .collect();
  match (args.len(), node.children()) {
    (0, Some(children)) => {
      let mut map = std::collections::BTreeMap::new();
      for kid in children.nodes() {
        map.insert(
          kid.name().value().to_owned(),
          property_node_value(kid, filename, text)?,
        );
      }
      Ok(Element::Map(map))
    }
    (0, None) => {
      Err(deser_err(*node.span(), RulesetErrorKind::NoValue, filename, text))
    }
    (1, None) => Ok(value_to_element(args[0])),
    (_, None) => {
      Ok(Element::List(args.into_iter().map(value_to_element).collect()))
    }
    (_, Some(_)) => {
      Err(deser_err(
        *node.span(),
        RulesetErrorKind::MixedValue,
        filename,
        text,
      ))
    }
  }
}

fn value_to_element(value: &KdlValue) -> Element {
  if let Some(b) = value.as_bool() {
    Element::Int(b as i64)
  } else if let Some(i) = value.as_i64() {
    Element::Int(i)
  } else if let Some(f) = value.as_f64() {
    Element::Float(f)
  } else if let Some(s) = value.as_string() {
    Element::from(s)
  } else {
    Element::None
  }
}

fn deser_err(
  span: SourceSpan,
  kind: RulesetErrorKind,
  filename: &str,
  text: &str,
) -> RulesetParseError {
  RulesetParseError::Deser(RulesetDeserError {
    span,
    src: NamedSource::new(filename, text.to_owned()),
    kind,
  })
}

/// Problems when resolving a type chain.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeLookupError {
  #[error("the type {0} was not found")]
  TypeNotFound(SmolStr),
  #[error("the type {0} names parent {1} but the parent was not found")]
  ParentNotFound(SmolStr, SmolStr),
  #[error("the following inheritance loop was found: {0:?}")]
  InheritanceLoop(Vec<SmolStr>),
}

#[derive(Debug, Error, Diagnostic)]
pub enum RulesetParseError {
  #[error("error when parsing kdl: {0}")]
  #[diagnostic(transparent)]
  Parse(#[from] kdl::KdlError),
  #[error("error when turning kdl into type definitions: {0}")]
  #[diagnostic(transparent)]
  Deser(#[from] RulesetDeserError),
}

#[derive(Debug, Error, Diagnostic)]
#[error("{kind}")]
pub struct RulesetDeserError {
  #[label]
  pub span: SourceSpan,
  #[source_code]
  pub src: NamedSource,
  pub kind: RulesetErrorKind,
}

#[derive(Debug, Error)]
pub enum RulesetErrorKind {
  #[error("type node had an argument; only `parent=\"…\"` or `merge=\"…\"` are allowed")]
  TopLevelArgument,
  #[error("the `parent` key wasn't a string")]
  BadParent,
  #[error(r#"the `merge` key didn't equal "clobber" or "merge""#)]
  BadMerge,
  #[error("type node had an invalid key; only `parent` and `merge` are allowed")]
  InvalidKey,
  #[error("property node had no value")]
  NoValue,
  #[error("property node had both arguments and children")]
  MixedValue,
}
