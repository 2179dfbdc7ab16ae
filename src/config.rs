//! Server configuration: KDL files with environment overrides.
//!
//! ```kdl
//! paths { data "./data"; shared "/usr/share/weald" }
//! database { connection "weald.store" }
//! world { ruleset "basic"; time-scale 1.0 }
//! net { host "0.0.0.0"; port 6767 }
//! ops { tick-budget 100; flush-batch 32 }
//! ```
//!
//! Any value can be overridden from the environment as
//! `section__key=value`, e.g. `net__port=7000`.

use std::path::{Path, PathBuf};

use kdl::{KdlDocument, KdlNode};
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
  pub paths: PathsConfig,
  pub database: DatabaseConfig,
  pub world: WorldConfig,
  pub net: NetConfig,
  pub ops: OpsConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathsConfig {
  pub data: PathBuf,
  pub shared: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
  /// Path of the store file.
  pub connection: String,
  pub schema: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldConfig {
  pub ruleset: String,
  pub time_scale: f64,
  pub initial_map: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetConfig {
  pub host: String,
  pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpsConfig {
  /// Operations routed per tick.
  pub tick_budget: usize,
  /// Dirty entities flushed per persistence tick.
  pub flush_batch: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      paths: PathsConfig {
        data: PathBuf::from("./data"),
        shared: PathBuf::from("/usr/share/weald"),
      },
      database: DatabaseConfig {
        connection: "weald.store".to_owned(),
        schema: "world".to_owned(),
      },
      world: WorldConfig {
        ruleset: "basic".to_owned(),
        time_scale: 1.0,
        initial_map: None,
      },
      net: NetConfig {
        host: "0.0.0.0".to_owned(),
        port: 6767,
      },
      ops: OpsConfig {
        tick_budget: 100,
        flush_batch: 32,
      },
    }
  }
}

impl Config {
  pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
      .map_err(|err| ConfigError::Io(path.display().to_string(), err))?;
    let mut config = Config::from_str(&text)?;
    config.apply_env(std::env::vars())?;
    Ok(config)
  }

  pub fn from_str(text: &str) -> Result<Config, ConfigError> {
    let doc: KdlDocument = text.parse()?;
    let mut config = Config::default();
    for section in doc.nodes() {
      let name = section.name().value();
      let Some(children) = section.children() else {
        return Err(ConfigError::NotASection(name.to_owned()));
      };
      for node in children.nodes() {
        let key = node.name().value().replace('-', "_");
        let value = first_arg_string(node).ok_or_else(|| {
          ConfigError::MissingValue(name.to_owned(), key.clone())
        })?;
        config.set(name, &key, &value)?;
      }
    }
    Ok(config)
  }

  /// Apply `section__key=value` overrides.
  pub fn apply_env(
    &mut self,
    vars: impl Iterator<Item = (String, String)>,
  ) -> Result<(), ConfigError> {
    for (name, value) in vars {
      let Some((section, key)) = name.split_once("__") else {
        continue;
      };
      if section.is_empty() || key.is_empty() {
        continue;
      }
      match self.set(section, key, &value) {
        Ok(()) => {}
        // Unrelated environment noise that happens to contain a double
        // underscore is not an error; bad values for known keys are.
        Err(ConfigError::UnknownKey(..)) | Err(ConfigError::UnknownSection(..)) => {}
        Err(other) => return Err(other),
      }
    }
    Ok(())
  }

  fn set(
    &mut self,
    section: &str,
    key: &str,
    value: &str,
  ) -> Result<(), ConfigError> {
    let bad = |key: &str, value: &str| {
      ConfigError::BadValue(
        section.to_owned(),
        key.to_owned(),
        value.to_owned(),
      )
    };
    match (section, key) {
      ("paths", "data") => self.paths.data = PathBuf::from(value),
      ("paths", "shared") => self.paths.shared = PathBuf::from(value),
      ("database", "connection") => {
        self.database.connection = value.to_owned()
      }
      ("database", "schema") => self.database.schema = value.to_owned(),
      ("world", "ruleset") => self.world.ruleset = value.to_owned(),
      ("world", "time_scale") => {
        self.world.time_scale =
          value.parse().map_err(|_| bad(key, value))?
      }
      ("world", "initial_map") => {
        self.world.initial_map = Some(value.to_owned())
      }
      ("net", "host") => self.net.host = value.to_owned(),
      ("net", "port") => {
        self.net.port = value.parse().map_err(|_| bad(key, value))?
      }
      ("ops", "tick_budget") => {
        self.ops.tick_budget = value.parse().map_err(|_| bad(key, value))?
      }
      ("ops", "flush_batch") => {
        self.ops.flush_batch = value.parse().map_err(|_| bad(key, value))?
      }
      ("paths" | "database" | "world" | "net" | "ops", _) => {
        return Err(ConfigError::UnknownKey(
          section.to_owned(),
          key.to_owned(),
        ))
      }
      _ => return Err(ConfigError::UnknownSection(section.to_owned())),
    }
    Ok(())
  }
}

fn first_arg_string(node: &KdlNode) -> Option<String> {
  let entry = node.entries().iter().find(|e| e.name().is_none())?;
  let value = entry.value();
  if let Some(s) = value.as_string() {
    Some(s.to_owned())
  } else if let Some(b) = value.as_bool() {
    Some(if b { "1" } else { "0" }.to_owned())
  } else if let Some(i) = value.as_i64() {
    Some(i.to_string())
  } else {
    value.as_f64().map(|f| f.to_string())
  }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
  #[error("cannot read config {0}: {1}")]
  Io(String, #[source] std::io::Error),
  #[error("config does not parse: {0}")]
  #[diagnostic(transparent)]
  Parse(#[from] kdl::KdlError),
  #[error("top-level config node {0} is not a section")]
  NotASection(String),
  #[error("config key {0}.{1} has no value")]
  MissingValue(String, String),
  #[error("unknown config section {0}")]
  UnknownSection(String),
  #[error("unknown config key {0}.{1}")]
  UnknownKey(String, String),
  #[error("bad value for {0}.{1}: {2:?}")]
  BadValue(String, String, String),
}
