//! The backing store: logical row tables driven by a background thread.
//!
//! The simulation thread never blocks on storage. Writes travel as
//! [`StoreCommand`]s over an MPSC channel to the driver thread, which
//! applies them to the row tables and persists the whole store to disk as
//! a bincode file whenever its queue runs dry. Reads happen at startup
//! from the snapshot taken when the store was opened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::element::Element;

/// One row of the `entities` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRow {
  pub id: u64,
  pub parent_id: Option<u64>,
  pub type_name: String,
  pub seq: u64,
  /// Self-describing location map, bincode-encoded.
  pub location: Vec<u8>,
}

/// The three logical tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
  pub entities: BTreeMap<u64, EntityRow>,
  /// Keyed by `(entity_id, property name)`; the blob is a `{"val": …}`
  /// map, bincode-encoded.
  pub properties: BTreeMap<(u64, String), Vec<u8>>,
  pub character_account: BTreeMap<u64, String>,
}

impl StoreData {
  /// Entity rows directly under `parent`, in id order.
  pub fn children_of(&self, parent: u64) -> Vec<&EntityRow> {
    self
      .entities
      .values()
      .filter(|row| row.parent_id == Some(parent))
      .collect()
  }

  /// Property rows of one entity, in name order.
  pub fn properties_of(
    &self,
    entity: u64,
  ) -> impl Iterator<Item = (&str, &[u8])> {
    self
      .properties
      .range((entity, String::new())..(entity + 1, String::new()))
      .map(|((_, name), blob)| (name.as_str(), blob.as_slice()))
  }
}

/// Everything the driver knows how to apply.
#[derive(Debug, Clone)]
pub enum StoreCommand {
  InsertEntity(EntityRow),
  UpdateEntity {
    id: u64,
    seq: u64,
    location: Vec<u8>,
    /// `None` leaves the parent untouched (the world root has none).
    parent_id: Option<u64>,
  },
  DropEntity(u64),
  UpsertProperty {
    entity: u64,
    name: String,
    blob: Vec<u8>,
  },
  DropProperties(u64),
  LinkCharacter {
    entity: u64,
    account: String,
  },
  UnlinkCharacter {
    entity: u64,
  },
  /// Persist the tables to disk now.
  Flush,
}

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("store io: {0}")]
  Io(#[from] std::io::Error),
  #[error("store codec: {0}")]
  Codec(#[from] bincode::Error),
  #[error("store driver is gone")]
  Disconnected,
}

/// Handle held by the simulation side. Cheap to query, never blocks.
pub struct StoreHandle {
  tx: channel::Sender<StoreCommand>,
  pending: Arc<AtomicUsize>,
  data: Arc<Mutex<StoreData>>,
  driver: Option<JoinHandle<()>>,
  path: PathBuf,
}

impl StoreHandle {
  /// Open (or create) the store at `path` and start the driver thread.
  /// Returns the handle plus a snapshot of the tables as loaded, for
  /// startup restore.
  pub fn open(path: impl AsRef<Path>) -> Result<(StoreHandle, StoreData), StoreError> {
    let path = path.as_ref().to_path_buf();
    let loaded = match std::fs::read(&path) {
      Ok(bytes) => bincode::deserialize(&bytes)?,
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        StoreData::default()
      }
      Err(err) => return Err(err.into()),
    };

    let (tx, rx) = channel::unbounded::<StoreCommand>();
    let pending = Arc::new(AtomicUsize::new(0));
    let data = Arc::new(Mutex::new(loaded.clone()));

    let driver = {
      let pending = Arc::clone(&pending);
      let data = Arc::clone(&data);
      let path = path.clone();
      std::thread::spawn(move || driver_loop(rx, pending, data, path))
    };

    Ok((
      StoreHandle {
        tx,
        pending,
        data,
        driver: Some(driver),
        path,
      },
      loaded,
    ))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Queue one command for the driver.
  pub fn send(&self, command: StoreCommand) -> Result<(), StoreError> {
    self.pending.fetch_add(1, Ordering::SeqCst);
    self.tx.send(command).map_err(|_| {
      self.pending.fetch_sub(1, Ordering::SeqCst);
      StoreError::Disconnected
    })
  }

  /// Commands queued but not yet applied.
  pub fn pending_queries(&self) -> usize {
    self.pending.load(Ordering::SeqCst)
  }

  /// Current table contents. Startup/test plumbing; the driver owns the
  /// hot path.
  pub fn snapshot(&self) -> StoreData {
    self.data.lock().expect("store tables poisoned").clone()
  }

  /// Ask the driver to persist, without waiting.
  pub fn flush(&self) -> Result<(), StoreError> {
    self.send(StoreCommand::Flush)
  }

  /// Stop the driver, persisting everything first.
  pub fn shutdown(mut self) {
    drop(self.tx);
    if let Some(driver) = self.driver.take() {
      let _ = driver.join();
    }
  }
}

fn driver_loop(
  rx: channel::Receiver<StoreCommand>,
  pending: Arc<AtomicUsize>,
  data: Arc<Mutex<StoreData>>,
  path: PathBuf,
) {
  let mut dirty = false;
  loop {
    // Block for the next command; when the queue runs dry, use the lull to
    // persist.
    let command = match rx.try_recv() {
      Ok(command) => command,
      Err(channel::TryRecvError::Empty) => {
        if dirty {
          persist(&data, &path);
          dirty = false;
        }
        match rx.recv() {
          Ok(command) => command,
          Err(_) => break,
        }
      }
      Err(channel::TryRecvError::Disconnected) => break,
    };

    match command {
      StoreCommand::Flush => {
        persist(&data, &path);
        dirty = false;
      }
      other => {
        let mut tables = data.lock().expect("store tables poisoned");
        apply(&mut tables, other);
        dirty = true;
      }
    }
    pending.fetch_sub(1, Ordering::SeqCst);
  }
  if dirty {
    persist(&data, &path);
  }
}

fn apply(tables: &mut StoreData, command: StoreCommand) {
  match command {
    StoreCommand::InsertEntity(row) => {
      tables.entities.insert(row.id, row);
    }
    StoreCommand::UpdateEntity {
      id,
      seq,
      location,
      parent_id,
    } => {
      let row = tables.entities.entry(id).or_insert_with(|| EntityRow {
        id,
        parent_id: None,
        type_name: String::new(),
        seq: 0,
        location: Vec::new(),
      });
      row.seq = seq;
      row.location = location;
      if parent_id.is_some() {
        row.parent_id = parent_id;
      }
    }
    StoreCommand::DropEntity(id) => {
      tables.entities.remove(&id);
    }
    StoreCommand::UpsertProperty { entity, name, blob } => {
      tables.properties.insert((entity, name), blob);
    }
    StoreCommand::DropProperties(entity) => {
      tables
        .properties
        .retain(|(owner, _), _| *owner != entity);
    }
    StoreCommand::LinkCharacter { entity, account } => {
      tables.character_account.insert(entity, account);
    }
    StoreCommand::UnlinkCharacter { entity } => {
      tables.character_account.remove(&entity);
    }
    StoreCommand::Flush => unreachable!("flush handled by the loop"),
  }
}

fn persist(data: &Arc<Mutex<StoreData>>, path: &Path) {
  let bytes = {
    let tables = data.lock().expect("store tables poisoned");
    match bincode::serialize(&*tables) {
      Ok(bytes) => bytes,
      Err(err) => {
        tracing::error!(%err, "failed to encode store tables");
        return;
      }
    }
  };
  let tmp = path.with_extension("tmp");
  let outcome = std::fs::write(&tmp, &bytes)
    .and_then(|_| std::fs::rename(&tmp, path));
  if let Err(err) = outcome {
    tracing::error!(%err, path = %path.display(), "failed to persist store");
  }
}

/// Encode a property value as its `{"val": …}` blob.
pub fn encode_value_blob(value: &Element) -> Result<Vec<u8>, StoreError> {
  let mut map = BTreeMap::new();
  map.insert("val".to_owned(), value.clone());
  Ok(bincode::serialize(&Element::Map(map))?)
}

/// Decode a `{"val": …}` blob back to the value.
pub fn decode_value_blob(blob: &[u8]) -> Result<Element, StoreError> {
  let element: Element = bincode::deserialize(blob)?;
  match element.get("val") {
    Some(value) => Ok(value.clone()),
    None => Ok(Element::None),
  }
}

/// Encode an arbitrary element (location maps).
pub fn encode_element(value: &Element) -> Result<Vec<u8>, StoreError> {
  Ok(bincode::serialize(value)?)
}

pub fn decode_element(blob: &[u8]) -> Result<Element, StoreError> {
  Ok(bincode::deserialize(blob)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn value_blob_roundtrip() {
    let value = Element::List(vec![1.0.into(), 0.0.into(), 0.0.into()]);
    let blob = encode_value_blob(&value).unwrap();
    assert_eq!(decode_value_blob(&blob).unwrap(), value);
  }

  #[test]
  fn canonical_encoding_is_stable() {
    let value: Element = [
      ("b".to_owned(), Element::Int(2)),
      ("a".to_owned(), Element::Int(1)),
    ]
    .into_iter()
    .collect();
    let one = encode_value_blob(&value).unwrap();
    let two = encode_value_blob(&decode_value_blob(&one).unwrap()).unwrap();
    assert_eq!(one, two);
  }

  #[test]
  fn properties_range_scan() {
    let mut data = StoreData::default();
    data.properties.insert((1, "a".into()), vec![1]);
    data.properties.insert((1, "b".into()), vec![2]);
    data.properties.insert((2, "a".into()), vec![3]);
    let mine: Vec<&str> = data.properties_of(1).map(|(n, _)| n).collect();
    assert_eq!(mine, vec!["a", "b"]);
  }
}
