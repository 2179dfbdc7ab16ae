//! The weald daemon: load config, open the store, restore the world, run
//! the simulation loop.

use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use eyre::WrapErr;
use tracing_subscriber::EnvFilter;

use weald::config::Config;
use weald::metrics::Metrics;
use weald::persistence::{self, PersistenceManager};
use weald::store::StoreHandle;
use weald::typeinfo::TypeRegistry;
use weald::world::World;

/// Milliseconds of simulation time per iteration.
const TICK_MS: u64 = 15;

fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let config = match load_config() {
    Ok(config) => config,
    Err(err) => {
      tracing::error!(%err, "configuration error");
      return ExitCode::from(1);
    }
  };

  let types = match load_types(&config) {
    Ok(types) => types,
    Err(err) => {
      tracing::error!(%err, "ruleset error");
      return ExitCode::from(1);
    }
  };

  let (store, snapshot) = match StoreHandle::open(&config.database.connection)
  {
    Ok(opened) => opened,
    Err(err) => {
      tracing::error!(%err, path = %config.database.connection,
        "cannot open store");
      return ExitCode::from(2);
    }
  };

  let mut world = World::new(types);
  world.set_op_budget(config.ops.tick_budget);
  let mut manager = PersistenceManager::new(store);
  manager.set_flush_batch(config.ops.flush_batch);
  let mut metrics = Metrics::new();

  let restored = match manager.restore_world(&mut world, &snapshot) {
    Ok(count) => count,
    Err(err) => {
      tracing::error!(%err, "world state is unusable");
      return ExitCode::from(3);
    }
  };
  if restored == 0 {
    persistence::init_world(&mut world);
  }
  tracing::info!(
    entities = world.entities().len(),
    host = %config.net.host,
    port = config.net.port,
    "simulation running"
  );

  let abort = AtomicBool::new(false);
  loop {
    let started = Instant::now();
    world.tick(TICK_MS);
    manager.tick(&mut world, &mut metrics);

    if let Some(message) = world.fatal_error() {
      tracing::error!(message, "irrecoverable world-state error");
      manager.shutdown(&mut world, &abort);
      manager.into_store().shutdown();
      return ExitCode::from(3);
    }

    let elapsed = started.elapsed();
    let budget = Duration::from_millis(TICK_MS);
    if elapsed < budget {
      std::thread::sleep(budget - elapsed);
    }
  }
}

fn load_config() -> eyre::Result<Config> {
  match std::env::args().nth(1) {
    Some(path) => {
      Config::load(&path).wrap_err_with(|| format!("loading {path}"))
    }
    None => {
      let mut config = Config::default();
      config.apply_env(std::env::vars())?;
      Ok(config)
    }
  }
}

fn load_types(config: &Config) -> eyre::Result<TypeRegistry> {
  let mut types = TypeRegistry::with_root();
  let ruleset_path = config
    .paths
    .data
    .join(format!("{}.kdl", config.world.ruleset));
  match std::fs::read_to_string(&ruleset_path) {
    Ok(text) => {
      types
        .load_str(&text, &ruleset_path.display().to_string())
        .map_err(|err| eyre::eyre!("{err}"))?;
    }
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
      tracing::warn!(path = %ruleset_path.display(),
        "no ruleset file, running with the base types only");
    }
    Err(err) => {
      return Err(err).wrap_err_with(|| {
        format!("reading {}", ruleset_path.display())
      });
    }
  }
  Ok(types)
}
