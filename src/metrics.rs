//! A small registry of named process metrics.
//!
//! Subsystems publish counters and gauges here; the server surface exposes
//! the snapshot. Names follow the `family{label="value"}` convention.

use indexmap::IndexMap;
use smol_str::SmolStr;

#[derive(Default)]
pub struct Metrics {
  values: IndexMap<SmolStr, i64>,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&mut self, name: &str, value: i64) {
    self.values.insert(SmolStr::new(name), value);
  }

  pub fn add(&mut self, name: &str, delta: i64) {
    *self.values.entry(SmolStr::new(name)).or_insert(0) += delta;
  }

  pub fn get(&self, name: &str) -> i64 {
    self.values.get(name).copied().unwrap_or(0)
  }

  /// All metrics in registration order.
  pub fn snapshot(&self) -> impl Iterator<Item = (&str, i64)> {
    self.values.iter().map(|(k, v)| (k.as_str(), *v))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn counters_accumulate() {
    let mut m = Metrics::new();
    m.add("storage_entity_inserts", 2);
    m.add("storage_entity_inserts", 3);
    m.set("storage_qps{qtype=\"inserts\",t=\"1\"}", 7);
    assert_eq!(m.get("storage_entity_inserts"), 5);
    assert_eq!(m.get("storage_qps{qtype=\"inserts\",t=\"1\"}"), 7);
    assert_eq!(m.get("absent"), 0);
  }
}
