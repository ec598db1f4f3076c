//! The ordered output of resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;

use crate::formula::Package;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
  Build,
  /// Already recorded in the ledger at the selected version.
  Skip,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
  pub name: String,
  pub version: String,
  #[serde(skip)]
  pub package: Arc<Package>,
  pub action: PlanAction,
  /// In-plan build-time dependencies.
  pub build_deps: BTreeSet<String>,
  /// In-plan runtime dependencies.
  pub runtime_deps: BTreeSet<String>,
  /// Named on the command line rather than pulled in as a dependency.
  pub requested: bool,
}

impl PlanEntry {
  /// Every in-plan dependency regardless of kind.
  pub fn dependencies(&self) -> impl Iterator<Item = &str> {
    self.build_deps.union(&self.runtime_deps).map(String::as_str)
  }
}

/// Entries in dependency order: every dependency precedes its dependents.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildPlan {
  entries: Vec<PlanEntry>,
  #[serde(skip)]
  positions: HashMap<String, usize>,
}

impl BuildPlan {
  pub(super) fn new(entries: Vec<PlanEntry>) -> Self {
    let positions = entries.iter().enumerate().map(|(i, e)| (e.name.clone(), i)).collect();
    Self { entries, positions }
  }

  pub fn entries(&self) -> &[PlanEntry] {
    &self.entries
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, name: &str) -> Option<&PlanEntry> {
    self.positions.get(name).map(|&i| &self.entries[i])
  }

  pub fn position(&self, name: &str) -> Option<usize> {
    self.positions.get(name).copied()
  }

  pub fn names(&self) -> Vec<&str> {
    self.entries.iter().map(|e| e.name.as_str()).collect()
  }

  pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
    self.get(name).map(|e| e.dependencies().collect()).unwrap_or_default()
  }

  /// Entries that depend directly on `name`, in plan order.
  pub fn dependents_of(&self, name: &str) -> Vec<&str> {
    self
      .entries
      .iter()
      .filter(|e| e.build_deps.contains(name) || e.runtime_deps.contains(name))
      .map(|e| e.name.as_str())
      .collect()
  }

  /// Number of entries that will actually be built.
  pub fn build_count(&self) -> usize {
    self.entries.iter().filter(|e| e.action == PlanAction::Build).count()
  }

  /// Group entries into levels that could run side by side.
  ///
  /// An entry's level is one past the deepest of its dependencies.
  pub fn waves(&self) -> Vec<Vec<&PlanEntry>> {
    let mut levels: HashMap<&str, usize> = HashMap::new();
    let mut waves: Vec<Vec<&PlanEntry>> = Vec::new();

    for entry in &self.entries {
      let level = entry
        .dependencies()
        .filter_map(|dep| levels.get(dep))
        .map(|l| l + 1)
        .max()
        .unwrap_or(0);
      levels.insert(entry.name.as_str(), level);
      if waves.len() <= level {
        waves.resize_with(level + 1, Vec::new);
      }
      waves[level].push(entry);
    }

    waves
  }

  /// `name -> version` for every entry.
  pub fn versions(&self) -> BTreeMap<&str, &str> {
    self
      .entries
      .iter()
      .map(|e| (e.name.as_str(), e.version.as_str()))
      .collect()
  }
}
