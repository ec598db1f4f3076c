//! Installation ledger.
//!
//! The durable record of what is installed:
//!
//! ```text
//! ledger/
//! └── <name>/
//!     └── <version>.json    # InstallRecord
//! ```
//!
//! Records are written to a temp file and renamed into place, so a reader
//! sees either the previous state or the complete new record. A record that
//! cannot be parsed or contradicts its own path is reported as corruption
//! and left untouched for a human to inspect.

mod record;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub use record::{InstallRecord, InstallSource, TestOutcome};

use crate::error::ErrorKind;
use crate::platform::paths::Layout;
use crate::resolve::InstalledSet;
use crate::service::{ServiceError, ServiceRegistrar};
use crate::util::locks::KeyedLocks;

#[derive(Debug, Error)]
pub enum LedgerError {
  #[error("ledger record {path} is corrupt: {message}")]
  Corruption { path: PathBuf, message: String },

  #[error("'{0}' is not installed")]
  NotInstalled(String),

  #[error("cannot uninstall {name}: still required by {}", dependents.join(", "))]
  StillRequired { name: String, dependents: Vec<String> },

  #[error(transparent)]
  Service(#[from] ServiceError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl LedgerError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      LedgerError::Corruption { .. } => ErrorKind::LedgerCorruption,
      LedgerError::NotInstalled(_) => ErrorKind::UnknownPackage,
      LedgerError::StillRequired { .. } => ErrorKind::DependencyFailed,
      LedgerError::Service(e) => e.kind(),
      LedgerError::Io { .. } => ErrorKind::Io,
    }
  }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
  move |source| LedgerError::Io {
    path: path.to_path_buf(),
    source,
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UninstallOptions {
  /// Remove targets even when other installed packages depend on them.
  pub ignore_dependents: bool,
}

#[derive(Debug, Default)]
pub struct UninstallReport {
  /// `(name, version)` in removal order.
  pub removed: Vec<(String, String)>,
  /// Manifest files that were already gone.
  pub missing: Vec<PathBuf>,
  pub services_removed: Vec<String>,
}

/// Files of a record that are no longer on disk.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ManifestCheck {
  pub missing: Vec<PathBuf>,
}

impl ManifestCheck {
  pub fn is_intact(&self) -> bool {
    self.missing.is_empty()
  }
}

#[derive(Debug, Clone)]
pub struct Ledger {
  layout: Layout,
  locks: KeyedLocks,
}

impl Ledger {
  pub fn new(layout: Layout) -> Self {
    Self {
      layout,
      locks: KeyedLocks::new(),
    }
  }

  pub fn layout(&self) -> &Layout {
    &self.layout
  }

  fn record_path(&self, name: &str, version: &str) -> PathBuf {
    self.layout.ledger_dir().join(name).join(format!("{version}.json"))
  }

  /// Persist `record`, replacing any record for the same name and version.
  pub async fn commit(&self, record: &InstallRecord) -> Result<PathBuf, LedgerError> {
    let _guard = self.locks.lock(&record.name).await;
    let path = self.record_path(&record.name, &record.version);
    let dir = path.parent().unwrap_or(&path).to_path_buf();
    fs::create_dir_all(&dir).await.map_err(io_err(&dir))?;

    let json = serde_json::to_vec_pretty(record).map_err(|e| LedgerError::Corruption {
      path: path.clone(),
      message: e.to_string(),
    })?;
    let tmp = dir.join(format!(".{}.json.tmp", record.version));
    fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
    fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

    info!(package = %record.name, version = %record.version, files = record.manifest.len(), "install recorded");
    Ok(path)
  }

  pub async fn get(&self, name: &str, version: &str) -> Result<Option<InstallRecord>, LedgerError> {
    let path = self.record_path(name, version);
    let bytes = match fs::read(&path).await {
      Ok(bytes) => bytes,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(io_err(&path)(e)),
    };
    parse_record(&path, &bytes, name, version).map(Some)
  }

  /// Every record, ordered by name then version string.
  pub async fn installed(&self) -> Result<Vec<InstallRecord>, LedgerError> {
    let root = self.layout.ledger_dir();
    let mut names = match fs::read_dir(&root).await {
      Ok(dir) => dir,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(io_err(&root)(e)),
    };

    let mut keys = Vec::new();
    while let Some(name_entry) = names.next_entry().await.map_err(io_err(&root))? {
      let name_dir = name_entry.path();
      if !name_dir.is_dir() {
        continue;
      }
      let name = name_entry.file_name().to_string_lossy().into_owned();
      let mut versions = fs::read_dir(&name_dir).await.map_err(io_err(&name_dir))?;
      while let Some(version_entry) = versions.next_entry().await.map_err(io_err(&name_dir))? {
        let file = version_entry.file_name().to_string_lossy().into_owned();
        if file.starts_with('.') {
          continue;
        }
        if let Some(version) = file.strip_suffix(".json") {
          keys.push((name.clone(), version.to_string()));
        }
      }
    }
    keys.sort();

    let mut records = Vec::with_capacity(keys.len());
    for (name, version) in keys {
      if let Some(record) = self.get(&name, &version).await? {
        records.push(record);
      }
    }
    Ok(records)
  }

  pub async fn installed_set(&self) -> Result<InstalledSet, LedgerError> {
    let mut set = InstalledSet::new();
    for record in self.installed().await? {
      set.entry(record.name).or_default().insert(record.version);
    }
    Ok(set)
  }

  /// Every record for `name`.
  pub async fn versions_of(&self, name: &str) -> Result<Vec<InstallRecord>, LedgerError> {
    Ok(self.installed().await?.into_iter().filter(|r| r.name == name).collect())
  }

  /// Delete a record without touching the files it lists.
  pub async fn remove_record(&self, name: &str, version: &str) -> Result<bool, LedgerError> {
    let _guard = self.locks.lock(name).await;
    let path = self.record_path(name, version);
    let removed = match fs::remove_file(&path).await {
      Ok(()) => true,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
      Err(e) => return Err(io_err(&path)(e)),
    };
    if let Some(dir) = path.parent() {
      // only succeeds once the last version is gone
      let _ = fs::remove_dir(dir).await;
    }
    Ok(removed)
  }

  /// Report manifest entries missing from disk.
  pub fn verify_manifest(record: &InstallRecord) -> ManifestCheck {
    let missing = record
      .manifest
      .iter()
      .filter(|p| std::fs::symlink_metadata(p).is_err())
      .cloned()
      .collect();
    ManifestCheck { missing }
  }

  /// Remove `names`, dependents first.
  ///
  /// A bare name selects every installed version; `name@version` selects
  /// one. An installed name containing `@` (`openssl@1.1`) is taken whole.
  pub async fn uninstall(
    &self,
    names: &[String],
    options: UninstallOptions,
    services: &ServiceRegistrar,
  ) -> Result<UninstallReport, LedgerError> {
    let all = self.installed().await?;

    let mut selected: BTreeSet<(&str, &str)> = BTreeSet::new();
    for target in names {
      let matched: Vec<&InstallRecord> = match all.iter().filter(|r| r.name == *target).collect::<Vec<_>>() {
        whole if !whole.is_empty() => whole,
        _ => match target.rsplit_once('@') {
          Some((name, version)) => all.iter().filter(|r| r.name == name && r.version == version).collect(),
          None => Vec::new(),
        },
      };
      if matched.is_empty() {
        return Err(LedgerError::NotInstalled(target.clone()));
      }
      selected.extend(matched.iter().map(|r| (r.name.as_str(), r.version.as_str())));
    }

    if !options.ignore_dependents {
      for &(name, version) in &selected {
        let dependents: BTreeSet<String> = all
          .iter()
          .filter(|r| !selected.contains(&(r.name.as_str(), r.version.as_str())))
          .filter(|r| r.runtime_dependencies.get(name).is_some_and(|v| v == version))
          .map(|r| r.name.clone())
          .collect();
        if !dependents.is_empty() {
          return Err(LedgerError::StillRequired {
            name: name.to_string(),
            dependents: dependents.into_iter().collect(),
          });
        }
      }
    }

    let records: Vec<&InstallRecord> = all
      .iter()
      .filter(|r| selected.contains(&(r.name.as_str(), r.version.as_str())))
      .collect();
    let ordered = removal_order(&records);

    let mut report = UninstallReport::default();
    for record in ordered {
      self.remove_files(record, &mut report).await?;
      self.remove_record(&record.name, &record.version).await?;
      report.removed.push((record.name.clone(), record.version.clone()));
      info!(package = %record.name, version = %record.version, "uninstalled");

      // The entry goes with the keg it points at, or with the last version.
      let points_here = services
        .get(&record.name)
        .await?
        .is_some_and(|entry| entry.version == record.version);
      let remaining = self.versions_of(&record.name).await?;
      if (points_here || remaining.is_empty())
        && services.remove(&record.name).await?
        && !report.services_removed.contains(&record.name)
      {
        report.services_removed.push(record.name.clone());
      }
    }
    Ok(report)
  }

  async fn remove_files(&self, record: &InstallRecord, report: &mut UninstallReport) -> Result<(), LedgerError> {
    let mut parents = BTreeSet::new();
    for path in record.manifest.iter().rev() {
      match fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
          warn!(package = %record.name, path = %path.display(), "manifest file already missing");
          report.missing.push(path.clone());
        }
        Err(e) => return Err(io_err(path)(e)),
      }
      if let Some(parent) = path.parent() {
        parents.insert(parent.to_path_buf());
      }
    }

    parents.insert(self.layout.keg(&record.name, &record.version));
    let stop = self.layout.cellar_dir();
    // deepest first so children are pruned before their parents
    for dir in parents.iter().rev() {
      prune_empty(dir, &stop).await;
    }
    Ok(())
  }
}

fn parse_record(path: &Path, bytes: &[u8], name: &str, version: &str) -> Result<InstallRecord, LedgerError> {
  let record: InstallRecord = serde_json::from_slice(bytes).map_err(|e| LedgerError::Corruption {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;
  if let Some(message) = record.consistency_problem(name, version) {
    return Err(LedgerError::Corruption {
      path: path.to_path_buf(),
      message,
    });
  }
  Ok(record)
}

/// Remove `dir` and its ancestors while they are empty, stopping at `stop`.
async fn prune_empty(dir: &Path, stop: &Path) {
  let mut current = Some(dir);
  while let Some(dir) = current {
    if dir == stop || !dir.starts_with(stop) {
      break;
    }
    if fs::remove_dir(dir).await.is_err() {
      break;
    }
    debug!(dir = %dir.display(), "pruned empty directory");
    current = dir.parent();
  }
}

/// Order records so that anything depending on another target comes first.
fn removal_order<'a>(records: &[&'a InstallRecord]) -> Vec<&'a InstallRecord> {
  let mut remaining: BTreeMap<(&str, &str), &'a InstallRecord> = records
    .iter()
    .map(|r| ((r.name.as_str(), r.version.as_str()), *r))
    .collect();
  let mut order = Vec::with_capacity(records.len());

  while !remaining.is_empty() {
    let next = remaining
      .iter()
      .find(|(_, candidate)| {
        !remaining
          .values()
          .any(|other| other.name != candidate.name && other.runtime_dependencies.contains_key(&candidate.name))
      })
      .map(|(key, _)| *key)
      // a dependency cycle among records; fall back to name order
      .or_else(|| remaining.keys().next().copied());

    let Some(key) = next else { break };
    if let Some(record) = remaining.remove(&key) {
      order.push(record);
    }
  }
  order
}
