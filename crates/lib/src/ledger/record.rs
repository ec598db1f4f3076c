//! The persisted install record.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::consts::LEDGER_FORMAT_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
  NotRun,
  Passed,
  Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallSource {
  Bottle,
  Source,
}

/// What was installed, where its files are and what it was built against.
///
/// Written once, after the package reached `Installed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
  pub format_version: u32,
  pub name: String,
  pub version: String,
  /// Absolute paths of every file and symlink in the keg, sorted.
  pub manifest: Vec<PathBuf>,
  /// `name -> version` of runtime dependencies.
  pub runtime_dependencies: BTreeMap<String, String>,
  /// `name -> version` of build dependencies.
  pub build_dependencies: BTreeMap<String, String>,
  pub test_outcome: TestOutcome,
  /// Seconds since the Unix epoch.
  pub installed_at: u64,
  pub source: InstallSource,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub post_install_warning: Option<String>,
  /// `name -> sha256` of resources vendored into the keg.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub resources: BTreeMap<String, String>,
  /// Hash of the vendor directory right after staging.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub vendor_hash: Option<String>,
}

impl InstallRecord {
  pub fn new(name: impl Into<String>, version: impl Into<String>, source: InstallSource) -> Self {
    Self {
      format_version: LEDGER_FORMAT_VERSION,
      name: name.into(),
      version: version.into(),
      manifest: Vec::new(),
      runtime_dependencies: BTreeMap::new(),
      build_dependencies: BTreeMap::new(),
      test_outcome: TestOutcome::NotRun,
      installed_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      source,
      post_install_warning: None,
      resources: BTreeMap::new(),
      vendor_hash: None,
    }
  }

  /// Check the fields that must hold for any record we wrote.
  pub(super) fn consistency_problem(&self, name: &str, version: &str) -> Option<String> {
    if self.format_version != LEDGER_FORMAT_VERSION {
      return Some(format!("unsupported format version {}", self.format_version));
    }
    if self.name != name || self.version != version {
      return Some(format!(
        "record describes {}@{} but is stored as {name}@{version}",
        self.name, self.version
      ));
    }
    if let Some(relative) = self.manifest.iter().find(|p| !p.is_absolute()) {
      return Some(format!("manifest entry {} is not absolute", relative.display()));
    }
    if self.manifest.windows(2).any(|w| w[0] >= w[1]) {
      return Some("manifest is not sorted".to_string());
    }
    None
  }
}
