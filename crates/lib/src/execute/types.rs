//! Types for package execution.
//!
//! The per-package state machine, failure reasons, per-package outcomes
//! and the configuration knobs for a run.

use std::fmt;

use serde::Serialize;

use crate::error::ErrorKind;
use crate::ledger::InstallRecord;
use crate::store::RetryPolicy;

/// Lifecycle of one package in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum PackageState {
  Pending,
  Fetching,
  Verifying,
  Staging,
  Building,
  Installing,
  PostInstalling,
  Testing,
  Installed,
  Failed(FailureReason),
}

impl PackageState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, PackageState::Installed | PackageState::Failed(_))
  }

  pub fn name(&self) -> &'static str {
    match self {
      PackageState::Pending => "pending",
      PackageState::Fetching => "fetching",
      PackageState::Verifying => "verifying",
      PackageState::Staging => "staging",
      PackageState::Building => "building",
      PackageState::Installing => "installing",
      PackageState::PostInstalling => "post_installing",
      PackageState::Testing => "testing",
      PackageState::Installed => "installed",
      PackageState::Failed(_) => "failed",
    }
  }
}

impl fmt::Display for PackageState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PackageState::Failed(reason) => write!(f, "failed: {reason}"),
      other => f.write_str(other.name()),
    }
  }
}

/// Why a package ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FailureReason {
  ChecksumMismatch { url: String, expected: String, actual: String },
  Fetch { url: String, message: String },
  ResourceStage { resource: String, message: String },
  BuildCommand { step: usize, code: Option<i32>, message: String },
  DependencyFailed { dependency: String },
  Cancelled,
  Ledger { message: String },
  Io { message: String },
  Internal { message: String },
}

impl FailureReason {
  pub fn kind(&self) -> ErrorKind {
    match self {
      FailureReason::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
      FailureReason::Fetch { .. } => ErrorKind::Fetch,
      FailureReason::ResourceStage { .. } => ErrorKind::ResourceStage,
      FailureReason::BuildCommand { .. } => ErrorKind::BuildCommand,
      FailureReason::DependencyFailed { .. } => ErrorKind::DependencyFailed,
      FailureReason::Cancelled => ErrorKind::Cancelled,
      FailureReason::Ledger { .. } => ErrorKind::LedgerCorruption,
      FailureReason::Io { .. } => ErrorKind::Io,
      FailureReason::Internal { .. } => ErrorKind::Internal,
    }
  }
}

impl fmt::Display for FailureReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      FailureReason::ChecksumMismatch { url, expected, actual } => {
        write!(f, "checksum mismatch for {url}: expected {expected}, got {actual}")
      }
      FailureReason::Fetch { url, message } => write!(f, "fetching {url} failed: {message}"),
      FailureReason::ResourceStage { resource, message } => write!(f, "resource {resource}: {message}"),
      FailureReason::BuildCommand { message, .. } => f.write_str(message),
      FailureReason::DependencyFailed { dependency } => write!(f, "dependency {dependency} failed"),
      FailureReason::Cancelled => f.write_str("cancelled"),
      FailureReason::Ledger { message } | FailureReason::Io { message } | FailureReason::Internal { message } => {
        f.write_str(message)
      }
    }
  }
}

/// What happened to one plan entry.
#[derive(Debug, Clone, Serialize)]
pub struct PackageOutcome {
  pub name: String,
  pub version: String,
  /// Every state entered, in order, starting with `Pending`.
  pub transitions: Vec<PackageState>,
  /// Non-fatal problems such as a failed post-install step.
  pub warnings: Vec<String>,
  /// The committed record for packages that reached `Installed`.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub record: Option<InstallRecord>,
  /// Already installed and intact, nothing was done.
  pub skipped: bool,
}

impl PackageOutcome {
  pub fn new(name: &str, version: &str) -> Self {
    Self {
      name: name.to_string(),
      version: version.to_string(),
      transitions: vec![PackageState::Pending],
      warnings: Vec::new(),
      record: None,
      skipped: false,
    }
  }

  pub fn state(&self) -> &PackageState {
    self.transitions.last().unwrap_or(&PackageState::Pending)
  }

  pub fn is_installed(&self) -> bool {
    matches!(self.state(), PackageState::Installed)
  }

  pub fn failure(&self) -> Option<&FailureReason> {
    match self.state() {
      PackageState::Failed(reason) => Some(reason),
      _ => None,
    }
  }

  /// Whether the package ever entered `state`.
  pub fn visited(&self, state: &PackageState) -> bool {
    self.transitions.iter().any(|s| s.name() == state.name())
  }
}

/// Outcomes of a whole run, in plan order.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
  pub outcomes: Vec<PackageOutcome>,
}

impl RunReport {
  pub fn get(&self, name: &str) -> Option<&PackageOutcome> {
    self.outcomes.iter().find(|o| o.name == name)
  }

  pub fn is_success(&self) -> bool {
    self.outcomes.iter().all(PackageOutcome::is_installed)
  }

  pub fn installed(&self) -> impl Iterator<Item = &PackageOutcome> {
    self.outcomes.iter().filter(|o| o.is_installed() && !o.skipped)
  }

  pub fn failed(&self) -> impl Iterator<Item = &PackageOutcome> {
    self.outcomes.iter().filter(|o| o.failure().is_some())
  }
}

#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of packages in flight.
  pub parallelism: usize,
  /// Ignore bottles and always build from source.
  pub force_source: bool,
  /// Run test steps after install.
  pub run_tests: bool,
  /// Shell for `shell` steps; `/bin/sh` when unset.
  pub shell: Option<String>,
  pub retry: RetryPolicy,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      force_source: false,
      run_tests: false,
      shell: None,
      retry: RetryPolicy::default(),
    }
  }
}

fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
