//! Machine-distinguishable error categories.
//!
//! Every module keeps its own error enum; [`ErrorKind`] is the shared
//! vocabulary the CLI and callers match on without caring which module
//! produced the failure.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
  Cycle,
  Conflict,
  /// Transport failure; the only retryable kind.
  Fetch,
  ChecksumMismatch,
  ResourceStage,
  BuildCommand,
  /// Recorded on the install record, never fatal.
  TestFailure,
  LedgerCorruption,
  UnknownPackage,
  UnsatisfiableConstraint,
  DependencyFailed,
  Cancelled,
  Io,
  Formula,
  Internal,
}

impl ErrorKind {
  pub fn is_retryable(self) -> bool {
    matches!(self, ErrorKind::Fetch)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ErrorKind::Cycle => "cycle",
      ErrorKind::Conflict => "conflict",
      ErrorKind::Fetch => "fetch",
      ErrorKind::ChecksumMismatch => "checksum_mismatch",
      ErrorKind::ResourceStage => "resource_stage",
      ErrorKind::BuildCommand => "build_command",
      ErrorKind::TestFailure => "test_failure",
      ErrorKind::LedgerCorruption => "ledger_corruption",
      ErrorKind::UnknownPackage => "unknown_package",
      ErrorKind::UnsatisfiableConstraint => "unsatisfiable_constraint",
      ErrorKind::DependencyFailed => "dependency_failed",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::Io => "io",
      ErrorKind::Formula => "formula",
      ErrorKind::Internal => "internal",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}
