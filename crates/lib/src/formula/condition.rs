//! Platform predicates on dependency edges.

use serde::{Deserialize, Serialize};

use crate::platform::Platform;
use crate::platform::arch::Arch;
use crate::platform::os::Os;

/// When a dependency edge applies.
///
/// Serialized externally tagged: `"always"`, `{"os": "linux"}`,
/// `{"not": {"os": "macos"}}`, `{"any": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformCondition {
  #[default]
  Always,
  Os(Os),
  Arch(Arch),
  Not(Box<PlatformCondition>),
  All(Vec<PlatformCondition>),
  Any(Vec<PlatformCondition>),
}

impl PlatformCondition {
  pub fn evaluate(&self, platform: &Platform) -> bool {
    match self {
      PlatformCondition::Always => true,
      PlatformCondition::Os(os) => platform.os == *os,
      PlatformCondition::Arch(arch) => platform.arch == *arch,
      PlatformCondition::Not(inner) => !inner.evaluate(platform),
      PlatformCondition::All(conds) => conds.iter().all(|c| c.evaluate(platform)),
      PlatformCondition::Any(conds) => conds.iter().any(|c| c.evaluate(platform)),
    }
  }

  pub fn is_always(&self) -> bool {
    matches!(self, PlatformCondition::Always)
  }
}
