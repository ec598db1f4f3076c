//! Formula data model.
//!
//! A formula describes one package: its versions with their source and
//! bottle artifacts, its dependency edges, vendored resources, the recipe
//! that builds it and the optional service and test definitions. Formulas
//! are plain JSON documents; nothing in them is evaluated.

mod condition;
mod index;
mod step;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use condition::PlatformCondition;
pub use index::FormulaIndex;
pub use step::BuildStep;

use crate::error::ErrorKind;
use crate::store::ArtifactSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
  pub name: String,
  pub versions: Vec<Version>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub homepage: Option<String>,
  #[serde(default)]
  pub dependencies: Vec<Dependency>,
  #[serde(default)]
  pub resources: Vec<Resource>,
  #[serde(default)]
  pub recipe: BuildRecipe,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub service: Option<ServiceSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub test: Option<TestSpec>,
  #[serde(default)]
  pub conflicts: Vec<Conflict>,
}

impl Package {
  pub fn version(&self, version: &str) -> Option<&Version> {
    self.versions.iter().find(|v| v.version == version)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
  pub version: String,
  pub source: ArtifactSource,
  /// Precompiled artifacts keyed by bottle tag (`x86_64_linux`, `arm64_sonoma`).
  #[serde(default)]
  pub bottles: BTreeMap<String, Bottle>,
  #[serde(default)]
  pub patches: Vec<Patch>,
}

impl Version {
  /// Semver view used for constraint matching and ordering.
  pub fn semver(&self) -> Result<semver::Version, FormulaError> {
    parse_version(&self.version)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bottle {
  #[serde(flatten)]
  pub source: ArtifactSource,
}

/// A patch applied to the unpacked source before the build steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
  #[serde(flatten)]
  pub source: ArtifactSource,
  #[serde(default = "default_strip")]
  pub strip: u32,
}

fn default_strip() -> u32 {
  1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
  Build,
  Runtime,
  Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
  pub name: String,
  #[serde(default = "default_kind")]
  pub kind: DependencyKind,
  #[serde(default, skip_serializing_if = "PlatformCondition::is_always")]
  pub condition: PlatformCondition,
  /// Semver requirement such as `>=3.0, <4`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub constraint: Option<String>,
}

fn default_kind() -> DependencyKind {
  DependencyKind::Runtime
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
  pub with: String,
  pub reason: String,
}

/// A sub-dependency vendored into the package's private directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
  pub name: String,
  pub source: ArtifactSource,
  #[serde(default)]
  pub install: Vec<BuildStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRecipe {
  #[serde(default)]
  pub build: Vec<BuildStep>,
  #[serde(default)]
  pub install: Vec<BuildStep>,
  #[serde(default)]
  pub post_install: Vec<BuildStep>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
  pub steps: Vec<BuildStep>,
}

/// Daemon definition recorded for an installed package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
  pub run: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_log_path: Option<String>,
  #[serde(default)]
  pub keep_alive: bool,
  #[serde(default)]
  pub run_at_load: bool,
}

#[derive(Debug, Error)]
pub enum FormulaError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("formula '{0}' is defined more than once")]
  Duplicate(String),

  #[error("formula '{0}' declares no versions")]
  NoVersions(String),

  #[error("formula '{package}' declares version {version} twice")]
  DuplicateVersion { package: String, version: String },

  #[error("invalid version '{version}': {message}")]
  InvalidVersion { version: String, message: String },

  #[error("formula '{package}': {what} has an invalid sha256 '{sha256}'")]
  InvalidChecksum {
    package: String,
    what: String,
    sha256: String,
  },

  #[error("formula '{package}': invalid constraint '{constraint}' on '{dependency}': {message}")]
  InvalidConstraint {
    package: String,
    dependency: String,
    constraint: String,
    message: String,
  },
}

impl FormulaError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      FormulaError::Io { .. } => ErrorKind::Io,
      _ => ErrorKind::Formula,
    }
  }
}

/// Parse a formula version leniently into semver.
///
/// Missing minor or patch components are zero (`1.2` is `1.2.0`). Components
/// past the third are kept as build metadata so `2.9.7.1` stays distinct
/// from `2.9.7`. A leading `v` is ignored.
pub fn parse_version(version: &str) -> Result<semver::Version, FormulaError> {
  let invalid = |message: &str| FormulaError::InvalidVersion {
    version: version.to_string(),
    message: message.to_string(),
  };

  if let Ok(parsed) = semver::Version::parse(version) {
    return Ok(parsed);
  }

  let trimmed = version.strip_prefix('v').unwrap_or(version);
  let parts: Vec<&str> = trimmed.split('.').collect();
  if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
    return Err(invalid("empty version component"));
  }

  let mut numbers = [0u64; 3];
  for (slot, part) in numbers.iter_mut().zip(parts.iter()) {
    *slot = part.parse().map_err(|_| invalid("components must be numeric"))?;
  }

  let mut parsed = semver::Version::new(numbers[0], numbers[1], numbers[2]);
  if parts.len() > 3 {
    let extra = parts[3..].join(".");
    parsed.build = semver::BuildMetadata::new(&extra).map_err(|e| invalid(&e.to_string()))?;
  }
  Ok(parsed)
}
