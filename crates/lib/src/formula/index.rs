//! Loading and validating a set of formulas.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use super::{FormulaError, Package};
use crate::store::ArtifactSource;
use crate::util::hash::normalize_sha256;

/// A formula file holds either one package or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum FormulaFile {
  Many(Vec<Package>),
  One(Box<Package>),
}

/// All known formulas, keyed by package name.
#[derive(Debug, Clone, Default)]
pub struct FormulaIndex {
  packages: BTreeMap<String, Arc<Package>>,
}

impl FormulaIndex {
  /// Load formulas from a JSON file or a directory of `*.json` files.
  pub fn load(path: &Path) -> Result<Self, FormulaError> {
    let io_err = |source| FormulaError::Io {
      path: path.display().to_string(),
      source,
    };

    let mut files = Vec::new();
    if path.is_dir() {
      for entry in std::fs::read_dir(path).map_err(io_err)? {
        let entry_path = entry.map_err(io_err)?.path();
        if entry_path.extension().is_some_and(|ext| ext == "json") {
          files.push(entry_path);
        }
      }
      files.sort();
    } else {
      files.push(path.to_path_buf());
    }

    let mut packages = Vec::new();
    for file in &files {
      let content = std::fs::read_to_string(file).map_err(|source| FormulaError::Io {
        path: file.display().to_string(),
        source,
      })?;
      let parsed: FormulaFile = serde_json::from_str(&content).map_err(|source| FormulaError::Parse {
        path: file.display().to_string(),
        source,
      })?;
      match parsed {
        FormulaFile::Many(many) => packages.extend(many),
        FormulaFile::One(one) => packages.push(*one),
      }
    }

    debug!(files = files.len(), formulas = packages.len(), "loaded formulas");
    Self::from_packages(packages)
  }

  /// Build an index from already-parsed packages, validating each one.
  pub fn from_packages(packages: impl IntoIterator<Item = Package>) -> Result<Self, FormulaError> {
    let mut index = BTreeMap::new();
    for mut package in packages {
      validate(&mut package)?;
      let name = package.name.clone();
      if index.insert(name.clone(), Arc::new(package)).is_some() {
        return Err(FormulaError::Duplicate(name));
      }
    }
    Ok(Self { packages: index })
  }

  pub fn get(&self, name: &str) -> Option<&Arc<Package>> {
    self.packages.get(name)
  }

  pub fn contains(&self, name: &str) -> bool {
    self.packages.contains_key(name)
  }

  pub fn len(&self) -> usize {
    self.packages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.packages.is_empty()
  }

  /// Packages in name order.
  pub fn iter(&self) -> impl Iterator<Item = &Arc<Package>> {
    self.packages.values()
  }
}

/// Reject malformed formulas and normalize checksums to lowercase.
fn validate(package: &mut Package) -> Result<(), FormulaError> {
  let name = package.name.clone();
  if package.versions.is_empty() {
    return Err(FormulaError::NoVersions(name));
  }

  let mut seen = HashSet::new();
  for version in &mut package.versions {
    version.semver()?;
    if !seen.insert(version.version.clone()) {
      return Err(FormulaError::DuplicateVersion {
        package: name,
        version: version.version.clone(),
      });
    }

    let label = version.version.clone();
    check_source(&name, &format!("source of {label}"), &mut version.source)?;
    for (tag, bottle) in &mut version.bottles {
      check_source(&name, &format!("bottle {tag} of {label}"), &mut bottle.source)?;
    }
    for (i, patch) in version.patches.iter_mut().enumerate() {
      check_source(&name, &format!("patch {i} of {label}"), &mut patch.source)?;
    }
  }

  for resource in &mut package.resources {
    check_source(&name, &format!("resource {}", resource.name), &mut resource.source)?;
  }

  for dep in &package.dependencies {
    if let Some(constraint) = &dep.constraint {
      semver::VersionReq::parse(constraint).map_err(|e| FormulaError::InvalidConstraint {
        package: name.clone(),
        dependency: dep.name.clone(),
        constraint: constraint.clone(),
        message: e.to_string(),
      })?;
    }
  }

  Ok(())
}

fn check_source(package: &str, what: &str, source: &mut ArtifactSource) -> Result<(), FormulaError> {
  match normalize_sha256(&source.sha256) {
    Some(normalized) => {
      source.sha256 = normalized;
      Ok(())
    }
    None => Err(FormulaError::InvalidChecksum {
      package: package.to_string(),
      what: what.to_string(),
      sha256: source.sha256.clone(),
    }),
  }
}
