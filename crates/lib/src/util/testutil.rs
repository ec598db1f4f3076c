//! Test helpers for cellar-lib.
//!
//! Builders for formulas and indexes so tests can describe dependency
//! graphs in a line or two.

use crate::formula::{BuildStep, Conflict, Dependency, DependencyKind, FormulaIndex, Package, PlatformCondition, Version};
use crate::platform::Platform;
use crate::platform::arch::Arch;
use crate::platform::os::Os;
use crate::store::ArtifactSource;

pub const ZERO_SHA: &str = "0000000000000000000000000000000000000000000000000000000000000000";

pub struct PackageBuilder {
  package: Package,
}

impl PackageBuilder {
  pub fn new(name: &str) -> Self {
    Self {
      package: Package {
        name: name.to_string(),
        versions: Vec::new(),
        description: None,
        homepage: None,
        dependencies: Vec::new(),
        resources: Vec::new(),
        recipe: Default::default(),
        service: None,
        test: None,
        conflicts: Vec::new(),
      },
    }
  }

  pub fn version(mut self, version: &str) -> Self {
    let url = format!("https://example.org/{}-{version}.tar.gz", self.package.name);
    self.package.versions.push(Version {
      version: version.to_string(),
      source: ArtifactSource::new(url, ZERO_SHA),
      bottles: Default::default(),
      patches: Vec::new(),
    });
    self
  }

  pub fn dep(self, name: &str, kind: DependencyKind) -> Self {
    self.dependency(Dependency {
      name: name.to_string(),
      kind,
      condition: PlatformCondition::Always,
      constraint: None,
    })
  }

  pub fn dep_constrained(self, name: &str, constraint: &str) -> Self {
    self.dependency(Dependency {
      name: name.to_string(),
      kind: DependencyKind::Runtime,
      condition: PlatformCondition::Always,
      constraint: Some(constraint.to_string()),
    })
  }

  pub fn dependency(mut self, dep: Dependency) -> Self {
    self.package.dependencies.push(dep);
    self
  }

  pub fn conflict(mut self, with: &str, reason: &str) -> Self {
    self.package.conflicts.push(Conflict {
      with: with.to_string(),
      reason: reason.to_string(),
    });
    self
  }

  pub fn install_step(mut self, step: BuildStep) -> Self {
    self.package.recipe.install.push(step);
    self
  }

  /// Finish the package, giving it version 1.0.0 if none was declared.
  pub fn build(mut self) -> Package {
    if self.package.versions.is_empty() {
      self = self.version("1.0.0");
    }
    self.package
  }
}

impl From<Package> for PackageBuilder {
  fn from(package: Package) -> Self {
    Self { package }
  }
}

pub fn index(packages: impl IntoIterator<Item = Package>) -> FormulaIndex {
  FormulaIndex::from_packages(packages).unwrap()
}

pub fn linux_x86() -> Platform {
  Platform::new(Arch::X86_64, Os::Linux)
}

pub fn mac_arm() -> Platform {
  Platform::new(Arch::Aarch64, Os::MacOs).with_codename("sonoma")
}

/// Returns the shell command and args to execute a shell script.
#[cfg(unix)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

#[cfg(windows)]
pub fn shell_cmd(script: &str) -> (&'static str, Vec<String>) {
  ("cmd.exe", vec!["/C".to_string(), script.to_string()])
}

/// Write a gzipped tarball containing `files` (path, content).
pub fn write_tar_gz(path: &std::path::Path, files: &[(&str, &str)]) {
  let file = std::fs::File::create(path).unwrap();
  let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
  let mut builder = tar::Builder::new(encoder);
  for (name, content) in files {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, name, content.as_bytes()).unwrap();
  }
  builder.into_inner().unwrap().finish().unwrap();
}

/// `file://` URL and sha256 of a local artifact.
pub fn local_artifact(path: &std::path::Path) -> ArtifactSource {
  let sha = crate::util::hash::hash_file(path).unwrap().0;
  ArtifactSource::new(format!("file://{}", path.display()), sha)
}
