//! Static platform descriptor.
//!
//! A [`Platform`] is captured once per invocation and every conditional
//! dependency edge is evaluated against it at plan-construction time.

pub mod arch;
pub mod os;
pub mod paths;

use std::fmt;

use arch::Arch;
use os::Os;

/// Environment variable naming the OS release codename (e.g. `monterey`).
pub const CODENAME_ENV: &str = "CELLAR_OS_CODENAME";

/// Platform identifier combining architecture, OS and an optional release codename.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
  pub codename: Option<String>,
}

impl Platform {
  /// Create a new platform identifier
  pub fn new(arch: Arch, os: Os) -> Self {
    Self {
      arch,
      os,
      codename: None,
    }
  }

  pub fn with_codename(mut self, codename: impl Into<String>) -> Self {
    self.codename = Some(codename.into());
    self
  }

  /// Detect the current platform at runtime
  ///
  /// Returns `None` if the OS or architecture is not supported. The release
  /// codename is read from `CELLAR_OS_CODENAME` when set.
  pub fn current() -> Option<Self> {
    let platform = Self::new(Arch::current()?, Os::current()?);
    match std::env::var(CODENAME_ENV) {
      Ok(codename) if !codename.is_empty() => Some(platform.with_codename(codename)),
      _ => Some(platform),
    }
  }

  /// Returns the platform triple string (e.g., "aarch64-darwin")
  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }

  /// Tag used to look up a bottle for this platform.
  ///
  /// macOS bottles are keyed by release codename (`arm64_monterey`, `big_sur`),
  /// everything else by `<arch>_<os>` (`x86_64_linux`).
  pub fn bottle_tag(&self) -> String {
    match (&self.os, &self.codename) {
      (Os::MacOs, Some(codename)) => match self.arch {
        Arch::Aarch64 => format!("arm64_{codename}"),
        Arch::X86_64 => codename.clone(),
      },
      (Os::Linux, _) => format!("{}_linux", self.arch.bottle_prefix()),
      (os, _) => format!("{}_{}", self.arch.bottle_prefix(), os),
    }
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triple())
  }
}
