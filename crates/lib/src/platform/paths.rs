use std::path::{Path, PathBuf};

use crate::consts::{APP_NAME, ROOT_ENV};

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/"))
}

/// Returns the directory for data files for the application
#[cfg(windows)]
pub fn data_dir() -> PathBuf {
  std::env::var("APPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir())
    .join(APP_NAME)
}

/// Returns the directory for data files for the application
#[cfg(not(windows))]
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Root of everything cellar owns. `CELLAR_ROOT` wins over the data directory.
pub fn root_dir() -> PathBuf {
  if let Ok(path) = std::env::var(ROOT_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  data_dir()
}

/// Directory layout under a cellar root.
///
/// ```text
/// <root>/
/// ├── store/artifacts/<sha256>/<file>   # content-addressed artifact cache
/// ├── cellar/<name>/<version>/          # installed kegs
/// ├── var/                              # shared runtime state (logs, data)
/// ├── ledger/<name>/<version>.json      # install records
/// ├── services/<name>.json              # registered service definitions
/// └── tmp/                              # scoped build directories
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
  root: PathBuf,
}

impl Layout {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  /// Layout rooted at [`root_dir`].
  pub fn from_env() -> Self {
    Self::new(root_dir())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn artifacts_dir(&self) -> PathBuf {
    self.root.join("store").join("artifacts")
  }

  pub fn cellar_dir(&self) -> PathBuf {
    self.root.join("cellar")
  }

  /// Install prefix for one package version.
  pub fn keg(&self, name: &str, version: &str) -> PathBuf {
    self.cellar_dir().join(name).join(version)
  }

  pub fn var_dir(&self) -> PathBuf {
    self.root.join("var")
  }

  pub fn ledger_dir(&self) -> PathBuf {
    self.root.join("ledger")
  }

  pub fn services_dir(&self) -> PathBuf {
    self.root.join("services")
  }

  pub fn tmp_dir(&self) -> PathBuf {
    self.root.join("tmp")
  }
}
