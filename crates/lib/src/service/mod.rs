//! Service registrar.
//!
//! Records the daemon definition of an installed package under
//! `services/<name>.json` with every placeholder resolved. Nothing here
//! starts or supervises a process; the entry is what an init system
//! adapter would consume.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::error::ErrorKind;
use crate::formula::ServiceSpec;
use crate::placeholder::{PlaceholderError, StepScope, substitute};
use crate::platform::paths::Layout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
  pub name: String,
  pub version: String,
  pub run: Vec<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub working_dir: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub log_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error_log_path: Option<String>,
  pub keep_alive: bool,
  pub run_at_load: bool,
  pub registered_at: u64,
}

#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("service for {name}: {source}")]
  Placeholder {
    name: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("service entry {path} is unreadable: {message}")]
  Corrupt { path: PathBuf, message: String },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl ServiceError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ServiceError::Placeholder { .. } => ErrorKind::Formula,
      ServiceError::Corrupt { .. } => ErrorKind::LedgerCorruption,
      ServiceError::Io { .. } => ErrorKind::Io,
    }
  }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ServiceError + '_ {
  move |source| ServiceError::Io {
    path: path.to_path_buf(),
    source,
  }
}

#[derive(Debug, Clone)]
pub struct ServiceRegistrar {
  dir: PathBuf,
}

impl ServiceRegistrar {
  pub fn new(layout: &Layout) -> Self {
    Self {
      dir: layout.services_dir(),
    }
  }

  fn entry_path(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{name}.json"))
  }

  /// Resolve `spec` against `scope` and record it, replacing any previous entry.
  pub async fn register(
    &self,
    name: &str,
    version: &str,
    spec: &ServiceSpec,
    scope: &StepScope,
  ) -> Result<ServiceEntry, ServiceError> {
    let resolve = |value: &str| {
      substitute(value, scope).map_err(|source| ServiceError::Placeholder {
        name: name.to_string(),
        source,
      })
    };
    let resolve_opt = |value: &Option<String>| value.as_deref().map(resolve).transpose();

    let entry = ServiceEntry {
      name: name.to_string(),
      version: version.to_string(),
      run: spec.run.iter().map(|arg| resolve(arg)).collect::<Result<_, _>>()?,
      working_dir: resolve_opt(&spec.working_dir)?,
      log_path: resolve_opt(&spec.log_path)?,
      error_log_path: resolve_opt(&spec.error_log_path)?,
      keep_alive: spec.keep_alive,
      run_at_load: spec.run_at_load,
      registered_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };

    fs::create_dir_all(&self.dir).await.map_err(io_err(&self.dir))?;
    let path = self.entry_path(name);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(&entry).map_err(|e| ServiceError::Corrupt {
      path: path.clone(),
      message: e.to_string(),
    })?;
    fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
    fs::rename(&tmp, &path).await.map_err(io_err(&path))?;

    info!(service = %name, %version, path = %path.display(), "service registered");
    Ok(entry)
  }

  pub async fn get(&self, name: &str) -> Result<Option<ServiceEntry>, ServiceError> {
    let path = self.entry_path(name);
    match fs::read(&path).await {
      Ok(bytes) => serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ServiceError::Corrupt {
          path,
          message: e.to_string(),
        }),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(io_err(&path)(e)),
    }
  }

  /// All registered services in name order.
  pub async fn list(&self) -> Result<Vec<ServiceEntry>, ServiceError> {
    let mut dir = match fs::read_dir(&self.dir).await {
      Ok(dir) => dir,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(io_err(&self.dir)(e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = dir.next_entry().await.map_err(io_err(&self.dir))? {
      let path = entry.path();
      if path.extension().is_some_and(|ext| ext == "json")
        && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
      {
        names.push(stem.to_string());
      }
    }
    names.sort();

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
      if let Some(entry) = self.get(&name).await? {
        entries.push(entry);
      }
    }
    Ok(entries)
  }

  /// Drop the entry for `name`. Returns whether one existed.
  pub async fn remove(&self, name: &str) -> Result<bool, ServiceError> {
    let path = self.entry_path(name);
    match fs::remove_file(&path).await {
      Ok(()) => {
        debug!(service = %name, "service deregistered");
        Ok(true)
      }
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
      Err(e) => Err(io_err(&path)(e)),
    }
  }
}
