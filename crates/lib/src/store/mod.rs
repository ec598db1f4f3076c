//! Content-addressed artifact cache.
//!
//! Every source tarball, patch, resource and bottle is stored under the
//! sha256 it was declared with:
//!
//! ```text
//! store/artifacts/
//! └── <sha256>/
//!     └── <filename from url>
//! ```
//!
//! An entry is only ever created by renaming a fully written and verified
//! temp file into place, so a present entry is complete. It is still
//! re-hashed on every hit and replaced when it no longer matches.

mod fetcher;
mod unpack;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};

pub use fetcher::{FetchFailure, Fetcher, HttpFetcher};
pub use unpack::{source_root, unpack_archive};

use crate::error::ErrorKind;
use crate::util::hash::{hash_bytes, normalize_sha256};
use crate::util::locks::KeyedLocks;

/// Where an artifact comes from and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSource {
  pub url: String,
  pub sha256: String,
  /// Tried in order when the primary URL fails in transport.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub mirrors: Vec<String>,
}

impl ArtifactSource {
  pub fn new(url: impl Into<String>, sha256: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      sha256: sha256.into(),
      mirrors: Vec::new(),
    }
  }

  pub fn urls(&self) -> impl Iterator<Item = &str> {
    std::iter::once(self.url.as_str()).chain(self.mirrors.iter().map(String::as_str))
  }
}

#[derive(Debug, Error)]
pub enum ArtifactError {
  #[error("fetching {url} failed after {attempts} attempt(s): {message}")]
  Fetch {
    url: String,
    message: String,
    attempts: u32,
  },

  #[error("checksum mismatch for {url}: expected {expected}, got {actual}")]
  ChecksumMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("invalid sha256 '{0}'")]
  InvalidChecksum(String),

  #[error("cannot unpack {path}: {message}")]
  Unpack { path: PathBuf, message: String },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

impl ArtifactError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ArtifactError::Fetch { .. } => ErrorKind::Fetch,
      ArtifactError::ChecksumMismatch { .. } | ArtifactError::InvalidChecksum(_) => ErrorKind::ChecksumMismatch,
      ArtifactError::Unpack { .. } | ArtifactError::Io { .. } => ErrorKind::Io,
    }
  }

  fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
    move |source| ArtifactError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Bounded exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts per URL, including the first.
  pub attempts: u32,
  pub base_delay: Duration,
  pub factor: u32,
}

impl RetryPolicy {
  pub fn none() -> Self {
    Self {
      attempts: 1,
      base_delay: Duration::ZERO,
      factor: 1,
    }
  }

  /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
  pub fn delay_after(&self, attempt: u32) -> Duration {
    let exp = self.factor.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(exp)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      attempts: 3,
      base_delay: Duration::from_millis(500),
      factor: 2,
    }
  }
}

pub struct ArtifactStore {
  dir: PathBuf,
  fetcher: Arc<dyn Fetcher>,
  locks: KeyedLocks,
  retry: RetryPolicy,
}

impl ArtifactStore {
  pub fn new(dir: impl Into<PathBuf>, fetcher: Arc<dyn Fetcher>) -> Self {
    Self {
      dir: dir.into(),
      fetcher,
      locks: KeyedLocks::new(),
      retry: RetryPolicy::default(),
    }
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  /// Fetch an artifact, trying mirrors after a transport failure.
  ///
  /// A checksum mismatch from any URL ends the attempt immediately.
  pub async fn fetch_source(&self, source: &ArtifactSource) -> Result<PathBuf, ArtifactError> {
    let mut last_err = None;
    for url in source.urls() {
      match self.fetch(url, &source.sha256).await {
        Ok(path) => return Ok(path),
        Err(err @ ArtifactError::Fetch { .. }) => {
          warn!(%url, error = %err, "artifact download failed");
          last_err = Some(err);
        }
        Err(err) => return Err(err),
      }
    }
    Err(last_err.unwrap_or_else(|| ArtifactError::Fetch {
      url: source.url.clone(),
      message: "no URL to fetch".to_string(),
      attempts: 0,
    }))
  }

  /// Return the cached path for `sha256`, downloading `url` on a miss.
  pub async fn fetch(&self, url: &str, sha256: &str) -> Result<PathBuf, ArtifactError> {
    let expected = normalize_sha256(sha256).ok_or_else(|| ArtifactError::InvalidChecksum(sha256.to_string()))?;
    let _guard = self.locks.lock(&expected).await;

    let entry_dir = self.dir.join(&expected);
    if let Some(hit) = self.cached(&entry_dir, &expected).await? {
      debug!(sha256 = %expected, path = %hit.display(), "artifact cache hit");
      return Ok(hit);
    }

    let bytes = self.download(url).await?;
    let actual = hash_bytes(&bytes).0;
    if actual != expected {
      return Err(ArtifactError::ChecksumMismatch {
        url: url.to_string(),
        expected,
        actual,
      });
    }

    fs::create_dir_all(&entry_dir).await.map_err(ArtifactError::io(&entry_dir))?;
    let dest = entry_dir.join(url_to_filename(url));
    let tmp = entry_dir.join(format!(".{}.partial", std::process::id()));
    fs::write(&tmp, &bytes).await.map_err(ArtifactError::io(&tmp))?;
    fs::rename(&tmp, &dest).await.map_err(ArtifactError::io(&dest))?;

    info!(sha256 = %expected, size = bytes.len(), path = %dest.display(), "artifact stored");
    Ok(dest)
  }

  /// A verified file in the entry directory, if there is one.
  async fn cached(&self, entry_dir: &Path, expected: &str) -> Result<Option<PathBuf>, ArtifactError> {
    let mut entries = match fs::read_dir(entry_dir).await {
      Ok(entries) => entries,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(ArtifactError::io(entry_dir)(e)),
    };

    let mut found = None;
    while let Some(entry) = entries.next_entry().await.map_err(ArtifactError::io(entry_dir))? {
      let path = entry.path();
      let is_partial = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'));
      if is_partial {
        continue;
      }
      found = Some(path);
      break;
    }

    let Some(path) = found else {
      return Ok(None);
    };
    let bytes = fs::read(&path).await.map_err(ArtifactError::io(&path))?;
    if hash_bytes(&bytes).0 == expected {
      return Ok(Some(path));
    }

    warn!(path = %path.display(), "cached artifact is corrupt, refetching");
    fs::remove_dir_all(entry_dir).await.map_err(ArtifactError::io(entry_dir))?;
    Ok(None)
  }

  async fn download(&self, url: &str) -> Result<Vec<u8>, ArtifactError> {
    let attempts = self.retry.attempts.max(1);
    let mut attempt = 1;
    loop {
      debug!(%url, attempt, "fetching artifact");
      match self.fetcher.fetch(url).await {
        Ok(bytes) => return Ok(bytes),
        Err(failure) if failure.transient && attempt < attempts => {
          let delay = self.retry.delay_after(attempt);
          warn!(%url, attempt, error = %failure, delay = ?delay, "transient fetch failure, retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(failure) => {
          return Err(ArtifactError::Fetch {
            url: url.to_string(),
            message: failure.message,
            attempts: attempt,
          });
        }
      }
    }
  }
}

/// Last path segment of `url`, sanitized. Falls back to `artifact`.
fn url_to_filename(url: &str) -> String {
  let last = url.rsplit('/').next().unwrap_or_default();
  let last = last.split(['?', '#']).next().unwrap_or_default();
  let sanitized: String = last
    .chars()
    .map(|c| {
      if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '+') {
        c
      } else {
        '_'
      }
    })
    .collect();

  if sanitized.is_empty() || sanitized.starts_with('.') {
    "artifact".to_string()
  } else {
    sanitized
  }
}
