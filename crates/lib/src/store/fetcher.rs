//! Transport for artifact downloads.

use std::path::PathBuf;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::consts::APP_NAME;

/// A failed download attempt.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct FetchFailure {
  pub message: String,
  /// Worth retrying: timeouts, connection resets, 5xx and 429 responses.
  pub transient: bool,
}

impl FetchFailure {
  pub fn transient(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      transient: true,
    }
  }

  pub fn permanent(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      transient: false,
    }
  }
}

/// Retrieves the bytes behind a URL. Checksums are the store's concern.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchFailure>;
}

/// HTTP(S) via reqwest, plus `file://` for local mirrors and tests.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
  client: Client,
}

impl HttpFetcher {
  pub fn new() -> Self {
    let client = Client::builder()
      .user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")))
      .build()
      .unwrap_or_else(|_| Client::new());
    Self { client }
  }
}

impl Default for HttpFetcher {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
    if let Some(path) = url.strip_prefix("file://") {
      let path = PathBuf::from(path);
      debug!(path = %path.display(), "reading local artifact");
      return tokio::fs::read(&path)
        .await
        .map_err(|e| FetchFailure::permanent(format!("{}: {e}", path.display())));
    }

    debug!(%url, "downloading");
    let response = self.client.get(url).send().await.map_err(|e| FetchFailure {
      transient: e.is_timeout() || e.is_connect() || e.is_request(),
      message: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
      return Err(FetchFailure {
        message: format!("HTTP {status}"),
        transient: status.is_server_error() || status.as_u16() == 429,
      });
    }

    let bytes = response
      .bytes()
      .await
      .map_err(|e| FetchFailure::transient(e.to_string()))?;
    Ok(bytes.to_vec())
  }
}
