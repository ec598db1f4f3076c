//! Per-key async locking.
//!
//! The artifact store locks per checksum and the ledger per package name, so
//! unrelated keys never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A set of named async mutexes created on demand.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
  inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl KeyedLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `key`.
  pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
    let mutex = {
      let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
      map.entry(key.to_string()).or_default().clone()
    };
    mutex.lock_owned().await
  }

  /// Number of keys that have been locked at least once.
  pub fn len(&self) -> usize {
    self.inner.lock().map(|m| m.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
