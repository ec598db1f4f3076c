//! Cross-process advisory lock over a cellar root.
//!
//! In-process writers are serialized by per-key locks; this lock keeps two
//! `cellar` processes from mutating the same root at once.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".cellar.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
  /// Readers such as `list` and `info`.
  Shared,
  /// Mutations such as `install` and `uninstall`.
  Exclusive,
}

/// Written into the lock file by the exclusive holder.
#[derive(Debug, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub acquired_at: u64,
  pub command: String,
  pub root: PathBuf,
}

#[derive(Debug, Error)]
pub enum StoreLockError {
  #[error("cellar root {root} is in use by `{command}` (pid {pid}); remove {lock_path} if that process is gone")]
  Busy {
    root: PathBuf,
    command: String,
    pid: u32,
    lock_path: PathBuf,
  },

  #[error("cellar root is locked by another process; remove {lock_path} if no cellar process is running")]
  BusyUnknown { lock_path: PathBuf },

  #[error("cannot prepare lock file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("cannot record lock holder: {0}")]
  WriteHolder(#[source] io::Error),

  #[error("flock failed: {0}")]
  Lock(#[source] io::Error),
}

/// Held for as long as the value lives; the OS drops the lock with the file.
pub struct StoreLock {
  file: File,
  lock_path: PathBuf,
}

impl StoreLock {
  pub fn acquire(root: &Path, mode: LockMode, command: &str) -> Result<Self, StoreLockError> {
    let lock_path = root.join(LOCK_FILENAME);
    std::fs::create_dir_all(root).map_err(|source| StoreLockError::Open {
      path: root.to_path_buf(),
      source,
    })?;

    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(|source| StoreLockError::Open {
        path: lock_path.clone(),
        source,
      })?;

    if let Err(err) = try_lock(&file, mode) {
      if err.kind() == io::ErrorKind::WouldBlock {
        return Err(busy_error(root, &lock_path));
      }
      return Err(StoreLockError::Lock(err));
    }

    if mode == LockMode::Exclusive {
      write_holder(&file, command, root)?;
    }
    debug!(path = %lock_path.display(), ?mode, "acquired root lock");

    Ok(StoreLock { file, lock_path })
  }

  /// Read the holder record through the already-open handle.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_holder(file: &File, command: &str, root: &Path) -> Result<(), StoreLockError> {
  let holder = LockHolder {
    pid: std::process::id(),
    acquired_at: SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs(),
    command: command.to_string(),
    root: root.to_path_buf(),
  };

  file.set_len(0).map_err(StoreLockError::WriteHolder)?;
  let mut writer = io::BufWriter::new(file);
  serde_json::to_writer(&mut writer, &holder).map_err(|e| StoreLockError::WriteHolder(io::Error::other(e)))?;
  writer.flush().map_err(StoreLockError::WriteHolder)
}

fn busy_error(root: &Path, lock_path: &Path) -> StoreLockError {
  let holder = std::fs::read_to_string(lock_path)
    .ok()
    .and_then(|contents| serde_json::from_str::<LockHolder>(&contents).ok());

  match holder {
    Some(holder) => StoreLockError::Busy {
      root: root.to_path_buf(),
      command: holder.command,
      pid: holder.pid,
      lock_path: lock_path.to_path_buf(),
    },
    None => StoreLockError::BusyUnknown {
      lock_path: lock_path.to_path_buf(),
    },
  }
}

#[cfg(unix)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  let operation = match mode {
    LockMode::Shared => FlockOperation::NonBlockingLockShared,
    LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
  };

  flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock(file: &File, mode: LockMode) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;
  let flags = match mode {
    LockMode::Shared => LOCKFILE_FAIL_IMMEDIATELY,
    LockMode::Exclusive => LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
  };

  // SAFETY: a zeroed OVERLAPPED is valid and the handle is owned by `file`.
  let result = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(handle, flags, 0, 1, 0, &mut overlapped)
  };

  if result == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
