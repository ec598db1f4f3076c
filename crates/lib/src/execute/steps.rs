//! Running build steps in an isolated environment.
//!
//! Every subprocess starts from an empty environment:
//! - `PATH` is the `bin` directories of the package's dependencies followed
//!   by the system directories
//! - `HOME` is `/homeless-shelter`
//! - `TMPDIR`/`TMP`/`TEMP`/`TEMPDIR` point at the scoped working directory
//! - `LANG`/`LC_ALL` are `C` and `SOURCE_DATE_EPOCH` is fixed
//! - `prefix` is the keg being installed into
//!
//! Step-level `env` entries are merged last.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::consts::SOURCE_DATE_EPOCH;
use crate::formula::BuildStep;
use crate::placeholder::{Dir, PlaceholderError, StepScope, substitute};

#[cfg(unix)]
const SYSTEM_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";
#[cfg(windows)]
const SYSTEM_PATH: &str = r"C:\Windows\System32;C:\Windows";

#[cfg(unix)]
const PATH_SEPARATOR: &str = ":";
#[cfg(windows)]
const PATH_SEPARATOR: &str = ";";

#[derive(Debug, Error)]
pub enum StepError {
  #[error("step {step} ({description}): {source}")]
  Placeholder {
    step: usize,
    description: String,
    #[source]
    source: PlaceholderError,
  },

  #[error("step {step} ({description}) exited with {}", code.map(|c| c.to_string()).unwrap_or_else(|| "a signal".to_string()))]
  Command {
    step: usize,
    description: String,
    code: Option<i32>,
    /// Last lines of stderr.
    stderr: String,
  },

  #[error("step {step} ({description}): {source}")]
  Io {
    step: usize,
    description: String,
    #[source]
    source: std::io::Error,
  },

  #[error("cancelled")]
  Cancelled,
}

/// Runs steps for one package phase.
#[derive(Debug, Clone)]
pub struct StepRunner {
  shell: Option<String>,
  tmp_dir: PathBuf,
  path: String,
}

impl StepRunner {
  /// `scope` supplies the keg (`$${prefix}`) and dependency kegs for `PATH`.
  pub fn new(shell: Option<String>, tmp_dir: impl Into<PathBuf>, scope: &StepScope) -> Self {
    let mut path: Vec<String> = scope
      .dep_kegs()
      .map(|(_, keg)| Path::new(keg).join("bin").to_string_lossy().into_owned())
      .collect();
    path.push(SYSTEM_PATH.to_string());
    Self {
      shell,
      tmp_dir: tmp_dir.into(),
      path: path.join(PATH_SEPARATOR),
    }
  }

  /// Run `steps` in order with `cwd` as the default working directory.
  ///
  /// Each step's trimmed stdout becomes `$${step:N}` for later steps.
  pub async fn run_all(
    &self,
    steps: &[BuildStep],
    cwd: &Path,
    scope: &mut StepScope,
    cancel: &CancellationToken,
  ) -> Result<(), StepError> {
    scope.reset_steps();
    for (index, step) in steps.iter().enumerate() {
      if cancel.is_cancelled() {
        return Err(StepError::Cancelled);
      }
      let stdout = self.run(index, step, cwd, scope, cancel).await?;
      scope.push_step_output(&stdout);
    }
    Ok(())
  }

  async fn run(
    &self,
    index: usize,
    step: &BuildStep,
    cwd: &Path,
    scope: &StepScope,
    cancel: &CancellationToken,
  ) -> Result<String, StepError> {
    let description = step.describe();
    let resolve = |value: &str| {
      substitute(value, scope).map_err(|source| StepError::Placeholder {
        step: index,
        description: description.clone(),
        source,
      })
    };
    let io = |source| StepError::Io {
      step: index,
      description: description.clone(),
      source,
    };

    match step {
      BuildStep::Shell { cmd, env, cwd: dir } => {
        let (shell, args) = shell_invocation(self.shell.as_deref());
        let mut command = Command::new(shell);
        command.args(args).arg(resolve(cmd)?);
        let dir = dir.as_deref().map(resolve).transpose()?;
        self.spawn(index, &description, command, env, dir, cwd, scope, cancel).await
      }
      BuildStep::Exec { bin, args, env, cwd: dir } => {
        let mut command = Command::new(resolve(bin)?);
        for arg in args {
          command.arg(resolve(arg)?);
        }
        let dir = dir.as_deref().map(resolve).transpose()?;
        self.spawn(index, &description, command, env, dir, cwd, scope, cancel).await
      }
      BuildStep::WriteFile { path, content } => {
        let path = cwd.join(resolve(path)?);
        if let Some(parent) = path.parent() {
          tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        tokio::fs::write(&path, resolve(content)?).await.map_err(io)?;
        debug!(path = %path.display(), "wrote file");
        Ok(String::new())
      }
      BuildStep::MkDir { path } => {
        let path = cwd.join(resolve(path)?);
        tokio::fs::create_dir_all(&path).await.map_err(io)?;
        Ok(String::new())
      }
      BuildStep::Symlink { target, link } => {
        let target = PathBuf::from(resolve(target)?);
        let link = cwd.join(resolve(link)?);
        if let Some(parent) = link.parent() {
          tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        if tokio::fs::symlink_metadata(&link).await.is_ok() {
          tokio::fs::remove_file(&link).await.map_err(io)?;
        }
        make_symlink(&target, &link).await.map_err(io)?;
        Ok(String::new())
      }
    }
  }

  #[allow(clippy::too_many_arguments)]
  async fn spawn(
    &self,
    index: usize,
    description: &str,
    mut command: Command,
    env: &BTreeMap<String, String>,
    dir: Option<String>,
    cwd: &Path,
    scope: &StepScope,
    cancel: &CancellationToken,
  ) -> Result<String, StepError> {
    let working_dir = dir.map(|d| cwd.join(d)).unwrap_or_else(|| cwd.to_path_buf());
    info!(step = index, %description, "running step");

    command
      .current_dir(&working_dir)
      .env_clear()
      .env("PATH", &self.path)
      .env("HOME", "/homeless-shelter")
      .env("TMPDIR", &self.tmp_dir)
      .env("TMP", &self.tmp_dir)
      .env("TEMP", &self.tmp_dir)
      .env("TEMPDIR", &self.tmp_dir)
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    // Own process group so cancellation reaches nested shells and sub-makes.
    #[cfg(unix)]
    command.process_group(0);
    if let Some(prefix) = scope.dir(Dir::Prefix) {
      command.env("prefix", prefix);
    }
    for (key, value) in env {
      let value = substitute(value, scope).map_err(|source| StepError::Placeholder {
        step: index,
        description: description.to_string(),
        source,
      })?;
      command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| StepError::Io {
      step: index,
      description: description.to_string(),
      source,
    })?;

    let finished = tokio::select! {
      output = collect_output(&mut child) => Some(output),
      _ = cancel.cancelled() => None,
    };
    let Some(output) = finished else {
      terminate(&mut child).await;
      info!(step = index, "step cancelled, subprocess killed");
      return Err(StepError::Cancelled);
    };
    let output = output.map_err(|source| StepError::Io {
      step: index,
      description: description.to_string(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      debug!(stderr = %stderr, stdout = %stdout, "step failed");
      return Err(StepError::Command {
        step: index,
        description: description.to_string(),
        code: output.status.code(),
        stderr: tail(&stderr, 20),
      });
    }

    if !stdout.is_empty() {
      debug!(step = index, stdout = %stdout, "step output");
    }
    Ok(stdout)
  }
}

struct StepOutput {
  status: ExitStatus,
  stdout: Vec<u8>,
  stderr: Vec<u8>,
}

async fn collect_output(child: &mut Child) -> std::io::Result<StepOutput> {
  let mut stdout = Vec::new();
  let mut stderr = Vec::new();
  let (out, err) = tokio::join!(
    read_pipe(child.stdout.take(), &mut stdout),
    read_pipe(child.stderr.take(), &mut stderr)
  );
  out?;
  err?;
  let status = child.wait().await?;
  Ok(StepOutput { status, stdout, stderr })
}

async fn read_pipe(pipe: Option<impl AsyncRead + Unpin>, buf: &mut Vec<u8>) -> std::io::Result<()> {
  if let Some(mut pipe) = pipe {
    pipe.read_to_end(buf).await?;
  }
  Ok(())
}

/// Kill the step's whole process group, then reap the child.
async fn terminate(child: &mut Child) {
  #[cfg(unix)]
  if let Some(pid) = child.id().and_then(|id| rustix::process::Pid::from_raw(id as i32))
    && let Err(e) = rustix::process::kill_process_group(pid, rustix::process::Signal::KILL)
  {
    debug!(error = %e, "failed to signal process group");
  }
  if let Err(e) = child.kill().await {
    debug!(error = %e, "failed to kill step process");
  }
}

/// Shell and flag used to run a script. Profiles are never sourced.
fn shell_invocation(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    ("cmd.exe".to_string(), vec!["/C".to_string()])
  }
}

#[cfg(unix)]
async fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn make_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
  tokio::fs::symlink_file(target, link).await
}

fn tail(text: &str, lines: usize) -> String {
  let all: Vec<&str> = text.lines().collect();
  all[all.len().saturating_sub(lines)..].join("\n")
}
