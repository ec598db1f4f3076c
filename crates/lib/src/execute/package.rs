//! One package's trip through the install state machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use super::ExecContext;
use super::steps::{StepError, StepRunner};
use super::types::{FailureReason, PackageOutcome, PackageState};
use crate::formula::{BuildStep, Version};
use crate::ledger::{InstallRecord, InstallSource, Ledger, TestOutcome};
use crate::placeholder::{Dir, StepScope};
use crate::resolve::{PlanAction, PlanEntry};
use crate::stage::ResourceStageError;
use crate::store::{ArtifactError, ArtifactSource, source_root, unpack_archive};

/// Version and keg of each in-plan dependency.
pub(super) type DepKegs = BTreeMap<String, (String, PathBuf)>;

/// Bottles are `<name>/<version>/...`; pouring drops both levels.
const BOTTLE_STRIP: usize = 2;

struct Tracker {
  outcome: PackageOutcome,
}

impl Tracker {
  fn enter(&mut self, state: PackageState) {
    match &state {
      PackageState::Failed(reason) => {
        error!(package = %self.outcome.name, version = %self.outcome.version, kind = %reason.kind(), %reason, "package failed")
      }
      _ => info!(package = %self.outcome.name, version = %self.outcome.version, state = state.name(), "state transition"),
    }
    self.outcome.transitions.push(state);
  }

  fn warn(&mut self, message: String) {
    warn!(package = %self.outcome.name, version = %self.outcome.version, %message, "warning");
    self.outcome.warnings.push(message);
  }
}

/// Drive `entry` to `Installed` or `Failed`.
pub(super) async fn install_package(ctx: &ExecContext, entry: &PlanEntry, deps: &DepKegs) -> PackageOutcome {
  let mut tracker = Tracker {
    outcome: PackageOutcome::new(&entry.name, &entry.version),
  };

  if entry.action == PlanAction::Skip {
    match ctx.ledger.get(&entry.name, &entry.version).await {
      Ok(Some(record)) => {
        let check = Ledger::verify_manifest(&record);
        if check.is_intact() {
          tracker.outcome.skipped = true;
          tracker.outcome.record = Some(record);
          tracker.enter(PackageState::Installed);
          return tracker.outcome;
        }
        tracker.warn(format!(
          "{} recorded file(s) missing, reinstalling",
          check.missing.len()
        ));
        if let Err(e) = ctx.ledger.remove_record(&entry.name, &entry.version).await {
          tracker.enter(PackageState::Failed(FailureReason::Ledger { message: e.to_string() }));
          return tracker.outcome;
        }
      }
      Ok(None) => {}
      Err(e) => {
        tracker.enter(PackageState::Failed(FailureReason::Ledger { message: e.to_string() }));
        return tracker.outcome;
      }
    }
  }

  let keg = ctx.layout.keg(&entry.name, &entry.version);

  // A recorded keg being reinstalled is kept aside until the new one commits.
  let backup = if entry.action == PlanAction::Build {
    match ctx.ledger.get(&entry.name, &entry.version).await {
      Ok(Some(_)) => match set_aside(&keg).await {
        Ok(backup) => backup,
        Err(e) => {
          tracker.enter(PackageState::Failed(io_reason(e)));
          return tracker.outcome;
        }
      },
      Ok(None) => None,
      Err(e) => {
        tracker.enter(PackageState::Failed(FailureReason::Ledger { message: e.to_string() }));
        return tracker.outcome;
      }
    }
  } else {
    None
  };

  match run_lifecycle(ctx, entry, deps, &keg, &mut tracker).await {
    Ok(record) => {
      if let Some(backup) = &backup
        && let Err(e) = wipe_dir(backup).await
      {
        warn!(keg = %backup.display(), error = %e, "failed to remove previous keg");
      }
      tracker.outcome.record = Some(record);
      tracker.enter(PackageState::Installed);
    }
    Err(reason) => {
      remove_keg(ctx, &keg).await;
      if let Some(backup) = &backup {
        restore(backup, &keg).await;
      }
      tracker.enter(PackageState::Failed(reason));
    }
  }
  tracker.outcome
}

fn backup_path(keg: &Path) -> PathBuf {
  let mut name = keg.file_name().unwrap_or_default().to_os_string();
  name.push(".prev");
  keg.with_file_name(name)
}

/// Move an existing keg to `<keg>.prev`, returning the backup location.
async fn set_aside(keg: &Path) -> std::io::Result<Option<PathBuf>> {
  if tokio::fs::symlink_metadata(keg).await.is_err() {
    return Ok(None);
  }
  let backup = backup_path(keg);
  wipe_dir(&backup).await?;
  tokio::fs::rename(keg, &backup).await?;
  info!(keg = %keg.display(), "previous keg set aside");
  Ok(Some(backup))
}

async fn restore(backup: &Path, keg: &Path) {
  match tokio::fs::rename(backup, keg).await {
    Ok(()) => info!(keg = %keg.display(), "previous keg restored"),
    Err(e) => error!(keg = %keg.display(), error = %e, "failed to restore previous keg"),
  }
}

async fn run_lifecycle(
  ctx: &ExecContext,
  entry: &PlanEntry,
  deps: &DepKegs,
  keg: &Path,
  tracker: &mut Tracker,
) -> Result<InstallRecord, FailureReason> {
  if ctx.cancel.is_cancelled() {
    return Err(FailureReason::Cancelled);
  }
  let package = &entry.package;
  let version: &Version = package.version(&entry.version).ok_or_else(|| FailureReason::Internal {
    message: format!("version {} vanished from formula {}", entry.version, entry.name),
  })?;

  tokio::fs::create_dir_all(ctx.layout.tmp_dir()).await.map_err(io_reason)?;
  let workdir = tempfile::Builder::new()
    .prefix(&format!("{}-{}-", entry.name, entry.version))
    .tempdir_in(ctx.layout.tmp_dir())
    .map_err(io_reason)?;
  let step_tmp = workdir.path().join("tmp");
  tokio::fs::create_dir_all(&step_tmp).await.map_err(io_reason)?;

  wipe_dir(keg).await.map_err(io_reason)?;

  let vendor = keg.join(crate::consts::VENDOR_DIR);
  let mut scope = StepScope::new()
    .with_dir(Dir::Prefix, keg)
    .with_dir(Dir::Var, ctx.layout.var_dir())
    .with_dir(Dir::Vendor, &vendor);
  for (name, (_, dep_keg)) in deps {
    scope = scope.with_dep(name, dep_keg);
  }
  let runner = StepRunner::new(ctx.config.shell.clone(), &step_tmp, &scope);

  let tag = ctx.platform.bottle_tag();
  let bottle = if ctx.config.force_source {
    None
  } else {
    version.bottles.get(&tag)
  };

  tracker.enter(PackageState::Fetching);
  let mut staged = None;
  let source = match bottle {
    Some(bottle) => {
      info!(package = %entry.name, %tag, "pouring bottle");
      let archive = fetch(ctx, &bottle.source, tracker).await?;
      tracker.enter(PackageState::Verifying);

      tracker.enter(PackageState::Installing);
      unpack(archive, keg.to_path_buf(), BOTTLE_STRIP).await?;
      InstallSource::Bottle
    }
    None => {
      let archive = fetch(ctx, &version.source, tracker).await?;
      let mut patches = Vec::with_capacity(version.patches.len());
      for patch in &version.patches {
        patches.push((fetch(ctx, &patch.source, tracker).await?, patch.strip));
      }
      tracker.enter(PackageState::Verifying);

      if !package.resources.is_empty() {
        tracker.enter(PackageState::Staging);
        let resources = ctx
          .stager
          .stage(package, &vendor, &runner, &scope, &ctx.cancel)
          .await
          .map_err(stage_reason)?;
        info!(
          package = %entry.name,
          resources = resources.resources.len(),
          hash = %resources.content_hash,
          dir = %resources.dir.display(),
          "resources staged"
        );
        staged = Some(resources);
      }

      tracker.enter(PackageState::Building);
      let src_dir = workdir.path().join("src");
      let src_root = unpack_source(archive, src_dir).await?;
      scope.set_dir(Dir::BuildPath, &src_root);
      let patch_steps: Vec<BuildStep> = patches
        .iter()
        .map(|(path, strip)| BuildStep::Exec {
          bin: "patch".to_string(),
          args: vec![format!("-p{strip}"), "-i".to_string(), path.to_string_lossy().into_owned()],
          env: BTreeMap::new(),
          cwd: None,
        })
        .collect();
      runner
        .run_all(&patch_steps, &src_root, &mut scope, &ctx.cancel)
        .await
        .map_err(step_reason)?;
      runner
        .run_all(&package.recipe.build, &src_root, &mut scope, &ctx.cancel)
        .await
        .map_err(step_reason)?;

      tracker.enter(PackageState::Installing);
      tokio::fs::create_dir_all(keg).await.map_err(io_reason)?;
      runner
        .run_all(&package.recipe.install, &src_root, &mut scope, &ctx.cancel)
        .await
        .map_err(step_reason)?;
      InstallSource::Source
    }
  };
  tokio::fs::create_dir_all(keg).await.map_err(io_reason)?;

  tracker.enter(PackageState::PostInstalling);
  let mut post_install_warning = None;
  if let Err(e) = runner
    .run_all(&package.recipe.post_install, keg, &mut scope, &ctx.cancel)
    .await
  {
    if matches!(e, StepError::Cancelled) {
      return Err(FailureReason::Cancelled);
    }
    let message = format!("post-install failed: {e}");
    tracker.warn(message.clone());
    post_install_warning = Some(message);
  }

  let manifest = manifest_of(keg).await?;

  let mut test_outcome = TestOutcome::NotRun;
  if ctx.config.run_tests
    && let Some(test) = &package.test
  {
    tracker.enter(PackageState::Testing);
    test_outcome = run_tests(&runner, &test.steps, &workdir, &mut scope, ctx, tracker).await?;
  }

  let mut record = InstallRecord::new(&entry.name, &entry.version, source);
  record.manifest = manifest;
  record.runtime_dependencies = dep_versions(deps, entry.runtime_deps.iter());
  if source == InstallSource::Source {
    record.build_dependencies = dep_versions(deps, entry.build_deps.iter());
  }
  record.test_outcome = test_outcome;
  record.post_install_warning = post_install_warning;
  if let Some(staged) = staged {
    record.resources = staged.resources.into_iter().map(|r| (r.name, r.sha256)).collect();
    record.vendor_hash = Some(staged.content_hash.0);
  }

  if ctx.cancel.is_cancelled() {
    return Err(FailureReason::Cancelled);
  }
  ctx.ledger.commit(&record).await.map_err(|e| FailureReason::Ledger {
    message: e.to_string(),
  })?;

  if let Some(service) = &package.service
    && let Err(e) = ctx.services.register(&entry.name, &entry.version, service, &scope).await
  {
    tracker.warn(format!("service not registered: {e}"));
  }

  Ok(record)
}

async fn run_tests(
  runner: &StepRunner,
  steps: &[BuildStep],
  workdir: &TempDir,
  scope: &mut StepScope,
  ctx: &ExecContext,
  tracker: &mut Tracker,
) -> Result<TestOutcome, FailureReason> {
  let test_dir = workdir.path().join("test");
  tokio::fs::create_dir_all(&test_dir).await.map_err(io_reason)?;
  scope.set_dir(Dir::BuildPath, &test_dir);

  match runner.run_all(steps, &test_dir, scope, &ctx.cancel).await {
    Ok(()) => Ok(TestOutcome::Passed),
    Err(StepError::Cancelled) => Err(FailureReason::Cancelled),
    Err(e) => {
      tracker.warn(format!("test failed: {e}"));
      Ok(TestOutcome::Failed)
    }
  }
}

/// Fetch through the store; a checksum mismatch fails in `Verifying`.
async fn fetch(ctx: &ExecContext, source: &ArtifactSource, tracker: &mut Tracker) -> Result<PathBuf, FailureReason> {
  let result = tokio::select! {
    result = ctx.store.fetch_source(source) => result,
    _ = ctx.cancel.cancelled() => return Err(FailureReason::Cancelled),
  };
  result.map_err(|e| {
    if matches!(e, ArtifactError::ChecksumMismatch { .. }) {
      tracker.enter(PackageState::Verifying);
    }
    artifact_reason(e)
  })
}

async fn unpack(archive: PathBuf, dest: PathBuf, strip: usize) -> Result<(), FailureReason> {
  tokio::task::spawn_blocking(move || unpack_archive(&archive, &dest, strip))
    .await
    .map_err(|e| FailureReason::Internal { message: e.to_string() })?
    .map_err(artifact_reason)
}

async fn unpack_source(archive: PathBuf, dest: PathBuf) -> Result<PathBuf, FailureReason> {
  tokio::task::spawn_blocking(move || unpack_archive(&archive, &dest, 0).map(|()| source_root(&dest)))
    .await
    .map_err(|e| FailureReason::Internal { message: e.to_string() })?
    .map_err(artifact_reason)
}

/// Sorted absolute paths of every file and symlink under `keg`.
async fn manifest_of(keg: &Path) -> Result<Vec<PathBuf>, FailureReason> {
  let keg = keg.to_path_buf();
  tokio::task::spawn_blocking(move || {
    let mut files = Vec::new();
    for entry in WalkDir::new(&keg).follow_links(false) {
      let entry = entry.map_err(|e| FailureReason::Io { message: e.to_string() })?;
      let file_type = entry.file_type();
      if file_type.is_file() || file_type.is_symlink() {
        files.push(entry.into_path());
      }
    }
    files.sort();
    Ok(files)
  })
  .await
  .map_err(|e| FailureReason::Internal { message: e.to_string() })?
}

fn dep_versions<'a>(deps: &DepKegs, names: impl Iterator<Item = &'a String>) -> BTreeMap<String, String> {
  names
    .filter_map(|name| deps.get(name).map(|(version, _)| (name.clone(), version.clone())))
    .collect()
}

async fn wipe_dir(dir: &Path) -> std::io::Result<()> {
  match tokio::fs::remove_dir_all(dir).await {
    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
    _ => Ok(()),
  }
}

/// Remove a partially written keg and its name directory if now empty.
async fn remove_keg(ctx: &ExecContext, keg: &Path) {
  if let Err(e) = wipe_dir(keg).await {
    warn!(keg = %keg.display(), error = %e, "failed to remove partial keg");
  }
  if let Some(parent) = keg.parent()
    && parent != ctx.layout.cellar_dir()
  {
    let _ = tokio::fs::remove_dir(parent).await;
  }
}

fn io_reason(e: std::io::Error) -> FailureReason {
  FailureReason::Io { message: e.to_string() }
}

fn artifact_reason(e: ArtifactError) -> FailureReason {
  match e {
    ArtifactError::ChecksumMismatch { url, expected, actual } => FailureReason::ChecksumMismatch { url, expected, actual },
    ArtifactError::Fetch { url, message, .. } => FailureReason::Fetch { url, message },
    other => FailureReason::Io {
      message: other.to_string(),
    },
  }
}

fn step_reason(e: StepError) -> FailureReason {
  match e {
    StepError::Cancelled => FailureReason::Cancelled,
    StepError::Command { step, code, ref stderr, .. } => {
      let message = if stderr.is_empty() {
        e.to_string()
      } else {
        format!("{e}\n{stderr}")
      };
      FailureReason::BuildCommand { step, code, message }
    }
    StepError::Placeholder { step, .. } | StepError::Io { step, .. } => FailureReason::BuildCommand {
      step,
      code: None,
      message: e.to_string(),
    },
  }
}

fn stage_reason(e: ResourceStageError) -> FailureReason {
  if e.kind() == crate::error::ErrorKind::Cancelled {
    return FailureReason::Cancelled;
  }
  FailureReason::ResourceStage {
    resource: e.resource.clone(),
    message: e.failure.to_string(),
  }
}
