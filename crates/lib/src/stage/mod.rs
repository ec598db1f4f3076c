//! Resource staging.
//!
//! Resources are private sub-dependencies of a package, such as the Python
//! modules bind vendors for its tooling. They are fetched by checksum like
//! any other artifact, unpacked into a throwaway scratch directory and
//! installed with their own steps into `<keg>/libexec/vendor`, where only
//! the declaring package looks for them.
//!
//! Staging is all or nothing: the vendor directory is wiped before the
//! first resource and again after any failure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ErrorKind;
use crate::execute::steps::{StepError, StepRunner};
use crate::formula::Package;
use crate::placeholder::{Dir, StepScope};
use crate::store::{ArtifactError, ArtifactStore, source_root, unpack_archive};
use crate::util::hash::{ContentHash, DirHashError, hash_directory};

#[derive(Debug, Error)]
pub enum StageFailure {
  #[error(transparent)]
  Artifact(#[from] ArtifactError),

  #[error(transparent)]
  Step(#[from] StepError),

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  #[error("cancelled")]
  Cancelled,
}

#[derive(Debug, Error)]
#[error("staging resource '{resource}' of {package} failed: {failure}")]
pub struct ResourceStageError {
  pub package: String,
  pub resource: String,
  #[source]
  pub failure: StageFailure,
}

impl ResourceStageError {
  pub fn kind(&self) -> ErrorKind {
    match &self.failure {
      StageFailure::Cancelled | StageFailure::Step(StepError::Cancelled) => ErrorKind::Cancelled,
      _ => ErrorKind::ResourceStage,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedResource {
  pub name: String,
  pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct StagedResources {
  pub dir: PathBuf,
  pub resources: Vec<StagedResource>,
  /// Hash of the vendor tree after staging.
  pub content_hash: ContentHash,
}

pub struct ResourceStager {
  store: Arc<ArtifactStore>,
  scratch_root: PathBuf,
}

impl ResourceStager {
  /// Scratch directories are created under `scratch_root`.
  pub fn new(store: Arc<ArtifactStore>, scratch_root: impl Into<PathBuf>) -> Self {
    Self {
      store,
      scratch_root: scratch_root.into(),
    }
  }

  /// Stage every resource of `package` into `vendor`.
  pub async fn stage(
    &self,
    package: &Package,
    vendor: &Path,
    runner: &StepRunner,
    scope: &StepScope,
    cancel: &CancellationToken,
  ) -> Result<StagedResources, ResourceStageError> {
    wipe(vendor).await;
    let fail = |resource: &str, failure: StageFailure| ResourceStageError {
      package: package.name.clone(),
      resource: resource.to_string(),
      failure,
    };
    tokio::fs::create_dir_all(vendor)
      .await
      .map_err(|e| fail("-", StageFailure::Io(e)))?;

    let mut staged = Vec::with_capacity(package.resources.len());
    for resource in &package.resources {
      let result = if cancel.is_cancelled() {
        Err(StageFailure::Cancelled)
      } else {
        self.stage_one(resource, vendor, runner, scope, cancel).await
      };

      if let Err(failure) = result {
        warn!(package = %package.name, resource = %resource.name, error = %failure, "resource staging failed");
        wipe(vendor).await;
        return Err(fail(&resource.name, failure));
      }
      staged.push(StagedResource {
        name: resource.name.clone(),
        sha256: resource.source.sha256.clone(),
      });
    }

    let vendor_owned = vendor.to_path_buf();
    let content_hash = tokio::task::spawn_blocking(move || hash_directory(&vendor_owned, &[]))
      .await
      .map_err(|e| fail("-", StageFailure::Io(std::io::Error::other(e))))?
      .map_err(|e| fail("-", StageFailure::Hash(e)))?;

    info!(package = %package.name, resources = staged.len(), hash = %content_hash, "resources staged");
    Ok(StagedResources {
      dir: vendor.to_path_buf(),
      resources: staged,
      content_hash,
    })
  }

  async fn stage_one(
    &self,
    resource: &crate::formula::Resource,
    vendor: &Path,
    runner: &StepRunner,
    scope: &StepScope,
    cancel: &CancellationToken,
  ) -> Result<(), StageFailure> {
    let archive = self.store.fetch_source(&resource.source).await?;

    tokio::fs::create_dir_all(&self.scratch_root).await?;
    let scratch = tempfile::Builder::new()
      .prefix(&format!("resource-{}-", resource.name))
      .tempdir_in(&self.scratch_root)?;
    let unpack_dir = scratch.path().to_path_buf();
    let workdir = tokio::task::spawn_blocking(move || {
      unpack_archive(&archive, &unpack_dir, 0).map(|()| source_root(&unpack_dir))
    })
    .await
    .map_err(std::io::Error::other)??;
    debug!(resource = %resource.name, workdir = %workdir.display(), "resource unpacked");

    let mut scope = scope.clone();
    scope.set_dir(Dir::Target, vendor);
    scope.set_dir(Dir::Vendor, vendor);
    scope.set_dir(Dir::BuildPath, &workdir);
    runner.run_all(&resource.install, &workdir, &mut scope, cancel).await?;
    Ok(())
  }
}

async fn wipe(dir: &Path) {
  if let Err(e) = tokio::fs::remove_dir_all(dir).await
    && e.kind() != std::io::ErrorKind::NotFound
  {
    warn!(dir = %dir.display(), error = %e, "failed to clear vendor directory");
  }
}
