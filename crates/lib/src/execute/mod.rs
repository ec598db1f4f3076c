//! Plan execution.
//!
//! Packages start as soon as every in-plan dependency is `Installed`, up to
//! `parallelism` at a time. A failure marks every transitive dependent
//! `Failed(DependencyFailed)` without fetching anything for it; unrelated
//! branches keep going. Cancellation stops new packages from starting and
//! aborts the running steps of in-flight ones.

mod package;
pub mod steps;
mod types;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::ledger::Ledger;
use crate::platform::Platform;
use crate::platform::paths::Layout;
use crate::resolve::BuildPlan;
use crate::service::ServiceRegistrar;
use crate::stage::ResourceStager;
use crate::store::{ArtifactStore, Fetcher};

use package::DepKegs;

pub use steps::{StepError, StepRunner};
pub use types::{ExecuteConfig, FailureReason, PackageOutcome, PackageState, RunReport};

/// Everything a run needs, shared by all package tasks.
pub struct ExecContext {
  pub layout: Layout,
  pub platform: Platform,
  pub config: ExecuteConfig,
  pub store: Arc<ArtifactStore>,
  pub stager: ResourceStager,
  pub ledger: Arc<Ledger>,
  pub services: ServiceRegistrar,
  pub cancel: CancellationToken,
}

impl ExecContext {
  pub fn new(layout: Layout, platform: Platform, config: ExecuteConfig, fetcher: Arc<dyn Fetcher>) -> Self {
    let store = Arc::new(ArtifactStore::new(layout.artifacts_dir(), fetcher).with_retry(config.retry));
    Self {
      stager: ResourceStager::new(store.clone(), layout.tmp_dir()),
      ledger: Arc::new(Ledger::new(layout.clone())),
      services: ServiceRegistrar::new(&layout),
      store,
      layout,
      platform,
      config,
      cancel: CancellationToken::new(),
    }
  }

  /// Share an existing ledger instead of opening a new one.
  pub fn with_ledger(mut self, ledger: Arc<Ledger>) -> Self {
    self.ledger = ledger;
    self
  }

  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }
}

/// Execute `plan`, returning one outcome per entry in plan order.
pub async fn execute(plan: &BuildPlan, ctx: Arc<ExecContext>) -> RunReport {
  let entries = plan.entries();
  info!(
    packages = entries.len(),
    builds = plan.build_count(),
    parallelism = ctx.config.parallelism,
    "starting execution"
  );

  let mut outcomes: Vec<Option<PackageOutcome>> = vec![None; entries.len()];
  let mut waiting: Vec<usize> = entries.iter().map(|e| e.dependencies().count()).collect();
  let mut ready: BTreeSet<usize> = waiting
    .iter()
    .enumerate()
    .filter(|(_, count)| **count == 0)
    .map(|(pos, _)| pos)
    .collect();

  let semaphore = Arc::new(Semaphore::new(ctx.config.parallelism.max(1)));
  let mut join_set = JoinSet::new();
  let mut in_flight: HashMap<tokio::task::Id, usize> = HashMap::new();

  loop {
    while let Some(pos) = ready.pop_first() {
      let entry = entries[pos].clone();
      if ctx.cancel.is_cancelled() {
        let mut outcome = PackageOutcome::new(&entry.name, &entry.version);
        outcome.transitions.push(PackageState::Failed(FailureReason::Cancelled));
        settle(plan, &mut outcomes, &mut waiting, &mut ready, pos, outcome);
        continue;
      }

      let deps: DepKegs = entry
        .dependencies()
        .filter_map(|dep| plan.get(dep))
        .map(|dep| {
          (
            dep.name.clone(),
            (dep.version.clone(), ctx.layout.keg(&dep.name, &dep.version)),
          )
        })
        .collect();
      let ctx = ctx.clone();
      let semaphore = semaphore.clone();

      let handle = join_set.spawn(async move {
        let Ok(_permit) = semaphore.acquire().await else {
          let mut outcome = PackageOutcome::new(&entry.name, &entry.version);
          outcome.transitions.push(PackageState::Failed(FailureReason::Internal {
            message: "scheduler semaphore closed".to_string(),
          }));
          return (pos, outcome);
        };
        (pos, package::install_package(&ctx, &entry, &deps).await)
      });
      in_flight.insert(handle.id(), pos);
    }

    let Some(joined) = join_set.join_next_with_id().await else {
      break;
    };
    let (pos, outcome) = match joined {
      Ok((id, result)) => {
        in_flight.remove(&id);
        result
      }
      Err(e) => {
        let Some(pos) = in_flight.remove(&e.id()) else {
          error!(error = %e, "unknown package task failed");
          continue;
        };
        let entry = &entries[pos];
        error!(package = %entry.name, error = %e, "package task panicked");
        let mut outcome = PackageOutcome::new(&entry.name, &entry.version);
        outcome.transitions.push(PackageState::Failed(FailureReason::Internal {
          message: format!("package task panicked: {e}"),
        }));
        (pos, outcome)
      }
    };
    settle(plan, &mut outcomes, &mut waiting, &mut ready, pos, outcome);
  }

  let report = RunReport {
    outcomes: outcomes
      .into_iter()
      .zip(entries)
      .map(|(outcome, entry)| {
        outcome.unwrap_or_else(|| {
          // Only reachable if the plan's dependency edges are inconsistent.
          let mut outcome = PackageOutcome::new(&entry.name, &entry.version);
          outcome.transitions.push(PackageState::Failed(FailureReason::Internal {
            message: "package was never scheduled".to_string(),
          }));
          outcome
        })
      })
      .collect(),
  };

  info!(
    installed = report.installed().count(),
    skipped = report.outcomes.iter().filter(|o| o.skipped).count(),
    failed = report.failed().count(),
    "execution complete"
  );
  report
}

/// Record a finished package and release or fail its dependents.
fn settle(
  plan: &BuildPlan,
  outcomes: &mut [Option<PackageOutcome>],
  waiting: &mut [usize],
  ready: &mut BTreeSet<usize>,
  pos: usize,
  outcome: PackageOutcome,
) {
  let entries = plan.entries();
  let installed = outcome.is_installed();
  let cancelled = matches!(outcome.failure(), Some(FailureReason::Cancelled));
  outcomes[pos] = Some(outcome);

  if installed {
    for dependent in plan.dependents_of(&entries[pos].name) {
      if let Some(dep_pos) = plan.position(dependent)
        && outcomes[dep_pos].is_none()
      {
        waiting[dep_pos] -= 1;
        if waiting[dep_pos] == 0 {
          ready.insert(dep_pos);
        }
      }
    }
    return;
  }

  let mut queue = VecDeque::from([pos]);
  while let Some(failed) = queue.pop_front() {
    let failed_name = &entries[failed].name;
    for dependent in plan.dependents_of(failed_name) {
      let Some(dep_pos) = plan.position(dependent) else {
        continue;
      };
      if outcomes[dep_pos].is_some() {
        continue;
      }
      let entry = &entries[dep_pos];
      let reason = if cancelled {
        FailureReason::Cancelled
      } else {
        FailureReason::DependencyFailed {
          dependency: failed_name.clone(),
        }
      };
      warn!(package = %entry.name, dependency = %failed_name, "not starting, dependency did not install");
      let mut outcome = PackageOutcome::new(&entry.name, &entry.version);
      outcome.transitions.push(PackageState::Failed(reason));
      outcomes[dep_pos] = Some(outcome);
      ready.remove(&dep_pos);
      queue.push_back(dep_pos);
    }
  }
}
