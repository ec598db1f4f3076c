//! Implementation of the `cellar install` command.
//!
//! Resolves the requested packages against a formula index and the ledger,
//! then runs the plan. Holds the exclusive store lock for the whole run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use owo_colors::{OwoColorize, Stream};
use tracing::warn;

use cellar_lib::execute::{ExecContext, ExecuteConfig, PackageOutcome, RunReport, execute};
use cellar_lib::ledger::Ledger;
use cellar_lib::platform::paths::Layout;
use cellar_lib::resolve::{BuildPlan, Request, ResolveOptions, resolve};
use cellar_lib::store::HttpFetcher;
use cellar_lib::store_lock::{LockMode, StoreLock};

use super::{current_platform, load_index, runtime};
use crate::output::{OutputFormat, format_duration, print_error, print_info, print_json, print_success, print_warning, symbols};

#[derive(Args, Debug)]
pub struct InstallArgs {
  /// Packages to install, optionally `name@constraint`
  #[arg(required = true)]
  pub packages: Vec<String>,

  /// Formula file or directory
  #[arg(short, long)]
  pub formulas: PathBuf,

  /// Ignore bottles and build everything from source
  #[arg(short = 's', long)]
  pub build_from_source: bool,

  /// Run each package's test steps after installing
  #[arg(long)]
  pub test: bool,

  /// Rebuild packages that are already installed
  #[arg(long)]
  pub reinstall: bool,

  /// Install even when declared conflicts are active
  #[arg(long)]
  pub allow_conflicts: bool,

  /// Maximum number of packages built at once
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Shell used for shell steps
  #[arg(long)]
  pub shell: Option<String>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

pub fn cmd_install(layout: &Layout, args: InstallArgs) -> Result<()> {
  let index = load_index(&args.formulas)?;
  let platform = current_platform()?;
  let requests = args
    .packages
    .iter()
    .map(|p| Request::parse_in(p, &index))
    .collect::<Result<Vec<_>, _>>()?;

  let _lock = StoreLock::acquire(layout.root(), LockMode::Exclusive, "install")?;

  let rt = runtime()?;
  let ledger = Arc::new(Ledger::new(layout.clone()));
  let installed = rt.block_on(ledger.installed_set()).context("Failed to read the ledger")?;
  let options = ResolveOptions {
    allow_conflicts: args.allow_conflicts,
    reinstall: args.reinstall,
  };
  let plan = resolve(&requests, &index, &platform, &installed, options).context("Resolution failed")?;

  let mut config = ExecuteConfig {
    force_source: args.build_from_source,
    run_tests: args.test,
    shell: args.shell,
    ..Default::default()
  };
  if let Some(jobs) = args.jobs {
    config.parallelism = jobs.max(1);
  }

  let ctx = Arc::new(
    ExecContext::new(layout.clone(), platform, config, Arc::new(HttpFetcher::new())).with_ledger(ledger),
  );
  let cancel = ctx.cancel_token();

  let started = Instant::now();
  let report = rt.block_on(async {
    let interrupt = cancel.clone();
    let watcher = tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling");
        interrupt.cancel();
      }
    });
    let report = execute(&plan, ctx).await;
    watcher.abort();
    report
  });

  if args.output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&plan, &report);
    print_info(&format!("Finished in {}", format_duration(started.elapsed())));
  }

  let failed = report.failed().count();
  if failed > 0 {
    bail!("{failed} package(s) failed to install");
  }
  Ok(())
}

fn print_report(plan: &BuildPlan, report: &RunReport) {
  if plan.is_empty() {
    print_info("Nothing to install");
    return;
  }

  for outcome in &report.outcomes {
    if outcome.skipped {
      println!(
        "  {} {} {} (already installed)",
        symbols::INFO.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        outcome.name,
        outcome.version
      );
    } else if outcome.is_installed() {
      print_success(&format!("{} {}", outcome.name, outcome.version));
    } else if let Some(reason) = outcome.failure() {
      print_error(&format!("{} {}: {}", outcome.name, outcome.version, reason));
    }
    print_warnings(outcome);
  }

  let installed = report.installed().count();
  println!();
  println!("Install complete!");
  println!("  Installed: {installed}");
  println!("  Already installed: {}", report.outcomes.iter().filter(|o| o.skipped).count());
  println!("  Failed: {}", report.failed().count());
}

fn print_warnings(outcome: &PackageOutcome) {
  for warning in &outcome.warnings {
    print_warning(&format!("{}: {}", outcome.name, warning));
  }
}
