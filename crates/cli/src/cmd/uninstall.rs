//! Implementation of the `cellar uninstall` command.

use anyhow::{Context, Result, bail};
use clap::Args;

use cellar_lib::ledger::{Ledger, UninstallOptions};
use cellar_lib::platform::paths::Layout;
use cellar_lib::service::ServiceRegistrar;
use cellar_lib::store_lock::{LockMode, StoreLock};

use super::runtime;
use crate::output::{OutputFormat, print_info, print_json, print_success, print_warning};
use crate::prompts::confirm;

#[derive(Args, Debug)]
pub struct UninstallArgs {
  /// Packages to remove; `name@version` removes a single version
  #[arg(required = true)]
  pub packages: Vec<String>,

  /// Remove packages even if other installed packages depend on them
  #[arg(long)]
  pub ignore_dependents: bool,

  /// Skip confirmation prompt
  #[arg(long)]
  pub force: bool,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

pub fn cmd_uninstall(layout: &Layout, args: UninstallArgs) -> Result<()> {
  if !confirm(&format!("Uninstall {}?", args.packages.join(", ")), args.force)? {
    print_info("Aborted");
    return Ok(());
  }

  let _lock = StoreLock::acquire(layout.root(), LockMode::Exclusive, "uninstall")?;

  let ledger = Ledger::new(layout.clone());
  let services = ServiceRegistrar::new(layout);
  let options = UninstallOptions {
    ignore_dependents: args.ignore_dependents,
  };
  let report = runtime()?
    .block_on(ledger.uninstall(&args.packages, options, &services))
    .context("Uninstall failed")?;

  if args.output.is_json() {
    #[derive(serde::Serialize)]
    struct UninstallOutput<'a> {
      removed: &'a [(String, String)],
      missing: Vec<String>,
      services_removed: &'a [String],
    }
    return print_json(&UninstallOutput {
      removed: &report.removed,
      missing: report.missing.iter().map(|p| p.display().to_string()).collect(),
      services_removed: &report.services_removed,
    });
  }

  if report.removed.is_empty() {
    bail!("Nothing was removed");
  }
  for (name, version) in &report.removed {
    print_success(&format!("Removed {name} {version}"));
  }
  for path in &report.missing {
    print_warning(&format!("Already missing: {}", path.display()));
  }
  for name in &report.services_removed {
    print_info(&format!("Deregistered service {name}"));
  }
  Ok(())
}
