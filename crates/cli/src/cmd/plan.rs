//! Implementation of the `cellar plan` command.
//!
//! Resolves packages exactly as `install` would and prints the build order
//! without touching the store.

use std::path::Path;

use anyhow::{Context, Result};
use owo_colors::{OwoColorize, Stream};

use cellar_lib::ledger::Ledger;
use cellar_lib::platform::paths::Layout;
use cellar_lib::resolve::{PlanAction, Request, ResolveOptions, resolve};

use super::{current_platform, load_index, runtime};
use crate::output::{OutputFormat, print_info, print_json, symbols};

pub fn cmd_plan(layout: &Layout, packages: &[String], formulas: &Path, reinstall: bool, output: OutputFormat) -> Result<()> {
  let index = load_index(formulas)?;
  let platform = current_platform()?;
  let requests = packages
    .iter()
    .map(|p| Request::parse_in(p, &index))
    .collect::<Result<Vec<_>, _>>()?;

  let installed = runtime()?
    .block_on(Ledger::new(layout.clone()).installed_set())
    .context("Failed to read the ledger")?;
  let options = ResolveOptions {
    reinstall,
    ..Default::default()
  };
  let plan = resolve(&requests, &index, &platform, &installed, options).context("Resolution failed")?;

  if output.is_json() {
    return print_json(&plan);
  }

  println!("Plan for {platform} (bottle tag {})", platform.bottle_tag());
  for (level, wave) in plan.waves().iter().enumerate() {
    println!("  Wave {}", level + 1);
    for entry in wave {
      let marker = match entry.action {
        PlanAction::Build => symbols::ADD.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
        PlanAction::Skip => symbols::INFO.if_supports_color(Stream::Stdout, |s| s.dimmed()).to_string(),
      };
      let bottled = entry
        .package
        .version(&entry.version)
        .is_some_and(|v| v.bottles.contains_key(&platform.bottle_tag()));
      let how = match (entry.action, bottled) {
        (PlanAction::Skip, _) => "installed",
        (PlanAction::Build, true) => "bottle",
        (PlanAction::Build, false) => "source",
      };
      println!("    {marker} {} {} ({how})", entry.name, entry.version);
      let deps: Vec<&str> = entry.dependencies().collect();
      if !deps.is_empty() {
        println!("        {} {}", symbols::ARROW, deps.join(", "));
      }
    }
  }
  println!();
  print_info(&format!(
    "{} package(s), {} to build",
    plan.len(),
    plan.build_count()
  ));
  Ok(())
}
