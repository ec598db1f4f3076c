//! Implementation of the `cellar info` command.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Serialize;

use cellar_lib::formula::{DependencyKind, Package};
use cellar_lib::ledger::{InstallRecord, Ledger};
use cellar_lib::platform::paths::Layout;

use super::{load_index, runtime};
use crate::output::{OutputFormat, format_timestamp, print_json, print_stat, truncate_hash};

#[derive(Serialize)]
struct InfoOutput<'a> {
  #[serde(skip_serializing_if = "Option::is_none")]
  formula: Option<&'a Package>,
  installed: &'a [InstallRecord],
}

pub fn cmd_info(layout: &Layout, name: &str, formulas: Option<&Path>, output: OutputFormat) -> Result<()> {
  let index = formulas.map(load_index).transpose()?;
  let package = index.as_ref().and_then(|i| i.get(name)).map(|p| p.as_ref());
  let installed = runtime()?
    .block_on(Ledger::new(layout.clone()).versions_of(name))
    .context("Failed to read the ledger")?;

  if package.is_none() && installed.is_empty() {
    bail!("No formula or installed package named {name}");
  }

  if output.is_json() {
    return print_json(&InfoOutput {
      formula: package,
      installed: &installed,
    });
  }

  println!("{name}");
  if let Some(package) = package {
    if let Some(description) = &package.description {
      println!("{description}");
    }
    if let Some(homepage) = &package.homepage {
      print_stat("Homepage", homepage);
    }
    for version in &package.versions {
      let bottles: Vec<&str> = version.bottles.keys().map(String::as_str).collect();
      let bottles = if bottles.is_empty() {
        String::new()
      } else {
        format!(" bottles: {}", bottles.join(", "))
      };
      print_stat(
        "Version",
        &format!("{} (sha256 {}){bottles}", version.version, truncate_hash(&version.source.sha256)),
      );
    }
    for (label, kind) in [
      ("Build deps", DependencyKind::Build),
      ("Runtime deps", DependencyKind::Runtime),
      ("Test deps", DependencyKind::Test),
    ] {
      let deps: Vec<&str> = package
        .dependencies
        .iter()
        .filter(|d| d.kind == kind)
        .map(|d| d.name.as_str())
        .collect();
      if !deps.is_empty() {
        print_stat(label, &deps.join(", "));
      }
    }
    if !package.resources.is_empty() {
      let names: Vec<&str> = package.resources.iter().map(|r| r.name.as_str()).collect();
      print_stat("Resources", &names.join(", "));
    }
    for conflict in &package.conflicts {
      print_stat("Conflicts", &format!("{} ({})", conflict.with, conflict.reason));
    }
    if package.service.is_some() {
      print_stat("Service", "yes");
    }
  }

  if installed.is_empty() {
    print_stat("Installed", "no");
  }
  for record in &installed {
    print_stat(
      "Installed",
      &format!(
        "{} ({} files, {})",
        record.version,
        record.manifest.len(),
        format_timestamp(record.installed_at)
      ),
    );
  }
  Ok(())
}
