//! Implementation of the `cellar list` command.

use anyhow::{Context, Result};

use cellar_lib::ledger::{InstallSource, Ledger, TestOutcome};
use cellar_lib::platform::paths::Layout;

use super::runtime;
use crate::output::{OutputFormat, format_timestamp, print_info, print_json};

pub fn cmd_list(layout: &Layout, output: OutputFormat) -> Result<()> {
  let records = runtime()?
    .block_on(Ledger::new(layout.clone()).installed())
    .context("Failed to read the ledger")?;

  if output.is_json() {
    return print_json(&records);
  }

  if records.is_empty() {
    print_info("No packages installed");
    return Ok(());
  }

  for record in &records {
    let source = match record.source {
      InstallSource::Bottle => "bottle",
      InstallSource::Source => "source",
    };
    let test = match record.test_outcome {
      TestOutcome::Failed => " [test failed]",
      _ => "",
    };
    println!(
      "{} {} ({source}, {}){test}",
      record.name,
      record.version,
      format_timestamp(record.installed_at)
    );
  }
  print_info(&format!("{} package(s) installed", records.len()));
  Ok(())
}
