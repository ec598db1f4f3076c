//! Implementation of the `cellar services` command.

use anyhow::{Context, Result};

use cellar_lib::platform::paths::Layout;
use cellar_lib::service::ServiceRegistrar;

use super::runtime;
use crate::output::{OutputFormat, print_info, print_json, print_stat};

pub fn cmd_services(layout: &Layout, output: OutputFormat) -> Result<()> {
  let entries = runtime()?
    .block_on(ServiceRegistrar::new(layout).list())
    .context("Failed to read service registrations")?;

  if output.is_json() {
    return print_json(&entries);
  }

  if entries.is_empty() {
    print_info("No services registered");
    return Ok(());
  }

  for entry in &entries {
    println!("{} {}", entry.name, entry.version);
    print_stat("Run", &entry.run.join(" "));
    if let Some(dir) = &entry.working_dir {
      print_stat("Working dir", dir);
    }
    if let Some(log) = &entry.log_path {
      print_stat("Log", log);
    }
    if let Some(log) = &entry.error_log_path {
      print_stat("Error log", log);
    }
    print_stat("Keep alive", &entry.keep_alive.to_string());
    print_stat("Run at load", &entry.run_at_load.to_string());
  }
  Ok(())
}
