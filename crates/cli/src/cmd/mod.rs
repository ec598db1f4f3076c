mod info;
mod install;
mod list;
mod plan;
mod services;
mod uninstall;

use std::path::Path;

use anyhow::{Context, Result};

use cellar_lib::formula::FormulaIndex;
use cellar_lib::platform::Platform;

pub use info::cmd_info;
pub use install::{InstallArgs, cmd_install};
pub use list::cmd_list;
pub use plan::cmd_plan;
pub use services::cmd_services;
pub use uninstall::{UninstallArgs, cmd_uninstall};

fn load_index(path: &Path) -> Result<FormulaIndex> {
  FormulaIndex::load(path).with_context(|| format!("Failed to load formulas from {}", path.display()))
}

fn current_platform() -> Result<Platform> {
  Platform::current().context("Unsupported platform")
}

fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}
