mod cmd;
mod output;
mod prompts;

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cellar_lib::platform::paths::Layout;

use crate::cmd::{InstallArgs, UninstallArgs};
use crate::output::OutputFormat;

/// Cellar - dependency-aware formula build orchestrator
#[derive(Parser)]
#[command(name = "cellar")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  /// Root directory (defaults to $CELLAR_ROOT or the user data dir)
  #[arg(long, global = true)]
  root: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Resolve, build and install packages
  Install(InstallArgs),

  /// Remove installed packages
  Uninstall(UninstallArgs),

  /// Show the build plan for packages without installing anything
  Plan {
    /// Packages to plan, optionally `name@constraint`
    #[arg(required = true)]
    packages: Vec<String>,

    /// Formula file or directory
    #[arg(short, long)]
    formulas: PathBuf,

    /// Plan every package even if already installed
    #[arg(long)]
    reinstall: bool,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// List installed packages
  List {
    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Show a formula and its installed versions
  Info {
    /// Package name
    package: String,

    /// Formula file or directory
    #[arg(short, long)]
    formulas: Option<PathBuf>,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// List registered services
  Services {
    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  let default_level = match cli.verbose {
    0 => "warn",
    1 => "info",
    _ => "debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let layout = match cli.root {
    Some(root) => Layout::new(root),
    None => Layout::from_env(),
  };

  match cli.command {
    Commands::Install(args) => cmd::cmd_install(&layout, args),
    Commands::Uninstall(args) => cmd::cmd_uninstall(&layout, args),
    Commands::Plan {
      packages,
      formulas,
      reinstall,
      output,
    } => cmd::cmd_plan(&layout, &packages, &formulas, reinstall, output),
    Commands::List { output } => cmd::cmd_list(&layout, output),
    Commands::Info {
      package,
      formulas,
      output,
    } => cmd::cmd_info(&layout, &package, formulas.as_deref(), output),
    Commands::Services { output } => cmd::cmd_services(&layout, output),
  }
}
