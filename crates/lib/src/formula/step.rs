//! Build steps.
//!
//! Formula commands are inert data. The executor dispatches on the variant;
//! every string field may contain `$${...}` placeholders.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildStep {
  /// A script run by the configured shell (`/bin/sh -c` by default).
  Shell {
    cmd: String,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
  },
  /// A program run directly, without a shell.
  Exec {
    bin: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
  },
  WriteFile { path: String, content: String },
  MkDir { path: String },
  Symlink { target: String, link: String },
}

impl BuildStep {
  /// Short label for logs and error messages.
  pub fn describe(&self) -> String {
    match self {
      BuildStep::Shell { cmd, .. } => {
        let first = cmd.lines().next().unwrap_or_default();
        if first.len() > 60 {
          let cut = first.char_indices().nth(60).map(|(i, _)| i).unwrap_or(first.len());
          format!("sh: {}...", &first[..cut])
        } else {
          format!("sh: {first}")
        }
      }
      BuildStep::Exec { bin, .. } => format!("exec: {bin}"),
      BuildStep::WriteFile { path, .. } => format!("write: {path}"),
      BuildStep::MkDir { path } => format!("mkdir: {path}"),
      BuildStep::Symlink { link, .. } => format!("symlink: {link}"),
    }
  }

  pub fn shell(cmd: impl Into<String>) -> Self {
    BuildStep::Shell {
      cmd: cmd.into(),
      env: BTreeMap::new(),
      cwd: None,
    }
  }
}
