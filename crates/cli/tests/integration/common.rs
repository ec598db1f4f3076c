//! Shared test helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own root, formula directory and artifact directory.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    for dir in ["formulas", "artifacts"] {
      std::fs::create_dir_all(temp.path().join(dir)).unwrap();
    }
    Self { temp }
  }

  /// Root path (isolated per test).
  pub fn root_path(&self) -> PathBuf {
    let p = self.temp.path().join("cellar");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn formulas_path(&self) -> PathBuf {
    self.temp.path().join("formulas")
  }

  /// Write a plain-file artifact and return its source JSON.
  pub fn artifact(&self, name: &str, content: &str) -> Value {
    let path = self.temp.path().join("artifacts").join(name);
    std::fs::write(&path, content).unwrap();
    source_for(&path)
  }

  pub fn write_formula(&self, formula: Value) {
    let name = formula["name"].as_str().unwrap().to_string();
    let path = self.formulas_path().join(format!("{name}.json"));
    std::fs::write(path, serde_json::to_vec_pretty(&formula).unwrap()).unwrap();
  }

  /// A package shipping one script as `bin/<name>`.
  pub fn script_formula(&self, name: &str, deps: &[&str]) {
    let script = format!("{name}.sh");
    let source = self.artifact(&script, &format!("#!/bin/sh\necho {name}\n"));
    let dependencies: Vec<Value> = deps.iter().map(|d| json!({ "name": d })).collect();
    self.write_formula(json!({
      "name": name,
      "description": format!("The {name} tool"),
      "versions": [{ "version": "1.0.0", "source": source }],
      "dependencies": dependencies,
      "recipe": {
        "install": [{ "type": "shell", "cmd": format!("mkdir -p $${{prefix}}/bin && cp {script} $${{prefix}}/bin/{name}") }]
      }
    }));
  }

  /// Command with `CELLAR_ROOT` pointed at this environment.
  pub fn cellar_cmd(&self) -> Command {
    let mut cmd = cargo_bin_cmd!("cellar");
    cmd.env("CELLAR_ROOT", self.root_path());
    cmd.env_remove("RUST_LOG");
    cmd
  }

  pub fn keg(&self, name: &str, version: &str) -> PathBuf {
    self.root_path().join("cellar").join(name).join(version)
  }
}

fn source_for(path: &Path) -> Value {
  json!({
    "url": format!("file://{}", path.display()),
    "sha256": cellar_lib::util::hash::hash_file(path).unwrap().0,
  })
}
