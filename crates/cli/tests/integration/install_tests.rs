//! install / uninstall / list / services through the binary.

use predicates::prelude::*;
use serde_json::json;

use super::common::TestEnv;

#[test]
fn install_builds_dependencies_first() {
  let env = TestEnv::new();
  env.script_formula("zlib", &[]);
  env.script_formula("curl", &["zlib"]);

  env
    .cellar_cmd()
    .arg("install")
    .arg("curl")
    .arg("--formulas")
    .arg(env.formulas_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("Installed: 2"));

  assert!(env.keg("zlib", "1.0.0").join("bin/zlib").is_file());
  assert!(env.keg("curl", "1.0.0").join("bin/curl").is_file());
}

#[test]
fn second_install_is_a_noop() {
  let env = TestEnv::new();
  env.script_formula("jq", &[]);

  let install = |env: &TestEnv| {
    env
      .cellar_cmd()
      .args(["install", "jq", "--formulas"])
      .arg(env.formulas_path())
      .assert()
      .success()
  };
  install(&env);
  install(&env).stdout(predicate::str::contains("Already installed: 1"));
}

#[test]
fn failed_build_exits_nonzero() {
  let env = TestEnv::new();
  let source = env.artifact("broken.sh", "#!/bin/sh\n");
  env.write_formula(json!({
    "name": "broken",
    "versions": [{ "version": "0.1.0", "source": source }],
    "recipe": { "build": [{ "type": "shell", "cmd": "echo nope >&2; exit 4" }] }
  }));

  env
    .cellar_cmd()
    .args(["install", "broken", "--formulas"])
    .arg(env.formulas_path())
    .assert()
    .failure()
    .stderr(predicate::str::contains("1 package(s) failed"));

  assert!(!env.keg("broken", "0.1.0").exists());
}

#[test]
fn list_json_reports_installed_records() {
  let env = TestEnv::new();
  env.script_formula("tree", &[]);
  env
    .cellar_cmd()
    .args(["install", "tree", "--formulas"])
    .arg(env.formulas_path())
    .assert()
    .success();

  let output = env.cellar_cmd().args(["list", "-o", "json"]).output().unwrap();
  assert!(output.status.success());
  let records: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
  assert_eq!(records[0]["name"], "tree");
  assert_eq!(records[0]["version"], "1.0.0");
  assert_eq!(records[0]["source"], "source");
}

#[test]
fn uninstall_refuses_required_dependency() {
  let env = TestEnv::new();
  env.script_formula("openssl", &[]);
  env.script_formula("wget", &["openssl"]);
  env
    .cellar_cmd()
    .args(["install", "wget", "--formulas"])
    .arg(env.formulas_path())
    .assert()
    .success();

  env
    .cellar_cmd()
    .args(["uninstall", "openssl", "--force"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("wget"));

  env
    .cellar_cmd()
    .args(["uninstall", "wget", "openssl", "--force"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Removed wget 1.0.0"));

  assert!(!env.keg("openssl", "1.0.0").exists());
  env
    .cellar_cmd()
    .arg("list")
    .assert()
    .success()
    .stdout(predicate::str::contains("No packages installed"));
}

#[test]
fn services_lists_registered_service() {
  let env = TestEnv::new();
  let source = env.artifact("moto.sh", "#!/bin/sh\n");
  env.write_formula(json!({
    "name": "moto",
    "versions": [{ "version": "5.0.0", "source": source }],
    "recipe": { "install": [{ "type": "shell", "cmd": "mkdir -p $${prefix}/bin && cp moto.sh $${prefix}/bin/moto_server" }] },
    "service": {
      "run": ["$${prefix}/bin/moto_server", "--port", "5000"],
      "log_path": "$${var}/log/moto.log",
      "keep_alive": true
    }
  }));
  env
    .cellar_cmd()
    .args(["install", "moto", "--formulas"])
    .arg(env.formulas_path())
    .assert()
    .success();

  let bin = env.keg("moto", "5.0.0").join("bin/moto_server");
  env
    .cellar_cmd()
    .arg("services")
    .assert()
    .success()
    .stdout(predicate::str::contains(format!("{} --port 5000", bin.display())));
}

#[test]
fn info_shows_formula_and_install_state() {
  let env = TestEnv::new();
  env.script_formula("fd", &[]);

  env
    .cellar_cmd()
    .args(["info", "fd", "--formulas"])
    .arg(env.formulas_path())
    .assert()
    .success()
    .stdout(predicate::str::contains("The fd tool"))
    .stdout(predicate::str::contains("Installed: no"));
}
