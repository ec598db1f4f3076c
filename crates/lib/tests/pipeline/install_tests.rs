//! Install pipeline tests.

use std::time::Duration;

use cellar_lib::error::ErrorKind;
use cellar_lib::execute::{ExecuteConfig, FailureReason, PackageState, execute};
use cellar_lib::ledger::{InstallSource, TestOutcome};
use cellar_lib::resolve::{ResolveError, ResolveOptions};
use serde_json::json;

use super::common::{Sandbox, config, copy_readme};

fn states(report: &cellar_lib::execute::RunReport, name: &str) -> Vec<&'static str> {
  report.get(name).unwrap().transitions.iter().map(PackageState::name).collect()
}

#[tokio::test]
async fn build_then_runtime_chain_installs_in_order() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "a",
    "versions": [{ "version": "1.0.0", "source": sb.source("a", "1.0.0") }],
    "recipe": { "install": [copy_readme("a")] }
  }));
  sb.write_formula(json!({
    "name": "b",
    "versions": [{ "version": "1.0.0", "source": sb.source("b", "1.0.0") }],
    "dependencies": [{ "name": "a", "kind": "build" }],
    "recipe": { "install": [copy_readme("b")] }
  }));
  sb.write_formula(json!({
    "name": "c",
    "versions": [{ "version": "1.0.0", "source": sb.source("c", "1.0.0") }],
    "dependencies": [{ "name": "b" }],
    "recipe": { "install": [copy_readme("c")] }
  }));

  let plan = sb.plan(&["c"], ResolveOptions::default()).await.unwrap();
  assert_eq!(plan.names(), vec!["a", "b", "c"]);

  let report = execute(&plan, sb.context(config())).await;
  assert!(report.is_success(), "{report:?}");

  let ledger = sb.ledger();
  let c = ledger.get("c", "1.0.0").await.unwrap().unwrap();
  assert_eq!(c.runtime_dependencies.get("b").map(String::as_str), Some("1.0.0"));
  assert_eq!(c.manifest, vec![sb.keg("c", "1.0.0").join("share/c/README")]);
  assert_eq!(c.source, InstallSource::Source);
  assert_eq!(sb.scratch_entries(), 0);
}

#[tokio::test]
async fn failed_root_fails_whole_chain_without_fetching() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "a",
    "versions": [{ "version": "1.0.0", "source": sb.source("a", "1.0.0") }],
    "recipe": { "build": [{ "type": "shell", "cmd": "exit 2" }] }
  }));
  sb.write_formula(json!({
    "name": "b",
    "versions": [{ "version": "1.0.0", "source": sb.source("b", "1.0.0") }],
    "dependencies": [{ "name": "a", "kind": "build" }]
  }));
  sb.write_formula(json!({
    "name": "c",
    "versions": [{ "version": "1.0.0", "source": sb.source("c", "1.0.0") }],
    "dependencies": [{ "name": "b", "kind": "runtime" }]
  }));

  let report = sb.install(&["c"]).await;

  assert_eq!(report.get("a").unwrap().failure().unwrap().kind(), ErrorKind::BuildCommand);
  for name in ["b", "c"] {
    let outcome = report.get(name).unwrap();
    assert_eq!(outcome.failure().unwrap().kind(), ErrorKind::DependencyFailed);
    assert_eq!(states(&report, name), vec!["pending", "failed"]);
  }
  assert_eq!(sb.fetcher.calls_for("b-1.0.0"), 0);
  assert_eq!(sb.fetcher.calls_for("c-1.0.0"), 0);
  assert!(sb.ledger().installed().await.unwrap().is_empty());
}

#[tokio::test]
async fn checksum_mismatch_leaves_no_record() {
  let sb = Sandbox::new();
  let mut source = sb.source("zlib", "1.3.1");
  source["sha256"] = json!(cellar_lib::util::hash::hash_bytes(b"something else").0);
  sb.write_formula(json!({
    "name": "zlib",
    "versions": [{ "version": "1.3.1", "source": source }],
    "recipe": { "install": [copy_readme("zlib")] }
  }));

  let report = sb.install(&["zlib"]).await;

  let outcome = report.get("zlib").unwrap();
  assert!(matches!(outcome.failure(), Some(FailureReason::ChecksumMismatch { .. })));
  assert_eq!(states(&report, "zlib"), vec!["pending", "fetching", "verifying", "failed"]);
  assert!(sb.ledger().get("zlib", "1.3.1").await.unwrap().is_none());
  assert!(!sb.keg("zlib", "1.3.1").exists());
  // a bad download is never cached
  assert_eq!(std::fs::read_dir(sb.layout().artifacts_dir()).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn resource_checksum_mismatch_blocks_package() {
  let sb = Sandbox::new();
  let mut ply = sb.archive("ply-3.11.tar.gz", &[("ply-3.11/ply/lex.py", "lex")]);
  ply["sha256"] = json!(cellar_lib::util::hash::hash_bytes(b"tampered").0);
  let six = sb.archive("six-1.16.0.tar.gz", &[("six-1.16.0/six.py", "six")]);
  let copy = json!({ "type": "shell", "cmd": "mkdir -p $${target} && cp -R . $${target}/" });
  sb.write_formula(json!({
    "name": "bind",
    "versions": [{ "version": "9.18.24", "source": sb.source("bind", "9.18.24") }],
    "resources": [
      { "name": "six", "source": six, "install": [copy] },
      { "name": "ply", "source": ply, "install": [copy] }
    ],
    "recipe": { "install": [copy_readme("bind")] }
  }));

  let report = sb.install(&["bind"]).await;

  let outcome = report.get("bind").unwrap();
  assert!(!outcome.is_installed());
  match outcome.failure() {
    Some(FailureReason::ResourceStage { resource, .. }) => assert_eq!(resource, "ply"),
    other => panic!("unexpected failure {other:?}"),
  }
  assert!(!outcome.visited(&PackageState::Building));
  assert!(sb.ledger().get("bind", "9.18.24").await.unwrap().is_none());
  assert!(!sb.keg("bind", "9.18.24").exists());
}

#[tokio::test]
async fn resources_are_vendored_before_build() {
  let sb = Sandbox::new();
  let ply = sb.archive("ply-3.11.tar.gz", &[("ply-3.11/ply/lex.py", "lex")]);
  let ply_sha = ply["sha256"].clone();
  sb.write_formula(json!({
    "name": "bind",
    "versions": [{ "version": "9.18.24", "source": sb.source("bind", "9.18.24") }],
    "resources": [{
      "name": "ply",
      "source": ply,
      "install": [{ "type": "shell", "cmd": "mkdir -p $${target}/ply && cp -R ply $${target}/ply/" }]
    }],
    "recipe": {
      "build": [{ "type": "shell", "cmd": "test -f $${vendor}/ply/ply/lex.py" }],
      "install": [copy_readme("bind")]
    }
  }));

  let report = sb.install(&["bind"]).await;

  assert!(report.is_success(), "{report:?}");
  assert!(report.get("bind").unwrap().visited(&PackageState::Staging));
  let keg = sb.keg("bind", "9.18.24");
  assert!(keg.join("libexec/vendor/ply/ply/lex.py").is_file());

  let record = report.get("bind").unwrap().record.as_ref().unwrap();
  assert_eq!(record.resources.get("ply").map(String::as_str), ply_sha.as_str());
  assert_eq!(record.vendor_hash.as_ref().map(String::len), Some(64));
}

#[tokio::test]
async fn same_artifact_is_downloaded_once() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "jq",
    "versions": [{ "version": "1.7.1", "source": sb.source("jq", "1.7.1") }],
    "recipe": { "install": [copy_readme("jq")] }
  }));

  assert!(sb.install(&["jq"]).await.is_success());
  let reinstall = ResolveOptions {
    reinstall: true,
    ..Default::default()
  };
  let report = sb.install_with(&["jq"], config(), reinstall).await;

  assert!(report.is_success());
  assert!(!report.get("jq").unwrap().skipped);
  assert_eq!(sb.fetcher.calls_for("jq-1.7.1"), 1);
}

#[tokio::test]
async fn failed_reinstall_keeps_previous_install() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "jq",
    "versions": [{ "version": "1.7.1", "source": sb.source("jq", "1.7.1") }],
    "recipe": { "install": [copy_readme("jq")] }
  }));
  assert!(sb.install(&["jq"]).await.is_success());
  let readme = sb.keg("jq", "1.7.1").join("share/jq/README");
  assert!(readme.is_file());

  sb.write_formula(json!({
    "name": "jq",
    "versions": [{ "version": "1.7.1", "source": sb.source("jq", "1.7.1") }],
    "recipe": {
      "build": [{ "type": "shell", "cmd": "exit 1" }],
      "install": [copy_readme("jq")]
    }
  }));
  let reinstall = ResolveOptions {
    reinstall: true,
    ..Default::default()
  };
  let report = sb.install_with(&["jq"], config(), reinstall).await;

  assert_eq!(report.get("jq").unwrap().failure().unwrap().kind(), ErrorKind::BuildCommand);
  let record = sb.ledger().get("jq", "1.7.1").await.unwrap().unwrap();
  assert!(cellar_lib::ledger::Ledger::verify_manifest(&record).is_intact());
  assert!(readme.is_file());
  assert!(!sb.keg("jq", "1.7.1.prev").exists());
}

#[tokio::test]
async fn successful_reinstall_drops_previous_keg() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "jq",
    "versions": [{ "version": "1.7.1", "source": sb.source("jq", "1.7.1") }],
    "recipe": { "install": [copy_readme("jq"), { "type": "shell", "cmd": "touch $${prefix}/stamp-$(ls $${prefix} | wc -l | tr -d ' ')" }] }
  }));
  assert!(sb.install(&["jq"]).await.is_success());
  let reinstall = ResolveOptions {
    reinstall: true,
    ..Default::default()
  };
  assert!(sb.install_with(&["jq"], config(), reinstall).await.is_success());

  let entries: Vec<String> = std::fs::read_dir(sb.keg("jq", "1.7.1").parent().unwrap())
    .unwrap()
    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
    .collect();
  assert_eq!(entries, ["1.7.1"]);
  let record = sb.ledger().get("jq", "1.7.1").await.unwrap().unwrap();
  assert_eq!(
    record.manifest,
    vec![
      sb.keg("jq", "1.7.1").join("share/jq/README"),
      sb.keg("jq", "1.7.1").join("stamp-1"),
    ]
  );
}

#[tokio::test]
async fn cancellation_reaches_nested_shells() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "nested",
    "versions": [{ "version": "1.0.0", "source": sb.source("nested", "1.0.0") }],
    "recipe": {
      "install": [{ "type": "shell", "cmd": "sh -c 'sleep 1; mkdir -p $${prefix}/bin; touch $${prefix}/bin/late'; true" }]
    }
  }));
  let plan = sb.plan(&["nested"], ResolveOptions::default()).await.unwrap();
  let ctx = sb.context(config());
  let token = ctx.cancel_token();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();
  });

  let report = execute(&plan, ctx).await;
  assert_eq!(report.get("nested").unwrap().failure(), Some(&FailureReason::Cancelled));

  tokio::time::sleep(Duration::from_secs(2)).await;
  assert!(!sb.keg("nested", "1.0.0").exists());
}

#[tokio::test]
async fn cancellation_leaves_nothing_behind() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "slow",
    "versions": [{ "version": "1.0.0", "source": sb.source("slow", "1.0.0") }],
    "recipe": {
      "build": [{ "type": "shell", "cmd": "mkdir -p $${prefix} && touch $${prefix}/partial && sleep 30" }]
    }
  }));
  let plan = sb.plan(&["slow"], ResolveOptions::default()).await.unwrap();
  let ctx = sb.context(config());
  let token = ctx.cancel_token();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();
  });

  let started = std::time::Instant::now();
  let report = execute(&plan, ctx).await;

  assert!(started.elapsed() < Duration::from_secs(20));
  assert_eq!(report.get("slow").unwrap().failure(), Some(&FailureReason::Cancelled));
  assert!(sb.ledger().get("slow", "1.0.0").await.unwrap().is_none());
  assert!(!sb.keg("slow", "1.0.0").exists());
  assert_eq!(sb.scratch_entries(), 0);
}

#[tokio::test]
async fn intact_install_is_skipped_and_damaged_one_repaired() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "tree",
    "versions": [{ "version": "2.1.1", "source": sb.source("tree", "2.1.1") }],
    "recipe": { "install": [copy_readme("tree")] }
  }));
  assert!(sb.install(&["tree"]).await.is_success());

  let second = sb.install(&["tree"]).await;
  let outcome = second.get("tree").unwrap();
  assert!(outcome.skipped);
  assert_eq!(states(&second, "tree"), vec!["pending", "installed"]);

  let readme = sb.keg("tree", "2.1.1").join("share/tree/README");
  std::fs::remove_file(&readme).unwrap();

  let third = sb.install(&["tree"]).await;
  let outcome = third.get("tree").unwrap();
  assert!(outcome.is_installed());
  assert!(!outcome.skipped);
  assert!(outcome.visited(&PackageState::Building));
  assert!(readme.is_file());
}

#[tokio::test]
async fn bottle_is_poured_and_post_install_still_runs() {
  let sb = Sandbox::new();
  let bottle = sb.archive(
    "ripgrep-14.1.0.x86_64_linux.bottle.tar.gz",
    &[("ripgrep/14.1.0/bin/rg", "#!/bin/sh\necho rg\n")],
  );
  sb.write_formula(json!({
    "name": "ripgrep",
    "versions": [{
      "version": "14.1.0",
      "source": sb.source("ripgrep", "14.1.0"),
      "bottles": { "x86_64_linux": bottle }
    }],
    "recipe": {
      "build": [{ "type": "shell", "cmd": "exit 1" }],
      "post_install": [{ "type": "mk_dir", "path": "$${var}/ripgrep" }]
    }
  }));

  let report = sb.install(&["ripgrep"]).await;

  assert!(report.is_success(), "{report:?}");
  assert_eq!(
    states(&report, "ripgrep"),
    vec!["pending", "fetching", "verifying", "installing", "post_installing", "installed"]
  );
  assert!(sb.keg("ripgrep", "14.1.0").join("bin/rg").is_file());
  assert!(sb.layout().var_dir().join("ripgrep").is_dir());
  let record = sb.ledger().get("ripgrep", "14.1.0").await.unwrap().unwrap();
  assert_eq!(record.source, InstallSource::Bottle);
  assert_eq!(sb.fetcher.calls_for("ripgrep-14.1.0.tar.gz"), 0);
}

#[tokio::test]
async fn post_install_failure_is_a_warning() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "named",
    "versions": [{ "version": "1.0.0", "source": sb.source("named", "1.0.0") }],
    "recipe": {
      "install": [copy_readme("named")],
      "post_install": [{ "type": "shell", "cmd": "exit 9" }]
    }
  }));

  let report = sb.install(&["named"]).await;

  let outcome = report.get("named").unwrap();
  assert!(outcome.is_installed());
  assert_eq!(outcome.warnings.len(), 1);
  let record = sb.ledger().get("named", "1.0.0").await.unwrap().unwrap();
  assert!(record.post_install_warning.is_some());
}

#[tokio::test]
async fn failing_test_is_recorded_not_fatal() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "moto",
    "versions": [{ "version": "5.0.0", "source": sb.source("moto", "5.0.0") }],
    "recipe": { "install": [copy_readme("moto")] },
    "test": { "steps": [{ "type": "shell", "cmd": "test -f $${prefix}/missing" }] }
  }));
  let run_tests = ExecuteConfig {
    run_tests: true,
    ..config()
  };

  let report = sb.install_with(&["moto"], run_tests, ResolveOptions::default()).await;

  let outcome = report.get("moto").unwrap();
  assert!(outcome.is_installed());
  assert!(outcome.visited(&PackageState::Testing));
  assert_eq!(outcome.record.as_ref().unwrap().test_outcome, TestOutcome::Failed);
}

#[tokio::test]
async fn tests_are_skipped_unless_requested() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "moto",
    "versions": [{ "version": "5.0.0", "source": sb.source("moto", "5.0.0") }],
    "test": { "steps": [{ "type": "shell", "cmd": "exit 1" }] }
  }));

  let report = sb.install(&["moto"]).await;

  let outcome = report.get("moto").unwrap();
  assert!(!outcome.visited(&PackageState::Testing));
  assert_eq!(outcome.record.as_ref().unwrap().test_outcome, TestOutcome::NotRun);
}

#[tokio::test]
async fn service_is_registered_with_resolved_paths() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "bind",
    "versions": [{ "version": "9.18.24", "source": sb.source("bind", "9.18.24") }],
    "recipe": { "install": [copy_readme("bind")] },
    "service": {
      "run": ["$${prefix}/sbin/named", "-f", "-c", "$${var}/named/named.conf"],
      "log_path": "$${var}/log/named/named.log",
      "keep_alive": true,
      "run_at_load": true
    }
  }));

  assert!(sb.install(&["bind"]).await.is_success());

  let entry = sb.services().get("bind").await.unwrap().unwrap();
  let keg = sb.keg("bind", "9.18.24");
  let var = sb.layout().var_dir();
  assert_eq!(entry.run[0], keg.join("sbin/named").display().to_string());
  assert_eq!(entry.run[3], var.join("named/named.conf").display().to_string());
  assert_eq!(entry.log_path, Some(var.join("log/named/named.log").display().to_string()));
  assert!(entry.keep_alive && entry.run_at_load);
}

#[tokio::test]
async fn failed_install_registers_no_service() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "moto",
    "versions": [{ "version": "5.0.0", "source": sb.source("moto", "5.0.0") }],
    "recipe": { "install": [{ "type": "shell", "cmd": "exit 1" }] },
    "service": { "run": ["$${prefix}/bin/moto_server"] }
  }));

  sb.install(&["moto"]).await;

  assert!(sb.services().get("moto").await.unwrap().is_none());
}

#[tokio::test]
async fn mirror_is_used_when_primary_is_unreachable() {
  let sb = Sandbox::new();
  let mut source = sb.source("snort", "3.1.78");
  let good = source["url"].as_str().unwrap().to_string();
  source["url"] = json!(format!("file://{}/missing/snort.tar.gz", sb.temp.path().display()));
  source["mirrors"] = json!([good]);
  sb.write_formula(json!({
    "name": "snort",
    "versions": [{ "version": "3.1.78", "source": source }],
    "recipe": { "install": [copy_readme("snort")] }
  }));

  let report = sb.install(&["snort"]).await;

  assert!(report.is_success(), "{report:?}");
  assert_eq!(sb.fetcher.calls_for("missing/snort"), 1);
}

#[tokio::test]
async fn patches_apply_before_build() {
  if !std::path::Path::new("/usr/bin/patch").exists() {
    return;
  }
  let sb = Sandbox::new();
  let patch = sb.file_artifact(
    "snort-readme.patch",
    "--- a/README\n+++ b/README\n@@ -1 +1 @@\n-snort 3.1.78\n+snort 3.1.78 patched\n",
  );
  sb.write_formula(json!({
    "name": "snort",
    "versions": [{
      "version": "3.1.78",
      "source": sb.source("snort", "3.1.78"),
      "patches": [patch]
    }],
    "recipe": { "install": [copy_readme("snort")] }
  }));

  let report = sb.install(&["snort"]).await;

  assert!(report.is_success(), "{report:?}");
  let readme = sb.keg("snort", "3.1.78").join("share/snort/README");
  assert_eq!(std::fs::read_to_string(readme).unwrap(), "snort 3.1.78 patched\n");
}

#[tokio::test]
async fn conflicting_install_is_refused() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "vim",
    "versions": [{ "version": "9.1.0", "source": sb.source("vim", "9.1.0") }],
    "recipe": { "install": [copy_readme("vim")] }
  }));
  sb.write_formula(json!({
    "name": "ex-vi",
    "versions": [{ "version": "3.0.0", "source": sb.source("ex-vi", "3.0.0") }],
    "conflicts": [{ "with": "vim", "reason": "both install bin/ex" }]
  }));
  assert!(sb.install(&["vim"]).await.is_success());

  let err = sb.plan(&["ex-vi"], ResolveOptions::default()).await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Conflict);
  assert!(matches!(err, ResolveError::Conflict(ref c) if c.reason == "both install bin/ex"));

  let allowed = ResolveOptions {
    allow_conflicts: true,
    ..Default::default()
  };
  assert!(sb.plan(&["ex-vi"], allowed).await.is_ok());
}

#[tokio::test]
async fn platform_conditional_dependency_is_dropped() {
  let sb = Sandbox::new();
  sb.write_formula(json!({
    "name": "libiconv",
    "versions": [{ "version": "1.17.0", "source": sb.source("libiconv", "1.17.0") }]
  }));
  sb.write_formula(json!({
    "name": "git",
    "versions": [{ "version": "2.44.0", "source": sb.source("git", "2.44.0") }],
    "dependencies": [{ "name": "libiconv", "condition": { "os": "macos" } }],
    "recipe": { "install": [copy_readme("git")] }
  }));

  let plan = sb.plan(&["git"], ResolveOptions::default()).await.unwrap();

  assert_eq!(plan.names(), vec!["git"]);
}
