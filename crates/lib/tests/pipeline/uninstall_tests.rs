//! Install followed by uninstall.

use cellar_lib::error::ErrorKind;
use cellar_lib::ledger::{LedgerError, UninstallOptions};
use serde_json::json;

use super::common::{Sandbox, copy_readme};

fn app_and_lib(sb: &Sandbox) {
  sb.write_formula(json!({
    "name": "openssl",
    "versions": [{ "version": "3.2.1", "source": sb.source("openssl", "3.2.1") }],
    "recipe": { "install": [copy_readme("openssl")] }
  }));
  sb.write_formula(json!({
    "name": "curl",
    "versions": [{ "version": "8.6.0", "source": sb.source("curl", "8.6.0") }],
    "dependencies": [{ "name": "openssl" }],
    "recipe": { "install": [copy_readme("curl")] },
    "service": { "run": ["$${prefix}/bin/curl", "--version"] }
  }));
}

#[tokio::test]
async fn uninstall_removes_files_records_and_services() {
  let sb = Sandbox::new();
  app_and_lib(&sb);
  assert!(sb.install(&["curl"]).await.is_success());
  assert!(sb.services().get("curl").await.unwrap().is_some());

  let report = sb
    .ledger()
    .uninstall(
      &["curl".to_string(), "openssl".to_string()],
      UninstallOptions::default(),
      &sb.services(),
    )
    .await
    .unwrap();

  assert_eq!(
    report.removed,
    vec![
      ("curl".to_string(), "8.6.0".to_string()),
      ("openssl".to_string(), "3.2.1".to_string())
    ]
  );
  assert_eq!(report.services_removed, vec!["curl".to_string()]);
  assert!(sb.ledger().installed().await.unwrap().is_empty());
  assert!(sb.services().list().await.unwrap().is_empty());
  // kegs and their name directories are pruned
  let cellar = sb.layout().cellar_dir();
  assert_eq!(std::fs::read_dir(&cellar).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn uninstall_refuses_while_still_required() {
  let sb = Sandbox::new();
  app_and_lib(&sb);
  assert!(sb.install(&["curl"]).await.is_success());

  let err = sb
    .ledger()
    .uninstall(&["openssl".to_string()], UninstallOptions::default(), &sb.services())
    .await
    .unwrap_err();

  assert!(matches!(&err, LedgerError::StillRequired { dependents, .. } if dependents == &vec!["curl".to_string()]));
  assert!(sb.keg("openssl", "3.2.1").join("share/openssl/README").is_file());

  let forced = UninstallOptions {
    ignore_dependents: true,
  };
  sb.ledger()
    .uninstall(&["openssl".to_string()], forced, &sb.services())
    .await
    .unwrap();
  assert!(!sb.keg("openssl", "3.2.1").exists());
  assert!(sb.ledger().get("curl", "8.6.0").await.unwrap().is_some());
}

#[tokio::test]
async fn missing_files_only_warn() {
  let sb = Sandbox::new();
  app_and_lib(&sb);
  assert!(sb.install(&["openssl"]).await.is_success());
  let readme = sb.keg("openssl", "3.2.1").join("share/openssl/README");
  std::fs::remove_file(&readme).unwrap();

  let report = sb
    .ledger()
    .uninstall(&["openssl".to_string()], UninstallOptions::default(), &sb.services())
    .await
    .unwrap();

  assert_eq!(report.missing, vec![readme]);
  assert!(sb.ledger().get("openssl", "3.2.1").await.unwrap().is_none());
}

#[tokio::test]
async fn corrupt_record_is_fatal() {
  let sb = Sandbox::new();
  app_and_lib(&sb);
  assert!(sb.install(&["openssl"]).await.is_success());
  let record = sb.layout().ledger_dir().join("openssl/3.2.1.json");
  std::fs::write(&record, "{ not json").unwrap();

  let err = sb.ledger().installed().await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::LedgerCorruption);

  assert!(sb.ledger().get("openssl", "3.2.1").await.is_err());
  assert_eq!(std::fs::read_to_string(&record).unwrap(), "{ not json");
}
