//! Shared sandbox for pipeline tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cellar_lib::execute::{ExecContext, ExecuteConfig, RunReport, execute};
use cellar_lib::formula::FormulaIndex;
use cellar_lib::ledger::Ledger;
use cellar_lib::platform::Platform;
use cellar_lib::platform::arch::Arch;
use cellar_lib::platform::os::Os;
use cellar_lib::platform::paths::Layout;
use cellar_lib::resolve::{BuildPlan, Request, ResolveError, ResolveOptions, resolve};
use cellar_lib::service::ServiceRegistrar;
use cellar_lib::store::{FetchFailure, Fetcher, HttpFetcher, RetryPolicy};
use cellar_lib::util::hash::hash_file;
use serde_json::{Value, json};
use tempfile::TempDir;

/// Reads `file://` URLs and counts requests per URL.
#[derive(Default)]
pub struct CountingFetcher {
  inner: HttpFetcher,
  calls: Mutex<HashMap<String, usize>>,
}

impl CountingFetcher {
  pub fn calls_for(&self, needle: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(url, _)| url.contains(needle))
      .map(|(_, n)| n)
      .sum()
  }
}

#[async_trait::async_trait]
impl Fetcher for CountingFetcher {
  async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchFailure> {
    *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
    self.inner.fetch(url).await
  }
}

/// Isolated root, formula directory and artifact directory.
pub struct Sandbox {
  pub temp: TempDir,
  pub fetcher: Arc<CountingFetcher>,
}

impl Sandbox {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    for dir in ["root", "formulas", "artifacts"] {
      std::fs::create_dir_all(temp.path().join(dir)).unwrap();
    }
    Self {
      temp,
      fetcher: Arc::new(CountingFetcher::default()),
    }
  }

  pub fn layout(&self) -> Layout {
    Layout::new(self.temp.path().join("root"))
  }

  pub fn ledger(&self) -> Ledger {
    Ledger::new(self.layout())
  }

  pub fn services(&self) -> ServiceRegistrar {
    ServiceRegistrar::new(&self.layout())
  }

  pub fn platform(&self) -> Platform {
    Platform::new(Arch::X86_64, Os::Linux)
  }

  /// Write a gzipped tarball and return its artifact JSON.
  pub fn archive(&self, file_name: &str, files: &[(&str, &str)]) -> Value {
    let path = self.temp.path().join("artifacts").join(file_name);
    let file = std::fs::File::create(&path).unwrap();
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, content) in files {
      let mut header = tar::Header::new_gnu();
      header.set_size(content.len() as u64);
      header.set_mode(0o755);
      header.set_cksum();
      builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap();
    artifact(&path)
  }

  /// Write a plain file and return its artifact JSON.
  pub fn file_artifact(&self, file_name: &str, content: &str) -> Value {
    let path = self.temp.path().join("artifacts").join(file_name);
    std::fs::write(&path, content).unwrap();
    artifact(&path)
  }

  /// Source tarball `<name>-<version>/README` for a package.
  pub fn source(&self, name: &str, version: &str) -> Value {
    self.archive(
      &format!("{name}-{version}.tar.gz"),
      &[(&format!("{name}-{version}/README"), &format!("{name} {version}\n"))],
    )
  }

  pub fn write_formula(&self, formula: Value) {
    let name = formula["name"].as_str().unwrap().to_string();
    let path = self.temp.path().join("formulas").join(format!("{name}.json"));
    std::fs::write(path, serde_json::to_vec_pretty(&formula).unwrap()).unwrap();
  }

  pub fn index(&self) -> FormulaIndex {
    FormulaIndex::load(&self.temp.path().join("formulas")).unwrap()
  }

  pub async fn plan(&self, requests: &[&str], options: ResolveOptions) -> Result<BuildPlan, ResolveError> {
    let index = self.index();
    let requests: Vec<Request> = requests.iter().map(|r| Request::parse_in(r, &index).unwrap()).collect();
    let installed = self.ledger().installed_set().await.unwrap();
    resolve(&requests, &index, &self.platform(), &installed, options)
  }

  pub fn context(&self, config: ExecuteConfig) -> Arc<ExecContext> {
    Arc::new(ExecContext::new(self.layout(), self.platform(), config, self.fetcher.clone()))
  }

  pub async fn install(&self, requests: &[&str]) -> RunReport {
    self.install_with(requests, config(), ResolveOptions::default()).await
  }

  pub async fn install_with(&self, requests: &[&str], config: ExecuteConfig, options: ResolveOptions) -> RunReport {
    let plan = self.plan(requests, options).await.unwrap();
    execute(&plan, self.context(config)).await
  }

  pub fn keg(&self, name: &str, version: &str) -> PathBuf {
    self.layout().keg(name, version)
  }

  pub fn scratch_entries(&self) -> usize {
    std::fs::read_dir(self.layout().tmp_dir()).map(|d| d.count()).unwrap_or(0)
  }
}

pub fn config() -> ExecuteConfig {
  ExecuteConfig {
    parallelism: 4,
    retry: RetryPolicy::none(),
    ..Default::default()
  }
}

pub fn artifact(path: &Path) -> Value {
  json!({
    "url": format!("file://{}", path.display()),
    "sha256": hash_file(path).unwrap().0,
  })
}

/// Install step copying the unpacked README into the keg.
pub fn copy_readme(name: &str) -> Value {
  json!({ "type": "shell", "cmd": format!("mkdir -p $${{prefix}}/share/{name} && cp README $${{prefix}}/share/{name}/") })
}
