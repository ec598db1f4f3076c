//! `$${...}` placeholders in build steps and service definitions.
//!
//! Formula steps refer to paths that only exist once a package is being
//! built: the keg it installs into, the scratch directory it builds in, the
//! kegs of its dependencies. Steps carry these as placeholders which are
//! substituted right before the step runs.
//!
//! | Placeholder        | Value                                        |
//! |--------------------|----------------------------------------------|
//! | `$${prefix}`       | the package keg                              |
//! | `$${buildpath}`    | the scoped working directory                 |
//! | `$${var}`          | the shared `var` directory                   |
//! | `$${vendor}`       | the package-private resource directory       |
//! | `$${target}`       | the install target of the resource in flight |
//! | `$${dep:<name>}`   | keg of dependency `<name>`                   |
//! | `$${step:N}`       | trimmed stdout of step N of the same phase   |
//!
//! A single `$` passes through, so `$HOME` and `$PATH` reach the shell
//! untouched. `$$${` produces a literal `$${`.
//!
//! ```
//! use cellar_lib::placeholder::{parse, Dir, Placeholder, Segment};
//!
//! let segments = parse("$${prefix}/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Dir(Dir::Prefix)),
//!     Segment::Literal("/bin:$PATH".to_string()),
//! ]);
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use thiserror::Error;

/// Directories known by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Dir {
  Prefix,
  BuildPath,
  Var,
  Vendor,
  Target,
}

impl Dir {
  fn from_name(name: &str) -> Option<Self> {
    match name {
      "prefix" => Some(Dir::Prefix),
      "buildpath" => Some(Dir::BuildPath),
      "var" => Some(Dir::Var),
      "vendor" => Some(Dir::Vendor),
      "target" => Some(Dir::Target),
      _ => None,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Dir::Prefix => "prefix",
      Dir::BuildPath => "buildpath",
      Dir::Var => "var",
      Dir::Vendor => "vendor",
      Dir::Target => "target",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Dir(Dir),
  Dep(String),
  Step(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at byte {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("invalid step index: {0}")]
  InvalidStepIndex(String),

  #[error("`$${{{0}}}` is not available here")]
  UnavailableDir(&'static str),

  #[error("`$${{dep:{0}}}` does not name a dependency of this package")]
  UnknownDependency(String),

  #[error("`$${{step:{0}}}` refers to a step that has not run")]
  StepNotRun(usize),
}

/// Supplies values for placeholders while steps execute.
pub trait Resolver {
  fn resolve_dir(&self, dir: Dir) -> Result<&str, PlaceholderError>;

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError>;

  fn resolve_step(&self, index: usize) -> Result<&str, PlaceholderError>;
}

/// Split `input` into literal text and placeholders.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut rest = input;
  let mut offset = 0;

  while let Some(idx) = rest.find("$$") {
    literal.push_str(&rest[..idx]);
    let after = &rest[idx + 2..];
    let start = offset + idx;

    if let Some(escaped) = after.strip_prefix("${") {
      literal.push_str("$${");
      offset = start + 4;
      rest = escaped;
    } else if let Some(body) = after.strip_prefix('{') {
      let close = body.find('}').ok_or(PlaceholderError::Unclosed(start))?;
      if !literal.is_empty() {
        segments.push(Segment::Literal(std::mem::take(&mut literal)));
      }
      segments.push(Segment::Placeholder(parse_body(&body[..close])?));
      offset = start + 3 + close + 1;
      rest = &body[close + 1..];
    } else {
      literal.push_str("$$");
      offset = start + 2;
      rest = after;
    }
  }

  literal.push_str(rest);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

fn parse_body(body: &str) -> Result<Placeholder, PlaceholderError> {
  if let Some(dir) = Dir::from_name(body) {
    return Ok(Placeholder::Dir(dir));
  }

  match body.split_once(':') {
    Some(("dep", name)) if !name.is_empty() => Ok(Placeholder::Dep(name.to_string())),
    Some(("step", index)) => index
      .parse::<usize>()
      .map(Placeholder::Step)
      .map_err(|_| PlaceholderError::InvalidStepIndex(index.to_string())),
    _ => Err(PlaceholderError::Unknown(body.to_string())),
  }
}

/// Parse and substitute in one go.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut out = String::new();
  for segment in segments {
    match segment {
      Segment::Literal(text) => out.push_str(text),
      Segment::Placeholder(Placeholder::Dir(dir)) => out.push_str(resolver.resolve_dir(*dir)?),
      Segment::Placeholder(Placeholder::Dep(name)) => out.push_str(resolver.resolve_dep(name)?),
      Segment::Placeholder(Placeholder::Step(index)) => out.push_str(resolver.resolve_step(*index)?),
    }
  }
  Ok(out)
}

/// The placeholder values for one phase of one package.
///
/// Step outputs accumulate as the phase runs, so `$${step:N}` only resolves
/// to steps that already completed.
#[derive(Debug, Clone, Default)]
pub struct StepScope {
  dirs: BTreeMap<Dir, String>,
  deps: BTreeMap<String, String>,
  steps: Vec<String>,
}

impl StepScope {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_dir(mut self, dir: Dir, path: impl Into<PathBuf>) -> Self {
    self.set_dir(dir, path);
    self
  }

  pub fn set_dir(&mut self, dir: Dir, path: impl Into<PathBuf>) {
    self.dirs.insert(dir, path.into().to_string_lossy().into_owned());
  }

  pub fn with_dep(mut self, name: &str, keg: impl Into<PathBuf>) -> Self {
    self.deps.insert(name.to_string(), keg.into().to_string_lossy().into_owned());
    self
  }

  pub fn dir(&self, dir: Dir) -> Option<&str> {
    self.dirs.get(&dir).map(String::as_str)
  }

  /// Kegs of every dependency, in name order.
  pub fn dep_kegs(&self) -> impl Iterator<Item = (&str, &str)> {
    self.deps.iter().map(|(name, keg)| (name.as_str(), keg.as_str()))
  }

  pub fn push_step_output(&mut self, stdout: &str) {
    self.steps.push(stdout.trim_end().to_string());
  }

  /// Forget step outputs when a new phase starts.
  pub fn reset_steps(&mut self) {
    self.steps.clear();
  }
}

impl Resolver for StepScope {
  fn resolve_dir(&self, dir: Dir) -> Result<&str, PlaceholderError> {
    self.dir(dir).ok_or(PlaceholderError::UnavailableDir(dir.name()))
  }

  fn resolve_dep(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .deps
      .get(name)
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnknownDependency(name.to_string()))
  }

  fn resolve_step(&self, index: usize) -> Result<&str, PlaceholderError> {
    self
      .steps
      .get(index)
      .map(String::as_str)
      .ok_or(PlaceholderError::StepNotRun(index))
  }
}
