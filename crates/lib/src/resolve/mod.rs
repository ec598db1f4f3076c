//! Dependency resolution.
//!
//! Turns a set of requested package names into a [`BuildPlan`]:
//!
//! 1. Walk dependency edges from the requests, dropping edges whose platform
//!    condition is false and test-only edges.
//! 2. Pick the highest version of each package satisfying every constraint.
//! 3. Reject cycles, naming the full cycle.
//! 4. Drop build-only dependencies of packages that are already installed.
//! 5. Order with Kahn's algorithm, breaking ties by name.
//! 6. Reject declared conflicts between active packages.

mod plan;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use semver::VersionReq;
use thiserror::Error;
use tracing::{debug, info};

pub use plan::{BuildPlan, PlanAction, PlanEntry};

use crate::error::ErrorKind;
use crate::formula::{DependencyKind, FormulaError, FormulaIndex, Package};
use crate::platform::Platform;

/// Installed versions by package name.
pub type InstalledSet = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
  /// Permit declared conflicts between active packages.
  pub allow_conflicts: bool,
  /// Rebuild requested packages even when already installed.
  pub reinstall: bool,
}

/// A requested package, optionally with a version requirement (`openssl@>=3`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub name: String,
  pub constraint: Option<String>,
}

impl Request {
  /// Parse `name` or `name@<req>`, splitting at the last `@`.
  pub fn parse(input: &str) -> Result<Self, ResolveError> {
    let (name, constraint) = match input.rsplit_once('@') {
      Some((name, req)) => (name.trim(), Some(req.trim().to_string())),
      None => (input.trim(), None),
    };
    if name.is_empty() {
      return Err(ResolveError::InvalidRequest(input.to_string()));
    }
    if let Some(req) = &constraint {
      VersionReq::parse(req).map_err(|_| ResolveError::InvalidRequest(input.to_string()))?;
    }
    Ok(Self {
      name: name.to_string(),
      constraint,
    })
  }

  /// Like [`Request::parse`], but an input naming a formula in `index`
  /// (`openssl@1.1`) is taken whole.
  pub fn parse_in(input: &str, index: &FormulaIndex) -> Result<Self, ResolveError> {
    let trimmed = input.trim();
    if index.contains(trimmed) {
      return Ok(Self {
        name: trimmed.to_string(),
        constraint: None,
      });
    }
    Self::parse(input)
  }
}

impl fmt::Display for Request {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.constraint {
      Some(req) => write!(f, "{}@{}", self.name, req),
      None => f.write_str(&self.name),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle: {}", path.join(" -> "))]
pub struct CycleError {
  /// The cycle with its first element repeated at the end.
  pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{a} conflicts with {b}: {reason}")]
pub struct ConflictError {
  pub a: String,
  pub b: String,
  pub reason: String,
}

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("unknown package '{name}'{}", required_by.as_ref().map(|r| format!(" (required by {r})")).unwrap_or_default())]
  UnknownPackage { name: String, required_by: Option<String> },

  #[error("no version of '{name}' satisfies {} (available: {})", constraints.join(", "), available.join(", "))]
  UnsatisfiableConstraint {
    name: String,
    constraints: Vec<String>,
    available: Vec<String>,
  },

  #[error(transparent)]
  Cycle(#[from] CycleError),

  #[error(transparent)]
  Conflict(#[from] ConflictError),

  #[error("invalid package request '{0}'")]
  InvalidRequest(String),

  #[error(transparent)]
  Formula(#[from] FormulaError),
}

impl ResolveError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      ResolveError::UnknownPackage { .. } | ResolveError::InvalidRequest(_) => ErrorKind::UnknownPackage,
      ResolveError::UnsatisfiableConstraint { .. } => ErrorKind::UnsatisfiableConstraint,
      ResolveError::Cycle(_) => ErrorKind::Cycle,
      ResolveError::Conflict(_) => ErrorKind::Conflict,
      ResolveError::Formula(e) => e.kind(),
    }
  }
}

/// Edges of one package after platform filtering.
#[derive(Debug, Default)]
struct Edges {
  build: BTreeSet<String>,
  runtime: BTreeSet<String>,
}

/// A constraint together with who imposed it.
struct Requirement {
  req: VersionReq,
  text: String,
  by: String,
}

pub fn resolve(
  requests: &[Request],
  index: &FormulaIndex,
  platform: &Platform,
  installed: &InstalledSet,
  options: ResolveOptions,
) -> Result<BuildPlan, ResolveError> {
  let requested: BTreeSet<&str> = requests.iter().map(|r| r.name.as_str()).collect();

  // 1. discovery
  let mut packages: BTreeMap<String, Arc<Package>> = BTreeMap::new();
  let mut edges: BTreeMap<String, Edges> = BTreeMap::new();
  let mut requirements: HashMap<String, Vec<Requirement>> = HashMap::new();
  let mut queue: VecDeque<(String, Option<String>)> = VecDeque::new();

  for request in requests {
    if let Some(text) = &request.constraint {
      let req = VersionReq::parse(text).map_err(|_| ResolveError::InvalidRequest(request.to_string()))?;
      requirements.entry(request.name.clone()).or_default().push(Requirement {
        req,
        text: text.clone(),
        by: "request".to_string(),
      });
    }
    queue.push_back((request.name.clone(), None));
  }

  while let Some((name, required_by)) = queue.pop_front() {
    if packages.contains_key(&name) {
      continue;
    }
    let package = index
      .get(&name)
      .cloned()
      .ok_or_else(|| ResolveError::UnknownPackage {
        name: name.clone(),
        required_by: required_by.clone(),
      })?;

    let mut pkg_edges = Edges::default();
    for dep in &package.dependencies {
      if dep.kind == DependencyKind::Test || !dep.condition.evaluate(platform) {
        debug!(package = %name, dependency = %dep.name, kind = ?dep.kind, "edge dropped");
        continue;
      }
      match dep.kind {
        DependencyKind::Build => pkg_edges.build.insert(dep.name.clone()),
        _ => pkg_edges.runtime.insert(dep.name.clone()),
      };
      if let Some(text) = &dep.constraint {
        let req = VersionReq::parse(text).map_err(|e| FormulaError::InvalidConstraint {
          package: name.clone(),
          dependency: dep.name.clone(),
          constraint: text.clone(),
          message: e.to_string(),
        })?;
        requirements.entry(dep.name.clone()).or_default().push(Requirement {
          req,
          text: text.clone(),
          by: name.clone(),
        });
      }
      queue.push_back((dep.name.clone(), Some(name.clone())));
    }

    edges.insert(name.clone(), pkg_edges);
    packages.insert(name, package);
  }

  // 2. version selection
  let mut selected: BTreeMap<String, String> = BTreeMap::new();
  for (name, package) in &packages {
    let reqs = requirements.get(name).map(Vec::as_slice).unwrap_or_default();
    selected.insert(name.clone(), select_version(package, reqs)?);
  }

  // 3. cycles over the full graph
  let graph = DepGraph::build(&edges);
  graph.check_acyclic()?;

  // 4. actions, then prune build-only deps of skipped packages
  let mut actions: BTreeMap<&str, PlanAction> = BTreeMap::new();
  for (name, version) in &selected {
    let present = installed.get(name).is_some_and(|v| v.contains(version));
    let forced = options.reinstall && requested.contains(name.as_str());
    let action = if present && !forced {
      PlanAction::Skip
    } else {
      PlanAction::Build
    };
    actions.insert(name.as_str(), action);
  }

  let mut needed: BTreeSet<&str> = BTreeSet::new();
  let mut stack: Vec<&str> = requested.iter().copied().collect();
  while let Some(name) = stack.pop() {
    if !needed.insert(name) {
      continue;
    }
    let pkg_edges = &edges[name];
    stack.extend(pkg_edges.runtime.iter().map(String::as_str));
    if actions[name] == PlanAction::Build {
      stack.extend(pkg_edges.build.iter().map(String::as_str));
    }
  }

  // 5. ordering
  let order = graph.kahn_order(&needed);
  let entries: Vec<PlanEntry> = order
    .into_iter()
    .map(|name| {
      let pkg_edges = &edges[name];
      let keep = |deps: &BTreeSet<String>| -> BTreeSet<String> {
        deps.iter().filter(|d| needed.contains(d.as_str())).cloned().collect()
      };
      PlanEntry {
        name: name.to_string(),
        version: selected[name].clone(),
        package: packages[name].clone(),
        action: actions[name],
        build_deps: keep(&pkg_edges.build),
        runtime_deps: keep(&pkg_edges.runtime),
        requested: requested.contains(name),
      }
    })
    .collect();
  let plan = BuildPlan::new(entries);

  // 6. conflicts
  if !options.allow_conflicts {
    check_conflicts(&plan, index, installed)?;
  }

  info!(
    entries = plan.len(),
    builds = plan.build_count(),
    order = %plan.names().join(", "),
    "resolved plan"
  );
  Ok(plan)
}

fn select_version(package: &Package, reqs: &[Requirement]) -> Result<String, ResolveError> {
  let mut candidates = Vec::with_capacity(package.versions.len());
  for version in &package.versions {
    candidates.push((version.semver()?, version.version.clone()));
  }
  candidates.sort_by(|a, b| b.0.cmp(&a.0));

  candidates
    .iter()
    .find(|(semver, _)| reqs.iter().all(|r| r.req.matches(semver)))
    .map(|(_, version)| version.clone())
    .ok_or_else(|| ResolveError::UnsatisfiableConstraint {
      name: package.name.clone(),
      constraints: reqs.iter().map(|r| format!("{} (from {})", r.text, r.by)).collect(),
      available: candidates.iter().map(|(_, v)| v.clone()).collect(),
    })
}

/// Active means in the plan or already installed.
fn check_conflicts(plan: &BuildPlan, index: &FormulaIndex, installed: &InstalledSet) -> Result<(), ConflictError> {
  let active: BTreeSet<&str> = plan
    .entries()
    .iter()
    .map(|e| e.name.as_str())
    .chain(installed.iter().filter(|(_, v)| !v.is_empty()).map(|(n, _)| n.as_str()))
    .collect();

  for name in &active {
    let Some(package) = plan.get(name).map(|e| e.package.clone()).or_else(|| index.get(name).cloned()) else {
      continue;
    };
    for conflict in &package.conflicts {
      let involves_plan = plan.get(name).is_some() || plan.get(&conflict.with).is_some();
      if conflict.with != *name && involves_plan && active.contains(conflict.with.as_str()) {
        return Err(ConflictError {
          a: name.to_string(),
          b: conflict.with.clone(),
          reason: conflict.reason.clone(),
        });
      }
    }
  }
  Ok(())
}

/// Dependency graph with edges pointing from dependency to dependent.
struct DepGraph<'a> {
  graph: DiGraph<&'a str, ()>,
  nodes: BTreeMap<&'a str, NodeIndex>,
}

impl<'a> DepGraph<'a> {
  fn build(edges: &'a BTreeMap<String, Edges>) -> Self {
    let mut graph = DiGraph::new();
    let mut nodes = BTreeMap::new();
    for name in edges.keys() {
      nodes.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for (name, pkg_edges) in edges {
      let dependent = nodes[name.as_str()];
      for dep in pkg_edges.build.union(&pkg_edges.runtime) {
        if let Some(&dependency) = nodes.get(dep.as_str()) {
          graph.update_edge(dependency, dependent, ());
        }
      }
    }
    Self { graph, nodes }
  }

  fn check_acyclic(&self) -> Result<(), CycleError> {
    let mut cyclic: Vec<Vec<NodeIndex>> = tarjan_scc(&self.graph)
      .into_iter()
      .filter(|scc| scc.len() > 1 || self.graph.contains_edge(scc[0], scc[0]))
      .collect();
    if cyclic.is_empty() {
      return Ok(());
    }

    for scc in &mut cyclic {
      scc.sort_by_key(|&n| self.graph[n]);
    }
    cyclic.sort_by_key(|scc| self.graph[scc[0]]);
    let scc = &cyclic[0];
    let start = scc[0];
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();

    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    self.walk_cycle(start, start, &members, &mut path, &mut visited);
    Err(CycleError {
      path: path.into_iter().map(|n| self.graph[n].to_string()).collect(),
    })
  }

  /// Depth-first from `node` along "depends on" edges until `start` recurs.
  fn walk_cycle(
    &self,
    start: NodeIndex,
    node: NodeIndex,
    members: &HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
  ) -> bool {
    let mut next: Vec<NodeIndex> = self
      .graph
      .neighbors_directed(node, Direction::Incoming)
      .filter(|n| members.contains(n))
      .collect();
    next.sort_by_key(|&n| self.graph[n]);
    next.dedup();

    for n in next {
      if n == start {
        path.push(start);
        return true;
      }
      if visited.insert(n) {
        path.push(n);
        if self.walk_cycle(start, n, members, path, visited) {
          return true;
        }
        path.pop();
      }
    }
    false
  }

  /// Kahn's algorithm over `subset`, smallest ready name first.
  fn kahn_order(&self, subset: &BTreeSet<&'a str>) -> Vec<&'a str> {
    let in_subset = |n: NodeIndex| subset.contains(self.graph[n]);
    let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
    let mut ready: BTreeSet<&'a str> = BTreeSet::new();

    for name in subset {
      let idx = self.nodes[name];
      let degree = self
        .graph
        .neighbors_directed(idx, Direction::Incoming)
        .filter(|&n| in_subset(n))
        .count();
      in_degree.insert(idx, degree);
      if degree == 0 {
        ready.insert(*name);
      }
    }

    let mut order = Vec::with_capacity(subset.len());
    while let Some(name) = ready.pop_first() {
      order.push(name);
      for dependent in self.graph.neighbors_directed(self.nodes[name], Direction::Outgoing) {
        if let Some(degree) = in_degree.get_mut(&dependent) {
          *degree -= 1;
          if *degree == 0 {
            ready.insert(self.graph[dependent]);
          }
        }
      }
    }
    order
  }
}
