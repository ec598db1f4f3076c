//! cellar-lib: core of the Cellar package orchestrator
//!
//! The pipeline from a formula index to installed kegs:
//! - `formula`: package descriptions and the index they are loaded into
//! - `resolve`: turn install requests into a dependency-ordered `BuildPlan`
//! - `store`: content-addressed artifact cache with checksum verification
//! - `stage`: vendor private resources into a keg
//! - `execute`: run a plan through the per-package state machine
//! - `ledger`: durable install records, manifests and uninstall
//! - `service`: background service registrations

pub mod consts;
pub mod error;
pub mod execute;
pub mod formula;
pub mod ledger;
pub mod placeholder;
pub mod platform;
pub mod resolve;
pub mod service;
pub mod stage;
pub mod store;
pub mod store_lock;
pub mod util;
