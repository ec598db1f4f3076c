//! Shared utilities.
//!
//! Common utilities used across the crate including hashing, keyed locks and
//! test helpers.

pub mod hash;
pub mod locks;

#[cfg(test)]
pub mod testutil;
