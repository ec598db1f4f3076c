//! End-to-end tests: formulas on disk, `file://` artifacts, real `/bin/sh` steps.

#![cfg(unix)]

mod common;
mod install_tests;
mod uninstall_tests;
