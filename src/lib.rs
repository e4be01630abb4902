//! Process supervisor for Unix services.

#![warn(unused_crate_dependencies)]
// These dependencies are only used in the binary (src/bin/main.rs)
// Test dependencies are only used in test code
#[cfg(test)]
use assert_cmd as _;
#[cfg(test)]
use predicates as _;
use strum as _;
#[cfg(test)]
use tempfile as _;
use tracing_subscriber as _;

/// CLI parsing.
pub mod cli;

/// Config loading.
pub mod config;

/// Errors.
pub mod error;

/// Top-level service handler.
pub mod handler;

/// Email notifications.
pub mod notifier;

/// Service aggregates.
pub mod service;

/// Worker state machine.
pub mod worker;
