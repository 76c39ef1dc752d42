//! Structured logging init.
//!
//! A `tracing_subscriber` registry built from a level filter, installed
//! once. A terminal UI typically composes display/file/shared-writer
//! layers on top of this; this crate has no UI to coordinate with, so it
//! keeps only the part relevant to a library: a single stderr `fmt` layer
//! gated by a level filter, safe to call multiple times (idempotent via
//! `try_init`).

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `tracing` subscriber writing to stderr.
///
/// Safe to call more than once (e.g. from multiple `#[test]`s); subsequent
/// calls are no-ops because `try_init` reports but does not propagate the
/// "already set" error.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
