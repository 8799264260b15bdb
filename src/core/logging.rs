//! Tracing bootstrap for binaries and tests embedding the orchestrator.

use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::core::errors::{MaestroError, Result};

/// Installs a global fmt subscriber at `level`
///
/// Returns `false` when a global subscriber is already set, which makes it
/// safe to call from every test.
pub fn init_tracing(level: Level) -> bool {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).is_ok()
}

/// Parses `trace`, `debug`, `info`, `warn` or `error` (any case)
pub fn parse_level(name: &str) -> Result<Level> {
    Level::from_str(name.trim())
        .map_err(|_| MaestroError::configuration_field(format!("unknown log level '{}'", name), "log_level"))
}
