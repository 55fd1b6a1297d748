//! Environment-driven configuration, grounded on `packages/server/src/config.rs`:
//! `dotenvy::dotenv()` loads an optional `.env` for local runs, then each
//! setting is read with `env::var(...).context(...)` or falls back to a
//! sane default via `unwrap_or_else`.

use anyhow::Context;
use std::env;

/// The worker-pool size used when neither the environment nor a caller
/// supplies one.
pub const DEFAULT_MAX_WORKERS: u32 = 8;

/// Tunables for a process-wide [`crate::facade::Octopus`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of execution contexts in the worker pool.
    pub max_workers: u32,
    /// Upper bound on each worker's task queue. `None` means unbounded
    /// (heap-sized), which is also what `from_env` defaults to when
    /// `OCTOPUSDB_QUEUE_CAPACITY` is unset.
    pub queue_capacity: Option<usize>,
}

impl Config {
    /// Loads configuration from the process environment, falling back to
    /// `.env` in the current directory if present (ignored if absent — this
    /// is a convenience for local development, not a hard dependency).
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let max_workers = match env::var("OCTOPUSDB_MAX_WORKERS") {
            Ok(raw) => raw.parse::<u32>().context("OCTOPUSDB_MAX_WORKERS must be a positive integer")?,
            Err(_) => DEFAULT_MAX_WORKERS,
        };

        let queue_capacity = match env::var("OCTOPUSDB_QUEUE_CAPACITY") {
            Ok(raw) => Some(raw.parse::<usize>().context("OCTOPUSDB_QUEUE_CAPACITY must be a positive integer")?),
            Err(_) => None,
        };

        Ok(Config { max_workers, queue_capacity })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config { max_workers: DEFAULT_MAX_WORKERS, queue_capacity: None }
    }
}
