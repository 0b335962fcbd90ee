pub mod cascade;
pub mod catalog;
pub mod costing;
pub mod db;
pub mod engine;
pub mod errors;
pub mod models;
pub mod report;
pub mod rules;
pub mod scoring;
pub mod stages;
pub mod validation;
pub mod weighting;

pub use crate::engine::Engine;
pub use crate::errors::{AppError, AppResult};

use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global JSON subscriber writing to a daily rolled
/// `engine.log` under `log_dir`. `RUST_LOG` overrides the `info` default.
/// Fails if a global subscriber is already set.
pub fn init_tracing(log_dir: &Path) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "engine.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
