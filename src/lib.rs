//! testrollup -- test-status reconciliation and reporting.
//!
//! This crate merges incoming test status observations through a fixed
//! lattice, rolls execution records up into suite, group, and build
//! summaries, and correlates executions with earlier runs of the same test
//! in comparable environments.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod history;
pub mod ingest;
pub mod model;
pub mod service;
pub mod status;
pub mod storage;

use anyhow::{Context, Result};

pub use error::{LedgerError, StoreError};
pub use service::ReportingService;
pub use status::Status;

/// Open the configured database and build a reporting service over it.
pub fn open(config: &config::RollupConfig) -> Result<(storage::Pool, ReportingService)> {
    let db_path = config.storage.database_path.to_string_lossy();
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(&db_path)
        .with_context(|| format!("failed to open database {}", db_path))?;
    let service = ReportingService::sqlite(
        pool.clone(),
        config.aggregation.settings(),
        config.aggregation.cache_enabled,
    );
    Ok((pool, service))
}
