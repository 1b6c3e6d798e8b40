//! Error types shared by the reconciliation, rollup, and history layers.

use thiserror::Error;

/// Failures raised by the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot decode column {column}: {value:?}")]
    Decode { column: &'static str, value: String },

    #[error("rollup task failed: {0}")]
    Task(String),
}

/// Errors surfaced by the core to its callers.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A required parent record (suite or build) is missing.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },

    /// An unrecognised status token reached the lattice.
    #[error("invalid status token: {0:?}")]
    InvalidStatus(String),

    /// A build document that cannot be stored faithfully.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// A rollup or history query overran its budget.
    #[error("{query} timed out after {budget_ms} ms")]
    Timeout { query: &'static str, budget_ms: u64 },

    #[error(transparent)]
    Collaborator(#[from] StoreError),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Collaborator(StoreError::Sqlite(e))
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(e: r2d2::Error) -> Self {
        LedgerError::Collaborator(StoreError::Pool(e))
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
