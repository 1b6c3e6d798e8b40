//! SQLite storage layer -- pool, schema, and the execution store adapter.

pub mod schema;
pub mod store;

pub use self::store::{
    CountScope, ExecutionStore, GroupFilter, HistoryCandidate, HistoryQuery, SqliteExecutionStore,
    StatusFilter,
};

use crate::error::StoreError;
use crate::model::{format_options, EnvironmentFingerprint, TestCategory, TestIdentity};
use crate::status::Status;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StoreError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Single-connection in-memory pool. Every connection to `:memory:` is a
/// separate database, so the pool must never grow.
pub fn open_memory_pool() -> Result<Pool, StoreError> {
    let manager = SqliteConnectionManager::memory()
        .with_init(|c| c.execute_batch("PRAGMA foreign_keys = ON;"));
    let pool = R2D2Pool::builder().max_size(1).build(manager)?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

/// Fixed-width RFC 3339 so lexical order equals time order.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(column: &'static str, raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| StoreError::Decode { column, value: s }),
    }
}

/// Fields for a new suite row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSuite {
    pub build_id: i64,
    pub category: TestCategory,
    pub name: String,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub fingerprint: EnvironmentFingerprint,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub elapsed_override_ms: Option<i64>,
    #[serde(default)]
    pub declared_test_count: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Fields for a new execution row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewExecution {
    pub suite_id: i64,
    pub identity: TestIdentity,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    pub status: Status,
}

pub fn insert_build(
    conn: &Connection,
    version: &str,
    start_time: Option<&DateTime<Utc>>,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO builds (version, start_time) VALUES (?1, ?2)",
        params![version, start_time.map(format_ts)],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_suite(conn: &Connection, s: &NewSuite) -> Result<i64, StoreError> {
    let options = if s.options.is_empty() {
        None
    } else {
        Some(format_options(&s.options))
    };
    conn.execute(
        "INSERT INTO suites (build_id, category, name, group_id, group_name,
                             host_name, jdk_version, jdk_vendor, os_name, os_arch, os_version,
                             start_time, end_time, elapsed_ms, test_count, options)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            s.build_id,
            s.category.as_str(),
            s.name,
            s.group_id,
            s.group_name,
            s.fingerprint.host_name,
            s.fingerprint.jdk_version,
            s.fingerprint.jdk_vendor,
            s.fingerprint.os_name,
            s.fingerprint.os_arch,
            s.fingerprint.os_version,
            s.start_time.as_ref().map(format_ts),
            s.end_time.as_ref().map(format_ts),
            s.elapsed_override_ms,
            s.declared_test_count as i64,
            options,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn insert_execution(conn: &Connection, e: &NewExecution) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO executions (suite_id, class_name, method_name, group_name,
                                 start_time, end_time, status, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            e.suite_id,
            e.identity.class_name,
            e.identity.method_name,
            e.group_name,
            e.start_time.as_ref().map(format_ts),
            e.end_time.as_ref().map(format_ts),
            e.status.as_token(),
            e.message,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}
