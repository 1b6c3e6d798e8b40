//! Execution store: the capability interface the core reads and writes
//! through, plus its SQLite adapter.
//!
//! One adapter instance serves one [`TestCategory`]. Categories share the
//! schema and differ only in the `category` column of their suites.

use super::{format_ts, parse_ts, Pool};
use crate::error::StoreError;
use crate::model::{
    parse_options, BuildExecution, EnvironmentFingerprint, SuiteExecution, TestCategory,
    TestExecution, TestIdentity,
};
use crate::status::Status;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeSet;
use tracing::debug;

/// Scope of an execution count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    Suite(i64),
    Build(i64),
}

/// Group restriction. The effective group of an execution is its own group
/// name when set, otherwise its suite's.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GroupFilter {
    #[default]
    Any,
    Named(String),
    Ungrouped,
}

impl GroupFilter {
    pub fn from_name(name: Option<&str>) -> Self {
        match name {
            Some(n) => GroupFilter::Named(n.to_string()),
            None => GroupFilter::Ungrouped,
        }
    }
}

/// Status restriction for history lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFilter {
    #[default]
    Any,
    Only(Status),
    Not(Status),
}

/// Comparable-execution lookup.
#[derive(Debug, Clone)]
pub struct HistoryQuery {
    pub identity: TestIdentity,
    pub fingerprint: EnvironmentFingerprint,
    /// SQL `LIKE` pattern that every matching build version satisfies.
    pub version_pattern: String,
    /// Only executions that started strictly before this instant.
    pub before: DateTime<Utc>,
    pub status: StatusFilter,
}

/// A history match together with the version of the build it ran against.
#[derive(Debug, Clone)]
pub struct HistoryCandidate {
    pub execution: TestExecution,
    pub build_version: String,
}

/// Record lookup and status persistence for one test category.
pub trait ExecutionStore: Send + Sync {
    fn category(&self) -> TestCategory;

    fn fetch_execution(&self, execution_id: i64) -> Result<Option<TestExecution>, StoreError>;

    fn fetch_executions_by_suite(&self, suite_id: i64) -> Result<Vec<TestExecution>, StoreError>;

    fn fetch_executions_by_build(&self, build_id: i64) -> Result<Vec<TestExecution>, StoreError>;

    fn fetch_executions_by_group(
        &self,
        build_id: i64,
        group: &GroupFilter,
    ) -> Result<Vec<TestExecution>, StoreError>;

    fn fetch_suite(&self, suite_id: i64) -> Result<Option<SuiteExecution>, StoreError>;

    fn fetch_suites_by_build(&self, build_id: i64) -> Result<Vec<SuiteExecution>, StoreError>;

    fn fetch_build(&self, build_id: i64) -> Result<Option<BuildExecution>, StoreError>;

    fn count_executions(
        &self,
        scope: CountScope,
        status: Option<Status>,
        group: &GroupFilter,
    ) -> Result<u64, StoreError>;

    /// Distinct non-null suite and test group names within a build.
    fn group_names(&self, build_id: i64) -> Result<BTreeSet<String>, StoreError>;

    /// Overwrite a status. Returns false when the execution does not exist.
    fn persist_status(&self, execution_id: i64, status: Status) -> Result<bool, StoreError>;

    /// Read the current status, compute the next one, and persist it as a
    /// single step. Returns `(previous, next)`, or `None` when the execution
    /// does not exist.
    ///
    /// The default reads and writes separately; adapters that can should
    /// hold a write lock across both.
    fn apply_status(
        &self,
        execution_id: i64,
        next: &mut dyn FnMut(Status) -> Status,
    ) -> Result<Option<(Status, Status)>, StoreError> {
        let Some(current) = self.fetch_execution(execution_id)? else {
            return Ok(None);
        };
        let updated = next(current.status);
        if updated != current.status {
            self.persist_status(execution_id, updated)?;
        }
        Ok(Some((current.status, updated)))
    }

    /// Executions with the same identity and fingerprint whose build version
    /// matches the pattern, most recent first.
    fn find_comparable(&self, query: &HistoryQuery) -> Result<Vec<HistoryCandidate>, StoreError>;
}

const EXEC_COLUMNS: &str = "e.id, e.suite_id, e.class_name, e.method_name, e.group_name, \
                            e.start_time, e.end_time, e.status, e.message";

const SUITE_COLUMNS: &str = "s.id, s.build_id, s.category, s.name, s.group_id, s.group_name, \
                             s.host_name, s.jdk_version, s.jdk_vendor, s.os_name, s.os_arch, \
                             s.os_version, s.start_time, s.end_time, s.elapsed_ms, s.test_count, \
                             s.options";

const EFFECTIVE_GROUP: &str = "COALESCE(e.group_name, s.group_name)";

/// Raw execution row, decoded outside the rusqlite callback so that bad
/// tokens and timestamps surface as [`StoreError::Decode`].
struct ExecRow {
    id: i64,
    suite_id: i64,
    class_name: String,
    method_name: Option<String>,
    group_name: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    status: String,
    message: String,
}

impl ExecRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            suite_id: row.get(1)?,
            class_name: row.get(2)?,
            method_name: row.get(3)?,
            group_name: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            status: row.get(7)?,
            message: row.get(8)?,
        })
    }
}

impl TryFrom<ExecRow> for TestExecution {
    type Error = StoreError;

    fn try_from(r: ExecRow) -> Result<Self, Self::Error> {
        let status = Status::from_token(&r.status).map_err(|_| StoreError::Decode {
            column: "status",
            value: r.status.clone(),
        })?;
        Ok(TestExecution {
            id: r.id,
            suite_id: r.suite_id,
            identity: TestIdentity {
                class_name: r.class_name,
                method_name: r.method_name,
            },
            group_name: r.group_name,
            start_time: parse_ts("start_time", r.start_time)?,
            end_time: parse_ts("end_time", r.end_time)?,
            message: r.message,
            status,
        })
    }
}

struct SuiteRow {
    id: i64,
    build_id: i64,
    category: String,
    name: String,
    group_id: Option<i64>,
    group_name: Option<String>,
    fingerprint: EnvironmentFingerprint,
    start_time: Option<String>,
    end_time: Option<String>,
    elapsed_ms: Option<i64>,
    test_count: i64,
    options: Option<String>,
}

impl SuiteRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            build_id: row.get(1)?,
            category: row.get(2)?,
            name: row.get(3)?,
            group_id: row.get(4)?,
            group_name: row.get(5)?,
            fingerprint: EnvironmentFingerprint {
                host_name: row.get(6)?,
                jdk_version: row.get(7)?,
                jdk_vendor: row.get(8)?,
                os_name: row.get(9)?,
                os_arch: row.get(10)?,
                os_version: row.get(11)?,
            },
            start_time: row.get(12)?,
            end_time: row.get(13)?,
            elapsed_ms: row.get(14)?,
            test_count: row.get(15)?,
            options: row.get(16)?,
        })
    }
}

impl TryFrom<SuiteRow> for SuiteExecution {
    type Error = StoreError;

    fn try_from(r: SuiteRow) -> Result<Self, Self::Error> {
        let category = r
            .category
            .parse::<TestCategory>()
            .map_err(|_| StoreError::Decode {
                column: "category",
                value: r.category.clone(),
            })?;
        Ok(SuiteExecution {
            id: r.id,
            build_id: r.build_id,
            category,
            name: r.name,
            group_id: r.group_id,
            group_name: r.group_name,
            fingerprint: r.fingerprint,
            start_time: parse_ts("start_time", r.start_time)?,
            end_time: parse_ts("end_time", r.end_time)?,
            elapsed_override_ms: r.elapsed_ms,
            declared_test_count: r.test_count.max(0) as u64,
            options: r.options.as_deref().map(parse_options).unwrap_or_default(),
        })
    }
}

/// SQLite adapter for one category.
#[derive(Clone)]
pub struct SqliteExecutionStore {
    pool: Pool,
    category: TestCategory,
}

impl SqliteExecutionStore {
    pub fn new(pool: Pool, category: TestCategory) -> Self {
        Self { pool, category }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    fn query_executions(
        &self,
        filter: &str,
        values: Vec<Value>,
    ) -> Result<Vec<TestExecution>, StoreError> {
        let conn = self.pool.get()?;
        let sql = format!(
            "SELECT {EXEC_COLUMNS} FROM executions e JOIN suites s ON s.id = e.suite_id
             WHERE s.category = ? AND {filter}
             ORDER BY e.id ASC"
        );
        let mut all = vec![Value::Text(self.category.as_str().to_string())];
        all.extend(values);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(all.iter()), ExecRow::read)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(TestExecution::try_from(r?)?);
        }
        Ok(out)
    }

    fn group_clause(group: &GroupFilter, values: &mut Vec<Value>) -> String {
        match group {
            GroupFilter::Any => "1 = 1".to_string(),
            GroupFilter::Named(name) => {
                values.push(Value::Text(name.clone()));
                format!("{EFFECTIVE_GROUP} = ?")
            }
            GroupFilter::Ungrouped => format!("{EFFECTIVE_GROUP} IS NULL"),
        }
    }
}

impl ExecutionStore for SqliteExecutionStore {
    fn category(&self) -> TestCategory {
        self.category
    }

    fn fetch_execution(&self, execution_id: i64) -> Result<Option<TestExecution>, StoreError> {
        let mut found =
            self.query_executions("e.id = ?", vec![Value::Integer(execution_id)])?;
        Ok(found.pop())
    }

    fn fetch_executions_by_suite(&self, suite_id: i64) -> Result<Vec<TestExecution>, StoreError> {
        self.query_executions("e.suite_id = ?", vec![Value::Integer(suite_id)])
    }

    fn fetch_executions_by_build(&self, build_id: i64) -> Result<Vec<TestExecution>, StoreError> {
        self.query_executions("s.build_id = ?", vec![Value::Integer(build_id)])
    }

    fn fetch_executions_by_group(
        &self,
        build_id: i64,
        group: &GroupFilter,
    ) -> Result<Vec<TestExecution>, StoreError> {
        let mut values = vec![Value::Integer(build_id)];
        let clause = Self::group_clause(group, &mut values);
        self.query_executions(&format!("s.build_id = ? AND {clause}"), values)
    }

    fn fetch_suite(&self, suite_id: i64) -> Result<Option<SuiteExecution>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {SUITE_COLUMNS} FROM suites s WHERE s.id = ?1 AND s.category = ?2"),
                params![suite_id, self.category.as_str()],
                SuiteRow::read,
            )
            .optional()?;
        row.map(SuiteExecution::try_from).transpose()
    }

    fn fetch_suites_by_build(&self, build_id: i64) -> Result<Vec<SuiteExecution>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SUITE_COLUMNS} FROM suites s
             WHERE s.build_id = ?1 AND s.category = ?2
             ORDER BY s.id ASC"
        ))?;
        let rows = stmt.query_map(params![build_id, self.category.as_str()], SuiteRow::read)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(SuiteExecution::try_from(r?)?);
        }
        Ok(out)
    }

    fn fetch_build(&self, build_id: i64) -> Result<Option<BuildExecution>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT id, version, start_time FROM builds WHERE id = ?1",
                [build_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, version, start)) => Ok(Some(BuildExecution {
                id,
                version,
                start_time: parse_ts("start_time", start)?,
            })),
        }
    }

    fn count_executions(
        &self,
        scope: CountScope,
        status: Option<Status>,
        group: &GroupFilter,
    ) -> Result<u64, StoreError> {
        let mut values = vec![Value::Text(self.category.as_str().to_string())];
        let mut sql = String::from(
            "SELECT COUNT(*) FROM executions e JOIN suites s ON s.id = e.suite_id
             WHERE s.category = ?",
        );
        match scope {
            CountScope::Suite(id) => {
                sql.push_str(" AND e.suite_id = ?");
                values.push(Value::Integer(id));
            }
            CountScope::Build(id) => {
                sql.push_str(" AND s.build_id = ?");
                values.push(Value::Integer(id));
            }
        }
        if let Some(status) = status {
            sql.push_str(" AND e.status = ?");
            values.push(Value::Text(status.as_token().to_string()));
        }
        let clause = Self::group_clause(group, &mut values);
        sql.push_str(" AND ");
        sql.push_str(&clause);

        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    fn group_names(&self, build_id: i64) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut names = BTreeSet::new();

        let mut stmt = conn.prepare(
            "SELECT DISTINCT group_name FROM suites
             WHERE build_id = ?1 AND category = ?2 AND group_name IS NOT NULL",
        )?;
        for r in stmt.query_map(params![build_id, self.category.as_str()], |row| {
            row.get::<_, String>(0)
        })? {
            names.insert(r?);
        }

        let mut stmt = conn.prepare(
            "SELECT DISTINCT e.group_name FROM executions e JOIN suites s ON s.id = e.suite_id
             WHERE s.build_id = ?1 AND s.category = ?2 AND e.group_name IS NOT NULL",
        )?;
        for r in stmt.query_map(params![build_id, self.category.as_str()], |row| {
            row.get::<_, String>(0)
        })? {
            names.insert(r?);
        }

        Ok(names)
    }

    fn persist_status(&self, execution_id: i64, status: Status) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE executions SET status = ?1
             WHERE id = ?2
               AND suite_id IN (SELECT id FROM suites WHERE category = ?3)",
            params![status.as_token(), execution_id, self.category.as_str()],
        )?;
        debug!(execution_id, %status, category = %self.category, "persisted status");
        Ok(changed > 0)
    }

    fn apply_status(
        &self,
        execution_id: i64,
        next: &mut dyn FnMut(Status) -> Status,
    ) -> Result<Option<(Status, Status)>, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT e.status FROM executions e JOIN suites s ON s.id = e.suite_id
                 WHERE e.id = ?1 AND s.category = ?2",
                params![execution_id, self.category.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(token) = current else {
            return Ok(None);
        };
        let previous = Status::from_token(&token).map_err(|_| StoreError::Decode {
            column: "status",
            value: token.clone(),
        })?;

        let updated = next(previous);
        if updated != previous {
            tx.execute(
                "UPDATE executions SET status = ?1 WHERE id = ?2",
                params![updated.as_token(), execution_id],
            )?;
        }
        tx.commit()?;
        Ok(Some((previous, updated)))
    }

    fn find_comparable(&self, query: &HistoryQuery) -> Result<Vec<HistoryCandidate>, StoreError> {
        let fp = &query.fingerprint;
        let mut values = vec![
            Value::Text(self.category.as_str().to_string()),
            Value::Text(query.identity.class_name.clone()),
        ];
        let mut sql = format!(
            "SELECT {EXEC_COLUMNS}, b.version
             FROM executions e
             JOIN suites s ON s.id = e.suite_id
             JOIN builds b ON b.id = s.build_id
             WHERE s.category = ?
               AND e.class_name = ?"
        );

        match &query.identity.method_name {
            Some(m) => {
                sql.push_str(" AND e.method_name = ?");
                values.push(Value::Text(m.clone()));
            }
            None => sql.push_str(" AND e.method_name IS NULL"),
        }

        sql.push_str(
            " AND s.host_name = ? AND s.jdk_version = ? AND s.jdk_vendor = ?
              AND s.os_name = ? AND s.os_arch = ? AND s.os_version = ?
              AND b.version LIKE ?
              AND e.start_time IS NOT NULL AND e.start_time < ?",
        );
        for field in [
            &fp.host_name,
            &fp.jdk_version,
            &fp.jdk_vendor,
            &fp.os_name,
            &fp.os_arch,
            &fp.os_version,
            &query.version_pattern,
        ] {
            values.push(Value::Text(field.clone()));
        }
        values.push(Value::Text(format_ts(&query.before)));

        match query.status {
            StatusFilter::Any => {}
            StatusFilter::Only(s) => {
                sql.push_str(" AND e.status = ?");
                values.push(Value::Text(s.as_token().to_string()));
            }
            StatusFilter::Not(s) => {
                sql.push_str(" AND e.status != ?");
                values.push(Value::Text(s.as_token().to_string()));
            }
        }
        sql.push_str(" ORDER BY e.start_time DESC, e.id DESC");

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok((ExecRow::read(row)?, row.get::<_, String>(9)?))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (exec, build_version) = r?;
            out.push(HistoryCandidate {
                execution: TestExecution::try_from(exec)?,
                build_version,
            });
        }
        Ok(out)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::storage::open_memory_pool;

    #[test]
    fn test_fetch_and_count_by_scope() {
        let pool = open_memory_pool().unwrap();
        let store = SqliteExecutionStore::new(pool.clone(), TestCategory::Unit);
        let b = build(&pool, "1.0.20240615.120000");
        let s = suite(&pool, b, TestCategory::Unit, Some("core"));
        exec(&pool, s, "a", Status::Pass, 0, 1);
        exec(&pool, s, "b", Status::Fail, 1, 1);

        // A different category in the same build stays invisible.
        let other = suite(&pool, b, TestCategory::Ui, None);
        exec(&pool, other, "c", Status::Pass, 0, 1);

        assert_eq!(store.fetch_executions_by_suite(s).unwrap().len(), 2);
        assert_eq!(store.fetch_executions_by_build(b).unwrap().len(), 2);
        assert_eq!(
            store
                .count_executions(CountScope::Build(b), Some(Status::Fail), &GroupFilter::Any)
                .unwrap(),
            1
        );
        assert!(store.fetch_suite(other).unwrap().is_none());
        assert_eq!(store.fetch_build(b).unwrap().unwrap().version, "1.0.20240615.120000");
        assert!(store.fetch_build(999).unwrap().is_none());
    }

    #[test]
    fn test_test_group_overrides_suite_group() {
        let pool = open_memory_pool().unwrap();
        let store = SqliteExecutionStore::new(pool.clone(), TestCategory::Unit);
        let b = build(&pool, "1.0");
        let s1 = suite(&pool, b, TestCategory::Unit, Some("core"));
        let s2 = suite(&pool, b, TestCategory::Unit, None);
        exec(&pool, s1, "a", Status::Pass, 0, 1);
        exec_in_group(&pool, s1, "b", Status::Pass, 0, 1, Some("gen-7"));
        exec_in_group(&pool, s2, "c", Status::Fail, 0, 1, Some("gen-7"));
        exec(&pool, s2, "d", Status::Pass, 0, 1);

        let gen = store
            .fetch_executions_by_group(b, &GroupFilter::Named("gen-7".into()))
            .unwrap();
        assert_eq!(gen.len(), 2);
        let core = store
            .fetch_executions_by_group(b, &GroupFilter::Named("core".into()))
            .unwrap();
        assert_eq!(core.len(), 1);
        let loose = store.fetch_executions_by_group(b, &GroupFilter::Ungrouped).unwrap();
        assert_eq!(loose.len(), 1);
        assert_eq!(loose[0].identity.method_name.as_deref(), Some("d"));

        let names: Vec<String> = store.group_names(b).unwrap().into_iter().collect();
        assert_eq!(names, vec!["core".to_string(), "gen-7".to_string()]);
    }

    #[test]
    fn test_apply_status_is_read_merge_write() {
        let pool = open_memory_pool().unwrap();
        let store = SqliteExecutionStore::new(pool.clone(), TestCategory::Unit);
        let b = build(&pool, "1.0");
        let s = suite(&pool, b, TestCategory::Unit, None);
        let id = exec(&pool, s, "a", Status::Running, 0, 1);

        let out = store
            .apply_status(id, &mut |cur| crate::status::merge(cur, Status::Pass))
            .unwrap();
        assert_eq!(out, Some((Status::Running, Status::Pass)));
        assert_eq!(store.fetch_execution(id).unwrap().unwrap().status, Status::Pass);
        assert!(store.apply_status(4242, &mut |c| c).unwrap().is_none());
    }

    #[test]
    fn test_persist_status_reports_missing_rows() {
        let pool = open_memory_pool().unwrap();
        let store = SqliteExecutionStore::new(pool.clone(), TestCategory::Acceptance);
        assert!(!store.persist_status(1, Status::Pass).unwrap());
    }

    #[test]
    fn test_suite_round_trip_keeps_options_and_fingerprint() {
        let pool = open_memory_pool().unwrap();
        let store = SqliteExecutionStore::new(pool.clone(), TestCategory::Flex);
        let b = build(&pool, "2.0");
        let s = suite_with(&pool, b, TestCategory::Flex, None, "flexhost", "bug=true\nthreads=2");
        let suite = store.fetch_suite(s).unwrap().unwrap();
        assert!(suite.is_bug_suite());
        assert_eq!(suite.fingerprint, fingerprint("flexhost"));
        assert_eq!(suite.category, TestCategory::Flex);
    }
}
