//! Record ingestion from JSON build documents.

use crate::error::{LedgerError, Result};
use crate::model::{option_problem, EnvironmentFingerprint, TestCategory, TestIdentity};
use crate::status::{self, Status};
use crate::storage::{insert_build, insert_execution, insert_suite, NewExecution, NewSuite, Pool};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// A build with its suites and their test executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDocument {
    pub version: String,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub suites: Vec<SuiteDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteDocument {
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
    pub elapsed_ms: Option<i64>,
    #[serde(default)]
    pub test_count: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub tests: Vec<TestDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestDocument {
    #[serde(flatten)]
    pub identity: TestIdentity,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    /// Status tokens in the order they were observed.
    #[serde(default)]
    pub statuses: Vec<String>,
}

impl TestDocument {
    /// Fold the observed tokens through the lattice, starting from Unknown.
    /// Returns the final status and the tokens that were not recognised.
    pub fn resolve_status(&self) -> (Status, Vec<String>) {
        let mut current = Status::Unknown;
        let mut invalid = Vec::new();
        for token in &self.statuses {
            let outcome = status::merge_token(current, token);
            if let Some(bad) = outcome.invalid_token {
                invalid.push(bad);
            }
            current = outcome.status;
        }
        (current, invalid)
    }
}

impl BuildDocument {
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn test_count(&self) -> usize {
        self.suites.iter().map(|s| s.tests.len()).sum()
    }

    /// Reject content the store would not read back unchanged.
    pub fn validate(&self) -> Result<()> {
        for suite in &self.suites {
            for (name, value) in &suite.options {
                if let Some(problem) = option_problem(name, value) {
                    return Err(LedgerError::InvalidRecord(format!(
                        "suite {:?}: {} ({:?})",
                        suite.name, problem, name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Ids assigned by an import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub build_id: i64,
    pub suite_ids: Vec<i64>,
    pub execution_ids: Vec<i64>,
    /// Status tokens that could not be parsed and were clamped.
    pub invalid_tokens: usize,
}

/// Insert a whole build document in one transaction.
pub fn import_build(pool: &Pool, doc: &BuildDocument) -> Result<ImportSummary> {
    doc.validate()?;
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    let mut summary = ImportSummary {
        build_id: insert_build(&tx, &doc.version, doc.start_time.as_ref())?,
        ..ImportSummary::default()
    };

    for s in &doc.suites {
        let suite_id = insert_suite(
            &tx,
            &NewSuite {
                build_id: summary.build_id,
                category: s.category,
                name: s.name.clone(),
                group_id: s.group_id,
                group_name: s.group_name.clone(),
                fingerprint: s.fingerprint.clone(),
                start_time: s.start_time,
                end_time: s.end_time,
                elapsed_override_ms: s.elapsed_ms,
                declared_test_count: s.test_count,
                options: s.options.clone(),
            },
        )?;
        summary.suite_ids.push(suite_id);

        for t in &s.tests {
            let (status, invalid) = t.resolve_status();
            if !invalid.is_empty() {
                warn!(
                    suite = %s.name,
                    test = %t.identity,
                    tokens = ?invalid,
                    "clamped unrecognised status tokens"
                );
                summary.invalid_tokens += invalid.len();
            }
            let id = insert_execution(
                &tx,
                &NewExecution {
                    suite_id,
                    identity: t.identity.clone(),
                    group_name: t.group_name.clone(),
                    start_time: t.start_time,
                    end_time: t.end_time,
                    message: t.message.clone(),
                    status,
                },
            )?;
            summary.execution_ids.push(id);
        }
    }

    tx.commit()?;
    info!(
        build_id = summary.build_id,
        version = %doc.version,
        suites = summary.suite_ids.len(),
        executions = summary.execution_ids.len(),
        "imported build"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_memory_pool, ExecutionStore, SqliteExecutionStore};

    const DOC: &str = r#"{
        "version": "5.2.2024.0615.120000",
        "start_time": "2024-06-15T12:00:00Z",
        "suites": [{
            "category": "unit",
            "name": "ledger-core",
            "group_name": "core",
            "fingerprint": {
                "host_name": "ci-01", "jdk_version": "17", "jdk_vendor": "Temurin",
                "os_name": "Linux", "os_arch": "amd64", "os_version": "6.1"
            },
            "options": {"bug": "true"},
            "tests": [
                {"class_name": "LedgerTest", "method_name": "opens",
                 "start_time": "2024-06-15T12:00:01Z", "end_time": "2024-06-15T12:00:02Z",
                 "statuses": ["RUNNING", "PASS"]},
                {"class_name": "LedgerTest", "method_name": "closes",
                 "statuses": ["RUNNING", "ERROR", "PASS"]},
                {"class_name": "LedgerTest", "method_name": "odd",
                 "statuses": ["RUNNING", "GREEN"]}
            ]
        }]
    }"#;

    #[test]
    fn test_import_applies_statuses_through_lattice() {
        let pool = open_memory_pool().unwrap();
        let doc = BuildDocument::from_json(DOC).unwrap();
        assert_eq!(doc.test_count(), 3);

        let summary = import_build(&pool, &doc).unwrap();
        assert_eq!(summary.suite_ids.len(), 1);
        assert_eq!(summary.execution_ids.len(), 3);
        assert_eq!(summary.invalid_tokens, 1);

        let store = SqliteExecutionStore::new(pool.clone(), TestCategory::Unit);
        let tests = store.fetch_executions_by_suite(summary.suite_ids[0]).unwrap();
        let statuses: Vec<Status> = tests.iter().map(|t| t.status).collect();
        assert_eq!(statuses, vec![Status::Pass, Status::Error, Status::Unknown]);
        assert_eq!(tests[0].elapsed_ms(), 1_000);

        let suite = store.fetch_suite(summary.suite_ids[0]).unwrap().unwrap();
        assert!(suite.is_bug_suite());
        assert_eq!(suite.fingerprint.host_name, "ci-01");
        let build = store.fetch_build(summary.build_id).unwrap().unwrap();
        assert_eq!(build.version, "5.2.2024.0615.120000");
    }

    #[test]
    fn test_failed_import_leaves_nothing_behind() {
        let pool = open_memory_pool().unwrap();
        let doc = BuildDocument::from_json(DOC).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TRIGGER reject BEFORE INSERT ON executions BEGIN SELECT RAISE(ABORT, 'rejected'); END;")
                .unwrap();
        }
        assert!(import_build(&pool, &doc).is_err());

        let conn = pool.get().unwrap();
        let builds: i64 = conn
            .query_row("SELECT COUNT(*) FROM builds", [], |r| r.get(0))
            .unwrap();
        assert_eq!(builds, 0);
    }

    #[test]
    fn test_options_that_would_not_read_back_are_rejected() {
        let pool = open_memory_pool().unwrap();
        for (name, value) in [("bug", "true\nretry=3"), ("a=b", "c"), ("note", "x\r")] {
            let mut doc = BuildDocument::from_json(DOC).unwrap();
            doc.suites[0].options.insert(name.to_string(), value.to_string());
            let err = import_build(&pool, &doc).unwrap_err();
            assert!(matches!(err, LedgerError::InvalidRecord(_)), "{:?}", err);
        }

        let conn = pool.get().unwrap();
        let builds: i64 = conn
            .query_row("SELECT COUNT(*) FROM builds", [], |r| r.get(0))
            .unwrap();
        assert_eq!(builds, 0);
    }
}
