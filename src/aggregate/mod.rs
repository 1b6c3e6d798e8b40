//! Rollups of execution records into suite, group, and build summaries.
//!
//! Summaries are derived data. They are recomputed from execution records
//! on demand and only ever cached, never treated as a source of truth.

pub mod cache;
pub mod engine;

pub use self::cache::SummaryCache;
pub use self::engine::{AggregationEngine, AggregationSettings};

use crate::model::{BuildExecution, SuiteExecution, TestCategory, TestExecution};
use crate::status::Status;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Counts of executions by status.
///
/// Merging is associative and commutative, so partial summaries from
/// different suites can be combined in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestSummary {
    /// Only statuses with at least one execution appear.
    pub counts: BTreeMap<Status, u64>,
    pub total: u64,
    /// Executions that ran longer than the long-running threshold.
    pub long_running: u64,
    pub elapsed_ms: i64,
}

impl TestSummary {
    pub fn from_executions<'a>(
        executions: impl IntoIterator<Item = &'a TestExecution>,
        long_running_ms: i64,
    ) -> Self {
        let mut summary = Self::default();
        for e in executions {
            summary.record(e, long_running_ms);
        }
        summary
    }

    pub fn record(&mut self, execution: &TestExecution, long_running_ms: i64) {
        *self.counts.entry(execution.status).or_insert(0) += 1;
        self.total += 1;
        let elapsed = execution.elapsed_ms();
        if elapsed > long_running_ms {
            self.long_running += 1;
        }
        self.elapsed_ms += elapsed;
    }

    pub fn merge(&mut self, other: &TestSummary) {
        for (status, n) in &other.counts {
            *self.counts.entry(*status).or_insert(0) += n;
        }
        self.total += other.total;
        self.long_running += other.long_running;
        self.elapsed_ms += other.elapsed_ms;
    }

    pub fn merged(mut self, other: &TestSummary) -> Self {
        self.merge(other);
        self
    }

    pub fn count(&self, status: Status) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Sum of the per-status counts; always equal to `total`.
    pub fn status_sum(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// No failures, errors, kills or blacklisted tests, and nothing running.
    pub fn is_clean(&self) -> bool {
        [
            Status::Fail,
            Status::Error,
            Status::Kill,
            Status::Blacklist,
            Status::Running,
            Status::Pending,
        ]
        .iter()
        .all(|s| self.count(*s) == 0)
    }

    /// Percentage of executions that passed, 0 when empty.
    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.count(Status::Pass) as f64 / self.total as f64 * 100.0
        }
    }
}

/// Suite-shaped summary. Real suites and cross-suite groups both produce
/// this shape so that consumers need not distinguish them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteSummary {
    pub label: String,
    /// Set for a real suite, absent for a synthetic group summary.
    pub suite_id: Option<i64>,
    pub build_id: i64,
    pub category: TestCategory,
    pub group_name: Option<String>,
    pub suite_ids: Vec<i64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Tests the suites declared; falls back to the executed count.
    pub declared_tests: u64,
    /// Status of the most significant execution.
    pub representative: Option<Status>,
    pub summary: TestSummary,
}

impl SuiteSummary {
    pub fn for_suite(
        suite: &SuiteExecution,
        summary: TestSummary,
        representative: Option<Status>,
    ) -> Self {
        let declared_tests = if suite.declared_test_count == 0 {
            summary.total
        } else {
            suite.declared_test_count
        };
        Self {
            label: suite.name.clone(),
            suite_id: Some(suite.id),
            build_id: suite.build_id,
            category: suite.category,
            group_name: suite.group_name.clone(),
            suite_ids: vec![suite.id],
            start_time: suite.start_time,
            end_time: suite.end_time,
            declared_tests,
            representative,
            summary,
        }
    }
}

/// Outcome of one category's rollup within a build report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum CategoryRollup {
    Available { summary: TestSummary },
    Unavailable { reason: String },
}

impl CategoryRollup {
    pub fn summary(&self) -> Option<&TestSummary> {
        match self {
            CategoryRollup::Available { summary } => Some(summary),
            CategoryRollup::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, CategoryRollup::Available { .. })
    }
}

/// Per-category summaries for one build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub build: BuildExecution,
    pub categories: BTreeMap<TestCategory, CategoryRollup>,
    /// Sum over the available categories.
    pub total: TestSummary,
}

impl BuildReport {
    pub fn new(build: BuildExecution, categories: BTreeMap<TestCategory, CategoryRollup>) -> Self {
        let total = categories
            .values()
            .filter_map(CategoryRollup::summary)
            .fold(TestSummary::default(), |acc, s| acc.merged(s));
        Self {
            build,
            categories,
            total,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.categories.values().any(|c| !c.is_available())
    }
}
