//! Aggregation engine: suite, group, and build rollups across categories.

use super::cache::{CacheScope, SummaryCache};
use super::{BuildReport, CategoryRollup, SuiteSummary, TestSummary};
use crate::error::{LedgerError, Result};
use crate::model::{BuildExecution, SuiteExecution, TestCategory, TestExecution};
use crate::status::priority::{self, TestGroup};
use crate::storage::{ExecutionStore, GroupFilter};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Label used for executions that carry no group at either level.
pub const UNGROUPED_LABEL: &str = "(ungrouped)";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregationSettings {
    /// Executions longer than this count as long-running.
    pub long_running_ms: i64,
    /// Leave `bug=true` suites out of group and build rollups.
    pub exclude_bug_suites: bool,
    /// Budget for each category's rollup within a build report.
    pub category_timeout: Duration,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            long_running_ms: 300_000,
            exclude_bug_suites: true,
            category_timeout: Duration::from_millis(5_000),
        }
    }
}

/// Rollups over one category's store.
struct CategoryRollups<'a> {
    store: &'a dyn ExecutionStore,
    settings: &'a AggregationSettings,
    cache: Option<&'a SummaryCache>,
}

impl<'a> CategoryRollups<'a> {
    fn cached(
        &self,
        build_id: i64,
        scope: CacheScope,
        compute: impl FnOnce() -> Result<TestSummary>,
    ) -> Result<TestSummary> {
        let category = self.store.category();
        let Some(cache) = self.cache else {
            return compute();
        };
        if let Some(hit) = cache.get(category, build_id, &scope) {
            debug!(%category, build_id, ?scope, "summary cache hit");
            return Ok(hit);
        }
        let generation = cache.generation(build_id);
        let summary = compute()?;
        cache.put(category, build_id, scope, generation, summary.clone());
        Ok(summary)
    }

    /// Suites of the build that take part in build-wide totals.
    fn counted_suites(&self, build_id: i64) -> Result<BTreeMap<i64, SuiteExecution>> {
        Ok(self
            .store
            .fetch_suites_by_build(build_id)?
            .into_iter()
            .filter(|s| !(self.settings.exclude_bug_suites && s.is_bug_suite()))
            .map(|s| (s.id, s))
            .collect())
    }

    /// One partial summary per contributing suite.
    fn partials<'t>(
        &self,
        tests: impl IntoIterator<Item = &'t TestExecution>,
        suites: &BTreeMap<i64, SuiteExecution>,
    ) -> BTreeMap<i64, TestSummary> {
        let mut partials: BTreeMap<i64, TestSummary> = BTreeMap::new();
        for t in tests {
            if suites.contains_key(&t.suite_id) {
                partials
                    .entry(t.suite_id)
                    .or_default()
                    .record(t, self.settings.long_running_ms);
            }
        }
        partials
    }

    fn fold(partials: &BTreeMap<i64, TestSummary>) -> TestSummary {
        partials
            .values()
            .fold(TestSummary::default(), |acc, p| acc.merged(p))
    }

    fn suite_summary(&self, suite: &SuiteExecution) -> Result<SuiteSummary> {
        let tests = self.store.fetch_executions_by_suite(suite.id)?;
        let mut summary = TestSummary::from_executions(&tests, self.settings.long_running_ms);
        if suite.is_complete() || suite.elapsed_override_ms.is_some() {
            summary.elapsed_ms = suite.elapsed_ms();
        }
        let representative = priority::headline(&tests).map(|t| t.status);
        Ok(SuiteSummary::for_suite(suite, summary, representative))
    }

    fn group(&self, build_id: i64, group: Option<&str>) -> Result<TestSummary> {
        self.cached(build_id, CacheScope::Group(group.map(str::to_string)), || {
            let suites = self.counted_suites(build_id)?;
            let tests = self
                .store
                .fetch_executions_by_group(build_id, &GroupFilter::from_name(group))?;
            Ok(Self::fold(&self.partials(&tests, &suites)))
        })
    }

    fn groups(&self, build_id: i64) -> Result<Vec<SuiteSummary>> {
        let suites = self.counted_suites(build_id)?;
        let tests = self.store.fetch_executions_by_build(build_id)?;

        let mut buckets: BTreeMap<Option<String>, TestGroup> = BTreeMap::new();
        for t in tests {
            let Some(suite) = suites.get(&t.suite_id) else {
                continue;
            };
            let key = t.group_name.clone().or_else(|| suite.group_name.clone());
            buckets
                .entry(key.clone())
                .or_insert_with(|| TestGroup::new(key.unwrap_or_else(|| UNGROUPED_LABEL.to_string())))
                .add(t);
        }

        let mut ordered: Vec<(Option<String>, TestGroup)> = buckets.into_iter().collect();
        ordered.sort_by(|(_, a), (_, b)| TestGroup::compare(a, b));
        Ok(ordered
            .into_iter()
            .map(|(name, group)| self.synthetic_suite(build_id, name, &group, &suites))
            .collect())
    }

    fn synthetic_suite(
        &self,
        build_id: i64,
        name: Option<String>,
        group: &TestGroup,
        suites: &BTreeMap<i64, SuiteExecution>,
    ) -> SuiteSummary {
        let members = group.members();
        let partials = self.partials(members, suites);
        let summary = Self::fold(&partials);

        let start_time: Option<DateTime<Utc>> = members.iter().filter_map(|t| t.start_time).min();
        let end_time: Option<DateTime<Utc>> = members.iter().filter_map(|t| t.end_time).max();

        SuiteSummary {
            label: group.name().to_string(),
            suite_id: None,
            build_id,
            category: self.store.category(),
            group_name: name,
            suite_ids: partials.keys().copied().collect(),
            start_time,
            end_time,
            declared_tests: summary.total,
            representative: group.representative().map(|t| t.status),
            summary,
        }
    }

    fn category(&self, build_id: i64) -> Result<TestSummary> {
        self.cached(build_id, CacheScope::Category, || {
            let suites = self.counted_suites(build_id)?;
            let tests = self.store.fetch_executions_by_build(build_id)?;
            Ok(Self::fold(&self.partials(&tests, &suites)))
        })
    }
}

/// Rolls execution records up into summaries. Holds no authoritative state;
/// the optional cache is invalidated by writers through [`Self::invalidate`].
pub struct AggregationEngine {
    stores: BTreeMap<TestCategory, Arc<dyn ExecutionStore>>,
    settings: AggregationSettings,
    cache: Option<Arc<SummaryCache>>,
}

impl AggregationEngine {
    pub fn new(
        stores: impl IntoIterator<Item = Arc<dyn ExecutionStore>>,
        settings: AggregationSettings,
    ) -> Self {
        Self {
            stores: stores.into_iter().map(|s| (s.category(), s)).collect(),
            settings,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<SummaryCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn settings(&self) -> &AggregationSettings {
        &self.settings
    }

    pub fn categories(&self) -> impl Iterator<Item = TestCategory> + '_ {
        self.stores.keys().copied()
    }

    pub fn store(&self, category: TestCategory) -> Option<&Arc<dyn ExecutionStore>> {
        self.stores.get(&category)
    }

    pub fn invalidate(&self, build_id: i64) {
        if let Some(cache) = &self.cache {
            cache.invalidate_build(build_id);
        }
    }

    fn rollups<'a>(&'a self, store: &'a Arc<dyn ExecutionStore>) -> CategoryRollups<'a> {
        CategoryRollups {
            store: store.as_ref(),
            settings: &self.settings,
            cache: self.cache.as_deref(),
        }
    }

    /// Find the category that owns a suite.
    fn locate_suite(&self, suite_id: i64) -> Result<Option<(&Arc<dyn ExecutionStore>, SuiteExecution)>> {
        for store in self.stores.values() {
            if let Some(suite) = store.fetch_suite(suite_id)? {
                return Ok(Some((store, suite)));
            }
        }
        Ok(None)
    }

    /// Per-status counts for one suite. Bug suites are always counted here.
    pub fn rollup_suite(&self, suite_id: i64) -> Result<Option<TestSummary>> {
        let Some((store, suite)) = self.locate_suite(suite_id)? else {
            return Ok(None);
        };
        let rollups = self.rollups(store);
        let summary = rollups.cached(suite.build_id, CacheScope::Suite(suite_id), || {
            Ok(rollups.suite_summary(&suite)?.summary)
        })?;
        Ok(Some(summary))
    }

    /// Suite rollup in suite-summary shape, with its representative status.
    pub fn summarize_suite(&self, suite_id: i64) -> Result<Option<SuiteSummary>> {
        match self.locate_suite(suite_id)? {
            Some((store, suite)) => Ok(Some(self.rollups(store).suite_summary(&suite)?)),
            None => Ok(None),
        }
    }

    /// Counts for one group (`None` for the ungrouped bucket) across every
    /// category of the build.
    pub fn rollup_group(&self, build_id: i64, group: Option<&str>) -> Result<TestSummary> {
        let mut total = TestSummary::default();
        for store in self.stores.values() {
            total.merge(&self.rollups(store).group(build_id, group)?);
        }
        Ok(total)
    }

    /// Every group of one category in the build, as synthetic suites.
    pub fn rollup_groups(&self, build_id: i64, category: TestCategory) -> Result<Vec<SuiteSummary>> {
        match self.stores.get(&category) {
            Some(store) => self.rollups(store).groups(build_id),
            None => Ok(Vec::new()),
        }
    }

    /// Distinct group names of the build across every category.
    pub fn group_names(&self, build_id: i64) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for store in self.stores.values() {
            names.extend(store.group_names(build_id)?);
        }
        Ok(names)
    }

    /// Summary of one category in a build.
    pub fn rollup_category(&self, build_id: i64, category: TestCategory) -> Result<Option<TestSummary>> {
        match self.stores.get(&category) {
            Some(store) => Ok(Some(self.rollups(store).category(build_id)?)),
            None => Ok(None),
        }
    }

    fn find_build(&self, build_id: i64) -> Result<Option<BuildExecution>> {
        let mut last_err = None;
        for store in self.stores.values() {
            match store.fetch_build(build_id) {
                Ok(found) => return Ok(found),
                Err(e) => {
                    warn!(build_id, category = %store.category(), error = %e, "build lookup failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) => Err(LedgerError::from(e)),
            None => Ok(None),
        }
    }

    /// One summary per category. Each category runs on the blocking pool
    /// under its own timeout; a failed or slow category is reported as
    /// unavailable while the others still render.
    pub async fn rollup_build(&self, build_id: i64) -> Result<Option<BuildReport>> {
        let Some(build) = self.find_build(build_id)? else {
            return Ok(None);
        };

        let deadline = tokio::time::Instant::now() + self.settings.category_timeout;
        let mut handles = Vec::with_capacity(self.stores.len());
        for (category, store) in &self.stores {
            let store = Arc::clone(store);
            let settings = self.settings;
            let cache = self.cache.clone();
            let handle = tokio::task::spawn_blocking(move || {
                CategoryRollups {
                    store: store.as_ref(),
                    settings: &settings,
                    cache: cache.as_deref(),
                }
                .category(build_id)
            });
            handles.push((*category, handle));
        }

        let mut categories = BTreeMap::new();
        for (category, handle) in handles {
            let rollup = match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(Ok(summary))) => CategoryRollup::Available { summary },
                Ok(Ok(Err(e))) => {
                    warn!(build_id, %category, error = %e, "category rollup failed");
                    CategoryRollup::Unavailable {
                        reason: e.to_string(),
                    }
                }
                Ok(Err(join)) => {
                    warn!(build_id, %category, error = %join, "category rollup task aborted");
                    CategoryRollup::Unavailable {
                        reason: format!("rollup task failed: {}", join),
                    }
                }
                Err(_) => {
                    warn!(build_id, %category, "category rollup timed out");
                    CategoryRollup::Unavailable {
                        reason: format!(
                            "timed out after {} ms",
                            self.settings.category_timeout.as_millis()
                        ),
                    }
                }
            };
            categories.insert(category, rollup);
        }

        let report = BuildReport::new(build, categories);
        info!(
            build_id,
            total = report.total.total,
            partial = report.is_partial(),
            "build rollup complete"
        );
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;
    use crate::storage::store::fixtures::*;
    use crate::storage::{open_memory_pool, Pool, SqliteExecutionStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn engine(pool: &Pool, categories: &[TestCategory]) -> AggregationEngine {
        let stores: Vec<Arc<dyn ExecutionStore>> = categories
            .iter()
            .map(|c| Arc::new(SqliteExecutionStore::new(pool.clone(), *c)) as Arc<dyn ExecutionStore>)
            .collect();
        AggregationEngine::new(stores, AggregationSettings::default())
    }

    #[test]
    fn test_rollup_suite_scenario() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "5.2.20240615.120000");
        let s = suite(&pool, b, TestCategory::Unit, None);
        for i in 0..6 {
            exec(&pool, s, &format!("pass{}", i), Status::Pass, i, 1);
        }
        exec(&pool, s, "fail0", Status::Fail, 0, 1);
        exec(&pool, s, "fail1", Status::Fail, 0, 1);
        exec(&pool, s, "err", Status::Error, 0, 400);
        exec(&pool, s, "run", Status::Running, 0, 1);

        let engine = engine(&pool, &[TestCategory::Unit, TestCategory::Ui]);
        let summary = engine.rollup_suite(s).unwrap().unwrap();
        assert_eq!(summary.count(Status::Pass), 6);
        assert_eq!(summary.count(Status::Fail), 2);
        assert_eq!(summary.count(Status::Error), 1);
        assert_eq!(summary.count(Status::Running), 1);
        assert_eq!(summary.total, 10);
        assert_eq!(summary.status_sum(), summary.total);
        assert_eq!(summary.long_running, 1);

        let shaped = engine.summarize_suite(s).unwrap().unwrap();
        assert_eq!(shaped.representative, Some(Status::Running));
        assert_eq!(shaped.declared_tests, 10);

        assert!(engine.rollup_suite(9999).unwrap().is_none());
    }

    #[test]
    fn test_group_rollup_pools_tests_across_suites() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let core = suite(&pool, b, TestCategory::Unit, Some("core"));
        let loose = suite(&pool, b, TestCategory::Unit, None);
        exec(&pool, core, "a", Status::Pass, 0, 1);
        exec_in_group(&pool, core, "b", Status::Fail, 0, 1, Some("gen"));
        exec_in_group(&pool, loose, "c", Status::Pass, 0, 1, Some("gen"));
        exec(&pool, loose, "d", Status::Skip, 0, 1);

        let engine = engine(&pool, &[TestCategory::Unit]);
        let gen = engine.rollup_group(b, Some("gen")).unwrap();
        assert_eq!(gen.total, 2);
        assert_eq!(gen.count(Status::Fail), 1);
        assert_eq!(engine.rollup_group(b, Some("core")).unwrap().total, 1);
        assert_eq!(engine.rollup_group(b, None).unwrap().count(Status::Skip), 1);

        let groups = engine.rollup_groups(b, TestCategory::Unit).unwrap();
        let labels: Vec<&str> = groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["gen", UNGROUPED_LABEL, "core"]);
        assert_eq!(groups[0].suite_ids, vec![core, loose]);
        assert!(groups[0].suite_id.is_none());

        let total: u64 = groups.iter().map(|g| g.summary.total).sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_bug_suites_are_left_out_of_build_totals() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let normal = suite(&pool, b, TestCategory::Unit, None);
        let bug = suite_with(&pool, b, TestCategory::Unit, None, "host-a", "bug=true");
        exec(&pool, normal, "a", Status::Pass, 0, 1);
        exec(&pool, bug, "b", Status::Fail, 0, 1);

        let engine = engine(&pool, &[TestCategory::Unit]);
        let unit = engine.rollup_category(b, TestCategory::Unit).unwrap().unwrap();
        assert_eq!(unit.total, 1);
        assert_eq!(engine.rollup_suite(bug).unwrap().unwrap().total, 1);
    }

    #[test]
    fn test_cache_is_read_through_and_invalidated() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let s = suite(&pool, b, TestCategory::Unit, None);
        exec(&pool, s, "a", Status::Pass, 0, 1);

        let cache = Arc::new(SummaryCache::new());
        let engine = engine(&pool, &[TestCategory::Unit]).with_cache(cache.clone());
        assert_eq!(engine.rollup_group(b, None).unwrap().total, 1);
        assert_eq!(cache.len(), 1);

        exec(&pool, s, "b", Status::Pass, 0, 1);
        assert_eq!(engine.rollup_group(b, None).unwrap().total, 1);
        engine.invalidate(b);
        assert_eq!(engine.rollup_group(b, None).unwrap().total, 2);
    }

    #[test]
    fn test_groups_with_equal_status_put_slower_first() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let s = suite(&pool, b, TestCategory::Unit, None);
        exec_in_group(&pool, s, "a", Status::Fail, 0, 1, Some("alpha"));
        exec_in_group(&pool, s, "b", Status::Fail, 0, 9, Some("beta"));
        exec_in_group(&pool, s, "c", Status::Pass, 0, 30, Some("gamma"));

        let groups = engine(&pool, &[TestCategory::Unit])
            .rollup_groups(b, TestCategory::Unit)
            .unwrap();
        let labels: Vec<&str> = groups.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, vec!["beta", "alpha", "gamma"]);
        assert_eq!(groups[0].representative, Some(Status::Fail));
        assert_eq!(groups[0].group_name.as_deref(), Some("beta"));
    }

    #[test]
    fn test_write_during_rollup_is_not_cached_over() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let s = suite(&pool, b, TestCategory::Unit, None);
        let id = exec(&pool, s, "a", Status::Pass, 0, 1);

        // The status write and its invalidation land after the rollup has
        // read its records but before it stores the summary.
        let cache = Arc::new(SummaryCache::new());
        let sqlite = SqliteExecutionStore::new(pool.clone(), TestCategory::Unit);
        let writer = sqlite.clone();
        let invalidator = Arc::clone(&cache);
        let fired = AtomicBool::new(false);
        let store = HookedStore::new(sqlite, HookPoint::ExecutionsByGroup, move || {
            if !fired.swap(true, Ordering::SeqCst) {
                writer.persist_status(id, Status::Kill).unwrap();
                invalidator.invalidate_build(b);
            }
        });
        let engine = AggregationEngine::new(
            vec![Arc::new(store) as Arc<dyn ExecutionStore>],
            AggregationSettings::default(),
        )
        .with_cache(cache.clone());

        let first = engine.rollup_group(b, None).unwrap();
        assert_eq!(first.count(Status::Pass), 1);
        assert!(cache.is_empty());

        let second = engine.rollup_group(b, None).unwrap();
        assert_eq!(second.count(Status::Pass), 0);
        assert_eq!(second.count(Status::Kill), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(engine.rollup_group(b, None).unwrap(), second);
    }

    #[tokio::test]
    async fn test_slow_category_times_out_while_others_render() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let s = suite(&pool, b, TestCategory::Unit, None);
        exec(&pool, s, "a", Status::Pass, 0, 1);

        let slow = HookedStore::new(
            SqliteExecutionStore::new(pool.clone(), TestCategory::Ui),
            HookPoint::ExecutionsByBuild,
            || std::thread::sleep(Duration::from_millis(1_000)),
        );
        let stores: Vec<Arc<dyn ExecutionStore>> = vec![
            Arc::new(SqliteExecutionStore::new(pool.clone(), TestCategory::Unit)),
            Arc::new(slow),
        ];
        let settings = AggregationSettings {
            category_timeout: Duration::from_millis(100),
            ..AggregationSettings::default()
        };
        let engine = AggregationEngine::new(stores, settings);

        let started = std::time::Instant::now();
        let report = engine.rollup_build(b).await.unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_millis(900));

        assert_eq!(report.categories[&TestCategory::Unit].summary().unwrap().total, 1);
        match &report.categories[&TestCategory::Ui] {
            CategoryRollup::Unavailable { reason } => assert!(reason.contains("timed out")),
            other => panic!("expected a timed-out category, got {:?}", other),
        }
        assert!(report.is_partial());
        assert_eq!(report.total.total, 1);
    }

    #[tokio::test]
    async fn test_build_rollup_reports_failed_category_as_unavailable() {
        let pool = open_memory_pool().unwrap();
        let b = build(&pool, "1.0");
        let s = suite(&pool, b, TestCategory::Unit, None);
        exec(&pool, s, "a", Status::Pass, 0, 1);
        exec(&pool, s, "b", Status::Fail, 0, 1);

        let stores: Vec<Arc<dyn ExecutionStore>> = vec![
            Arc::new(SqliteExecutionStore::new(pool.clone(), TestCategory::Unit)),
            Arc::new(SqliteExecutionStore::new(pool.clone(), TestCategory::Acceptance)),
            Arc::new(BrokenStore(TestCategory::Ui)),
        ];
        let engine = AggregationEngine::new(stores, AggregationSettings::default());
        let report = engine.rollup_build(b).await.unwrap().unwrap();

        let unit = report.categories[&TestCategory::Unit].summary().unwrap();
        assert_eq!(unit.total, 2);
        let acceptance = report.categories[&TestCategory::Acceptance].summary().unwrap();
        assert!(acceptance.is_empty());
        assert!(!report.categories[&TestCategory::Ui].is_available());
        assert!(report.is_partial());
        assert_eq!(report.total.total, 2);

        assert!(engine.rollup_build(4242).await.unwrap().is_none());
    }
}
