//! Reporting facade: the status writer, rollups, and history lookups over a
//! set of per-category stores.

use crate::aggregate::{AggregationEngine, AggregationSettings, BuildReport, SuiteSummary, SummaryCache, TestSummary};
use crate::error::{LedgerError, Result, StoreError};
use crate::history::{HistoryCorrelator, HistoryKind};
use crate::ingest::{self, BuildDocument, ImportSummary};
use crate::model::{TestCategory, TestExecution};
use crate::status::{self, MergeOutcome, Status};
use crate::storage::{CountScope, ExecutionStore, GroupFilter, Pool, SqliteExecutionStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, info_span, warn};

/// Number of lock stripes serializing status writes.
const LOCK_STRIPES: usize = 64;

type Stores = BTreeMap<TestCategory, Arc<dyn ExecutionStore>>;
type Correlators = BTreeMap<TestCategory, HistoryCorrelator>;

/// Stateless composition over the stores. All durable state lives in the
/// stores; the only in-process state is the optional summary cache and the
/// write lock table.
pub struct ReportingService {
    stores: Stores,
    engine: Arc<AggregationEngine>,
    correlators: Correlators,
    locks: Vec<Mutex<()>>,
}

impl ReportingService {
    pub fn new(
        stores: Vec<Arc<dyn ExecutionStore>>,
        settings: AggregationSettings,
        cache: Option<Arc<SummaryCache>>,
    ) -> Self {
        let mut engine = AggregationEngine::new(stores.iter().cloned(), settings);
        if let Some(cache) = cache {
            engine = engine.with_cache(cache);
        }
        let correlators = stores
            .iter()
            .map(|s| (s.category(), HistoryCorrelator::new(Arc::clone(s))))
            .collect();
        Self {
            stores: stores.into_iter().map(|s| (s.category(), s)).collect(),
            engine: Arc::new(engine),
            correlators,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// One SQLite adapter per category, all sharing `pool`.
    pub fn sqlite(pool: Pool, settings: AggregationSettings, cache_enabled: bool) -> Self {
        let stores = TestCategory::ALL
            .iter()
            .map(|c| Arc::new(SqliteExecutionStore::new(pool.clone(), *c)) as Arc<dyn ExecutionStore>)
            .collect();
        let cache = cache_enabled.then(|| Arc::new(SummaryCache::new()));
        Self::new(stores, settings, cache)
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    fn stripe(&self, execution_id: i64) -> MutexGuard<'_, ()> {
        let idx = execution_id.rem_euclid(LOCK_STRIPES as i64) as usize;
        self.locks[idx].lock().unwrap_or_else(|e| e.into_inner())
    }

    fn owner(&self, execution_id: i64) -> Result<Option<(&Arc<dyn ExecutionStore>, TestExecution)>> {
        for store in self.stores.values() {
            if let Some(found) = store.fetch_execution(execution_id)? {
                return Ok(Some((store, found)));
            }
        }
        Ok(None)
    }

    /// Look up an execution in whichever category owns it.
    pub fn find_execution(&self, execution_id: i64) -> Result<Option<(TestCategory, TestExecution)>> {
        Ok(self
            .owner(execution_id)?
            .map(|(store, execution)| (store.category(), execution)))
    }

    /// Fold an incoming status token into an execution's stored status.
    /// Returns `None` when the execution does not exist.
    pub fn merge_status(&self, execution_id: i64, token: &str) -> Result<Option<MergeOutcome>> {
        let _span = info_span!("merge_status", execution_id).entered();
        let mut invalid_token = None;
        let applied = self.write_status(execution_id, &mut |current| {
            let outcome = status::merge_token(current, token);
            invalid_token = outcome.invalid_token;
            outcome.status
        })?;
        Ok(applied.map(|(previous, status)| MergeOutcome {
            previous,
            status,
            invalid_token,
        }))
    }

    /// Overwrite an execution's status, bypassing the lattice.
    pub fn set_status(&self, execution_id: i64, status: Status) -> Result<Option<MergeOutcome>> {
        let _span = info_span!("set_status", execution_id).entered();
        let applied = self.write_status(execution_id, &mut |_| status)?;
        Ok(applied.map(|(previous, status)| MergeOutcome {
            previous,
            status,
            invalid_token: None,
        }))
    }

    fn write_status(
        &self,
        execution_id: i64,
        next: &mut dyn FnMut(Status) -> Status,
    ) -> Result<Option<(Status, Status)>> {
        let _guard = self.stripe(execution_id);

        let Some((store, execution)) = self.owner(execution_id)? else {
            debug!(execution_id, "status write for unknown execution");
            return Ok(None);
        };
        let Some((previous, updated)) = store.apply_status(execution_id, next)? else {
            return Ok(None);
        };

        if previous != updated {
            info!(execution_id, %previous, status = %updated, "status changed");
            match store.fetch_suite(execution.suite_id)? {
                Some(suite) => self.engine.invalidate(suite.build_id),
                None => warn!(execution_id, suite_id = execution.suite_id, "execution has no suite"),
            }
        }
        Ok(Some((previous, updated)))
    }

    /// Import a build document and drop any summaries cached for its id.
    pub fn import(&self, pool: &Pool, doc: &BuildDocument) -> Result<ImportSummary> {
        let summary = ingest::import_build(pool, doc)?;
        self.engine.invalidate(summary.build_id);
        Ok(summary)
    }

    /// Run a blocking query on the blocking pool under the per-query budget.
    async fn bounded<T, F>(&self, query: &'static str, run: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let budget = self.engine.settings().category_timeout;
        let budget_ms = u64::try_from(budget.as_millis()).unwrap_or(u64::MAX);
        match tokio::time::timeout(budget, tokio::task::spawn_blocking(run)).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(StoreError::Task(format!("{} task failed: {}", query, join)).into()),
            Err(_) => {
                warn!(query, budget_ms, "query timed out");
                Err(LedgerError::Timeout { query, budget_ms })
            }
        }
    }

    /// [`Self::summarize_suite`] under the per-query budget.
    pub async fn summarize_suite_bounded(&self, suite_id: i64) -> Result<Option<SuiteSummary>> {
        let engine = Arc::clone(&self.engine);
        self.bounded("suite rollup", move || engine.summarize_suite(suite_id))
            .await
    }

    /// [`Self::rollup_group`] under the per-query budget.
    pub async fn rollup_group_bounded(&self, build_id: i64, group: Option<String>) -> Result<TestSummary> {
        let engine = Arc::clone(&self.engine);
        self.bounded("group rollup", move || engine.rollup_group(build_id, group.as_deref()))
            .await
    }

    /// History lookup under the per-query budget. Unlike the unbounded
    /// lookups, an overrun is an error rather than "no history".
    pub async fn history_bounded(
        &self,
        execution: &TestExecution,
        kind: HistoryKind,
    ) -> Result<Vec<TestExecution>> {
        let stores = self.stores.clone();
        let correlators = self.correlators.clone();
        let execution = execution.clone();
        self.bounded("history lookup", move || {
            Ok(route(&stores, &correlators, &execution)
                .map(|c| c.history(&execution, kind))
                .unwrap_or_default())
        })
        .await
    }

    pub fn rollup_suite(&self, suite_id: i64) -> Result<Option<TestSummary>> {
        self.engine.rollup_suite(suite_id)
    }

    pub fn summarize_suite(&self, suite_id: i64) -> Result<Option<SuiteSummary>> {
        self.engine.summarize_suite(suite_id)
    }

    pub fn rollup_group(&self, build_id: i64, group: Option<&str>) -> Result<TestSummary> {
        self.engine.rollup_group(build_id, group)
    }

    pub fn rollup_groups(&self, build_id: i64, category: TestCategory) -> Result<Vec<SuiteSummary>> {
        self.engine.rollup_groups(build_id, category)
    }

    pub fn group_names(&self, build_id: i64) -> Result<BTreeSet<String>> {
        self.engine.group_names(build_id)
    }

    pub async fn rollup_build(&self, build_id: i64) -> Result<Option<BuildReport>> {
        self.engine.rollup_build(build_id).await
    }

    pub fn count_executions(
        &self,
        category: TestCategory,
        scope: CountScope,
        status: Option<Status>,
        group: &GroupFilter,
    ) -> Result<u64> {
        match self.stores.get(&category) {
            Some(store) => Ok(store.count_executions(scope, status, group)?),
            None => Ok(0),
        }
    }

    fn correlator_for(&self, execution: &TestExecution) -> Option<&HistoryCorrelator> {
        route(&self.stores, &self.correlators, execution)
    }

    pub fn last_pass(&self, execution: &TestExecution) -> Option<TestExecution> {
        self.correlator_for(execution)?.last_pass(execution)
    }

    pub fn last_failure(&self, execution: &TestExecution) -> Option<TestExecution> {
        self.correlator_for(execution)?.last_failure(execution)
    }

    pub fn full_history(&self, execution: &TestExecution) -> Vec<TestExecution> {
        self.correlator_for(execution)
            .map(|c| c.full_history(execution))
            .unwrap_or_default()
    }
}

/// Correlator of the category whose suite owns the execution.
fn route<'a>(
    stores: &Stores,
    correlators: &'a Correlators,
    execution: &TestExecution,
) -> Option<&'a HistoryCorrelator> {
    for (category, store) in stores {
        match store.fetch_suite(execution.suite_id) {
            Ok(Some(_)) => return correlators.get(category),
            Ok(None) => {}
            Err(e) => {
                warn!(execution_id = execution.id, %category, error = %e, "suite lookup failed");
            }
        }
    }
    None
}
