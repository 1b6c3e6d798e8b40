//! History correlation: find earlier runs of the same test, on the same kind
//! of host, against builds from the same release line.

pub mod family;

pub use self::family::VersionFamily;

use crate::error::{LedgerError, Result};
use crate::model::{EnvironmentFingerprint, TestExecution};
use crate::status::Status;
use crate::storage::{ExecutionStore, HistoryQuery, StatusFilter};
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything needed to decide whether another execution is comparable.
#[derive(Debug, Clone)]
pub struct HistoryContext {
    pub execution: TestExecution,
    pub fingerprint: EnvironmentFingerprint,
    pub family: VersionFamily,
}

/// Which history question to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    LastPass,
    LastFailure,
    Full,
}

/// Answers "last pass", "last failure" and "full history" questions.
#[derive(Clone)]
pub struct HistoryCorrelator {
    store: Arc<dyn ExecutionStore>,
}

impl HistoryCorrelator {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Resolve the owning suite's fingerprint and build's version family.
    pub fn context(&self, execution: &TestExecution) -> Result<HistoryContext> {
        let suite = self
            .store
            .fetch_suite(execution.suite_id)?
            .ok_or(LedgerError::NotFound {
                kind: "suite",
                id: execution.suite_id,
            })?;
        let build = self
            .store
            .fetch_build(suite.build_id)?
            .ok_or(LedgerError::NotFound {
                kind: "build",
                id: suite.build_id,
            })?;

        Ok(HistoryContext {
            execution: execution.clone(),
            fingerprint: suite.fingerprint,
            family: VersionFamily::of(&build.version),
        })
    }

    /// Most recent earlier comparable execution that passed.
    pub fn last_pass(&self, execution: &TestExecution) -> Option<TestExecution> {
        self.lookup(execution, StatusFilter::Only(Status::Pass), Some(1))
            .into_iter()
            .next()
    }

    /// Most recent earlier comparable execution that did not pass.
    pub fn last_failure(&self, execution: &TestExecution) -> Option<TestExecution> {
        self.lookup(execution, StatusFilter::Not(Status::Pass), Some(1))
            .into_iter()
            .next()
    }

    /// Every earlier comparable execution, most recent first.
    pub fn full_history(&self, execution: &TestExecution) -> Vec<TestExecution> {
        self.lookup(execution, StatusFilter::Any, None)
    }

    pub fn history(&self, execution: &TestExecution, kind: HistoryKind) -> Vec<TestExecution> {
        match kind {
            HistoryKind::LastPass => self.last_pass(execution).into_iter().collect(),
            HistoryKind::LastFailure => self.last_failure(execution).into_iter().collect(),
            HistoryKind::Full => self.full_history(execution),
        }
    }

    /// Collaborator failures resolve to "no history".
    fn lookup(
        &self,
        execution: &TestExecution,
        status: StatusFilter,
        limit: Option<usize>,
    ) -> Vec<TestExecution> {
        let ctx = match self.context(execution) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(execution_id = execution.id, error = %e, "history context unavailable");
                return Vec::new();
            }
        };
        match Self::search(self.store.as_ref(), &ctx, status, limit) {
            Ok(found) => found,
            Err(e) => {
                warn!(execution_id = execution.id, error = %e, "history lookup failed");
                Vec::new()
            }
        }
    }

    /// Query with an explicit context. Errors are returned, not swallowed.
    pub fn search(
        store: &dyn ExecutionStore,
        ctx: &HistoryContext,
        status: StatusFilter,
        limit: Option<usize>,
    ) -> Result<Vec<TestExecution>> {
        // History only looks backwards from a run that has started.
        let Some(before) = ctx.execution.start_time else {
            debug!(execution_id = ctx.execution.id, "no start time, no history");
            return Ok(Vec::new());
        };

        let query = HistoryQuery {
            identity: ctx.execution.identity.clone(),
            fingerprint: ctx.fingerprint.clone(),
            version_pattern: ctx.family.like_pattern(),
            before,
            status,
        };

        let found = store
            .find_comparable(&query)?
            .into_iter()
            .filter(|c| ctx.family.contains(&c.build_version))
            .map(|c| c.execution)
            .filter(|e| e.id != ctx.execution.id)
            .take(limit.unwrap_or(usize::MAX))
            .collect::<Vec<_>>();

        debug!(
            execution_id = ctx.execution.id,
            family = %ctx.family,
            matches = found.len(),
            "history search complete"
        );
        Ok(found)
    }
}
