//! Read-through cache for rollups, invalidated per build.
//!
//! Every build carries a generation that [`SummaryCache::invalidate_build`]
//! bumps. A summary computed before an invalidation is never stored after it.

use super::TestSummary;
use crate::model::TestCategory;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// What a cached summary covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    Suite(i64),
    Group(Option<String>),
    Category,
}

type CacheKey = (TestCategory, i64, CacheScope);

#[derive(Debug, Default)]
struct Entries {
    summaries: HashMap<CacheKey, TestSummary>,
    generations: HashMap<i64, u64>,
}

impl Entries {
    fn generation(&self, build_id: i64) -> u64 {
        self.generations.get(&build_id).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
pub struct SummaryCache {
    entries: Mutex<Entries>,
}

impl SummaryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // Entries are replaced whole, so a poisoned map is still consistent.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, category: TestCategory, build_id: i64, scope: &CacheScope) -> Option<TestSummary> {
        self.lock()
            .summaries
            .get(&(category, build_id, scope.clone()))
            .cloned()
    }

    /// Current generation of a build. Read it before computing a summary and
    /// hand it to [`Self::put`].
    pub fn generation(&self, build_id: i64) -> u64 {
        self.lock().generation(build_id)
    }

    /// Store a summary computed at `generation`. Returns false, storing
    /// nothing, when the build was invalidated in the meantime.
    pub fn put(
        &self,
        category: TestCategory,
        build_id: i64,
        scope: CacheScope,
        generation: u64,
        summary: TestSummary,
    ) -> bool {
        let mut entries = self.lock();
        if entries.generation(build_id) != generation {
            debug!(%category, build_id, ?scope, "discarding summary computed before invalidation");
            return false;
        }
        entries.summaries.insert((category, build_id, scope), summary);
        true
    }

    /// Drop every entry for a build. Call whenever its executions change.
    pub fn invalidate_build(&self, build_id: i64) {
        let mut entries = self.lock();
        let before = entries.summaries.len();
        entries.summaries.retain(|(_, b, _), _| *b != build_id);
        let dropped = before - entries.summaries.len();
        let generation = entries.generations.entry(build_id).or_insert(0);
        *generation = generation.wrapping_add(1);
        debug!(build_id, dropped, generation = *generation, "summary cache invalidated");
    }

    pub fn len(&self) -> usize {
        self.lock().summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().summaries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_only_touches_one_build() {
        let cache = SummaryCache::new();
        cache.put(TestCategory::Unit, 1, CacheScope::Category, 0, TestSummary::default());
        cache.put(TestCategory::Unit, 1, CacheScope::Suite(4), 0, TestSummary::default());
        cache.put(TestCategory::Ui, 2, CacheScope::Group(None), 0, TestSummary::default());
        assert_eq!(cache.len(), 3);

        cache.invalidate_build(1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(TestCategory::Unit, 1, &CacheScope::Category).is_none());
        assert!(cache
            .get(TestCategory::Ui, 2, &CacheScope::Group(None))
            .is_some());
        assert_eq!(cache.generation(1), 1);
        assert_eq!(cache.generation(2), 0);
    }

    #[test]
    fn test_summary_from_before_invalidation_is_not_stored() {
        let cache = SummaryCache::new();
        let seen = cache.generation(7);
        cache.invalidate_build(7);

        assert!(!cache.put(TestCategory::Unit, 7, CacheScope::Category, seen, TestSummary::default()));
        assert!(cache.get(TestCategory::Unit, 7, &CacheScope::Category).is_none());

        let fresh = cache.generation(7);
        assert!(cache.put(TestCategory::Unit, 7, CacheScope::Category, fresh, TestSummary::default()));
        assert_eq!(cache.len(), 1);
    }
}
