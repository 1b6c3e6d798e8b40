//! Priority order: which of several executions is the most newsworthy.
//!
//! Significance is not lifecycle order. An in-progress or abnormal result
//! must surface above a clean pass, so Running ranks first and Pass last.

use super::Status;
use crate::model::TestExecution;
use std::cmp::Ordering;

/// Significance ranks, most significant first.
const SIGNIFICANCE: [Status; 9] = [
    Status::Running,
    Status::Error,
    Status::Fail,
    Status::Kill,
    Status::Skip,
    Status::Blacklist,
    Status::Pending,
    Status::Unknown,
    Status::Pass,
];

/// Position of `status` in the significance order (0 is most significant).
pub fn significance(status: Status) -> usize {
    SIGNIFICANCE
        .iter()
        .position(|s| *s == status)
        .unwrap_or(SIGNIFICANCE.len())
}

/// Total order: significance, then slower first, then lower id first.
pub fn compare(a: &TestExecution, b: &TestExecution) -> Ordering {
    significance(a.status)
        .cmp(&significance(b.status))
        .then_with(|| b.elapsed_ms().cmp(&a.elapsed_ms()))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sort executions so the headline result comes first.
pub fn sort(executions: &mut [TestExecution]) {
    executions.sort_by(compare);
}

/// The single execution that represents a collection, if any.
pub fn headline(executions: &[TestExecution]) -> Option<&TestExecution> {
    executions.iter().min_by(|a, b| compare(a, b))
}

/// Executions of one logical test, kept in priority order.
#[derive(Debug, Clone, Default)]
pub struct TestGroup {
    name: String,
    members: Vec<TestExecution>,
}

impl TestGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&mut self, execution: TestExecution) {
        let idx = self
            .members
            .partition_point(|m| compare(m, &execution) != Ordering::Greater);
        self.members.insert(idx, execution);
    }

    pub fn members(&self) -> &[TestExecution] {
        &self.members
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn representative(&self) -> Option<&TestExecution> {
        self.members.first()
    }

    /// Status of the representative, Unknown for an empty group.
    pub fn status(&self) -> Status {
        self.representative()
            .map(|t| t.status)
            .unwrap_or(Status::Unknown)
    }

    /// Order groups by their representatives, empty groups last.
    pub fn compare(a: &TestGroup, b: &TestGroup) -> Ordering {
        match (a.representative(), b.representative()) {
            (Some(x), Some(y)) => compare(x, y).then_with(|| a.name.cmp(&b.name)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.name.cmp(&b.name),
        }
    }
}

/// Collect executions into groups keyed by their identity display name.
pub fn group_by_identity(executions: impl IntoIterator<Item = TestExecution>) -> Vec<TestGroup> {
    let mut groups: std::collections::BTreeMap<String, TestGroup> = Default::default();
    for t in executions {
        let key = t.identity.to_string();
        groups
            .entry(key.clone())
            .or_insert_with(|| TestGroup::new(key))
            .add(t);
    }
    let mut out: Vec<TestGroup> = groups.into_values().collect();
    out.sort_by(TestGroup::compare);
    out
}
