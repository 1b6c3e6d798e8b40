//! Execution records: builds, suites, and individual test executions.

use crate::status::{self, Status};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of test suite. Each category is served by its own store adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCategory {
    Unit,
    Acceptance,
    Ui,
    Flex,
}

impl TestCategory {
    pub const ALL: [TestCategory; 4] = [
        TestCategory::Unit,
        TestCategory::Acceptance,
        TestCategory::Ui,
        TestCategory::Flex,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestCategory::Unit => "unit",
            TestCategory::Acceptance => "acceptance",
            TestCategory::Ui => "ui",
            TestCategory::Flex => "flex",
        }
    }
}

impl fmt::Display for TestCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TestCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown test category '{}'", s))
    }
}

/// What a test is, independent of any particular run: the class (or script)
/// and, for unit tests, the method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestIdentity {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,
}

impl TestIdentity {
    pub fn new(class_name: impl Into<String>, method_name: Option<&str>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.map(str::to_string),
        }
    }

    pub fn script(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }
}

impl fmt::Display for TestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.method_name {
            Some(m) => write!(f, "{}#{}", self.class_name, m),
            None => f.write_str(&self.class_name),
        }
    }
}

/// Host and runtime attributes that decide whether two runs are comparable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentFingerprint {
    pub host_name: String,
    pub jdk_version: String,
    pub jdk_vendor: String,
    pub os_name: String,
    pub os_arch: String,
    pub os_version: String,
}

impl EnvironmentFingerprint {
    /// Comparable iff every attribute matches.
    pub fn is_comparable(&self, other: &EnvironmentFingerprint) -> bool {
        self == other
    }
}

/// One recorded run of a single test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestExecution {
    pub id: i64,
    pub suite_id: i64,
    pub identity: TestIdentity,
    /// Generation group, which may differ from the owning suite's group.
    pub group_name: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    pub status: Status,
}

impl TestExecution {
    pub fn new(id: i64, suite_id: i64, identity: TestIdentity) -> Self {
        Self {
            id,
            suite_id,
            identity,
            group_name: None,
            start_time: None,
            end_time: None,
            message: String::new(),
            status: Status::Unknown,
        }
    }

    /// Elapsed milliseconds; zero when either timestamp is missing or the
    /// clock went backwards.
    pub fn elapsed_ms(&self) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
            _ => 0,
        }
    }

    /// Merge an observed status through the lattice.
    pub fn update_status(&mut self, incoming: Status) -> Status {
        self.status = status::merge(self.status, incoming);
        self.status
    }

    /// Unconditional assignment for final, already validated statuses.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Append output, prefixed with the local wall-clock time.
    pub fn add_message(&mut self, text: &str) {
        let stamp = Local::now().format("%H:%M:%S%.3f - ");
        self.message.push_str(&format!("{}{}", stamp, text));
    }

    pub fn clear_message(&mut self) {
        self.message.clear();
    }
}

/// One recorded run of a test suite on a specific host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteExecution {
    pub id: i64,
    pub build_id: i64,
    pub category: TestCategory,
    pub name: String,
    pub group_id: Option<i64>,
    pub group_name: Option<String>,
    pub fingerprint: EnvironmentFingerprint,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Elapsed time reported by the runner, used when timestamps are absent.
    pub elapsed_override_ms: Option<i64>,
    /// Number of tests the suite declared up front (zero when unknown).
    pub declared_test_count: u64,
    pub options: BTreeMap<String, String>,
}

impl SuiteExecution {
    pub fn is_complete(&self) -> bool {
        self.start_time.is_some() && self.end_time.is_some()
    }

    pub fn elapsed_ms(&self) -> i64 {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0),
            _ => self.elapsed_override_ms.unwrap_or(0),
        }
    }

    /// Suites run to reproduce a known bug are kept out of build-wide totals.
    pub fn is_bug_suite(&self) -> bool {
        self.options
            .get("bug")
            .map(|v| v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// True when every option in `subset` is present with the same value.
    pub fn has_all_options(&self, subset: &BTreeMap<String, String>) -> bool {
        subset
            .iter()
            .all(|(k, v)| self.options.get(k).map(|x| x == v).unwrap_or(false))
    }
}

/// A build of the product that suites were executed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildExecution {
    pub id: i64,
    /// May embed a generation timestamp, see [`crate::history::VersionFamily`].
    pub version: String,
    pub start_time: Option<DateTime<Utc>>,
}

/// Why an option cannot survive the `name=value` line format, if it can't.
pub fn option_problem(name: &str, value: &str) -> Option<&'static str> {
    if name.contains('=') {
        Some("option name contains '='")
    } else if name.contains(['\n', '\r']) {
        Some("option name contains a line break")
    } else if value.contains(['\n', '\r']) {
        Some("option value contains a line break")
    } else {
        None
    }
}

/// Render suite options as `name=value` lines.
pub fn format_options(options: &BTreeMap<String, String>) -> String {
    options
        .iter()
        .map(|(k, v)| format!("{}={}\n", k, v))
        .collect()
}

/// Parse `name=value` lines. A bare `name` has an empty value and `=value`
/// has an empty name.
pub fn parse_options(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.split_once('=') {
            Some((name, value)) => (name.to_string(), value.to_string()),
            None => (line.to_string(), String::new()),
        })
        .collect()
}
