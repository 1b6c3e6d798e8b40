//! Version families: build versions with the generation timestamp masked.

use serde::Serialize;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Wildcard that replaces the timestamp token.
pub const WILDCARD: &str = "%";

/// yyyy[.]MMdd.HHmmss
static TIMESTAMP_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9]{4}\.?[0-1][0-9][0-3][0-9]\.[0-2][0-9][0-5][0-9][0-5][0-9]").unwrap()
});

/// A release line: every build whose masked version string is identical.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VersionFamily {
    masked: String,
}

impl VersionFamily {
    pub fn of(version: &str) -> Self {
        Self {
            masked: TIMESTAMP_REGEX.replace_all(version, WILDCARD).into_owned(),
        }
    }

    pub fn masked(&self) -> &str {
        &self.masked
    }

    /// Whether `version` belongs to this family.
    pub fn contains(&self, version: &str) -> bool {
        Self::of(version) == *self
    }

    /// A SQL `LIKE` pattern that matches at least every member version.
    pub fn like_pattern(&self) -> String {
        self.masked.clone()
    }

    /// Whether the version carried a timestamp at all.
    pub fn is_masked(&self) -> bool {
        self.masked.contains(WILDCARD)
    }
}

impl fmt::Display for VersionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked)
    }
}

pub fn same_family(a: &str, b: &str) -> bool {
    VersionFamily::of(a) == VersionFamily::of(b)
}
