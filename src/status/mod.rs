//! Status vocabulary and the monotonic merge rule for a single execution.
//!
//! An execution receives a stream of status observations while it runs
//! (pending, running, then a verdict). `merge` folds each observation into
//! the current value so that the stored status is always the most
//! significant one seen, never simply the latest.

pub mod priority;

use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Execution status.
///
/// The derived ordering follows declaration (lifecycle) order and exists so
/// statuses can key ordered maps. Display priority lives in [`priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Unknown,
    Pending,
    Running,
    Pass,
    Skip,
    Fail,
    Error,
    Kill,
    Blacklist,
}

impl Status {
    pub const ALL: [Status; 9] = [
        Status::Unknown,
        Status::Pending,
        Status::Running,
        Status::Pass,
        Status::Skip,
        Status::Fail,
        Status::Error,
        Status::Kill,
        Status::Blacklist,
    ];

    /// Upper-case token used in storage and on the command line.
    pub fn as_token(self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::Pending => "PENDING",
            Status::Running => "RUNNING",
            Status::Pass => "PASS",
            Status::Skip => "SKIP",
            Status::Fail => "FAIL",
            Status::Error => "ERROR",
            Status::Kill => "KILL",
            Status::Blacklist => "BLACKLIST",
        }
    }

    /// Parse a status token, ignoring case and surrounding whitespace.
    pub fn from_token(token: &str) -> Result<Status, LedgerError> {
        let t = token.trim();
        Status::ALL
            .iter()
            .copied()
            .find(|s| s.as_token().eq_ignore_ascii_case(t))
            .ok_or_else(|| LedgerError::InvalidStatus(token.to_string()))
    }

    /// Error, Kill and Blacklist: the run can no longer be trusted.
    pub fn is_absorbing(self) -> bool {
        matches!(self, Status::Error | Status::Kill | Status::Blacklist)
    }

    /// Pending and Running have not produced a verdict yet.
    pub fn is_in_progress(self) -> bool {
        matches!(self, Status::Pending | Status::Running)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl FromStr for Status {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::from_token(s)
    }
}

/// Fold one incoming observation into the current status.
///
/// Once the current status is absorbing it is never replaced. Otherwise
/// Error, Kill and Blacklist always win, progress states only move
/// forward, and a verdict can only be replaced by a worse verdict.
pub fn merge(current: Status, incoming: Status) -> Status {
    use Status::*;

    if current.is_absorbing() {
        return current;
    }

    let applies = match incoming {
        Unknown => false,
        Pending => matches!(current, Unknown),
        Running => matches!(current, Unknown | Pending),
        Blacklist | Kill | Error => true,
        Skip => matches!(current, Pass | Unknown | Pending | Running),
        Pass => matches!(current, Unknown | Pending | Running),
        Fail => matches!(current, Pass | Unknown | Skip | Pending | Running),
    };

    if applies {
        incoming
    } else {
        current
    }
}

/// Result of applying a raw status token through the lattice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub previous: Status,
    pub status: Status,
    /// The token that could not be parsed, if any.
    pub invalid_token: Option<String>,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }
}

/// Apply a raw token. Unrecognised tokens clamp a non-absorbing status to
/// Unknown and are reported as a warning, never as an error.
pub fn merge_token(current: Status, token: &str) -> MergeOutcome {
    match Status::from_token(token) {
        Ok(incoming) => MergeOutcome {
            previous: current,
            status: merge(current, incoming),
            invalid_token: None,
        },
        Err(_) => {
            let status = if current.is_absorbing() {
                current
            } else {
                Status::Unknown
            };
            warn!(token, previous = %current, %status, "unrecognised status token");
            MergeOutcome {
                previous: current,
                status,
                invalid_token: Some(token.to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = Status> {
        proptest::sample::select(Status::ALL.to_vec())
    }

    #[test]
    fn test_token_round_trip_is_case_insensitive() {
        assert_eq!(Status::from_token("pass").unwrap(), Status::Pass);
        assert_eq!(Status::from_token(" Blacklist ").unwrap(), Status::Blacklist);
        assert!(matches!(
            Status::from_token("flaky"),
            Err(LedgerError::InvalidStatus(t)) if t == "flaky"
        ));
    }

    #[test]
    fn test_merge_table() {
        use Status::*;
        assert_eq!(merge(Unknown, Pending), Pending);
        assert_eq!(merge(Running, Pending), Running);
        assert_eq!(merge(Pending, Running), Running);
        assert_eq!(merge(Pass, Running), Pass);
        assert_eq!(merge(Pass, Fail), Fail);
        assert_eq!(merge(Skip, Fail), Fail);
        assert_eq!(merge(Fail, Pass), Fail);
        assert_eq!(merge(Fail, Skip), Fail);
        assert_eq!(merge(Pass, Skip), Skip);
        assert_eq!(merge(Skip, Pass), Skip);
        assert_eq!(merge(Fail, Error), Error);
        assert_eq!(merge(Pass, Kill), Kill);
        assert_eq!(merge(Running, Blacklist), Blacklist);
    }

    #[test]
    fn test_running_pending_pass_fail_sequence() {
        let mut s = Status::Running;
        s = merge(s, Status::Pending);
        assert_eq!(s, Status::Running);
        s = merge(s, Status::Pass);
        assert_eq!(s, Status::Pass);
        s = merge(s, Status::Fail);
        assert_eq!(s, Status::Fail);
    }

    #[test]
    fn test_unrecognised_token_clamps_to_unknown() {
        let out = merge_token(Status::Fail, "bogus");
        assert_eq!(out.status, Status::Unknown);
        assert_eq!(out.invalid_token.as_deref(), Some("bogus"));
        assert!(out.changed());

        let out = merge_token(Status::Kill, "bogus");
        assert_eq!(out.status, Status::Kill);
        assert!(!out.changed());
    }

    #[test]
    fn test_valid_token_merges() {
        let out = merge_token(Status::Pending, "running");
        assert_eq!(out.status, Status::Running);
        assert!(out.invalid_token.is_none());
    }

    proptest! {
        #[test]
        fn absorbing_status_never_changes(current in any_status(), incoming in any_status()) {
            prop_assume!(current.is_absorbing());
            prop_assert_eq!(merge(current, incoming), current);
        }

        #[test]
        fn unknown_is_identity(current in any_status()) {
            prop_assert_eq!(merge(current, Status::Unknown), current);
        }

        #[test]
        fn merge_is_idempotent(current in any_status(), incoming in any_status()) {
            let once = merge(current, incoming);
            prop_assert_eq!(merge(once, incoming), once);
        }

        #[test]
        fn verdict_never_regresses_to_progress(current in any_status(), incoming in any_status()) {
            prop_assume!(!current.is_in_progress() && current != Status::Unknown);
            prop_assert!(!merge(current, incoming).is_in_progress());
        }
    }
}
