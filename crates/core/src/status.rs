//! Batch status and exit status value objects.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in escalation order: a status later in the list is
/// "more advanced" than an earlier one, except that [`BatchStatus::Completed`]
/// wins over the two running states it can race with (see [`BatchStatus::upgrade_to`]).
/// The stored representation is the upper-case variant name.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 8] = [
        BatchStatus::Completed,
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Failed,
        BatchStatus::Abandoned,
        BatchStatus::Unknown,
    ];

    fn rank(self) -> u8 {
        match self {
            BatchStatus::Completed => 0,
            BatchStatus::Starting => 1,
            BatchStatus::Started => 2,
            BatchStatus::Stopping => 3,
            BatchStatus::Stopped => 4,
            BatchStatus::Failed => 5,
            BatchStatus::Abandoned => 6,
            BatchStatus::Unknown => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }

    /// True while the execution still holds the instance (starting, started or stopping).
    pub fn is_running(self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    /// True for `FAILED` and anything more severe.
    pub fn is_unsuccessful(self) -> bool {
        self.rank() >= BatchStatus::Failed.rank()
    }

    pub fn is_greater_than(self, other: BatchStatus) -> bool {
        self.rank() > other.rank()
    }

    fn max(self, other: BatchStatus) -> BatchStatus {
        if other.rank() > self.rank() { other } else { self }
    }

    /// Combine two statuses without ever moving backwards.
    ///
    /// Once either side is past `STARTED` the more severe one wins. Among the
    /// early states, `COMPLETED` beats `STARTING`/`STARTED`.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self.is_greater_than(BatchStatus::Started) || other.is_greater_than(BatchStatus::Started) {
            return self.max(other);
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        self.max(other)
    }
}

impl core::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::unknown_variant("batch status", s))
    }
}

/// Exit outcome of an execution: a short code plus a free-form description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub exit_code: String,
    pub exit_description: String,
}

impl ExitStatus {
    pub const UNKNOWN: &'static str = "UNKNOWN";
    pub const EXECUTING: &'static str = "EXECUTING";
    pub const COMPLETED: &'static str = "COMPLETED";
    pub const NOOP: &'static str = "NOOP";
    pub const FAILED: &'static str = "FAILED";
    pub const STOPPED: &'static str = "STOPPED";

    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn with_description(exit_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: description.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(Self::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(Self::COMPLETED)
    }

    pub fn failed() -> Self {
        Self::new(Self::FAILED)
    }

    /// Exit description cut to at most `max_chars` characters.
    pub fn truncated_description(&self, max_chars: usize) -> &str {
        match self.exit_description.char_indices().nth(max_chars) {
            Some((byte_idx, _)) => &self.exit_description[..byte_idx],
            None => &self.exit_description,
        }
    }

    pub fn is_description_longer_than(&self, max_chars: usize) -> bool {
        self.exit_description.chars().nth(max_chars).is_some()
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_stored_name() {
        for status in BatchStatus::ALL {
            assert_eq!(status.as_str().parse::<BatchStatus>().unwrap(), status);
        }
        assert!("RUNNING".parse::<BatchStatus>().is_err());
    }

    #[test]
    fn serde_uses_upper_case_names() {
        let json = serde_json::to_string(&BatchStatus::Abandoned).unwrap();
        assert_eq!(json, "\"ABANDONED\"");
    }

    #[test]
    fn completed_beats_running_states() {
        assert_eq!(
            BatchStatus::Started.upgrade_to(BatchStatus::Completed),
            BatchStatus::Completed
        );
        assert_eq!(
            BatchStatus::Completed.upgrade_to(BatchStatus::Starting),
            BatchStatus::Completed
        );
    }

    #[test]
    fn terminal_failure_is_never_downgraded() {
        assert_eq!(
            BatchStatus::Failed.upgrade_to(BatchStatus::Started),
            BatchStatus::Failed
        );
        assert_eq!(
            BatchStatus::Stopping.upgrade_to(BatchStatus::Completed),
            BatchStatus::Stopping
        );
    }

    #[test]
    fn truncation_counts_characters() {
        let exit = ExitStatus::with_description("FAILED", "héllo wörld");
        assert_eq!(exit.truncated_description(5), "héllo");
        assert!(exit.is_description_longer_than(5));
        assert_eq!(exit.truncated_description(100), "héllo wörld");
        assert!(!exit.is_description_longer_than(11));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        fn any_status() -> impl Strategy<Value = BatchStatus> {
            prop::sample::select(BatchStatus::ALL.to_vec())
        }

        proptest! {
            /// Property: the result does not depend on which side is upgraded.
            #[test]
            fn upgrade_is_commutative(a in any_status(), b in any_status()) {
                prop_assert_eq!(a.upgrade_to(b), b.upgrade_to(a));
            }

            /// Property: upgrading is idempotent.
            #[test]
            fn upgrade_is_idempotent(a in any_status(), b in any_status()) {
                let once = a.upgrade_to(b);
                prop_assert_eq!(once.upgrade_to(b), once);
            }
        }
    }
}
