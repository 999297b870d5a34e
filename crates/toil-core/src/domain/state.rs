//! Job lifecycle state machine and the queue-level status flag.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Each state is backed by one named set in the
/// backend, and a job id belongs to exactly one of them at any instant.
///
/// State transitions:
/// - (none) -> Pending | Paused (creation, chosen by the queue status flag)
/// - Pending -> Active (a worker wins the claim)
/// - Active -> Complete (handler succeeded)
/// - Active -> Failed (handler returned an error)
/// - Pending -> Paused -> Pending (bulk pause / resume)
///
/// Design note: the Pending -> Active move is the exactly-once seam. It is a
/// single conditional move in the backend; losing it means another process is
/// handling the job, which is a normal outcome and never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Created and waiting to be claimed.
    Pending,

    /// Parked while the queue is paused.
    Paused,

    /// Claimed by exactly one worker, handler in flight.
    Active,

    /// Handler succeeded.
    Complete,

    /// Handler returned an error.
    Failed,
}

impl JobState {
    /// All states, in set-layout order.
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Paused,
        JobState::Active,
        JobState::Complete,
        JobState::Failed,
    ];

    /// Name of the backing set, also the wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Paused => "paused",
            JobState::Active => "active",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }
}

/// Queue-level status flag, persisted under the `status` key.
///
/// Never cached locally: every decision that depends on it re-reads the
/// backend, so independent processes cannot act on stale views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Active,
    Paused,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Active => "active",
            QueueStatus::Paused => "paused",
        }
    }

    /// Parse the persisted flag. An absent or unrecognized value means the
    /// queue was never paused, so it defaults to `Active`.
    pub fn from_flag(raw: Option<&str>) -> Self {
        match raw {
            Some("paused") => QueueStatus::Paused,
            _ => QueueStatus::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::pending(JobState::Pending, "pending", false)]
    #[case::paused(JobState::Paused, "paused", false)]
    #[case::active(JobState::Active, "active", false)]
    #[case::complete(JobState::Complete, "complete", true)]
    #[case::failed(JobState::Failed, "failed", true)]
    fn state_names_and_terminality(
        #[case] state: JobState,
        #[case] name: &str,
        #[case] terminal: bool,
    ) {
        assert_eq!(state.as_str(), name);
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn status_flag_defaults_to_active() {
        assert_eq!(QueueStatus::from_flag(None), QueueStatus::Active);
        assert_eq!(QueueStatus::from_flag(Some("active")), QueueStatus::Active);
        assert_eq!(QueueStatus::from_flag(Some("garbage")), QueueStatus::Active);
        assert_eq!(QueueStatus::from_flag(Some("paused")), QueueStatus::Paused);
    }
}
