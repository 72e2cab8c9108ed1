//! Job state machine.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Lifecycle state of a job.
///
/// A state is terminal when it has no outgoing transitions. `FailedWithRetry`
/// is transient: the manager moves it back to `Queued` as soon as the retry
/// message is dispatched.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Created,
    Waiting,
    Scheduled,
    Queued,
    Running,
    FailedWithRetry,
    Finished,
    Failed,
    Canceled,
    Aborted,
}

impl JobState {
    pub const ALL: [JobState; 10] = [
        JobState::Created,
        JobState::Waiting,
        JobState::Scheduled,
        JobState::Queued,
        JobState::Running,
        JobState::FailedWithRetry,
        JobState::Finished,
        JobState::Failed,
        JobState::Canceled,
        JobState::Aborted,
    ];

    /// States this state may move to.
    ///
    /// `Running` may re-enter itself (redelivery to the owning node) and
    /// fall back to `Queued` (recovery after a crash of the owning node).
    pub fn valid_transitions(self) -> &'static [JobState] {
        use JobState::*;

        match self {
            Created => &[Waiting, Scheduled, Queued, Running, Failed, Canceled, Aborted],
            Waiting | Scheduled => &[Queued, Running, Failed, Canceled, Aborted],
            Queued => &[Running, Canceled, Failed, Aborted],
            Running => &[Running, Queued, Finished, FailedWithRetry, Failed, Canceled, Aborted],
            FailedWithRetry => &[Scheduled, Queued, Running, Failed, Canceled, Aborted],
            Finished | Failed | Canceled | Aborted => &[],
        }
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    pub fn terminal_states() -> impl Iterator<Item = JobState> {
        Self::ALL.into_iter().filter(|s| s.is_terminal())
    }

    pub fn non_terminal_states() -> impl Iterator<Item = JobState> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Waiting => "WAITING",
            JobState::Scheduled => "SCHEDULED",
            JobState::Queued => "QUEUED",
            JobState::Running => "RUNNING",
            JobState::FailedWithRetry => "FAILED_WITH_RETRY",
            JobState::Finished => "FINISHED",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
            JobState::Aborted => "ABORTED",
        }
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|state| state.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| DomainError::UnknownState(wanted.to_string()))
    }
}
