//! Task lifecycle statuses and the legality table for transitions.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a queued task.
///
/// The persisted label for [`TaskStatus::Failed`] is `error`, matching the
/// task table contract consumed by the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted and waiting for a worker.
    Queued,
    /// Currently executing an iteration on a worker.
    Processing,
    /// Parked until its resume time elapses.
    Suspending,
    /// Finished successfully.
    Completed,
    /// Finished with a terminal error.
    #[serde(rename = "error")]
    Failed,
    /// Abandoned before completion.
    Cancelled,
}

impl TaskStatus {
    /// Whether the status ends a task's lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Stable persisted label for the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Suspending => "suspending",
            Self::Completed => "completed",
            Self::Failed => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a persisted label back into a status.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "suspending" => Some(Self::Suspending),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether the edge `from -> to` is a legal lifecycle transition.
    ///
    /// `from = None` denotes a task that has never been persisted; the only
    /// legal first transition is into [`TaskStatus::Queued`].
    #[must_use]
    pub const fn can_transition(from: Option<Self>, to: Self) -> bool {
        match (from, to) {
            (None, Self::Queued)
            | (Some(Self::Queued), Self::Queued | Self::Processing | Self::Failed)
            | (Some(Self::Processing), _)
            | (Some(Self::Suspending), Self::Processing | Self::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        let all = [
            TaskStatus::Queued,
            TaskStatus::Processing,
            TaskStatus::Suspending,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ];
        for status in all {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::Failed.as_str(), "error");
        assert!(TaskStatus::parse("bogus").is_none());
    }

    #[test]
    fn serde_uses_persisted_labels() {
        let json = serde_json::to_string(&TaskStatus::Failed).unwrap();
        assert_eq!(json, "\"error\"");
        let back: TaskStatus = serde_json::from_str("\"suspending\"").unwrap();
        assert_eq!(back, TaskStatus::Suspending);
    }

    #[test]
    fn transition_table_matches_contract() {
        use TaskStatus::{Cancelled, Completed, Failed, Processing, Queued, Suspending};

        // First transition must enter the queue.
        assert!(TaskStatus::can_transition(None, Queued));
        for to in [Processing, Suspending, Completed, Failed, Cancelled] {
            assert!(!TaskStatus::can_transition(None, to));
        }

        // Queued may be re-enqueued, picked up, or failed.
        assert!(TaskStatus::can_transition(Some(Queued), Queued));
        assert!(TaskStatus::can_transition(Some(Queued), Processing));
        assert!(TaskStatus::can_transition(Some(Queued), Failed));
        assert!(!TaskStatus::can_transition(Some(Queued), Suspending));
        assert!(!TaskStatus::can_transition(Some(Queued), Completed));
        assert!(!TaskStatus::can_transition(Some(Queued), Cancelled));

        // Processing may go anywhere.
        for to in [Queued, Processing, Suspending, Completed, Failed, Cancelled] {
            assert!(TaskStatus::can_transition(Some(Processing), to));
        }

        // Suspending resumes into processing or fails.
        assert!(TaskStatus::can_transition(Some(Suspending), Processing));
        assert!(TaskStatus::can_transition(Some(Suspending), Failed));
        assert!(!TaskStatus::can_transition(Some(Suspending), Queued));
        assert!(!TaskStatus::can_transition(Some(Suspending), Completed));
        assert!(!TaskStatus::can_transition(Some(Suspending), Cancelled));

        // Terminal statuses are absorbing.
        for from in [Completed, Failed, Cancelled] {
            for to in [Queued, Processing, Suspending, Completed, Failed, Cancelled] {
                assert!(!TaskStatus::can_transition(Some(from), to));
            }
        }
    }
}
