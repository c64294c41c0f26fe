//! Aggregate outcome of one acquisition session.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ErrorKind;

/// How one target ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetStatus {
    /// Acquired and handed to the stitching queue
    Acquired,
    /// Could not be started (configuration, preparation or link failure)
    StartFailed(String),
    /// Server reported a failure, or contact was lost while monitoring
    AcquisitionFailed(String),
    /// No progress within the inactivity timeout
    TimedOut,
    /// Cancelled by the operator
    Cancelled,
    /// Not attempted because the run was aborted or stopped
    Skipped,
}

impl TargetStatus {
    /// Counted as a failure in the session totals.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::StartFailed(_) | Self::AcquisitionFailed(_) | Self::TimedOut
        )
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquired => f.write_str("acquired"),
            Self::StartFailed(e) => write!(f, "could not start: {e}"),
            Self::AcquisitionFailed(e) => write!(f, "acquisition failed: {e}"),
            Self::TimedOut => f.write_str("timed out"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

/// Per-target record.
#[derive(Debug, Clone)]
pub struct TargetOutcome {
    /// Target name
    pub target: String,
    /// How it ended
    pub status: TargetStatus,
    /// Failure category, if it failed
    pub error_kind: Option<ErrorKind>,
    /// Stitch job submitted for it
    pub stitch_job: Option<Uuid>,
    /// Files the server was expected to write
    pub expected_files: u32,
    /// When work on the target began
    pub started_at: DateTime<Utc>,
    /// When work on the target ended
    pub finished_at: DateTime<Utc>,
}

/// Result of one stitch job, recorded when the session joins the queue.
#[derive(Debug, Clone)]
pub struct StitchRecord {
    /// Target name
    pub target: String,
    /// Job id
    pub job_id: Uuid,
    /// Written files, or the failure text
    pub result: Result<Vec<PathBuf>, String>,
}

/// Outcome of a whole session.
#[derive(Debug, Clone)]
pub struct SessionResult {
    /// Session id
    pub session_id: Uuid,
    /// Session start
    pub started_at: DateTime<Utc>,
    /// Session end, once all stitch jobs resolved
    pub finished_at: Option<DateTime<Utc>>,
    /// One record per target, in acquisition order
    pub targets: Vec<TargetOutcome>,
    /// One record per submitted stitch job, in submission order
    pub stitches: Vec<StitchRecord>,
    /// A failed acquisition stopped the run under the abort policy
    pub aborted: bool,
    /// The operator stopped the run
    pub stopped: bool,
}

impl SessionResult {
    pub(crate) fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            finished_at: None,
            targets: Vec::new(),
            stitches: Vec::new(),
            aborted: false,
            stopped: false,
        }
    }

    fn count(&self, pred: impl Fn(&TargetStatus) -> bool) -> usize {
        self.targets.iter().filter(|t| pred(&t.status)).count()
    }

    /// Targets acquired.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(|s| *s == TargetStatus::Acquired)
    }

    /// Targets that failed to start or to acquire.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(TargetStatus::is_failure)
    }

    /// Targets cancelled by the operator.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(|s| *s == TargetStatus::Cancelled)
    }

    /// Targets never attempted.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|s| *s == TargetStatus::Skipped)
    }

    /// Stitch jobs that failed.
    #[must_use]
    pub fn stitch_failures(&self) -> usize {
        self.stitches.iter().filter(|s| s.result.is_err()).count()
    }

    /// Record for one target.
    #[must_use]
    pub fn target(&self, name: &str) -> Option<&TargetOutcome> {
        self.targets.iter().find(|t| t.target == name)
    }

    /// Every target acquired and submitted for stitching.
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.aborted
            && !self.stopped
            && !self.targets.is_empty()
            && self
                .targets
                .iter()
                .all(|t| t.status == TargetStatus::Acquired && t.stitch_job.is_some())
    }

    /// Some targets acquired, others did not, and the run was not aborted.
    #[must_use]
    pub fn is_partial_success(&self) -> bool {
        !self.aborted && self.succeeded() > 0 && !self.is_success()
    }

    /// One-line summary for notifications.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut text = format!(
            "{} of {} target(s) acquired, {} failed, {} cancelled",
            self.succeeded(),
            self.targets.len(),
            self.failed(),
            self.cancelled()
        );
        if self.skipped() > 0 {
            text.push_str(&format!(", {} skipped", self.skipped()));
        }
        if self.stitch_failures() > 0 {
            text.push_str(&format!(", {} stitch job(s) failed", self.stitch_failures()));
        }
        if self.aborted {
            text.push_str(" (aborted)");
        } else if self.stopped {
            text.push_str(" (stopped)");
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, status: TargetStatus) -> TargetOutcome {
        TargetOutcome {
            target: name.into(),
            stitch_job: (status == TargetStatus::Acquired).then(Uuid::new_v4),
            error_kind: status.is_failure().then_some(ErrorKind::Configuration),
            status,
            expected_files: 4,
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_partial_success() {
        let mut result = SessionResult::new(Uuid::new_v4());
        result.targets.push(outcome("A", TargetStatus::Acquired));
        result
            .targets
            .push(outcome("B", TargetStatus::StartFailed("no profile".into())));
        result.targets.push(outcome("C", TargetStatus::Acquired));

        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert!(!result.is_success());
        assert!(result.is_partial_success());
        assert_eq!(result.summary(), "2 of 3 target(s) acquired, 1 failed, 0 cancelled");
    }

    #[test]
    fn test_full_success_and_abort() {
        let mut result = SessionResult::new(Uuid::new_v4());
        assert!(!result.is_success());
        result.targets.push(outcome("A", TargetStatus::Acquired));
        assert!(result.is_success());

        result
            .targets
            .push(outcome("B", TargetStatus::AcquisitionFailed("stage jammed".into())));
        result.targets.push(outcome("C", TargetStatus::Skipped));
        result.aborted = true;
        assert!(!result.is_partial_success());
        assert!(result.summary().ends_with("1 skipped (aborted)"));
    }
}
