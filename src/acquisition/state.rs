//! Acquisition lifecycle state.

use std::fmt;

use crate::error::{ScopeError, ScopeResult};

/// State of one acquisition, as tracked by the client.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Running ──poll──> Completed | Failed | Cancelled
///                    │
///              cancel│
///                    ▼
///               Cancelling ──poll──> Cancelled (or Completed/Failed if the
///                                    server finished first)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Not started
    Idle,
    /// Server is acquiring
    Running,
    /// Cancel sent, waiting for confirmation
    Cancelling,
    /// All files written
    Completed,
    /// Stopped at the operator's request
    Cancelled,
    /// Server reported failure
    Failed,
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AcquisitionState {
    /// Wire spelling of the state word.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Cancelling => "CANCELLING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    /// Map a (trimmed or padded) state word reported by the server.
    #[must_use]
    pub fn from_state_word(word: &str) -> Option<Self> {
        match word.trim().to_ascii_uppercase().as_str() {
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "CANCELLING" => Some(Self::Cancelling),
            "COMPLETED" => Some(Self::Completed),
            "CANCELLED" => Some(Self::Cancelled),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// No further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Check if the transition to `next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use AcquisitionState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Cancelling | Completed | Cancelled | Failed)
                | (Cancelling, Cancelled | Completed | Failed)
        )
    }
}

/// One in-flight acquisition for one target.
#[derive(Debug, Clone)]
pub struct AcquisitionJob {
    target: String,
    expected_files: u32,
    angles: Vec<f64>,
    state: AcquisitionState,
    failure_detail: Option<String>,
}

impl AcquisitionJob {
    /// Create an idle job. Expected files is `tiles_per_angle` times the number
    /// of angles, or times one when there are none.
    #[must_use]
    pub fn new(target: impl Into<String>, tiles_per_angle: u32, angles: Vec<f64>) -> Self {
        let angle_count = u32::try_from(angles.len().max(1)).unwrap_or(u32::MAX);
        Self {
            target: target.into(),
            expected_files: tiles_per_angle.saturating_mul(angle_count),
            angles,
            state: AcquisitionState::Idle,
            failure_detail: None,
        }
    }

    /// Target name.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Files the server is expected to write; zero when unknown.
    #[must_use]
    pub fn expected_files(&self) -> u32 {
        self.expected_files
    }

    /// Rotation angles in ticks.
    #[must_use]
    pub fn angles(&self) -> &[f64] {
        &self.angles
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    /// Last server-reported failure text.
    #[must_use]
    pub fn failure_detail(&self) -> Option<&str> {
        self.failure_detail.as_deref()
    }

    /// Move to `next`. Staying in the current state is a no-op.
    pub fn transition(&mut self, next: AcquisitionState) -> ScopeResult<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(ScopeError::Validation(format!(
                "Invalid acquisition transition for '{}': {} -> {}",
                self.target, self.state, next
            )));
        }
        tracing::debug!(target_name = %self.target, from = %self.state, to = %next, "Acquisition state change");
        self.state = next;
        Ok(())
    }

    /// Record a server-reported failure.
    pub fn fail(&mut self, detail: impl Into<String>) -> ScopeResult<()> {
        self.transition(AcquisitionState::Failed)?;
        self.failure_detail = Some(detail.into());
        Ok(())
    }
}
