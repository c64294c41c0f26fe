//! Start, monitor and cancel one acquisition.
//!
//! The session polls `status__` then `progress` every `poll_interval`.
//! The inactivity watermark moves whenever the completed count grows, the
//! reported total changes or the state word changes; a session whose
//! watermark is older than `inactivity_timeout` ends as
//! [`AcquisitionOutcome::TimedOut`].

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::progress::{CancelHandle, ProgressHandle};
use super::state::{AcquisitionJob, AcquisitionState};
use crate::config::AcquisitionConfig;
use crate::device::DeviceConnection;
use crate::error::{ScopeError, ScopeResult};
use crate::protocol::{AcquisitionCommand, StatusReply};

/// Polling and timeout settings for one session.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Interval between status polls
    pub poll_interval: Duration,
    /// Longest tolerated gap between observed activity
    pub inactivity_timeout: Duration,
    /// Failed polls tolerated before the first successful one
    pub startup_retry_attempts: u32,
    /// Pause after each tolerated failure
    pub startup_retry_delay: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::from(&AcquisitionConfig::default())
    }
}

impl From<&AcquisitionConfig> for MonitorConfig {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            inactivity_timeout: config.inactivity_timeout,
            startup_retry_attempts: config.startup_retry_attempts,
            startup_retry_delay: config.startup_retry_delay,
        }
    }
}

/// How a monitored acquisition ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionOutcome {
    /// Server reported success
    Completed,
    /// Server confirmed a cancel request
    Cancelled,
    /// Server-reported failure with its detail text
    Failed(String),
    /// No activity observed for the inactivity timeout
    TimedOut {
        /// Time since the last observed activity
        idle: Duration,
    },
}

impl AcquisitionOutcome {
    /// Whether all files were written.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Tracks the last moment anything changed on the server side.
#[derive(Debug)]
struct Watermark {
    at: Instant,
    completed: u32,
    total: Option<u32>,
    state_word: Option<String>,
}

impl Watermark {
    fn new() -> Self {
        Self {
            at: Instant::now(),
            completed: 0,
            total: None,
            state_word: None,
        }
    }

    fn observe_state(&mut self, word: &str) {
        if self.state_word.as_deref() != Some(word) {
            self.state_word = Some(word.to_string());
            self.at = Instant::now();
        }
    }

    fn observe_progress(&mut self, completed: u32, total: u32) {
        if completed > self.completed || self.total != Some(total) {
            self.at = Instant::now();
        }
        self.completed = self.completed.max(completed);
        self.total = Some(total);
    }

    fn idle(&self) -> Duration {
        self.at.elapsed()
    }
}

/// Drives one acquisition on a shared [`DeviceConnection`].
#[derive(Debug, Clone)]
pub struct AcquisitionSession {
    connection: DeviceConnection,
    config: MonitorConfig,
    progress: ProgressHandle,
    cancel: CancelHandle,
}

impl AcquisitionSession {
    /// Session with fresh progress and cancel handles.
    #[must_use]
    pub fn new(connection: DeviceConnection, config: MonitorConfig) -> Self {
        Self {
            connection,
            config,
            progress: ProgressHandle::default(),
            cancel: CancelHandle::new(),
        }
    }

    /// Publish progress through an existing handle.
    #[must_use]
    pub fn with_progress(mut self, progress: ProgressHandle) -> Self {
        self.progress = progress;
        self
    }

    /// Observe cancellation through an existing handle.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Handle read by progress sinks.
    #[must_use]
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Handle that cancels this session.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Request cancellation; the monitor loop sends `cancel__` on its next turn.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Start then monitor until a terminal outcome.
    pub async fn run(
        &self,
        job: &mut AcquisitionJob,
        command: &AcquisitionCommand,
    ) -> ScopeResult<AcquisitionOutcome> {
        self.start(job, command).await?;
        self.monitor(job).await
    }

    /// Send the acquisition command. The job stays `Idle` on error.
    pub async fn start(
        &self,
        job: &mut AcquisitionJob,
        command: &AcquisitionCommand,
    ) -> ScopeResult<()> {
        if job.state() != AcquisitionState::Idle {
            return Err(ScopeError::Validation(format!(
                "Acquisition for '{}' already started ({})",
                job.target(),
                job.state()
            )));
        }
        self.connection.start_acquisition(command).await?;
        job.transition(AcquisitionState::Running)?;
        if job.expected_files() > 0 {
            self.progress.update(0, job.expected_files());
        }
        info!(
            target_name = job.target(),
            expected_files = job.expected_files(),
            "Acquisition running"
        );
        Ok(())
    }

    /// Poll status and progress until the acquisition ends.
    pub async fn monitor(&self, job: &mut AcquisitionJob) -> ScopeResult<AcquisitionOutcome> {
        let mut watermark = Watermark::new();
        let mut successful_polls = 0u32;
        let mut startup_failures = 0u32;
        let mut cancel_sent = false;

        loop {
            if self.cancel.is_cancelled() && !cancel_sent {
                cancel_sent = true;
                self.send_cancel(job).await?;
            }

            let reply = match self.connection.acquisition_status().await {
                Ok(reply) => reply,
                Err(err) if self.tolerate_startup_error(&err, successful_polls, startup_failures) => {
                    startup_failures += 1;
                    warn!(
                        target_name = job.target(),
                        attempt = startup_failures,
                        "Status poll failed right after start, retrying: {}",
                        err
                    );
                    sleep(self.config.startup_retry_delay).await;
                    continue;
                }
                Err(err) => return Err(err),
            };
            successful_polls += 1;

            match reply {
                StatusReply::Success(detail) => {
                    if !detail.is_empty() {
                        debug!("Acquisition success detail: {}", detail);
                    }
                    return self.finish_completed(job);
                }
                StatusReply::Failed(detail) => {
                    warn!(target_name = job.target(), "Acquisition failed: {}", detail);
                    job.fail(detail.clone())?;
                    return Ok(AcquisitionOutcome::Failed(detail));
                }
                StatusReply::State(word) => {
                    watermark.observe_state(&word);
                    match AcquisitionState::from_state_word(&word) {
                        Some(AcquisitionState::Completed) => return self.finish_completed(job),
                        Some(AcquisitionState::Cancelled) => {
                            job.transition(AcquisitionState::Cancelled)?;
                            info!(target_name = job.target(), "Acquisition cancelled");
                            return Ok(AcquisitionOutcome::Cancelled);
                        }
                        Some(AcquisitionState::Failed) => {
                            let detail = "server reported FAILED".to_string();
                            job.fail(detail.clone())?;
                            return Ok(AcquisitionOutcome::Failed(detail));
                        }
                        Some(_) => {}
                        None => debug!("Unrecognized state word: {:?}", word),
                    }
                }
            }

            let (completed, total) = self.connection.acquisition_progress().await?;
            watermark.observe_progress(completed, total);
            if job.expected_files() > 0 {
                self.progress.update(completed, job.expected_files());
            }
            debug!(
                target_name = job.target(),
                completed, total, "Acquisition progress"
            );

            let idle = watermark.idle();
            if idle >= self.config.inactivity_timeout {
                warn!(
                    target_name = job.target(),
                    "No acquisition activity for {:?}, giving up", idle
                );
                job.fail(format!("no activity for {}s", idle.as_secs()))?;
                return Ok(AcquisitionOutcome::TimedOut { idle });
            }

            if cancel_sent {
                sleep(self.config.poll_interval).await;
            } else {
                tokio::select! {
                    () = sleep(self.config.poll_interval) => {}
                    () = self.cancel.cancelled() => {}
                }
            }
        }
    }

    fn tolerate_startup_error(&self, err: &ScopeError, successful_polls: u32, failures: u32) -> bool {
        successful_polls == 0
            && failures < self.config.startup_retry_attempts
            && err.is_retriable()
    }

    async fn send_cancel(&self, job: &mut AcquisitionJob) -> ScopeResult<()> {
        if job.state() == AcquisitionState::Running {
            job.transition(AcquisitionState::Cancelling)?;
        }
        info!(target_name = job.target(), "Cancelling acquisition");
        match self.connection.cancel_acquisition().await {
            Ok(true) => {}
            Ok(false) => warn!("Cancel was not acknowledged; waiting for the server anyway"),
            Err(err) => warn!("Failed to send cancel: {}", err),
        }
        Ok(())
    }

    fn finish_completed(&self, job: &mut AcquisitionJob) -> ScopeResult<AcquisitionOutcome> {
        job.transition(AcquisitionState::Completed)?;
        if job.expected_files() > 0 {
            self.progress
                .update(job.expected_files(), job.expected_files());
        }
        info!(target_name = job.target(), "Acquisition completed");
        Ok(AcquisitionOutcome::Completed)
    }
}
