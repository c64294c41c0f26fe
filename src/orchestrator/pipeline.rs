//! End-to-end acquisition pipeline.
//!
//! A run moves one [`SessionState`] through named stages:
//!
//! 1. `validate` - session identity and target names
//! 2. `prepare` - tile counts and stage bounds for every target
//! 3. `acquire_target` - one target at a time, in the order given
//! 4. `submit_stitch` - hand a completed target to the stitching queue
//! 5. `join_stitches` - wait for every submitted stitch job
//!
//! Each per-target stage returns a [`StepResult`], and `apply_policy` is the
//! only place that decides whether the run goes on after a failure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::profile::{ConfigProfileResolver, HardwareProfile, ProfileResolver};
use super::result::{SessionResult, StitchRecord, TargetOutcome, TargetStatus};
use super::target::{
    AcquisitionTarget, LogNotifier, NotificationSink, PipelineEvent, PreparedTarget,
    TileConfigPreparer, TilePreparer,
};
use crate::acquisition::{
    AcquisitionJob, AcquisitionOutcome, AcquisitionSession, CancelHandle, MonitorConfig,
    ProgressHandle,
};
use crate::config::{FailurePolicy, ScopeConfig, SessionConfig, StitchingConfig};
use crate::device::DeviceConnection;
use crate::error::{ErrorKind, ScopeError, ScopeResult};
use crate::protocol::AcquisitionCommand;
use crate::stitching::{
    Compositor, OutputSettings, StitchHandle, StitchJob, StitchMetadata, StitchingQueue,
    TileManifestCompositor,
};
use crate::validation::is_valid_name;

/// Settings the orchestrator reads from [`ScopeConfig`].
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Session identity and project layout
    pub session: SessionConfig,
    /// Stitching output settings
    pub stitching: StitchingConfig,
    /// Monitoring settings for every target
    pub monitor: MonitorConfig,
    /// Reaction to a failed acquisition
    pub failure_policy: FailurePolicy,
}

impl From<&ScopeConfig> for OrchestratorConfig {
    fn from(config: &ScopeConfig) -> Self {
        Self {
            session: config.session.clone(),
            stitching: config.stitching.clone(),
            monitor: MonitorConfig::from(&config.acquisition),
            failure_policy: config.acquisition.failure_policy,
        }
    }
}

#[derive(Debug, Default)]
struct Control {
    stop: AtomicBool,
    current: Mutex<Option<(String, CancelHandle)>>,
}

/// Operator controls for a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    control: Arc<Control>,
}

impl OrchestratorHandle {
    /// Cancel the acquisition in progress, if any. Returns the target name.
    pub fn cancel_current(&self) -> Option<String> {
        let current = self.control.current.lock();
        current.as_ref().map(|(name, cancel)| {
            info!(target_name = %name, "Operator cancelled current acquisition");
            cancel.cancel();
            name.clone()
        })
    }

    /// Start no further targets. Submitted stitch jobs still complete.
    ///
    /// The request sticks to the orchestrator: a stop issued before
    /// [`run`](AcquisitionOrchestrator::run) begins skips every target.
    pub fn stop(&self) {
        info!("Operator requested stop");
        self.control.stop.store(true, Ordering::SeqCst);
    }

    /// Whether [`stop`](Self::stop) was called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.control.stop.load(Ordering::SeqCst)
    }
}

/// Result of one per-target stage.
#[derive(Debug)]
enum StepResult {
    Acquired(AcquisitionJob, HardwareProfile),
    Cancelled,
    StartFailed(ScopeError),
    AcquisitionFailed { detail: String, kind: ErrorKind },
    TimedOut,
}

/// Mutable state carried through the stages of one run.
struct SessionState {
    result: SessionResult,
    queue: StitchingQueue,
    handles: Vec<StitchHandle>,
    running: bool,
}

/// Runs sessions on one shared connection.
pub struct AcquisitionOrchestrator {
    connection: DeviceConnection,
    config: OrchestratorConfig,
    resolver: Arc<dyn ProfileResolver>,
    preparer: Arc<dyn TilePreparer>,
    compositor: Arc<dyn Compositor>,
    notifier: Arc<dyn NotificationSink>,
    progress: ProgressHandle,
    control: Arc<Control>,
}

impl AcquisitionOrchestrator {
    /// Orchestrator with tile-configuration preparation, manifest composition
    /// and log notifications.
    #[must_use]
    pub fn new(
        connection: DeviceConnection,
        config: OrchestratorConfig,
        resolver: Arc<dyn ProfileResolver>,
    ) -> Self {
        Self {
            connection,
            config,
            resolver,
            preparer: Arc::new(TileConfigPreparer),
            compositor: Arc::new(TileManifestCompositor),
            notifier: Arc::new(LogNotifier),
            progress: ProgressHandle::default(),
            control: Arc::new(Control::default()),
        }
    }

    /// Orchestrator resolving profiles from `config.modalities`.
    #[must_use]
    pub fn from_config(connection: DeviceConnection, config: &ScopeConfig) -> Self {
        Self::new(
            connection,
            OrchestratorConfig::from(config),
            Arc::new(ConfigProfileResolver::from_config(config)),
        )
    }

    /// Replace the tiling collaborator.
    #[must_use]
    pub fn with_preparer(mut self, preparer: Arc<dyn TilePreparer>) -> Self {
        self.preparer = preparer;
        self
    }

    /// Replace the composition backend.
    #[must_use]
    pub fn with_compositor(mut self, compositor: Arc<dyn Compositor>) -> Self {
        self.compositor = compositor;
        self
    }

    /// Replace the notification sink.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Progress of the target being acquired.
    #[must_use]
    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    /// Operator controls.
    #[must_use]
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            control: self.control.clone(),
        }
    }

    /// Run every target, then wait for all stitch jobs.
    ///
    /// Fails only when validation rejects the session as a whole; per-target
    /// failures are recorded in the returned [`SessionResult`].
    pub async fn run(&self, targets: Vec<AcquisitionTarget>) -> ScopeResult<SessionResult> {
        self.validate(&targets)?;

        let session_id = Uuid::new_v4();
        let span = info_span!("session", %session_id, sample = %self.config.session.sample_name);
        async move {
            self.notifier.notify(&PipelineEvent::SessionStarted {
                session_id,
                targets: targets.len(),
            });

            let mut state = SessionState {
                result: SessionResult::new(session_id),
                queue: StitchingQueue::new(self.compositor.clone()),
                handles: Vec::new(),
                running: true,
            };

            let prepared = self.prepare(targets).await;
            let total = prepared.len();
            for (i, prepared) in prepared.into_iter().enumerate() {
                let name = match &prepared {
                    Ok(p) => p.target.name.clone(),
                    Err((t, _)) => t.name.clone(),
                };
                if !state.running || self.control.stop.load(Ordering::SeqCst) {
                    self.skip(&mut state, name);
                    continue;
                }

                self.notifier.notify(&PipelineEvent::TargetStarted {
                    index: i + 1,
                    total,
                    target: name.clone(),
                });
                let started_at = Utc::now();
                let (step, expected_files) = match prepared {
                    Ok(p) => {
                        let (step, expected) = self
                            .acquire_target(&p)
                            .instrument(info_span!("target", target_name = %name))
                            .await;
                        let step = match step {
                            StepResult::Acquired(job, profile) => {
                                self.submit_stitch(&mut state, &p, job, profile)
                            }
                            other => other,
                        };
                        (step, expected)
                    }
                    Err((_, err)) => (StepResult::StartFailed(err), 0),
                };
                self.apply_policy(&mut state, name, step, expected_files, started_at);
            }

            self.join_stitches(&mut state).await;
            state.queue.shutdown().await;
            state.result.stopped = self.control.stop.load(Ordering::SeqCst);
            state.result.finished_at = Some(Utc::now());

            let summary = state.result.summary();
            info!("Session finished: {}", summary);
            self.notifier
                .notify(&PipelineEvent::SessionFinished { summary });
            Ok(state.result)
        }
        .instrument(span)
        .await
    }

    fn validate(&self, targets: &[AcquisitionTarget]) -> ScopeResult<()> {
        let session = &self.config.session;
        is_valid_name(&session.sample_name)
            .map_err(|e| ScopeError::Validation(format!("Sample name '{}': {e}", session.sample_name)))?;
        if session.scan_type.trim().is_empty() {
            return Err(ScopeError::Validation("Scan type must not be empty".into()));
        }
        if targets.is_empty() {
            return Err(ScopeError::Validation("No acquisition targets given".into()));
        }
        let mut seen = HashSet::new();
        for target in targets {
            is_valid_name(&target.name)
                .map_err(|e| ScopeError::Validation(format!("Target '{}': {e}", target.name)))?;
            if !seen.insert(target.name.as_str()) {
                return Err(ScopeError::Validation(format!(
                    "Duplicate target name '{}'",
                    target.name
                )));
            }
        }
        Ok(())
    }

    async fn prepare(
        &self,
        targets: Vec<AcquisitionTarget>,
    ) -> Vec<Result<PreparedTarget, (AcquisitionTarget, ScopeError)>> {
        let mut prepared = Vec::with_capacity(targets.len());
        for target in targets {
            match self.preparer.prepare(&target).await {
                Ok(p) => {
                    debug!(target_name = %target.name, tiles = p.tile_count, "Target prepared");
                    prepared.push(Ok(p));
                }
                Err(e) => {
                    warn!(target_name = %target.name, "Preparation failed: {}", e);
                    prepared.push(Err((target, e)));
                }
            }
        }
        prepared
    }

    /// Returns the step together with the job's expected file count.
    async fn acquire_target(&self, prepared: &PreparedTarget) -> (StepResult, u32) {
        let target = &prepared.target;
        let profile = match self.resolver.resolve(&target.modality) {
            Ok(profile) => profile,
            Err(e) => return (StepResult::StartFailed(e), 0),
        };
        profile.log_server_settings();

        let session = &self.config.session;
        let command = profile.apply_to(
            AcquisitionCommand::new()
                .with_yaml_path(session.yaml_path.to_string_lossy())
                .with_projects_folder(session.projects_folder.to_string_lossy())
                .with_sample(session.sample_name.as_str())
                .with_scan_type(session.scan_type.as_str())
                .with_region(target.name.as_str()),
        );

        let mut job = AcquisitionJob::new(&target.name, prepared.tile_count, profile.angle_ticks());
        let expected_files = job.expected_files();
        let cancel = CancelHandle::new();
        *self.control.current.lock() = Some((target.name.clone(), cancel.clone()));
        let acquisition = AcquisitionSession::new(self.connection.clone(), self.config.monitor.clone())
            .with_progress(self.progress.clone())
            .with_cancel(cancel);

        let step = match acquisition.start(&mut job, &command).await {
            Err(e) => StepResult::StartFailed(e),
            Ok(()) => match acquisition.monitor(&mut job).await {
                Ok(AcquisitionOutcome::Completed) => StepResult::Acquired(job, profile),
                Ok(AcquisitionOutcome::Cancelled) => StepResult::Cancelled,
                Ok(AcquisitionOutcome::Failed(detail)) => StepResult::AcquisitionFailed {
                    detail,
                    kind: ErrorKind::Acquisition,
                },
                Ok(AcquisitionOutcome::TimedOut { .. }) => StepResult::TimedOut,
                Err(e) => StepResult::AcquisitionFailed {
                    kind: e.kind(),
                    detail: e.to_string(),
                },
            },
        };
        self.control.current.lock().take();
        (step, expected_files)
    }

    fn submit_stitch(
        &self,
        state: &mut SessionState,
        prepared: &PreparedTarget,
        job: AcquisitionJob,
        profile: HardwareProfile,
    ) -> StepResult {
        let session = &self.config.session;
        let stitching = &self.config.stitching;
        let stitch = StitchJob {
            id: Uuid::new_v4(),
            target: prepared.target.name.clone(),
            scan_type: session.scan_type.clone(),
            tile_dir: prepared.target.tile_dir.clone(),
            angles: job.angles().to_vec(),
            metadata: StitchMetadata {
                slide_offset: prepared.bounds.map_or((0.0, 0.0), |b| b.origin()),
                flip_x: stitching.invert_x,
                flip_y: stitching.invert_y,
                parent_image: session.parent_image.clone(),
                sample_name: session.sample_name.clone(),
                pixel_size_um: profile.pixel_size_um,
            },
            output: OutputSettings {
                folder: session
                    .projects_folder
                    .join(&session.sample_name)
                    .join(&stitching.output_folder),
                compression: stitching.compression.clone(),
                downsample: stitching.downsample,
            },
        };
        match state.queue.submit(stitch) {
            Ok(handle) => {
                state.handles.push(handle);
                StepResult::Acquired(job, profile)
            }
            Err(e) => StepResult::AcquisitionFailed {
                kind: e.kind(),
                detail: e.to_string(),
            },
        }
    }

    /// Record a step and decide whether the run continues.
    fn apply_policy(
        &self,
        state: &mut SessionState,
        target: String,
        step: StepResult,
        expected_files: u32,
        started_at: chrono::DateTime<Utc>,
    ) {
        let (status, error_kind) = match step {
            StepResult::Acquired(..) => (TargetStatus::Acquired, None),
            StepResult::Cancelled => {
                self.notifier.notify(&PipelineEvent::TargetCancelled {
                    target: target.clone(),
                });
                (TargetStatus::Cancelled, None)
            }
            StepResult::StartFailed(e) => {
                self.notify_failure(&target, e.kind(), e.to_string());
                (TargetStatus::StartFailed(e.to_string()), Some(e.kind()))
            }
            StepResult::AcquisitionFailed { detail, kind } => {
                self.notify_failure(&target, kind, format!("acquisition failed: {detail}"));
                self.halt_on_failure(state);
                (TargetStatus::AcquisitionFailed(detail), Some(kind))
            }
            StepResult::TimedOut => {
                self.notify_failure(
                    &target,
                    ErrorKind::Acquisition,
                    "no acquisition progress within the inactivity timeout".into(),
                );
                self.halt_on_failure(state);
                (TargetStatus::TimedOut, Some(ErrorKind::Acquisition))
            }
        };

        let stitch_job = if status == TargetStatus::Acquired {
            state.handles.last().map(StitchHandle::job_id)
        } else {
            None
        };
        state.result.targets.push(TargetOutcome {
            target,
            status,
            error_kind,
            stitch_job,
            expected_files,
            started_at,
            finished_at: Utc::now(),
        });
    }

    fn halt_on_failure(&self, state: &mut SessionState) {
        if self.config.failure_policy == FailurePolicy::Abort {
            warn!("Acquisition failed; no further targets will be started");
            state.running = false;
            state.result.aborted = true;
        }
    }

    fn notify_failure(&self, target: &str, kind: ErrorKind, message: String) {
        self.notifier.notify(&PipelineEvent::TargetFailed {
            target: target.to_string(),
            kind,
            message,
        });
    }

    fn skip(&self, state: &mut SessionState, target: String) {
        let reason = if state.running { "stopped by operator" } else { "run aborted" };
        self.notifier.notify(&PipelineEvent::TargetSkipped {
            target: target.clone(),
            reason: reason.to_string(),
        });
        let now = Utc::now();
        state.result.targets.push(TargetOutcome {
            target,
            status: TargetStatus::Skipped,
            error_kind: None,
            stitch_job: None,
            expected_files: 0,
            started_at: now,
            finished_at: now,
        });
    }

    async fn join_stitches(&self, state: &mut SessionState) {
        if !state.handles.is_empty() {
            info!("Waiting for {} stitch job(s)", state.handles.len());
        }
        for handle in state.handles.drain(..) {
            let target = handle.target().to_string();
            let job_id = handle.job_id();
            let result = handle.wait().await;
            self.notifier.notify(&PipelineEvent::StitchFinished {
                target: target.clone(),
                error: result.as_ref().err().map(ToString::to_string),
            });
            state.result.stitches.push(StitchRecord {
                target,
                job_id,
                result: result.map(|o| o.outputs).map_err(|e| e.to_string()),
            });
        }
    }
}
