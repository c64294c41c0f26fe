//! Acquisition targets and the external collaborators that prepare them and
//! receive pipeline notifications.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::tile_config::{count_tiles, TileBounds, TileConfiguration};
use crate::config::SessionConfig;
use crate::error::{ErrorKind, ScopeResult};

/// One named region to acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionTarget {
    /// Region name, also the tile folder name
    pub name: String,
    /// Folder holding the region's tile configuration
    pub tile_dir: PathBuf,
    /// Modality whose hardware profile applies
    pub modality: String,
}

impl AcquisitionTarget {
    /// Target with an explicit tile directory.
    #[must_use]
    pub fn new(name: impl Into<String>, tile_dir: impl Into<PathBuf>, modality: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tile_dir: tile_dir.into(),
            modality: modality.into(),
        }
    }

    /// Target in the standard project layout,
    /// `<projects>/<sample>/<scan_type>/<name>`.
    #[must_use]
    pub fn in_project(session: &SessionConfig, name: impl Into<String>, modality: impl Into<String>) -> Self {
        let name = name.into();
        let tile_dir = session
            .projects_folder
            .join(&session.sample_name)
            .join(&session.scan_type)
            .join(&name);
        Self::new(name, tile_dir, modality)
    }
}

/// A target after tiling and coordinate transform.
#[derive(Debug, Clone)]
pub struct PreparedTarget {
    /// The target itself
    pub target: AcquisitionTarget,
    /// Tiles per angle; zero when unknown
    pub tile_count: u32,
    /// Stage-space extent of the tiles
    pub bounds: Option<TileBounds>,
}

/// Tiling and transform service.
#[async_trait]
pub trait TilePreparer: Send + Sync {
    /// Produce stage-space tile information for a target.
    async fn prepare(&self, target: &AcquisitionTarget) -> ScopeResult<PreparedTarget>;
}

/// Reads tile configurations already written into each target's folder.
#[derive(Debug, Clone, Default)]
pub struct TileConfigPreparer;

#[async_trait]
impl TilePreparer for TileConfigPreparer {
    async fn prepare(&self, target: &AcquisitionTarget) -> ScopeResult<PreparedTarget> {
        let dir: &Path = &target.tile_dir;
        let tile_count = count_tiles(dir);
        let bounds = TileConfiguration::load(dir)?.and_then(|c| c.bounds());
        if tile_count == 0 {
            warn!(target_name = %target.name, "No tile configuration found; progress will not be shown");
        }
        Ok(PreparedTarget {
            target: target.clone(),
            tile_count,
            bounds,
        })
    }
}

/// Human-facing pipeline events.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A session began
    SessionStarted {
        /// Session id
        session_id: Uuid,
        /// Number of targets
        targets: usize,
    },
    /// Acquisition of one target began
    TargetStarted {
        /// 1-based position
        index: usize,
        /// Number of targets
        total: usize,
        /// Target name
        target: String,
    },
    /// A target failed
    TargetFailed {
        /// Target name
        target: String,
        /// Failure category
        kind: ErrorKind,
        /// Readable cause
        message: String,
    },
    /// A target was cancelled by the operator
    TargetCancelled {
        /// Target name
        target: String,
    },
    /// A target was not attempted
    TargetSkipped {
        /// Target name
        target: String,
        /// Why
        reason: String,
    },
    /// A stitch job finished
    StitchFinished {
        /// Target name
        target: String,
        /// Error text on failure
        error: Option<String>,
    },
    /// The session ended
    SessionFinished {
        /// One-line summary
        summary: String,
    },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionStarted { targets, .. } => {
                write!(f, "Starting acquisition of {targets} target(s)")
            }
            Self::TargetStarted { index, total, target } => {
                write!(f, "Acquiring target {index} of {total}: {target}")
            }
            Self::TargetFailed { target, message, .. } => write!(f, "{target}: {message}"),
            Self::TargetCancelled { target } => write!(f, "{target}: acquisition cancelled"),
            Self::TargetSkipped { target, reason } => write!(f, "{target}: skipped ({reason})"),
            Self::StitchFinished { target, error: None } => write!(f, "{target}: stitching complete"),
            Self::StitchFinished {
                target,
                error: Some(e),
            } => write!(f, "{target}: stitching failed: {e}"),
            Self::SessionFinished { summary } => f.write_str(summary),
        }
    }
}

/// Receives pipeline events. Must not block.
pub trait NotificationSink: Send + Sync {
    /// Deliver one event.
    fn notify(&self, event: &PipelineEvent);
}

/// Forwards events to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::TargetFailed { kind, .. } => error!(?kind, "{}", event),
            PipelineEvent::StitchFinished { error: Some(_), .. } => error!("{}", event),
            PipelineEvent::TargetSkipped { .. } => warn!("{}", event),
            _ => info!("{}", event),
        }
    }
}
