//! Multi-target acquisition pipeline.
//!
//! Targets are acquired strictly one after another on a single
//! [`DeviceConnection`](crate::device::DeviceConnection); each completed target
//! is handed to the stitching queue and the next one starts immediately.

pub mod pipeline;
pub mod profile;
pub mod result;
pub mod target;
pub mod tile_config;

pub use pipeline::{AcquisitionOrchestrator, OrchestratorConfig, OrchestratorHandle};
pub use profile::{ConfigProfileResolver, HardwareProfile, ProfileResolver};
pub use result::{SessionResult, StitchRecord, TargetOutcome, TargetStatus};
pub use target::{
    AcquisitionTarget, LogNotifier, NotificationSink, PipelineEvent, PreparedTarget,
    TileConfigPreparer, TilePreparer,
};
pub use tile_config::{count_tiles, TileBounds, TileConfiguration, TileEntry};
