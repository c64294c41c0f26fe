//! Post-acquisition image composition.
//!
//! The orchestrator builds a [`StitchJob`] for every completed target and
//! submits it to the [`StitchingQueue`] without waiting. The queue's single
//! worker expands each job into per-angle [`CompositionRequest`]s and hands
//! them to a [`Compositor`].

pub mod compositor;
pub mod job;
pub mod queue;

pub use compositor::{Compositor, TileManifestCompositor};
pub use job::{
    angle_label, CompositionRequest, OutputSettings, StitchJob, StitchMetadata, TilePlacement,
    BOUNDS_REGION,
};
pub use queue::{StitchHandle, StitchOutcome, StitchingQueue};
