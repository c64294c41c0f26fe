//! # Scope Acquisition Client
//!
//! This crate drives automated, multi-region image acquisition on a microscope
//! by talking to its hardware-control server over a private TCP protocol, and
//! hands every acquired region to a background stitching queue.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: 8-byte command words, big-endian numeric payloads, status
//!   frames and the flag-style acquisition message.
//! - **`device`**: `DeviceConnection`, the single shared link to the server,
//!   with serialized command execution, automatic reconnection and idle
//!   health checks. Also an in-process mock server.
//! - **`acquisition`**: the per-target state machine that starts one
//!   acquisition, monitors it with an inactivity timeout and supports
//!   cooperative cancellation.
//! - **`stitching`**: a single-worker queue that composes acquired tiles one
//!   job at a time, isolated per job.
//! - **`orchestrator`**: the staged pipeline over an ordered list of targets,
//!   with per-target failure isolation and a configurable failure policy.
//! - **`config`**: `ScopeConfig`, loaded from TOML with environment overrides.
//! - **`error`**: the `ScopeError` taxonomy shared by every layer.
//! - **`logging`**: tracing subscriber initialisation.
//! - **`validation`**: sample and target name rules.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod protocol;
pub mod stitching;
pub mod validation;

pub use config::ScopeConfig;
pub use device::{ConnectionConfig, DeviceConnection};
pub use error::{ScopeError, ScopeResult};
pub use orchestrator::{AcquisitionOrchestrator, AcquisitionTarget, SessionResult};
