//! Acquisition sessions: one started job on the server, monitored to a
//! terminal outcome.

pub mod progress;
pub mod session;
pub mod state;

pub use progress::{CancelHandle, Progress, ProgressHandle};
pub use session::{AcquisitionOutcome, AcquisitionSession, MonitorConfig};
pub use state::{AcquisitionJob, AcquisitionState};
