//! Device connection layer.
//!
//! - [`connection`]: the TCP client, its execution lock and background workers
//! - [`reconnect`]: lifecycle states plus reconnection and heartbeat settings
//! - [`mock_server`]: an in-process server speaking the same protocol

pub mod connection;
pub mod mock_server;
pub mod reconnect;

pub use connection::{ConnectionConfig, DeviceConnection};
pub use mock_server::{MockJob, MockMicroscopeServer};
pub use reconnect::{ConnectionState, HealthConfig, HealthStatus, ReconnectConfig};
