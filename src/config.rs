//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/scope.toml`)
//! 2. environment variables prefixed with `SCOPE_ACQ_`, nested with `__`
//!
//! Durations are written in humantime form (`"500ms"`, `"5m"`).
//!
//! # Example
//! ```no_run
//! use scope_acq::config::ScopeConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ScopeConfig::load()?;
//! config.validate()?;
//! println!("Server: {}:{}", config.server.host, config.server.port);
//! # Ok(())
//! # }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ScopeError, ScopeResult};
use crate::protocol::{AngleExposure, ZStack};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SCOPE_ACQ_";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Hardware server connection
    #[serde(default)]
    pub server: ServerConfig,
    /// Acquisition monitoring and pipeline policy
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Stitching output settings
    #[serde(default)]
    pub stitching: StitchingConfig,
    /// Session identity and project layout
    #[serde(default)]
    pub session: SessionConfig,
    /// Hardware profiles keyed by modality name
    #[serde(default)]
    pub modalities: BTreeMap<String, ModalityConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Connection settings for the hardware server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname or IP address
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port
    #[serde(default = "default_port")]
    pub port: u16,
    /// TCP handshake timeout
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// Per-read timeout
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// Reconnection attempts before giving up (0 disables reconnection)
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
    /// Idle time after which a heartbeat query is sent
    #[serde(with = "humantime_serde", default = "default_health_check_interval")]
    pub health_check_interval: Duration,
    /// Pause between the `acquire_` word and its text payload
    #[serde(with = "humantime_serde", default = "default_acquire_payload_delay")]
    pub acquire_payload_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay: default_reconnect_delay(),
            health_check_interval: default_health_check_interval(),
            acquire_payload_delay: default_acquire_payload_delay(),
        }
    }
}

/// What the pipeline does after a target's acquisition fails on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop starting new targets; outstanding stitch jobs still complete.
    #[default]
    Abort,
    /// Record the failure and move on to the next target.
    Continue,
}

/// Acquisition monitoring settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Interval between status polls
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Time without observed activity before the session times out
    #[serde(with = "humantime_serde", default = "default_inactivity_timeout")]
    pub inactivity_timeout: Duration,
    /// Transient poll failures tolerated right after start
    #[serde(default = "default_startup_retry_attempts")]
    pub startup_retry_attempts: u32,
    /// Delay between those retries
    #[serde(with = "humantime_serde", default = "default_startup_retry_delay")]
    pub startup_retry_delay: Duration,
    /// Reaction to a server-reported acquisition failure
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            inactivity_timeout: default_inactivity_timeout(),
            startup_retry_attempts: default_startup_retry_attempts(),
            startup_retry_delay: default_startup_retry_delay(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

/// Stitching output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchingConfig {
    /// Output compression (lzw, jpeg, j2k, uncompressed)
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Downsample factor for the composed image
    #[serde(default = "default_downsample")]
    pub downsample: u32,
    /// Folder under the sample directory receiving composed images
    #[serde(default = "default_output_folder")]
    pub output_folder: String,
    /// Stage X axis runs opposite to image X
    #[serde(default)]
    pub invert_x: bool,
    /// Stage Y axis runs opposite to image Y
    #[serde(default)]
    pub invert_y: bool,
}

impl Default for StitchingConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            downsample: default_downsample(),
            output_folder: default_output_folder(),
            invert_x: false,
            invert_y: false,
        }
    }
}

/// Identity of the acquisition session and its on-disk layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Microscope configuration file passed to the server
    #[serde(default)]
    pub yaml_path: PathBuf,
    /// Root folder for all projects
    #[serde(default)]
    pub projects_folder: PathBuf,
    /// Sample name (directory under the projects folder)
    #[serde(default)]
    pub sample_name: String,
    /// Imaging mode with index, e.g. `ppm_20x_1`
    #[serde(default)]
    pub scan_type: String,
    /// Image the acquired regions were drawn on
    #[serde(default)]
    pub parent_image: Option<String>,
}

/// Hardware profile of one imaging modality.
///
/// Angles, laser, averaging and Z-stack go into the acquisition message.
/// Autofocus, background correction and processing are applied by the server
/// from the microscope file passed as `--yaml`; they are never sent, only
/// logged when a target starts so the session log shows what was expected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModalityConfig {
    /// Objective identifier
    pub objective: String,
    /// Detector identifier
    pub detector: String,
    /// Pixel size at the sample, in micrometers
    pub pixel_size_um: f64,
    /// Rotation angles with exposures; empty for single-angle modalities
    #[serde(default)]
    pub angles: Vec<AngleExposure>,
    /// Laser scanning settings
    #[serde(default)]
    pub laser: Option<LaserConfig>,
    /// Frame averaging count
    #[serde(default)]
    pub averaging: Option<u32>,
    /// Z-stack range
    #[serde(default)]
    pub z_stack: Option<ZStack>,
    /// Autofocus settings (server-side, logged only)
    #[serde(default)]
    pub autofocus: Option<AutofocusConfig>,
    /// Background (flat-field) correction settings (server-side, logged only)
    #[serde(default)]
    pub background: Option<BackgroundConfig>,
    /// Post-acquisition processing steps, in order (server-side, logged only)
    #[serde(default)]
    pub processing: Vec<ProcessingStep>,
}

/// Laser scanning parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LaserConfig {
    /// Output power
    pub power: f64,
    /// Wavelength in nanometers
    pub wavelength: u32,
    /// Pixel dwell time in microseconds
    pub dwell_time: f64,
}

/// Autofocus parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutofocusConfig {
    /// Number of focal planes sampled
    pub n_steps: u32,
    /// Search range in micrometers
    pub search_range_um: f64,
    /// Tiles between autofocus runs
    #[serde(default = "default_autofocus_interval")]
    pub interval_tiles: u32,
}

/// Background correction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    /// Whether flat-field correction is applied
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Folder containing background images
    pub folder: PathBuf,
}

/// One named processing step with free-form parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStep {
    /// Step name, e.g. `debayer`
    pub name: String,
    /// Step-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

// Default value functions
fn default_app_name() -> String {
    "scope-acq".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_acquire_payload_delay() -> Duration {
    Duration::from_millis(50)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_startup_retry_attempts() -> u32 {
    3
}

fn default_startup_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_compression() -> String {
    "lzw".to_string()
}

fn default_downsample() -> u32 {
    1
}

fn default_output_folder() -> String {
    "SlideImages".to_string()
}

fn default_autofocus_interval() -> u32 {
    1
}

fn default_enabled() -> bool {
    true
}

impl ScopeConfig {
    /// Load configuration from `config/scope.toml` and environment variables.
    ///
    /// Environment variables override the file with prefix `SCOPE_ACQ_`.
    /// Example: `SCOPE_ACQ_SERVER__PORT=5001`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from("config/scope.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> ScopeResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.server.host.trim().is_empty() {
            return Err(invalid("server.host must not be empty"));
        }
        if self.server.port == 0 {
            return Err(invalid("server.port must be non-zero"));
        }
        for (name, value) in [
            ("server.connect_timeout", self.server.connect_timeout),
            ("server.read_timeout", self.server.read_timeout),
            ("server.health_check_interval", self.server.health_check_interval),
            ("acquisition.poll_interval", self.acquisition.poll_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.acquisition.poll_interval >= self.acquisition.inactivity_timeout {
            return Err(invalid(format!(
                "acquisition.poll_interval ({:?}) must be shorter than inactivity_timeout ({:?})",
                self.acquisition.poll_interval, self.acquisition.inactivity_timeout
            )));
        }

        if self.stitching.downsample == 0 {
            return Err(invalid("stitching.downsample must be at least 1"));
        }

        for (name, modality) in &self.modalities {
            if modality.pixel_size_um.is_nan() || modality.pixel_size_um <= 0.0 {
                return Err(invalid(format!(
                    "modality '{name}': pixel_size_um must be positive"
                )));
            }
            if let Some(z) = modality.z_stack {
                if z.step <= 0.0 {
                    return Err(invalid(format!(
                        "modality '{name}': z_stack.step must be positive"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> ScopeError {
    ScopeError::Validation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "bench"
log_level = "debug"

[server]
host = "10.0.0.5"
port = 5001
read_timeout = "2s"
reconnect_delay = "250ms"

[acquisition]
inactivity_timeout = "10m"
failure_policy = "continue"

[session]
projects_folder = "/data/projects"
sample_name = "slide_01"
scan_type = "ppm_20x_1"

[modalities.ppm_20x]
objective = "LOCI_OBJECTIVE_OLYMPUS_20X"
detector = "LOCI_DETECTOR_JAI"
pixel_size_um = 0.5
angles = [
    { ticks = -5.0, exposure_ms = 500.0 },
    { ticks = 0.0, exposure_ms = 800.0 },
]

[[modalities.ppm_20x.processing]]
name = "debayer"
params = { pattern = "RGGB" }
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = write_config(SAMPLE);
        let config = ScopeConfig::load_from(file.path()).unwrap();

        assert_eq!(config.application.name, "bench");
        assert_eq!(config.server.port, 5001);
        assert_eq!(config.server.read_timeout, Duration::from_secs(2));
        assert_eq!(config.server.reconnect_delay, Duration::from_millis(250));
        // untouched values fall back to defaults
        assert_eq!(config.server.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.server.max_reconnect_attempts, 3);
        assert_eq!(config.acquisition.poll_interval, Duration::from_millis(500));
        assert_eq!(config.acquisition.inactivity_timeout, Duration::from_secs(600));
        assert_eq!(config.acquisition.failure_policy, FailurePolicy::Continue);

        let ppm = &config.modalities["ppm_20x"];
        assert_eq!(ppm.angles.len(), 2);
        assert_eq!(ppm.angles[1], AngleExposure::new(0.0, 800.0));
        assert_eq!(ppm.processing[0].name, "debayer");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("SCOPE_ACQ_SERVER__PORT", "6001");
        std::env::set_var("SCOPE_ACQ_ACQUISITION__POLL_INTERVAL", "250ms");
        let config = ScopeConfig::load_from(file.path());
        std::env::remove_var("SCOPE_ACQ_SERVER__PORT");
        std::env::remove_var("SCOPE_ACQ_ACQUISITION__POLL_INTERVAL");

        let config = config.unwrap();
        assert_eq!(config.server.port, 6001);
        assert_eq!(config.acquisition.poll_interval, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let config = ScopeConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.stitching.output_folder, "SlideImages");
        assert!(config.modalities.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_bundled_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/scope.toml");
        let config = ScopeConfig::load_from(path).unwrap();
        config.validate().unwrap();

        assert_eq!(config.modalities.len(), 3);
        let shg = &config.modalities["shg_20x"];
        assert_eq!(shg.laser.map(|l| l.wavelength), Some(880));
        assert!(shg.z_stack.is_some());
        assert_eq!(config.modalities["ppm_20x"].angles.len(), 3);
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = ScopeConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(matches!(config.validate(), Err(ScopeError::Validation(_))));
    }

    #[test]
    fn test_poll_interval_must_be_below_inactivity_timeout() {
        let mut config = ScopeConfig::default();
        config.acquisition.poll_interval = Duration::from_secs(10);
        config.acquisition.inactivity_timeout = Duration::from_secs(5);
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("poll_interval"));
    }

    #[test]
    fn test_non_positive_pixel_size_rejected() {
        let mut config = ScopeConfig::default();
        config.modalities.insert(
            "bf_10x".into(),
            ModalityConfig {
                objective: "obj".into(),
                detector: "det".into(),
                pixel_size_um: 0.0,
                angles: vec![],
                laser: None,
                averaging: None,
                z_stack: None,
                autofocus: None,
                background: None,
                processing: vec![],
            },
        );
        assert!(config.validate().is_err());
    }
}
