//! Hardware profile resolution.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::config::{
    AutofocusConfig, BackgroundConfig, LaserConfig, ModalityConfig, ProcessingStep, ScopeConfig,
};
use crate::error::{ScopeError, ScopeResult};
use crate::protocol::{AcquisitionCommand, AngleExposure, ZStack};

/// Everything the pipeline needs to know about one modality.
#[derive(Debug, Clone)]
pub struct HardwareProfile {
    /// Modality name
    pub modality: String,
    /// Objective identifier
    pub objective: String,
    /// Detector identifier
    pub detector: String,
    /// Pixel size in micrometers
    pub pixel_size_um: f64,
    /// Angle and exposure pairs
    pub angles: Vec<AngleExposure>,
    /// Laser settings
    pub laser: Option<LaserConfig>,
    /// Frame averaging
    pub averaging: Option<u32>,
    /// Z-stack range
    pub z_stack: Option<ZStack>,
    /// Autofocus settings
    pub autofocus: Option<AutofocusConfig>,
    /// Background correction
    pub background: Option<BackgroundConfig>,
    /// Processing pipeline
    pub processing: Vec<ProcessingStep>,
}

impl HardwareProfile {
    /// Rotation angles in ticks.
    #[must_use]
    pub fn angle_ticks(&self) -> Vec<f64> {
        self.angles.iter().map(|a| a.ticks).collect()
    }

    /// Log the settings the server takes from its own microscope file.
    ///
    /// Autofocus, background correction and processing are not part of the
    /// acquisition message.
    pub fn log_server_settings(&self) {
        if let Some(af) = &self.autofocus {
            info!(
                modality = %self.modality,
                n_steps = af.n_steps,
                range_um = af.search_range_um,
                interval_tiles = af.interval_tiles,
                "Autofocus expected from the server configuration"
            );
        }
        if let Some(bg) = self.background.as_ref().filter(|bg| bg.enabled) {
            info!(
                modality = %self.modality,
                folder = %bg.folder.display(),
                "Background correction expected from the server configuration"
            );
        }
        if !self.processing.is_empty() {
            let steps: Vec<&str> = self.processing.iter().map(|p| p.name.as_str()).collect();
            info!(modality = %self.modality, ?steps, "Processing expected from the server configuration");
        }
    }

    /// Add this profile's optional parameters to an acquisition command.
    #[must_use]
    pub fn apply_to(&self, mut command: AcquisitionCommand) -> AcquisitionCommand {
        if !self.angles.is_empty() {
            command = command.with_angle_exposures(self.angles.clone());
        }
        if let Some(laser) = self.laser {
            command = command.with_laser(laser.power, laser.wavelength, laser.dwell_time);
        }
        if let Some(averaging) = self.averaging {
            command = command.with_averaging(averaging);
        }
        if let Some(z) = self.z_stack {
            command = command.with_z_stack(z);
        }
        command
    }
}

/// Configuration service resolving modality names.
pub trait ProfileResolver: Send + Sync {
    /// Profile for `modality`, or a configuration error.
    fn resolve(&self, modality: &str) -> ScopeResult<HardwareProfile>;
}

/// Resolves profiles from the `[modalities]` tables.
#[derive(Debug, Clone, Default)]
pub struct ConfigProfileResolver {
    modalities: BTreeMap<String, ModalityConfig>,
}

impl ConfigProfileResolver {
    /// Resolver over the given tables.
    #[must_use]
    pub fn new(modalities: BTreeMap<String, ModalityConfig>) -> Self {
        Self { modalities }
    }

    /// Resolver over a loaded configuration.
    #[must_use]
    pub fn from_config(config: &ScopeConfig) -> Self {
        Self::new(config.modalities.clone())
    }
}

impl ProfileResolver for ConfigProfileResolver {
    fn resolve(&self, modality: &str) -> ScopeResult<HardwareProfile> {
        let m = self.modalities.get(modality).ok_or_else(|| {
            ScopeError::Configuration(format!("No hardware profile for modality '{modality}'"))
        })?;
        if m.pixel_size_um.is_nan() || m.pixel_size_um <= 0.0 {
            return Err(ScopeError::Configuration(format!(
                "Modality '{modality}' has invalid pixel size {}",
                m.pixel_size_um
            )));
        }
        if m.objective.trim().is_empty() || m.detector.trim().is_empty() {
            return Err(ScopeError::Configuration(format!(
                "Modality '{modality}' is missing its objective or detector"
            )));
        }
        debug!(
            modality,
            objective = %m.objective,
            detector = %m.detector,
            pixel_size_um = m.pixel_size_um,
            "Resolved hardware profile"
        );
        Ok(HardwareProfile {
            modality: modality.to_string(),
            objective: m.objective.clone(),
            detector: m.detector.clone(),
            pixel_size_um: m.pixel_size_um,
            angles: m.angles.clone(),
            laser: m.laser,
            averaging: m.averaging,
            z_stack: m.z_stack,
            autofocus: m.autofocus,
            background: m.background.clone(),
            processing: m.processing.clone(),
        })
    }
}
