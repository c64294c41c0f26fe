//! Text payload of the `acquire_` command.
//!
//! The server parses a flag-style argument string and scans the stream for the
//! end-marker token, since there is no length prefix:
//!
//! ```text
//! --yaml <path> --projects <dir> --sample <name> --scan-type <type> --region <name>
//!   [--angles (a1,a2,...)] [--exposures (e1,e2,...)]
//!   [--laser-power n] [--laser-wavelength n] [--dwell-time n] [--averaging n]
//!   [--z-stack --z-start n --z-end n --z-step n] END_MARKER
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, ScopeResult};

use super::codec::END_MARKER;

/// Rotation position paired with the exposure used at that position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleExposure {
    /// Rotation stage position in ticks.
    pub ticks: f64,
    /// Camera exposure in milliseconds.
    pub exposure_ms: f64,
}

impl AngleExposure {
    /// Create a new angle/exposure pair.
    #[must_use]
    pub fn new(ticks: f64, exposure_ms: f64) -> Self {
        Self { ticks, exposure_ms }
    }
}

/// Z-stack range, in micrometers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZStack {
    /// First focal plane.
    pub start: f64,
    /// Last focal plane.
    pub end: f64,
    /// Distance between planes.
    pub step: f64,
}

/// Parameters of one acquisition request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcquisitionCommand {
    yaml_path: String,
    projects_folder: String,
    sample: String,
    scan_type: String,
    region: String,
    angle_exposures: Vec<AngleExposure>,
    laser_power: Option<f64>,
    laser_wavelength: Option<u32>,
    dwell_time: Option<f64>,
    averaging: Option<u32>,
    z_stack: Option<ZStack>,
}

impl AcquisitionCommand {
    /// Start an empty command.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Microscope configuration file read by the server.
    #[must_use]
    pub fn with_yaml_path(mut self, path: impl Into<String>) -> Self {
        self.yaml_path = path.into();
        self
    }

    /// Root folder holding all projects.
    #[must_use]
    pub fn with_projects_folder(mut self, folder: impl Into<String>) -> Self {
        self.projects_folder = folder.into();
        self
    }

    /// Sample label.
    #[must_use]
    pub fn with_sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = sample.into();
        self
    }

    /// Imaging mode with index, e.g. `ppm_20x_1`.
    #[must_use]
    pub fn with_scan_type(mut self, scan_type: impl Into<String>) -> Self {
        self.scan_type = scan_type.into();
        self
    }

    /// Region (target) name.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    /// Rotation angles and their exposures.
    #[must_use]
    pub fn with_angle_exposures(mut self, pairs: Vec<AngleExposure>) -> Self {
        self.angle_exposures = pairs;
        self
    }

    /// Laser power, wavelength (nm) and pixel dwell time.
    #[must_use]
    pub fn with_laser(mut self, power: f64, wavelength: u32, dwell_time: f64) -> Self {
        self.laser_power = Some(power);
        self.laser_wavelength = Some(wavelength);
        self.dwell_time = Some(dwell_time);
        self
    }

    /// Frame averaging count. Values of 1 or less are not sent.
    #[must_use]
    pub fn with_averaging(mut self, averaging: u32) -> Self {
        self.averaging = Some(averaging);
        self
    }

    /// Enable a Z-stack.
    #[must_use]
    pub fn with_z_stack(mut self, z_stack: ZStack) -> Self {
        self.z_stack = Some(z_stack);
        self
    }

    /// Region name.
    #[must_use]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Rotation angles in ticks, in submission order.
    #[must_use]
    pub fn angles(&self) -> Vec<f64> {
        self.angle_exposures.iter().map(|ae| ae.ticks).collect()
    }

    /// Check that every required field is present.
    pub fn validate(&self) -> ScopeResult<()> {
        let missing: Vec<&str> = [
            ("yaml_path", &self.yaml_path),
            ("projects_folder", &self.projects_folder),
            ("sample", &self.sample),
            ("scan_type", &self.scan_type),
            ("region", &self.region),
        ]
        .iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| *name)
        .collect();

        if !missing.is_empty() {
            return Err(ScopeError::Validation(format!(
                "Missing required parameters: {}",
                missing.join(", ")
            )));
        }
        Ok(())
    }

    /// Flag/value arguments, unquoted.
    pub fn to_args(&self) -> ScopeResult<Vec<String>> {
        self.validate()?;

        let mut args: Vec<String> = [
            "--yaml",
            self.yaml_path.as_str(),
            "--projects",
            self.projects_folder.as_str(),
            "--sample",
            self.sample.as_str(),
            "--scan-type",
            self.scan_type.as_str(),
            "--region",
            self.region.as_str(),
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();

        if !self.angle_exposures.is_empty() {
            args.push("--angles".into());
            args.push(paren_list(self.angle_exposures.iter().map(|ae| ae.ticks)));
            args.push("--exposures".into());
            args.push(paren_list(self.angle_exposures.iter().map(|ae| ae.exposure_ms)));
        }
        if let Some(power) = self.laser_power {
            args.push("--laser-power".into());
            args.push(format_number(power));
        }
        if let Some(wavelength) = self.laser_wavelength {
            args.push("--laser-wavelength".into());
            args.push(wavelength.to_string());
        }
        if let Some(dwell) = self.dwell_time {
            args.push("--dwell-time".into());
            args.push(format_number(dwell));
        }
        if let Some(averaging) = self.averaging.filter(|n| *n > 1) {
            args.push("--averaging".into());
            args.push(averaging.to_string());
        }
        if let Some(z) = self.z_stack {
            args.push("--z-stack".into());
            args.push("--z-start".into());
            args.push(format_number(z.start));
            args.push("--z-end".into());
            args.push(format_number(z.end));
            args.push("--z-step".into());
            args.push(format_number(z.step));
        }
        Ok(args)
    }

    /// Complete message text, terminated by the end marker.
    pub fn encode(&self) -> ScopeResult<String> {
        let mut parts: Vec<String> = self.to_args()?.iter().map(|a| quote_arg(a)).collect();
        parts.push(END_MARKER.to_string());
        Ok(parts.join(" "))
    }
}

/// Normalize path separators and quote values the server would split.
#[must_use]
pub fn quote_arg(arg: &str) -> String {
    let arg = arg.replace('\\', "/");
    if arg.contains([' ', '(', ')', ',']) {
        format!("\"{arg}\"")
    } else {
        arg
    }
}

fn paren_list(values: impl Iterator<Item = f64>) -> String {
    let items: Vec<String> = values.map(format_number).collect();
    format!("({})", items.join(","))
}

// Always keep a decimal point so the server parses floats as floats.
fn format_number(value: f64) -> String {
    format!("{value:?}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> AcquisitionCommand {
        AcquisitionCommand::new()
            .with_yaml_path("C:\\scope\\config.yml")
            .with_projects_folder("/data/projects")
            .with_sample("slide_01")
            .with_scan_type("ppm_20x_1")
            .with_region("tissue_1")
    }

    #[test]
    fn test_minimal_message() {
        let msg = base().encode().unwrap();
        assert_eq!(
            msg,
            "--yaml C:/scope/config.yml --projects /data/projects --sample slide_01 \
             --scan-type ppm_20x_1 --region tissue_1 END_MARKER"
        );
    }

    #[test]
    fn test_angles_and_exposures_are_quoted_lists() {
        let msg = base()
            .with_angle_exposures(vec![
                AngleExposure::new(-5.0, 500.0),
                AngleExposure::new(0.0, 800.0),
                AngleExposure::new(5.0, 500.0),
            ])
            .encode()
            .unwrap();
        assert!(msg.contains("--angles \"(-5.0,0.0,5.0)\""));
        assert!(msg.contains("--exposures \"(500.0,800.0,500.0)\""));
        assert!(msg.ends_with(" END_MARKER"));
    }

    #[test]
    fn test_optional_flags() {
        let msg = base()
            .with_laser(12.5, 780, 2.0)
            .with_averaging(1)
            .with_z_stack(ZStack {
                start: -10.0,
                end: 10.0,
                step: 2.5,
            })
            .encode()
            .unwrap();
        assert!(msg.contains("--laser-power 12.5 --laser-wavelength 780 --dwell-time 2.0"));
        assert!(!msg.contains("--averaging"));
        assert!(msg.contains("--z-stack --z-start -10.0 --z-end 10.0 --z-step 2.5"));

        let msg = base().with_averaging(4).encode().unwrap();
        assert!(msg.contains("--averaging 4"));
    }

    #[test]
    fn test_values_with_spaces_are_quoted() {
        let msg = base().with_region("left lobe").encode().unwrap();
        assert!(msg.contains("--region \"left lobe\""));
    }

    #[test]
    fn test_missing_fields_are_all_reported() {
        let err = AcquisitionCommand::new()
            .with_sample("s")
            .encode()
            .unwrap_err()
            .to_string();
        assert!(err.contains("yaml_path"));
        assert!(err.contains("projects_folder"));
        assert!(err.contains("scan_type"));
        assert!(err.contains("region"));
        assert!(!err.contains("sample,"));
    }
}
