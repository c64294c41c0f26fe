//! Stitch jobs and the per-angle composition requests derived from them.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ScopeError, ScopeResult};
use crate::orchestrator::tile_config::TileConfiguration;

/// Region name whose output omits the region suffix.
pub const BOUNDS_REGION: &str = "bounds";

/// Placement metadata for the composed image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StitchMetadata {
    /// Slide-corner offset in stage micrometers (minimum tile X, Y)
    pub slide_offset: (f64, f64),
    /// Image X is mirrored relative to stage X
    pub flip_x: bool,
    /// Image Y is mirrored relative to stage Y
    pub flip_y: bool,
    /// Image the target was drawn on
    pub parent_image: Option<String>,
    /// Sample name
    pub sample_name: String,
    /// Pixel size in micrometers
    pub pixel_size_um: f64,
}

/// Output encoding settings shared by every angle of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Folder receiving composed images
    pub folder: PathBuf,
    /// Compression name
    pub compression: String,
    /// Downsample factor
    pub downsample: u32,
}

/// Composition work for one acquired target. Owned by the queue once submitted.
#[derive(Debug, Clone)]
pub struct StitchJob {
    /// Unique job id
    pub id: Uuid,
    /// Target (region) name
    pub target: String,
    /// Imaging mode with index, e.g. `ppm_20x_1`
    pub scan_type: String,
    /// Directory holding the target's tiles
    pub tile_dir: PathBuf,
    /// Rotation angles in ticks; empty for single-angle acquisitions
    pub angles: Vec<f64>,
    /// Placement metadata
    pub metadata: StitchMetadata,
    /// Output location and encoding
    pub output: OutputSettings,
}

/// One call into the compositor: a single angle with an explicit tile set.
#[derive(Debug, Clone)]
pub struct CompositionRequest {
    /// Owning job
    pub job_id: Uuid,
    /// Target name
    pub target: String,
    /// Angle in ticks, `None` for single-angle jobs
    pub angle: Option<f64>,
    /// Tiles for this angle only, with positions when known
    pub tiles: Vec<TilePlacement>,
    /// Destination image path
    pub output_path: PathBuf,
    /// Placement metadata
    pub metadata: StitchMetadata,
    /// Compression name
    pub compression: String,
    /// Downsample factor
    pub downsample: u32,
}

/// A tile file and its stage position, if the tile configuration lists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilePlacement {
    /// Absolute tile path
    pub path: PathBuf,
    /// Stage position
    pub position: Option<(f64, f64)>,
}

/// Directory name for one angle's tiles.
#[must_use]
pub fn angle_label(angle: f64) -> String {
    format!("{angle}")
}

impl StitchJob {
    /// Angles to compose, `None` standing for a single-angle job.
    #[must_use]
    pub fn angle_slots(&self) -> Vec<Option<f64>> {
        if self.angles.is_empty() {
            vec![None]
        } else {
            self.angles.iter().copied().map(Some).collect()
        }
    }

    /// Tile directory for one angle.
    #[must_use]
    pub fn angle_dir(&self, angle: Option<f64>) -> PathBuf {
        match angle {
            Some(a) => self.tile_dir.join(angle_label(a)),
            None => self.tile_dir.clone(),
        }
    }

    /// `<sample>_<scan_type>[_<region>][_<angle>].ome.tif`
    #[must_use]
    pub fn output_name(&self, angle: Option<f64>) -> String {
        let mut name = format!("{}_{}", self.metadata.sample_name, self.scan_type);
        if self.target != BOUNDS_REGION {
            name.push('_');
            name.push_str(&self.target);
        }
        if let Some(a) = angle {
            name.push('_');
            name.push_str(&angle_label(a));
        }
        name.push_str(".ome.tif");
        name
    }

    /// Build one request per angle. Each request only sees its own angle's
    /// directory, so tiles from sibling angles never mix.
    pub fn composition_requests(&self) -> ScopeResult<Vec<CompositionRequest>> {
        self.angle_slots()
            .into_iter()
            .map(|angle| {
                let tiles = self.locate_tiles(angle)?;
                Ok(CompositionRequest {
                    job_id: self.id,
                    target: self.target.clone(),
                    angle,
                    tiles,
                    output_path: self.output.folder.join(self.output_name(angle)),
                    metadata: self.metadata.clone(),
                    compression: self.output.compression.clone(),
                    downsample: self.output.downsample,
                })
            })
            .collect()
    }

    fn locate_tiles(&self, angle: Option<f64>) -> ScopeResult<Vec<TilePlacement>> {
        let dir = self.angle_dir(angle);
        // Per-angle folders normally carry no tile configuration of their own
        let config = match TileConfiguration::load(&dir)? {
            Some(config) => Some(config),
            None => TileConfiguration::load(&self.tile_dir)?,
        };

        let tiles: Vec<TilePlacement> = match config {
            Some(config) => config
                .entries()
                .iter()
                .map(|e| TilePlacement {
                    path: dir.join(&e.file_name),
                    position: Some((e.x, e.y)),
                })
                .filter(|t| t.path.is_file())
                .collect(),
            None => list_tifs(&dir)?
                .into_iter()
                .map(|path| TilePlacement {
                    path,
                    position: None,
                })
                .collect(),
        };

        if tiles.is_empty() {
            return Err(ScopeError::Stitching(format!(
                "No tiles found for '{}' in {}",
                self.target,
                dir.display()
            )));
        }
        Ok(tiles)
    }
}

fn list_tifs(dir: &Path) -> ScopeResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_tif = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"));
        if is_tif && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
