//! Composition backends.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::job::{CompositionRequest, StitchMetadata};
use crate::error::{ScopeError, ScopeResult};

/// Composes one angle's tiles into an image.
///
/// Called from the single stitching worker, one request at a time.
#[async_trait]
pub trait Compositor: Send + Sync {
    /// Compose the request and return the path of what was written.
    async fn compose(&self, request: &CompositionRequest) -> ScopeResult<PathBuf>;
}

/// Writes a JSON layout manifest next to the intended output image.
///
/// The manifest lists every tile with its pixel offset from the slide corner,
/// ready for an external pyramid writer.
#[derive(Debug, Clone, Default)]
pub struct TileManifestCompositor;

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    job_id: Uuid,
    target: &'a str,
    angle: Option<f64>,
    image: &'a PathBuf,
    created_at: DateTime<Utc>,
    compression: &'a str,
    downsample: u32,
    metadata: &'a StitchMetadata,
    tiles: Vec<ManifestTile<'a>>,
}

#[derive(Debug, Serialize)]
struct ManifestTile<'a> {
    path: &'a PathBuf,
    pixel_offset: Option<(f64, f64)>,
}

impl TileManifestCompositor {
    /// Manifest location for an output image.
    #[must_use]
    pub fn manifest_path(request: &CompositionRequest) -> PathBuf {
        let mut name = request
            .output_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".json");
        request.output_path.with_file_name(name)
    }
}

#[async_trait]
impl Compositor for TileManifestCompositor {
    async fn compose(&self, request: &CompositionRequest) -> ScopeResult<PathBuf> {
        let meta = &request.metadata;
        if meta.pixel_size_um <= 0.0 {
            return Err(ScopeError::Stitching(format!(
                "Invalid pixel size {} for '{}'",
                meta.pixel_size_um, request.target
            )));
        }
        let (ox, oy) = meta.slide_offset;
        let scale = meta.pixel_size_um * f64::from(request.downsample.max(1));

        let manifest = Manifest {
            job_id: request.job_id,
            target: &request.target,
            angle: request.angle,
            image: &request.output_path,
            created_at: Utc::now(),
            compression: &request.compression,
            downsample: request.downsample,
            metadata: meta,
            tiles: request
                .tiles
                .iter()
                .map(|t| ManifestTile {
                    path: &t.path,
                    pixel_offset: t.position.map(|(x, y)| ((x - ox) / scale, (y - oy) / scale)),
                })
                .collect(),
        };
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| ScopeError::Stitching(format!("Failed to encode manifest: {e}")))?;

        let path = Self::manifest_path(request);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, body).await?;
        info!(
            target_name = %request.target,
            tiles = request.tiles.len(),
            "Wrote tile manifest {}",
            path.display()
        );
        Ok(path)
    }
}
