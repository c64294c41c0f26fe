//! Reader for ImageJ-style `TileConfiguration.txt` files.
//!
//! ```text
//! dim = 2
//! tile_0.tif; ; (12000.5, -3400.0)
//! tile_1.tif; ; (12900.5, -3400.0)
//! ```
//!
//! `TileConfiguration_QP.txt` holds the same tiles in image coordinates and is
//! preferred when counting; the plain file holds stage coordinates and is
//! preferred for placement.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::error::ScopeResult;

/// Tile configuration in stage coordinates.
pub const TILE_CONFIG_FILE: &str = "TileConfiguration.txt";
/// Tile configuration in image coordinates, written before the stage transform.
pub const TILE_CONFIG_QP_FILE: &str = "TileConfiguration_QP.txt";

static ENTRY_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(\S+\.tif); ; \((.*?), (.*?)\)").ok());

/// One tile and its position.
#[derive(Debug, Clone, PartialEq)]
pub struct TileEntry {
    /// Image file name relative to the tile directory
    pub file_name: String,
    /// X position
    pub x: f64,
    /// Y position
    pub y: f64,
}

/// Axis-aligned extent of a tile set.
#[derive(Debug, Clone, Copy, PartialEq)]
#[allow(missing_docs)]
pub struct TileBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl TileBounds {
    /// Top-left corner, used as the slide offset of the stitched image.
    #[must_use]
    pub fn origin(&self) -> (f64, f64) {
        (self.min_x, self.min_y)
    }
}

/// Parsed tile configuration.
#[derive(Debug, Clone)]
pub struct TileConfiguration {
    path: PathBuf,
    entries: Vec<TileEntry>,
}

impl TileConfiguration {
    /// Parse file contents. Lines that are not tile entries are skipped.
    #[must_use]
    pub fn parse(path: impl Into<PathBuf>, text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let caps = ENTRY_PATTERN.as_ref()?.captures(line.trim())?;
                let x = caps[2].trim().parse().ok()?;
                let y = caps[3].trim().parse().ok()?;
                Some(TileEntry {
                    file_name: caps[1].to_string(),
                    x,
                    y,
                })
            })
            .collect();
        Self {
            path: path.into(),
            entries,
        }
    }

    /// Load the stage-coordinate file from `dir`, falling back to the
    /// image-coordinate one. `Ok(None)` when neither exists.
    pub fn load(dir: &Path) -> ScopeResult<Option<Self>> {
        Self::load_preferring(dir, &[TILE_CONFIG_FILE, TILE_CONFIG_QP_FILE])
    }

    fn load_preferring(dir: &Path, names: &[&str]) -> ScopeResult<Option<Self>> {
        for name in names {
            let path = dir.join(name);
            if path.is_file() {
                let text = fs::read_to_string(&path)?;
                debug!("Read tile configuration {}", path.display());
                return Ok(Some(Self::parse(path, &text)));
            }
        }
        Ok(None)
    }

    /// File the entries were read from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tile entries in file order.
    #[must_use]
    pub fn entries(&self) -> &[TileEntry] {
        &self.entries
    }

    /// Number of tiles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no tiles were found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bounding box of all tile positions, `None` when empty.
    #[must_use]
    pub fn bounds(&self) -> Option<TileBounds> {
        let first = self.entries.first()?;
        let init = TileBounds {
            min_x: first.x,
            min_y: first.y,
            max_x: first.x,
            max_y: first.y,
        };
        Some(self.entries.iter().fold(init, |b, e| TileBounds {
            min_x: b.min_x.min(e.x),
            min_y: b.min_y.min(e.y),
            max_x: b.max_x.max(e.x),
            max_y: b.max_y.max(e.y),
        }))
    }
}

/// Number of tiles expected in `dir`.
///
/// Prefers `TileConfiguration_QP.txt`; a missing or unreadable file counts as
/// zero, which disables progress reporting.
#[must_use]
pub fn count_tiles(dir: &Path) -> u32 {
    match TileConfiguration::load_preferring(dir, &[TILE_CONFIG_QP_FILE, TILE_CONFIG_FILE]) {
        Ok(Some(config)) => u32::try_from(config.len()).unwrap_or(u32::MAX),
        Ok(None) => 0,
        Err(e) => {
            debug!("Could not read tile configuration in {}: {}", dir.display(), e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "# Define the number of dimensions\ndim = 2\n\
tile_0.tif; ; (100.0, 200.0)\n\
tile_1.tif; ; (-50.5, 200.0)\n\
tile_2.tif; ; (100.0, 900.25)\n";

    #[test]
    fn test_entry_pattern_compiles() {
        assert!(ENTRY_PATTERN.is_some());
    }

    #[test]
    fn test_parse_entries_and_bounds() {
        let config = TileConfiguration::parse("t.txt", SAMPLE);
        assert_eq!(config.len(), 3);
        assert_eq!(config.entries()[1].file_name, "tile_1.tif");
        let bounds = config.bounds().unwrap();
        assert_eq!(bounds.origin(), (-50.5, 200.0));
        assert_eq!(bounds.max_x, 100.0);
        assert_eq!(bounds.max_y, 900.25);
    }

    #[test]
    fn test_count_prefers_qp_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(TILE_CONFIG_FILE), "a.tif; ; (0, 0)\n").unwrap();
        assert_eq!(count_tiles(dir.path()), 1);
        fs::write(dir.path().join(TILE_CONFIG_QP_FILE), SAMPLE).unwrap();
        assert_eq!(count_tiles(dir.path()), 3);
    }

    #[test]
    fn test_missing_file_counts_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(count_tiles(dir.path()), 0);
        assert!(TileConfiguration::load(dir.path()).unwrap().is_none());
        assert!(TileConfiguration::parse("x", "").bounds().is_none());
    }
}
