use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Tunables for every pipeline stage.
///
/// Loaded from JSON; any section or field left out takes its default, so an
/// empty object `{}` is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub background: BackgroundConfig,
    pub segmentation: SegmentationConfig,
    pub catalog: CatalogConfig,
    pub solver: SolverConfig,
    pub photometry: PhotometryConfig,
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&contents)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject values no stage can work with.
    pub fn validate(&self) -> Result<()> {
        let bg = &self.background;
        if bg.box_size == 0 {
            return Err(PipelineError::Config("background.box_size must be > 0".into()));
        }
        if bg.filter_size == 0 {
            return Err(PipelineError::Config("background.filter_size must be > 0".into()));
        }
        if !(bg.sigma > 0.0) {
            return Err(PipelineError::Config("background.sigma must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&bg.min_valid_fraction) {
            return Err(PipelineError::Config(
                "background.min_valid_fraction must be within 0..=1".into(),
            ));
        }
        if !(self.segmentation.nsigma >= 0.0) {
            return Err(PipelineError::Config("segmentation.nsigma must be >= 0".into()));
        }
        if !(self.catalog.match_radius_arcsec > 0.0) {
            return Err(PipelineError::Config(
                "catalog.match_radius_arcsec must be > 0".into(),
            ));
        }
        if !self.photometry.calibration_mag_limit.is_finite() {
            return Err(PipelineError::Config(
                "photometry.calibration_mag_limit must be finite".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    /// Mesh tile edge length in pixels
    pub box_size: usize,
    /// Median filter window over the mesh, in tiles
    pub filter_size: usize,
    /// Clipping threshold in standard deviations
    pub sigma: f64,
    pub max_iterations: usize,
    /// Tiles with fewer finite pixels than this fraction are interpolated
    pub min_valid_fraction: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            box_size: 64,
            filter_size: 3,
            sigma: 3.0,
            max_iterations: 5,
            min_valid_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Detection threshold above the median, in robust sigma
    pub nsigma: f64,
    /// Smallest region kept as a source
    pub min_pixels: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            nsigma: 3.0,
            min_pixels: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Maximum source to reference star separation
    pub match_radius_arcsec: f64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        // Wide-field lenses spread bright stars over several arcminutes
        Self {
            match_radius_arcsec: 360.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// `solve-field` executable
    pub binary: PathBuf,
    pub scale_units: Option<String>,
    pub scale_low: Option<f64>,
    pub scale_high: Option<f64>,
    pub downsample: Option<u32>,
    /// CPU time limit in seconds
    pub cpu_limit: Option<u32>,
    pub ra: Option<f64>,
    pub dec: Option<f64>,
    pub radius: Option<f64>,
    pub extra_args: Vec<String>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("solve-field"),
            scale_units: None,
            scale_low: None,
            scale_high: None,
            downsample: None,
            cpu_limit: None,
            ra: None,
            dec: None,
            radius: None,
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotometryConfig {
    /// Only reference stars brighter than this magnitude calibrate the zeropoint
    pub calibration_mag_limit: f64,
}

impl Default for PhotometryConfig {
    fn default() -> Self {
        Self {
            calibration_mag_limit: 3.5,
        }
    }
}
