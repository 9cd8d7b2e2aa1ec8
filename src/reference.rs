/// Known bright stars used to calibrate the photometric zeropoint
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::filter::FilterBand;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStar {
    pub name: String,
    /// Right ascension in degrees (ICRS)
    pub ra: f64,
    /// Declination in degrees (ICRS)
    pub dec: f64,
    /// Catalog magnitude per band
    #[serde(default)]
    pub mags: BTreeMap<FilterBand, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceCatalog {
    stars: Vec<ReferenceStar>,
}

impl ReferenceCatalog {
    pub fn new(stars: Vec<ReferenceStar>) -> Self {
        Self { stars }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let catalog: ReferenceCatalog =
            serde_json::from_str(json).map_err(|e| PipelineError::Config(e.to_string()))?;
        catalog.validate()?;
        Ok(catalog)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("reference catalog {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents).map_err(|e| {
            PipelineError::Config(format!("reference catalog {}: {}", path.display(), e))
        })
    }

    fn validate(&self) -> Result<()> {
        for star in &self.stars {
            if !star.ra.is_finite() || !(-90.0..=90.0).contains(&star.dec) {
                return Err(PipelineError::Config(format!(
                    "star '{}' has invalid position ({}, {})",
                    star.name, star.ra, star.dec
                )));
            }
        }
        Ok(())
    }

    pub fn stars(&self) -> &[ReferenceStar] {
        &self.stars
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    /// Every band for which at least one star has a magnitude.
    pub fn bands(&self) -> BTreeSet<FilterBand> {
        self.stars
            .iter()
            .flat_map(|s| s.mags.keys().copied())
            .collect()
    }
}
