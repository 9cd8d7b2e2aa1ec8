/// Per-source photometry and cross-identification with reference stars
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::CatalogConfig;
use crate::error::{PipelineError, Result};
use crate::filter::FilterBand;
use crate::image::SkyImage;
use crate::reference::ReferenceCatalog;
use crate::segmentation::SegmentationMap;
use crate::wcs::{angular_separation_deg, Wcs};

/// Contract for building a source catalog from a solved image.
pub trait Cataloger {
    fn build(&self, image: &SkyImage, segmentation: &SegmentationMap, wcs: &Wcs)
        -> Result<Catalog>;
}

/// Reference star matched to a detected source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferenceMatch {
    pub name: String,
    pub separation_arcsec: f64,
    pub mags: BTreeMap<FilterBand, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogSource {
    pub label: u32,
    /// Flux-weighted centroid, 0-based pixel coordinates
    pub x: f64,
    pub y: f64,
    /// Number of pixels in the segment
    pub area: usize,
    pub flux: f64,
    /// -2.5 log10(flux); NaN when flux <= 0
    pub obs_mag: f64,
    pub ra: f64,
    pub dec: f64,
    pub reference: Option<ReferenceMatch>,
}

impl CatalogSource {
    pub fn reference_mag(&self, band: FilterBand) -> Option<f64> {
        self.reference
            .as_ref()
            .and_then(|r| r.mags.get(&band).copied())
    }
}

/// One row per detected source, plus the set of bands the reference
/// magnitudes were drawn from.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Catalog {
    pub sources: Vec<CatalogSource>,
    bands: BTreeSet<FilterBand>,
}

impl Catalog {
    pub fn new(sources: Vec<CatalogSource>, bands: BTreeSet<FilterBand>) -> Self {
        Self { sources, bands }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn bands(&self) -> &BTreeSet<FilterBand> {
        &self.bands
    }

    pub fn has_band(&self, band: FilterBand) -> bool {
        self.bands.contains(&band)
    }

    /// Reference magnitude of every row for `band`, `None` for unmatched rows.
    pub fn reference_column(&self, band: FilterBand) -> Result<Vec<Option<f64>>> {
        if !self.has_band(band) {
            return Err(PipelineError::MissingCatalogColumn(band));
        }
        Ok(self.sources.iter().map(|s| s.reference_mag(band)).collect())
    }

    pub fn matched(&self) -> impl Iterator<Item = &CatalogSource> {
        self.sources.iter().filter(|s| s.reference.is_some())
    }
}

/// Instrumental magnitude; NaN for non-positive flux.
pub fn instrumental_mag(flux: f64) -> f64 {
    if flux > 0.0 {
        -2.5 * flux.log10()
    } else {
        f64::NAN
    }
}

/// Measures segments directly on the image and matches them to a
/// [`ReferenceCatalog`].
#[derive(Debug, Clone)]
pub struct SegmentCataloger {
    reference: ReferenceCatalog,
    config: CatalogConfig,
}

impl SegmentCataloger {
    pub fn new(reference: ReferenceCatalog, config: CatalogConfig) -> Self {
        Self { reference, config }
    }

    fn measure(
        &self,
        image: &SkyImage,
        segmentation: &SegmentationMap,
        wcs: &Wcs,
    ) -> Vec<CatalogSource> {
        segmentation
            .pixels_by_label()
            .into_iter()
            .enumerate()
            .map(|(idx, pixels)| {
                let values: Vec<(usize, usize, f64)> = pixels
                    .iter()
                    .map(|&(x, y)| (x, y, image.data[[y, x]]))
                    .filter(|(_, _, v)| v.is_finite())
                    .collect();
                let flux: f64 = values.iter().map(|(_, _, v)| v).sum();

                let (x, y) = if flux > 0.0 {
                    let sx: f64 = values.iter().map(|(x, _, v)| *x as f64 * v).sum();
                    let sy: f64 = values.iter().map(|(_, y, v)| *y as f64 * v).sum();
                    (sx / flux, sy / flux)
                } else {
                    let n = pixels.len().max(1) as f64;
                    let sx: f64 = pixels.iter().map(|(x, _)| *x as f64).sum();
                    let sy: f64 = pixels.iter().map(|(_, y)| *y as f64).sum();
                    (sx / n, sy / n)
                };

                let (ra, dec) = wcs.pixel_to_sky(x, y);
                CatalogSource {
                    label: idx as u32 + 1,
                    x,
                    y,
                    area: pixels.len(),
                    flux,
                    obs_mag: instrumental_mag(flux),
                    ra,
                    dec,
                    reference: None,
                }
            })
            .collect()
    }

    /// Each reference star claims its nearest source within the match
    /// radius; a source claimed by several stars keeps the closest one.
    fn cross_match(&self, sources: &mut [CatalogSource]) {
        let radius_deg = self.config.match_radius_arcsec / 3600.0;
        let mut best: Vec<Option<(usize, f64)>> = vec![None; sources.len()];

        for (star_idx, star) in self.reference.stars().iter().enumerate() {
            let nearest = sources
                .iter()
                .enumerate()
                .map(|(i, s)| (i, angular_separation_deg(s.ra, s.dec, star.ra, star.dec)))
                .filter(|(_, sep)| *sep <= radius_deg)
                .min_by(|a, b| a.1.total_cmp(&b.1));

            if let Some((source_idx, sep)) = nearest {
                match best[source_idx] {
                    Some((_, current)) if current <= sep => {}
                    _ => best[source_idx] = Some((star_idx, sep)),
                }
            }
        }

        for (source, matched) in sources.iter_mut().zip(best) {
            if let Some((star_idx, sep)) = matched {
                let star = &self.reference.stars()[star_idx];
                source.reference = Some(ReferenceMatch {
                    name: star.name.clone(),
                    separation_arcsec: sep * 3600.0,
                    mags: star.mags.clone(),
                });
            }
        }
    }
}

impl Cataloger for SegmentCataloger {
    fn build(
        &self,
        image: &SkyImage,
        segmentation: &SegmentationMap,
        wcs: &Wcs,
    ) -> Result<Catalog> {
        image.ensure_dim(segmentation.dim())?;

        let mut sources = self.measure(image, segmentation, wcs);
        self.cross_match(&mut sources);

        let catalog = Catalog::new(sources, self.reference.bands());
        debug!(
            "Catalog: {} sources, {} matched to reference stars",
            catalog.len(),
            catalog.matched().count()
        );
        Ok(catalog)
    }
}
