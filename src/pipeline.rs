/// Orchestration of a single frame: background, difference, plate solve,
/// catalog, zeropoint and sky brightness map
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::astrometry::{AstrometricSolver, SolveField};
use crate::background::{BackgroundEstimator, MeshBackground};
use crate::catalog::{Catalog, Cataloger, SegmentCataloger};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::filter::FilterBand;
use crate::fits;
use crate::image::{CardValue, SkyImage};
use crate::photometry::{self, SkyBrightnessSummary, Zeropoint};
use crate::reference::ReferenceCatalog;
use crate::segmentation::{SourceSegmenter, ThresholdSegmenter};
use crate::units::PixelUnit;
use crate::utils::finite_median;

/// Files derived from one input frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputPaths {
    pub background: PathBuf,
    pub difference: PathBuf,
    pub sky: PathBuf,
    /// Known once the solver has run
    pub solved: Option<PathBuf>,
}

impl OutputPaths {
    /// `frame.fits` becomes `frame.bkg.fits`, `frame.subt.fits` and
    /// `frame.sky.fits`; only the last extension is replaced.
    pub fn for_input(path: &Path) -> Self {
        Self {
            background: path.with_extension("bkg.fits"),
            difference: path.with_extension("subt.fits"),
            sky: path.with_extension("sky.fits"),
            solved: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub input: PathBuf,
    pub catalog: Catalog,
    pub band: FilterBand,
    pub zeropoint: Zeropoint,
    /// arcsec² per pixel
    pub pixel_area: f64,
    pub sky: SkyBrightnessSummary,
    pub paths: OutputPaths,
    #[serde(skip)]
    pub sky_image: SkyImage,
    pub processed_at: DateTime<Utc>,
}

pub struct Pipeline {
    background: Box<dyn BackgroundEstimator>,
    solver: Box<dyn AstrometricSolver>,
    segmenter: Box<dyn SourceSegmenter>,
    cataloger: Box<dyn Cataloger>,
    calibration_mag_limit: f64,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Pipeline with the default collaborators configured from `config`.
    pub fn from_config(config: PipelineConfig, reference: ReferenceCatalog) -> Result<Self> {
        config.validate()?;
        Ok(PipelineBuilder {
            config,
            reference,
            ..PipelineBuilder::default()
        }
        .build())
    }

    pub fn calibration_mag_limit(&self) -> f64 {
        self.calibration_mag_limit
    }

    /// Run every stage on `path`. Intermediate products are written next to
    /// the input and left in place if a later stage fails.
    pub fn process(&self, path: &Path) -> Result<PipelineOutput> {
        let mut paths = OutputPaths::for_input(path);

        info!("Processing {}", path.display());
        let raw = fits::read_raw_image(path, Some(PixelUnit::Adu))?;
        let dim = raw.dim();
        debug!(
            "Raw image {}x{}, {} finite pixels",
            raw.width(),
            raw.height(),
            raw.finite_count()
        );

        let background = self.background.estimate(&raw)?;
        if background.dim() != dim {
            return Err(PipelineError::ShapeMismatch {
                expected: dim,
                found: background.dim(),
            });
        }
        info!(
            "Background median {:.2} rms {:.2} (rms map median {:.2})",
            background.global_median,
            background.global_rms,
            finite_median(background.rms.iter().copied()).unwrap_or(f64::NAN)
        );
        fits::write_image(&paths.background, &background.to_image())?;

        let difference = raw.subtract(&background.background)?;
        fits::write_image(&paths.difference, &difference)?;

        let solved_path = self.solver.solve(&paths.difference)?;
        paths.solved = Some(solved_path.clone());
        let solved = fits::read_image(&solved_path, Some(PixelUnit::Adu))?;
        solved.ensure_dim(dim)?;
        let wcs = solved
            .wcs
            .clone()
            .ok_or_else(|| PipelineError::MissingWcs(solved_path.clone()))?;
        info!(
            "Plate solution: centre pixel scale {:.2} arcsec/pixel",
            wcs.pixel_scale_arcsec()
        );

        let segmentation = self.segmenter.segment(&solved)?;
        if segmentation.dim() != dim {
            return Err(PipelineError::ShapeMismatch {
                expected: dim,
                found: segmentation.dim(),
            });
        }
        let catalog = self.cataloger.build(&solved, &segmentation, &wcs)?;
        info!(
            "Detected {} sources, {} matched to reference stars",
            catalog.len(),
            catalog.matched().count()
        );

        let band = FilterBand::from_card(raw.header.require("FILTER", path)?)?;
        let zeropoint = photometry::fit_zeropoint(&catalog, band, self.calibration_mag_limit)?;
        info!(
            "Zeropoint {:.3} ± {:.3} mag from {} stars in {}",
            zeropoint.value, zeropoint.std_dev, zeropoint.n_stars, band
        );

        let pixel_area = wcs.pixel_area_arcsec2();
        if !(pixel_area.is_finite() && pixel_area > 0.0) {
            return Err(PipelineError::InvalidWcs(format!(
                "pixel area {} arcsec² is not positive",
                pixel_area
            )));
        }

        let sky_map =
            photometry::sky_brightness(&background.background, zeropoint.value, pixel_area);
        let summary = photometry::summarize_sky(&sky_map);
        if summary.non_finite_pixels > 0 {
            warn!(
                "{} sky pixels have non-positive background and no defined brightness",
                summary.non_finite_pixels
            );
        }

        let mut sky_image = SkyImage::new(sky_map, PixelUnit::MagPerArcsec2).with_wcs(wcs);
        sky_image
            .header
            .set("FILTER", CardValue::Text(band.to_string()));
        sky_image.header.set("MAGZPT", CardValue::Real(zeropoint.value));
        sky_image.header.set("MAGZPSTD", CardValue::Real(zeropoint.std_dev));
        sky_image
            .header
            .set("NCALSTAR", CardValue::Integer(zeropoint.n_stars as i64));
        sky_image.header.set("PIXAREA", CardValue::Real(pixel_area));
        fits::write_image(&paths.sky, &sky_image)?;
        info!(
            "Sky brightness {:.2} .. {:.2} mag/arcsec² (median {:.2}) written to {}",
            summary.min,
            summary.max,
            summary.median,
            paths.sky.display()
        );

        Ok(PipelineOutput {
            input: path.to_path_buf(),
            catalog,
            band,
            zeropoint,
            pixel_area,
            sky: summary,
            paths,
            sky_image,
            processed_at: Utc::now(),
        })
    }
}

/// Assembles a [`Pipeline`]; any collaborator left unset gets its default
/// implementation configured from the builder's [`PipelineConfig`].
#[derive(Default)]
pub struct PipelineBuilder {
    config: PipelineConfig,
    reference: ReferenceCatalog,
    background: Option<Box<dyn BackgroundEstimator>>,
    solver: Option<Box<dyn AstrometricSolver>>,
    segmenter: Option<Box<dyn SourceSegmenter>>,
    cataloger: Option<Box<dyn Cataloger>>,
}

impl PipelineBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Reference stars for the default cataloger.
    pub fn reference(mut self, reference: ReferenceCatalog) -> Self {
        self.reference = reference;
        self
    }

    pub fn with_background(mut self, estimator: impl BackgroundEstimator + 'static) -> Self {
        self.background = Some(Box::new(estimator));
        self
    }

    pub fn with_solver(mut self, solver: impl AstrometricSolver + 'static) -> Self {
        self.solver = Some(Box::new(solver));
        self
    }

    pub fn with_segmenter(mut self, segmenter: impl SourceSegmenter + 'static) -> Self {
        self.segmenter = Some(Box::new(segmenter));
        self
    }

    pub fn with_cataloger(mut self, cataloger: impl Cataloger + 'static) -> Self {
        self.cataloger = Some(Box::new(cataloger));
        self
    }

    pub fn build(self) -> Pipeline {
        let config = self.config;
        let reference = self.reference;
        Pipeline {
            background: self
                .background
                .unwrap_or_else(|| Box::new(MeshBackground::new(config.background.clone()))),
            solver: self
                .solver
                .unwrap_or_else(|| Box::new(SolveField::new(config.solver.clone()))),
            segmenter: self
                .segmenter
                .unwrap_or_else(|| Box::new(ThresholdSegmenter::new(config.segmentation.clone()))),
            cataloger: self.cataloger.unwrap_or_else(|| {
                Box::new(SegmentCataloger::new(reference, config.catalog.clone()))
            }),
            calibration_mag_limit: config.photometry.calibration_mag_limit,
        }
    }
}
