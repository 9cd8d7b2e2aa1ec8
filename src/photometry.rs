/// Zeropoint calibration and conversion of the background to surface brightness
use ndarray::Array2;
use serde::Serialize;

use crate::catalog::Catalog;
use crate::error::{PipelineError, Result};
use crate::filter::FilterBand;
use crate::utils::finite_median;

/// Arcseconds per degree
const ARCSEC_PER_DEG: f64 = 3600.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Zeropoint {
    /// Mean of reference minus observed magnitude
    pub value: f64,
    /// Population standard deviation of the offsets
    pub std_dev: f64,
    /// Calibration stars used
    pub n_stars: usize,
    pub band: FilterBand,
}

/// `(reference_mag, reference_mag - obs_mag)` for every row that has a
/// reference magnitude in `band` and a finite observed magnitude.
pub fn photometric_offsets(catalog: &Catalog, band: FilterBand) -> Result<Vec<(f64, f64)>> {
    let column = catalog.reference_column(band)?;
    Ok(catalog
        .sources
        .iter()
        .zip(column)
        .filter_map(|(source, reference)| {
            let reference = reference?;
            let offset = reference - source.obs_mag;
            offset.is_finite().then_some((reference, offset))
        })
        .collect())
}

/// Mean offset over calibration stars brighter than `limit`.
///
/// An empty selection is an error, never a zero zeropoint.
pub fn fit_zeropoint(catalog: &Catalog, band: FilterBand, limit: f64) -> Result<Zeropoint> {
    let offsets: Vec<f64> = photometric_offsets(catalog, band)?
        .into_iter()
        .filter(|(reference, _)| *reference < limit)
        .map(|(_, offset)| offset)
        .collect();

    if offsets.is_empty() {
        return Err(PipelineError::EmptyCalibrationSet { band, limit });
    }

    let n = offsets.len() as f64;
    let value = offsets.iter().sum::<f64>() / n;
    let std_dev = (offsets.iter().map(|o| (o - value).powi(2)).sum::<f64>() / n).sqrt();

    Ok(Zeropoint {
        value,
        std_dev,
        n_stars: offsets.len(),
        band,
    })
}

/// Solid angle of one pixel in arcsec² from per-axis scales in degrees.
pub fn pixel_area_arcsec2(scales: (f64, f64)) -> f64 {
    (scales.0 * scales.1).abs() * ARCSEC_PER_DEG * ARCSEC_PER_DEG
}

/// `zp - 2.5 log10(background / area)` per pixel. Non-positive background
/// yields non-finite values, which are left in place.
pub fn sky_brightness(background: &Array2<f64>, zeropoint: f64, pixel_area: f64) -> Array2<f64> {
    background.mapv(|b| zeropoint - 2.5 * (b / pixel_area).log10())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SkyBrightnessSummary {
    /// Brightest sky (smallest magnitude)
    pub min: f64,
    pub median: f64,
    pub max: f64,
    pub non_finite_pixels: usize,
}

/// Statistics over the finite pixels of a sky brightness map; min, median
/// and max are NaN when no pixel is finite.
pub fn summarize_sky(map: &Array2<f64>) -> SkyBrightnessSummary {
    let finite = map.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite
        .clone()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    let median = finite_median(finite).unwrap_or(f64::NAN);
    let non_finite_pixels = map.iter().filter(|v| !v.is_finite()).count();

    if median.is_nan() {
        SkyBrightnessSummary {
            min: f64::NAN,
            median,
            max: f64::NAN,
            non_finite_pixels,
        }
    } else {
        SkyBrightnessSummary {
            min,
            median,
            max,
            non_finite_pixels,
        }
    }
}
