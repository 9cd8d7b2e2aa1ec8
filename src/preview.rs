/// Quicklook PNGs using a Midtone Transfer Function (MTF) auto-stretch
/// in the style of N.I.N.A.
use image::{ImageBuffer, Luma};
use ndarray::Array2;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::image::SkyImage;
use crate::utils::{median_and_mad, MAD_TO_SIGMA};

/// Auto-stretch parameters matching N.I.N.A. defaults
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StretchParameters {
    /// Target histogram median position
    pub factor: f64,
    /// Shadow clipping in MAD units
    pub black_clipping: f64,
}

impl Default for StretchParameters {
    fn default() -> Self {
        Self {
            factor: 0.2,
            black_clipping: -2.8,
        }
    }
}

/// Midtones Transfer Function
fn midtones_transfer_function(midtone_balance: f64, x: f64) -> f64 {
    if x > 0.0 {
        if x < 1.0 {
            return (midtone_balance - 1.0) * x
                / ((2.0 * midtone_balance - 1.0) * x - midtone_balance);
        }
        return 1.0;
    }
    0.0
}

/// Stretch `data` to 8-bit grey levels in row-major order.
///
/// Finite pixels are normalized to 0..1 over their range before the
/// stretch; non-finite pixels map to black. With `invert`, small values
/// become bright, which suits magnitude maps.
pub fn stretch_to_u8(data: &Array2<f64>, params: &StretchParameters, invert: bool) -> Vec<u8> {
    let (lo, hi) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !(lo.is_finite() && hi > lo) {
        return vec![0; data.len()];
    }

    let normalize = |v: f64| {
        let n = (v - lo) / (hi - lo);
        if invert {
            1.0 - n
        } else {
            n
        }
    };

    let Some((median, mad)) = median_and_mad(data.iter().map(|&v| normalize(v))) else {
        return vec![0; data.len()];
    };

    let (shadows, midtones, highlights) = if median > 0.5 {
        let shadows = 0.0;
        let highlights = median - params.black_clipping * mad * MAD_TO_SIGMA;
        let midtones = midtones_transfer_function(params.factor, 1.0 - (highlights - median));
        (shadows, midtones, highlights)
    } else {
        let shadows = median + params.black_clipping * mad * MAD_TO_SIGMA;
        let midtones = midtones_transfer_function(params.factor, median - shadows);
        (shadows, midtones, 1.0)
    };

    data.iter()
        .map(|&v| {
            if !v.is_finite() {
                return 0;
            }
            let input = (1.0 - highlights + normalize(v) - shadows).clamp(0.0, 1.0);
            let stretched = midtones_transfer_function(midtones, input);
            (stretched.clamp(0.0, 1.0) * 255.0).round() as u8
        })
        .collect()
}

/// Write an auto-stretched greyscale PNG of `image`.
pub fn write_preview(
    image: &SkyImage,
    path: &Path,
    params: &StretchParameters,
    invert: bool,
) -> Result<()> {
    let write_error = |reason: String| PipelineError::FileWrite {
        path: path.to_path_buf(),
        reason,
    };

    let pixels = stretch_to_u8(&image.data, params, invert);
    let buffer = ImageBuffer::<Luma<u8>, Vec<u8>>::from_raw(
        image.width() as u32,
        image.height() as u32,
        pixels,
    )
    .ok_or_else(|| write_error("pixel buffer does not match image size".to_string()))?;

    buffer.save(path).map_err(|e| write_error(e.to_string()))?;
    tracing::debug!("Saved preview to {}", path.display());
    Ok(())
}
