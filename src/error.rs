use std::path::PathBuf;
use thiserror::Error;

use crate::filter::FilterBand;

/// Errors produced while calibrating a sky camera frame.
///
/// Nothing in the pipeline retries or recovers from these; they propagate to
/// the caller and any products already written stay on disk.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The input (or an intermediate) FITS file could not be read.
    #[error("failed to read FITS file {path}: {reason}")]
    FileRead { path: PathBuf, reason: String },

    /// An output product could not be written.
    #[error("failed to write FITS file {path}: {reason}")]
    FileWrite { path: PathBuf, reason: String },

    /// A required header keyword is absent.
    #[error("missing header keyword {key} in {path}")]
    MissingHeaderKey { key: String, path: PathBuf },

    /// The FILTER keyword names a band we have no reference photometry for.
    #[error("unrecognized filter band '{0}'")]
    UnknownFilter(String),

    /// The astrometric solver could not match the field.
    #[error("astrometric solve failed for {path}: {reason}")]
    SolveFailure { path: PathBuf, reason: String },

    /// Background estimation failed on degenerate input.
    #[error("background estimation failed: {0}")]
    BackgroundEstimation(String),

    /// The solved image carries no usable WCS.
    #[error("no WCS found in {0}")]
    MissingWcs(PathBuf),

    /// WCS keywords are present but inconsistent or unsupported.
    #[error("invalid WCS: {0}")]
    InvalidWcs(String),

    /// Two image-shaped artifacts disagree in shape.
    #[error("shape mismatch: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },

    /// The catalog was built without a reference column for this band.
    #[error("catalog has no reference magnitudes for the {0} band")]
    MissingCatalogColumn(FilterBand),

    /// No calibration stars passed the brightness cut, so the zeropoint is undefined.
    #[error("no calibration stars brighter than {limit} mag in the {band} band; zeropoint is undefined")]
    EmptyCalibrationSet { band: FilterBand, limit: f64 },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
