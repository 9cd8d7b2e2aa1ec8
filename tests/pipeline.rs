use approx::assert_relative_eq;
use ndarray::Array2;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

use skycam_calib::astrometry::AstrometricSolver;
use skycam_calib::background::{BackgroundEstimator, BackgroundModel};
use skycam_calib::fits;
use skycam_calib::image::{CardValue, FitsHeader, SkyImage};
use skycam_calib::reference::{ReferenceCatalog, ReferenceStar};
use skycam_calib::units::PixelUnit;
use skycam_calib::wcs::Wcs;
use skycam_calib::{FilterBand, Pipeline, PipelineError};

const SIZE: usize = 64;
const SKY_LEVEL: f64 = 100.0;
const ZEROPOINT: f64 = 20.0;

/// 1 arcsec square pixels, so the pixel area is 1 arcsec²
fn solution() -> Wcs {
    Wcs::new(
        (32.5, 32.5),
        (180.0, 45.0),
        [[-1.0 / 3600.0, 0.0], [0.0, 1.0 / 3600.0]],
    )
}

/// Flat background estimator returning a fixed level.
struct FlatBackground {
    level: Array2<f64>,
}

impl FlatBackground {
    fn uniform(level: f64) -> Self {
        Self {
            level: Array2::from_elem((SIZE, SIZE), level),
        }
    }
}

impl BackgroundEstimator for FlatBackground {
    fn estimate(&self, image: &SkyImage) -> skycam_calib::Result<BackgroundModel> {
        Ok(BackgroundModel {
            background: self.level.clone(),
            rms: Array2::from_elem(self.level.dim(), 1.0),
            global_median: SKY_LEVEL,
            global_rms: 1.0,
            unit: image.unit.clone(),
        })
    }
}

/// Attaches a known WCS to the input and writes it next to it.
struct FakeSolver {
    wcs: Option<Wcs>,
    calls: Rc<Cell<usize>>,
}

impl FakeSolver {
    fn new(wcs: Option<Wcs>) -> Self {
        Self {
            wcs,
            calls: Rc::new(Cell::new(0)),
        }
    }
}

impl AstrometricSolver for FakeSolver {
    fn solve(&self, path: &Path) -> skycam_calib::Result<PathBuf> {
        self.calls.set(self.calls.get() + 1);
        let mut image = fits::read_image(path, None)?;
        image.wcs = self.wcs.clone();
        let output = path.with_extension("new");
        fits::write_image(&output, &image)?;
        Ok(output)
    }
}

struct FailingSolver;

impl AstrometricSolver for FailingSolver {
    fn solve(&self, path: &Path) -> skycam_calib::Result<PathBuf> {
        Err(PipelineError::SolveFailure {
            path: path.to_path_buf(),
            reason: "no match found".to_string(),
        })
    }
}

/// Calibration stars: (x0, y0) of a 3x3 block and the catalog V magnitude.
const STARS: [(usize, usize, f64); 3] = [(10, 12, 1.0), (40, 20, 2.5), (25, 48, 5.0)];

/// Per-pixel excess over the sky that makes `mag - obs_mag == ZEROPOINT`
/// for a 3x3 block.
fn pixel_excess(mag: f64) -> f64 {
    10f64.powf((ZEROPOINT - mag) / 2.5) / 9.0
}

fn frame_data() -> Array2<f64> {
    let mut data = Array2::from_elem((SIZE, SIZE), SKY_LEVEL);
    for (x0, y0, mag) in STARS {
        for y in y0..y0 + 3 {
            for x in x0..x0 + 3 {
                data[[y, x]] += pixel_excess(mag);
            }
        }
    }
    data
}

fn write_frame_with_header(dir: &Path, header: FitsHeader) -> PathBuf {
    let path = dir.join("frame.fits");
    fits::write_image(
        &path,
        &SkyImage::new(frame_data(), PixelUnit::Adu).with_header(header),
    )
    .unwrap();
    path
}

fn write_raw_frame(dir: &Path, filter: Option<&str>) -> PathBuf {
    let mut header = FitsHeader::new();
    header.set("INSTRUME", CardValue::Text("ASI178MM".to_string()));
    header.set("EXPTIME", CardValue::Real(30.0));
    if let Some(filter) = filter {
        header.set("FILTER", CardValue::Text(filter.to_string()));
    }
    write_frame_with_header(dir, header)
}

/// Raw frame written card by card, carrying a zenithal equal-area WCS the
/// way some all-sky cameras stamp their frames.
fn write_zea_frame(dir: &Path) -> PathBuf {
    let cards = [
        "SIMPLE  =                    T".to_string(),
        "BITPIX  =                  -64".to_string(),
        "NAXIS   =                    2".to_string(),
        format!("NAXIS1  = {:>20}", SIZE),
        format!("NAXIS2  = {:>20}", SIZE),
        "FILTER  = 'V       '".to_string(),
        "CTYPE1  = 'RA---ZEA'".to_string(),
        "CTYPE2  = 'DEC--ZEA'".to_string(),
        "CRPIX1  =                 32.5".to_string(),
        "CRPIX2  =                 32.5".to_string(),
        "CRVAL1  =                  0.0".to_string(),
        "CRVAL2  =                 90.0".to_string(),
        "CDELT1  =                 -2.8".to_string(),
        "CDELT2  =                  2.8".to_string(),
        "END".to_string(),
    ];

    let mut bytes = Vec::new();
    for card in &cards {
        bytes.extend(format!("{:<80}", card).bytes());
    }
    bytes.resize(bytes.len().div_ceil(2880) * 2880, b' ');
    for v in frame_data().iter() {
        bytes.extend_from_slice(&v.to_be_bytes());
    }
    bytes.resize(bytes.len().div_ceil(2880) * 2880, 0);

    let path = dir.join("frame.fits");
    std::fs::write(&path, bytes).unwrap();
    path
}

fn reference_stars() -> ReferenceCatalog {
    let wcs = solution();
    let names = ["Vega", "Deneb", "Altair"];
    ReferenceCatalog::new(
        STARS
            .iter()
            .zip(names)
            .map(|(&(x0, y0, mag), name)| {
                let (ra, dec) = wcs.pixel_to_sky(x0 as f64 + 1.0, y0 as f64 + 1.0);
                ReferenceStar {
                    name: name.to_string(),
                    ra,
                    dec,
                    mags: BTreeMap::from([(FilterBand::V, mag)]),
                }
            })
            .collect(),
    )
}

fn pipeline(background: FlatBackground, solver: impl AstrometricSolver + 'static) -> Pipeline {
    Pipeline::builder()
        .reference(reference_stars())
        .with_background(background)
        .with_solver(solver)
        .build()
}

#[test]
fn test_flat_sky_calibrates_to_constant_brightness() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));
    let solver = FakeSolver::new(Some(solution()));
    let calls = Rc::clone(&solver.calls);

    let output = pipeline(FlatBackground::uniform(SKY_LEVEL), solver)
        .process(&input)
        .unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(output.band, FilterBand::V);
    assert_eq!(output.catalog.len(), 3);
    assert_eq!(output.catalog.matched().count(), 3);

    // The 5th magnitude star is fainter than the calibration limit
    assert_eq!(output.zeropoint.n_stars, 2);
    assert_relative_eq!(output.zeropoint.value, ZEROPOINT, epsilon = 1e-6);
    assert!(output.zeropoint.std_dev < 1e-6);
    assert_relative_eq!(output.pixel_area, 1.0, max_relative = 1e-6);

    // 20 - 2.5 log10(100 / 1) = 15 everywhere
    for &v in output.sky_image.data.iter() {
        assert_relative_eq!(v, 15.0, epsilon = 1e-6);
    }
    assert_eq!(output.sky.non_finite_pixels, 0);
    assert_relative_eq!(output.sky.median, 15.0, epsilon = 1e-6);

    assert!(output.paths.background.exists());
    assert!(output.paths.difference.exists());
    assert!(output.paths.sky.exists());
    assert_eq!(output.paths.solved, Some(dir.path().join("frame.subt.new")));
}

#[test]
fn test_written_products() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));
    let output = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap();

    let background = fits::read_image(&dir.path().join("frame.bkg.fits"), None).unwrap();
    assert_eq!(background.unit, PixelUnit::Adu);
    assert!(background.data.iter().all(|&v| v == SKY_LEVEL));

    // Differencing is exact and keeps the raw header
    let difference = fits::read_image(&dir.path().join("frame.subt.fits"), None).unwrap();
    assert_eq!(difference.dim(), (SIZE, SIZE));
    assert_eq!(difference.data[[0, 0]], 0.0);
    assert_eq!(difference.header.get_str("FILTER"), Some("V"));
    assert!(difference.wcs.is_none());

    let sky = fits::read_image(&output.paths.sky, None).unwrap();
    assert_eq!(sky.unit, PixelUnit::MagPerArcsec2);
    assert_eq!(sky.dim(), (SIZE, SIZE));
    assert_eq!(sky.header.get_str("FILTER"), Some("V"));
    assert_relative_eq!(sky.header.get_f64("MAGZPT").unwrap(), ZEROPOINT, epsilon = 1e-6);
    let wcs = sky.wcs.expect("sky map carries the solved WCS");
    assert_relative_eq!(wcs.pixel_area_arcsec2(), 1.0, max_relative = 1e-6);
}

#[test]
fn test_catalog_positions_follow_wcs() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));
    let output = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap();

    let vega = output
        .catalog
        .sources
        .iter()
        .find(|s| s.reference.as_ref().map(|r| r.name.as_str()) == Some("Vega"))
        .unwrap();
    assert_relative_eq!(vega.x, 11.0, epsilon = 1e-9);
    assert_relative_eq!(vega.y, 13.0, epsilon = 1e-9);
    assert_eq!(vega.area, 9);
    assert!(vega.reference.as_ref().unwrap().separation_arcsec < 0.5);
}

#[test]
fn test_missing_filter_keyword() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), None);

    let err = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap_err();

    assert!(matches!(err, PipelineError::MissingHeaderKey { ref key, .. } if key == "FILTER"));
    // Products written before the failure stay on disk
    assert!(dir.path().join("frame.bkg.fits").exists());
    assert!(dir.path().join("frame.subt.fits").exists());
    assert!(!dir.path().join("frame.sky.fits").exists());
}

#[test]
fn test_unknown_filter() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("Halpha"));

    let err = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownFilter(_)));
}

#[test]
fn test_non_text_filter_is_unknown() {
    let dir = TempDir::new().unwrap();
    let mut header = FitsHeader::new();
    header.set("FILTER", CardValue::Integer(1));
    let input = write_frame_with_header(dir.path(), header);

    let err = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownFilter(ref name) if name == "1"));
}

#[test]
fn test_raw_frame_with_unsupported_projection() {
    let dir = TempDir::new().unwrap();
    let input = write_zea_frame(dir.path());
    assert!(matches!(
        fits::read_image(&input, None),
        Err(PipelineError::InvalidWcs(_))
    ));

    let output = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap();

    assert_eq!(output.band, FilterBand::V);
    assert_relative_eq!(output.zeropoint.value, ZEROPOINT, epsilon = 1e-6);
    assert!(output.paths.sky.exists());

    // The camera's own WCS does not leak into the difference image
    let difference = fits::read_image(&output.paths.difference, None).unwrap();
    assert!(difference.wcs.is_none());
    assert!(!difference.header.contains("CTYPE1"));
}

#[test]
fn test_filter_without_reference_column() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("B"));

    let err = pipeline(
        FlatBackground::uniform(SKY_LEVEL),
        FakeSolver::new(Some(solution())),
    )
    .process(&input)
    .unwrap_err();
    assert!(matches!(err, PipelineError::MissingCatalogColumn(FilterBand::B)));
}

#[test]
fn test_solver_failure_aborts_after_difference() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));

    let err = pipeline(FlatBackground::uniform(SKY_LEVEL), FailingSolver)
        .process(&input)
        .unwrap_err();

    assert!(matches!(err, PipelineError::SolveFailure { .. }));
    assert!(dir.path().join("frame.subt.fits").exists());
    assert!(!dir.path().join("frame.sky.fits").exists());
}

#[test]
fn test_solved_file_without_wcs() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));

    let err = pipeline(FlatBackground::uniform(SKY_LEVEL), FakeSolver::new(None))
        .process(&input)
        .unwrap_err();
    assert!(matches!(err, PipelineError::MissingWcs(_)));
}

#[test]
fn test_no_bright_calibration_stars() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));

    let pipeline = Pipeline::builder()
        .config({
            let mut config = skycam_calib::PipelineConfig::default();
            config.photometry.calibration_mag_limit = 0.5;
            config
        })
        .reference(reference_stars())
        .with_background(FlatBackground::uniform(SKY_LEVEL))
        .with_solver(FakeSolver::new(Some(solution())))
        .build();

    let err = pipeline.process(&input).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::EmptyCalibrationSet { band: FilterBand::V, limit } if limit == 0.5
    ));
}

#[test]
fn test_background_shape_mismatch() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));
    let background = FlatBackground {
        level: Array2::from_elem((SIZE, SIZE + 1), SKY_LEVEL),
    };

    let err = pipeline(background, FakeSolver::new(Some(solution())))
        .process(&input)
        .unwrap_err();
    assert!(matches!(err, PipelineError::ShapeMismatch { .. }));
}

#[test]
fn test_non_positive_background_is_reported_not_fatal() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));

    let mut level = Array2::from_elem((SIZE, SIZE), SKY_LEVEL);
    for x in 0..SIZE {
        level[[0, x]] = 0.0;
        level[[1, x]] = -4.0;
    }
    let output = pipeline(FlatBackground { level }, FakeSolver::new(Some(solution())))
        .process(&input)
        .unwrap();

    assert_eq!(output.sky.non_finite_pixels, 2 * SIZE);
    assert_relative_eq!(output.sky.min, 15.0, epsilon = 1e-6);
    assert!(output.sky_image.data[[0, 0]].is_infinite());
    assert!(output.sky_image.data[[1, 0]].is_nan());
}

#[test]
fn test_default_mesh_background_end_to_end() {
    let dir = TempDir::new().unwrap();
    let input = write_raw_frame(dir.path(), Some("V"));

    let output = Pipeline::builder()
        .reference(reference_stars())
        .with_solver(FakeSolver::new(Some(solution())))
        .build()
        .process(&input)
        .unwrap();

    // Star pixels are clipped out of the mesh, leaving the flat sky level
    assert_relative_eq!(output.sky.median, 15.0, epsilon = 1e-6);
    assert_eq!(output.zeropoint.n_stars, 2);
}
