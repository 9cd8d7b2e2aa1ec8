/// Sky background estimation on a mesh of sigma-clipped tiles
///
/// Tile levels are median filtered to suppress tiles dominated by bright
/// stars before bilinear interpolation between tile centres gives the
/// full-resolution maps.
use ndarray::Array2;
use tracing::debug;

use crate::config::BackgroundConfig;
use crate::error::{PipelineError, Result};
use crate::image::SkyImage;
use crate::units::PixelUnit;
use crate::utils::{finite_median, sigma_clipped_stats};

/// Contract for background estimators.
pub trait BackgroundEstimator {
    fn estimate(&self, image: &SkyImage) -> Result<BackgroundModel>;
}

/// Smooth background and noise maps, image-shaped, in the raw image's unit.
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    pub background: Array2<f64>,
    pub rms: Array2<f64>,
    pub global_median: f64,
    pub global_rms: f64,
    pub unit: PixelUnit,
}

impl BackgroundModel {
    /// The background map as an image, for writing to disk.
    pub fn to_image(&self) -> SkyImage {
        SkyImage::new(self.background.clone(), self.unit.clone())
    }

    pub fn dim(&self) -> (usize, usize) {
        self.background.dim()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeshBackground {
    config: BackgroundConfig,
}

/// Per-axis tile boundaries and centres.
struct TileAxis {
    starts: Vec<usize>,
    ends: Vec<usize>,
    centers: Vec<f64>,
}

impl TileAxis {
    fn new(len: usize, box_size: usize) -> Self {
        let starts: Vec<usize> = (0..len).step_by(box_size).collect();
        let ends: Vec<usize> = starts.iter().map(|s| (s + box_size).min(len)).collect();
        let centers = starts
            .iter()
            .zip(&ends)
            .map(|(s, e)| (*s + *e - 1) as f64 / 2.0)
            .collect();
        Self {
            starts,
            ends,
            centers,
        }
    }

    fn len(&self) -> usize {
        self.starts.len()
    }

    /// Bracketing tiles and fractional weight of the second for `pos`,
    /// clamped to the outermost centres.
    fn locate(&self, pos: f64) -> (usize, usize, f64) {
        let last = self.centers.len() - 1;
        if last == 0 || pos <= self.centers[0] {
            return (0, 0, 0.0);
        }
        if pos >= self.centers[last] {
            return (last, last, 0.0);
        }
        let i1 = self.centers.partition_point(|c| *c <= pos);
        let i0 = i1 - 1;
        let frac = (pos - self.centers[i0]) / (self.centers[i1] - self.centers[i0]);
        (i0, i1, frac)
    }
}

impl MeshBackground {
    pub fn new(config: BackgroundConfig) -> Self {
        Self { config }
    }

    /// Sigma-clipped median and standard deviation of each tile; `None` for
    /// tiles with too few finite pixels.
    fn tile_stats(
        &self,
        data: &Array2<f64>,
        xs: &TileAxis,
        ys: &TileAxis,
    ) -> Array2<Option<(f64, f64)>> {
        Array2::from_shape_fn((ys.len(), xs.len()), |(ty, tx)| {
            let tile = data.slice(ndarray::s![
                ys.starts[ty]..ys.ends[ty],
                xs.starts[tx]..xs.ends[tx]
            ]);
            let total = tile.len();
            let finite = tile.iter().filter(|v| v.is_finite()).count();
            if finite == 0 || (finite as f64) < self.config.min_valid_fraction * total as f64 {
                return None;
            }
            sigma_clipped_stats(
                tile.iter().copied(),
                self.config.sigma,
                self.config.max_iterations,
            )
            .map(|s| (s.median, s.std_dev))
        })
    }

    /// Median filter over a `filter_size` window, clamped at the mesh edges.
    fn median_filter(&self, mesh: &Array2<f64>) -> Array2<f64> {
        let half = self.config.filter_size / 2;
        if half == 0 {
            return mesh.clone();
        }
        let (rows, cols) = mesh.dim();
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            let r0 = r.saturating_sub(half);
            let r1 = (r + half + 1).min(rows);
            let c0 = c.saturating_sub(half);
            let c1 = (c + half + 1).min(cols);
            finite_median(mesh.slice(ndarray::s![r0..r1, c0..c1]).iter().copied())
                .unwrap_or(mesh[[r, c]])
        })
    }

    fn interpolate(
        mesh: &Array2<f64>,
        xs: &TileAxis,
        ys: &TileAxis,
        dim: (usize, usize),
    ) -> Array2<f64> {
        let columns: Vec<(usize, usize, f64)> =
            (0..dim.1).map(|x| xs.locate(x as f64)).collect();

        Array2::from_shape_fn(dim, |(y, x)| {
            let (ty0, ty1, fy) = ys.locate(y as f64);
            let (tx0, tx1, fx) = columns[x];
            let top = mesh[[ty0, tx0]] * (1.0 - fx) + mesh[[ty0, tx1]] * fx;
            let bottom = mesh[[ty1, tx0]] * (1.0 - fx) + mesh[[ty1, tx1]] * fx;
            top * (1.0 - fy) + bottom * fy
        })
    }
}

impl BackgroundEstimator for MeshBackground {
    fn estimate(&self, image: &SkyImage) -> Result<BackgroundModel> {
        let (height, width) = image.dim();
        if height == 0 || width == 0 {
            return Err(PipelineError::BackgroundEstimation(
                "image has no pixels".to_string(),
            ));
        }
        if self.config.box_size == 0 {
            return Err(PipelineError::BackgroundEstimation(
                "box size must be positive".to_string(),
            ));
        }

        let global = sigma_clipped_stats(
            image.data.iter().copied(),
            self.config.sigma,
            self.config.max_iterations,
        )
        .ok_or_else(|| {
            PipelineError::BackgroundEstimation("image has no finite pixels".to_string())
        })?;

        let xs = TileAxis::new(width, self.config.box_size);
        let ys = TileAxis::new(height, self.config.box_size);
        let stats = self.tile_stats(&image.data, &xs, &ys);

        let valid = stats.iter().flatten().count();
        let (fill_level, fill_rms) = if valid == 0 {
            (global.median, global.std_dev)
        } else {
            (
                finite_median(stats.iter().flatten().map(|s| s.0)).unwrap_or(global.median),
                finite_median(stats.iter().flatten().map(|s| s.1)).unwrap_or(global.std_dev),
            )
        };
        debug!(
            "Background mesh {}x{} tiles, {} valid, fill level {:.3}",
            xs.len(),
            ys.len(),
            valid,
            fill_level
        );

        let level_mesh = stats.mapv(|s| s.map_or(fill_level, |s| s.0));
        let rms_mesh = stats.mapv(|s| s.map_or(fill_rms, |s| s.1));

        let background = Self::interpolate(
            &self.median_filter(&level_mesh),
            &xs,
            &ys,
            (height, width),
        );
        let rms = Self::interpolate(&self.median_filter(&rms_mesh), &xs, &ys, (height, width));

        Ok(BackgroundModel {
            background,
            rms,
            global_median: global.median,
            global_rms: global.std_dev,
            unit: image.unit.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::{Rng, SeedableRng};

    fn estimator(box_size: usize) -> MeshBackground {
        MeshBackground::new(BackgroundConfig {
            box_size,
            ..BackgroundConfig::default()
        })
    }

    #[test]
    fn test_flat_image() {
        let image = SkyImage::new(Array2::from_elem((100, 130), 250.0), PixelUnit::Adu);
        let model = estimator(32).estimate(&image).unwrap();

        assert_eq!(model.dim(), (100, 130));
        assert_eq!(model.unit, PixelUnit::Adu);
        for &v in model.background.iter() {
            assert_relative_eq!(v, 250.0, max_relative = 1e-12);
        }
        assert_relative_eq!(model.global_median, 250.0);
        assert_eq!(model.global_rms, 0.0);
        assert!(model.rms.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_gradient_is_followed() {
        let image = SkyImage::new(
            Array2::from_shape_fn((128, 128), |(_, x)| 100.0 + x as f64),
            PixelUnit::Adu,
        );
        let model = MeshBackground::new(BackgroundConfig {
            box_size: 16,
            filter_size: 1,
            ..BackgroundConfig::default()
        })
        .estimate(&image)
        .unwrap();

        // Linear ramps are reproduced exactly between the outer tile centres
        for x in [8usize, 40, 64, 100, 119] {
            assert_relative_eq!(model.background[[60, x]], 100.0 + x as f64, epsilon = 1e-9);
        }
        // Clamped beyond them
        assert_relative_eq!(model.background[[0, 0]], 107.5, epsilon = 1e-9);
        assert!(model.background[[0, 127]] <= 220.5 + 1e-9);
    }

    #[test]
    fn test_stars_do_not_bias_background() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let mut data = Array2::from_shape_fn((96, 96), |_| 500.0 + rng.gen_range(-5.0..5.0));
        for (x, y) in [(10, 10), (50, 70), (80, 30)] {
            for dy in 0..3 {
                for dx in 0..3 {
                    data[[y + dy, x + dx]] = 40_000.0;
                }
            }
        }
        let image = SkyImage::new(data, PixelUnit::Adu);
        let model = estimator(32).estimate(&image).unwrap();

        for &v in model.background.iter() {
            assert!((v - 500.0).abs() < 3.0, "background {} too far from 500", v);
        }
        assert!(model.global_rms < 5.0);
        // Uniform noise of width 10 has sigma 10 / sqrt(12)
        assert_eq!(model.rms.dim(), (96, 96));
        for &v in model.rms.iter() {
            assert!((v - 2.887).abs() < 0.5, "rms {} too far from 2.89", v);
        }
    }

    #[test]
    fn test_sparse_tiles_are_filled() {
        let mut data = Array2::from_elem((64, 64), 42.0);
        for y in 0..32 {
            for x in 0..32 {
                data[[y, x]] = f64::NAN;
            }
        }
        let image = SkyImage::new(data, PixelUnit::Adu);
        let model = estimator(32).estimate(&image).unwrap();
        assert!(model.background.iter().all(|v| (v - 42.0).abs() < 1e-9));
    }

    #[test]
    fn test_degenerate_input() {
        let empty = SkyImage::new(Array2::zeros((0, 0)), PixelUnit::Adu);
        assert!(matches!(
            MeshBackground::default().estimate(&empty),
            Err(PipelineError::BackgroundEstimation(_))
        ));

        let nan = SkyImage::new(Array2::from_elem((10, 10), f64::NAN), PixelUnit::Adu);
        assert!(matches!(
            MeshBackground::default().estimate(&nan),
            Err(PipelineError::BackgroundEstimation(_))
        ));
    }

    #[test]
    fn test_tile_axis_locate() {
        let axis = TileAxis::new(40, 16);
        assert_eq!(axis.starts, vec![0, 16, 32]);
        assert_eq!(axis.ends, vec![16, 32, 40]);
        assert_eq!(axis.centers, vec![7.5, 23.5, 35.5]);

        assert_eq!(axis.locate(0.0), (0, 0, 0.0));
        assert_eq!(axis.locate(39.0), (2, 2, 0.0));
        let (i0, i1, frac) = axis.locate(15.5);
        assert_eq!((i0, i1), (0, 1));
        assert_relative_eq!(frac, 0.5);
    }
}
