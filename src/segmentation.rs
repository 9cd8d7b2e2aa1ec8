/// Source detection: threshold the solved difference image and label
/// connected regions
use ndarray::Array2;
use std::collections::VecDeque;
use tracing::debug;

use crate::config::SegmentationConfig;
use crate::error::Result;
use crate::image::SkyImage;
use crate::utils::{median_and_mad, MAD_TO_SIGMA};

/// Contract for anything that turns an image into a label map.
pub trait SourceSegmenter {
    fn segment(&self, image: &SkyImage) -> Result<SegmentationMap>;
}

/// Integer label per pixel. 0 is background; sources are labelled
/// `1..=num_labels` with no gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMap {
    labels: Array2<u32>,
    num_labels: u32,
}

impl SegmentationMap {
    /// Wrap a label array, renumbering its labels consecutively in order of
    /// first appearance (row-major).
    pub fn from_labels(mut labels: Array2<u32>) -> Self {
        let mut remap = std::collections::HashMap::new();
        let mut next = 0u32;
        for label in labels.iter_mut().filter(|l| **l != 0) {
            *label = *remap.entry(*label).or_insert_with(|| {
                next += 1;
                next
            });
        }
        Self {
            labels,
            num_labels: next,
        }
    }

    pub fn empty(dim: (usize, usize)) -> Self {
        Self {
            labels: Array2::zeros(dim),
            num_labels: 0,
        }
    }

    pub fn labels(&self) -> &Array2<u32> {
        &self.labels
    }

    pub fn num_labels(&self) -> u32 {
        self.num_labels
    }

    pub fn dim(&self) -> (usize, usize) {
        self.labels.dim()
    }

    /// Pixel coordinates `(x, y)` grouped by label; index 0 holds label 1.
    pub fn pixels_by_label(&self) -> Vec<Vec<(usize, usize)>> {
        let mut groups = vec![Vec::new(); self.num_labels as usize];
        for ((y, x), &label) in self.labels.indexed_iter() {
            if label != 0 {
                groups[label as usize - 1].push((x, y));
            }
        }
        groups
    }
}

/// n-sigma threshold over the robust background level, then 8-connected
/// region growing.
#[derive(Debug, Clone, Default)]
pub struct ThresholdSegmenter {
    config: SegmentationConfig,
}

impl ThresholdSegmenter {
    pub fn new(config: SegmentationConfig) -> Self {
        Self { config }
    }

    /// Detection threshold: median + nsigma * 1.4826 * MAD of finite pixels.
    pub fn threshold(&self, data: &Array2<f64>) -> Option<f64> {
        let (median, mad) = median_and_mad(data.iter().copied())?;
        Some(median + self.config.nsigma * MAD_TO_SIGMA * mad)
    }
}

impl SourceSegmenter for ThresholdSegmenter {
    fn segment(&self, image: &SkyImage) -> Result<SegmentationMap> {
        let Some(threshold) = self.threshold(&image.data) else {
            debug!("No finite pixels to segment");
            return Ok(SegmentationMap::empty(image.dim()));
        };

        let mask = image.data.mapv(|v| v.is_finite() && v > threshold);
        let regions = find_regions(&mask);

        let (height, width) = image.dim();
        let mut labels = Array2::<u32>::zeros((height, width));
        let mut next = 0u32;
        let mut dropped = 0usize;
        for region in regions {
            if region.len() < self.config.min_pixels {
                dropped += 1;
                continue;
            }
            next += 1;
            for (x, y) in region {
                labels[[y, x]] = next;
            }
        }

        debug!(
            "Segmentation threshold {:.3}: {} sources, {} regions below {} pixels",
            threshold, next, dropped, self.config.min_pixels
        );

        Ok(SegmentationMap {
            labels,
            num_labels: next,
        })
    }
}

/// 8-connected components of `mask`, each as a list of `(x, y)` pixels,
/// in row-major order of their first pixel.
fn find_regions(mask: &Array2<bool>) -> Vec<Vec<(usize, usize)>> {
    let (height, width) = mask.dim();
    let mut visited = Array2::<bool>::from_elem((height, width), false);
    let mut regions = Vec::new();

    for y in 0..height {
        for x in 0..width {
            if !mask[[y, x]] || visited[[y, x]] {
                continue;
            }

            let mut pixels = Vec::new();
            let mut queue = VecDeque::new();
            queue.push_back((x, y));
            visited[[y, x]] = true;

            while let Some((cx, cy)) = queue.pop_front() {
                pixels.push((cx, cy));

                for dy in -1i64..=1 {
                    for dx in -1i64..=1 {
                        if dx == 0 && dy == 0 {
                            continue;
                        }
                        let nx = cx as i64 + dx;
                        let ny = cy as i64 + dy;
                        if nx < 0 || ny < 0 || nx >= width as i64 || ny >= height as i64 {
                            continue;
                        }
                        let (nx, ny) = (nx as usize, ny as usize);
                        if mask[[ny, nx]] && !visited[[ny, nx]] {
                            visited[[ny, nx]] = true;
                            queue.push_back((nx, ny));
                        }
                    }
                }
            }

            regions.push(pixels);
        }
    }

    regions
}
