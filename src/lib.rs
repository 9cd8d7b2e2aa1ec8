pub mod astrometry;
pub mod background;
pub mod catalog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod filter;
pub mod fits;
pub mod image;
pub mod photometry;
pub mod pipeline;
pub mod preview;
pub mod reference;
pub mod segmentation;
pub mod units;
pub mod utils;
pub mod wcs;

// Re-export commonly used items
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use filter::FilterBand;
pub use image::SkyImage;
pub use pipeline::{OutputPaths, Pipeline, PipelineOutput};
