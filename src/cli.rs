use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::PipelineConfig;

#[derive(Parser)]
#[command(name = "skycam-calib")]
#[command(about = "Calibrate all-sky camera FITS images into sky brightness maps", long_about = None)]
pub struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the full calibration pipeline on one FITS image
    Process {
        /// FITS image to calibrate
        fits: PathBuf,

        /// Reference star list (JSON) used for the zeropoint
        #[arg(short, long)]
        reference: PathBuf,

        /// Pipeline configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[command(flatten)]
        options: ProcessOptions,

        /// Also write an inverted, stretched PNG of the sky brightness map
        #[arg(long)]
        preview: bool,

        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Show a header summary of a FITS file or every FITS file in a directory
    Inspect {
        /// File or directory
        path: PathBuf,

        /// Show all header keywords
        #[arg(long)]
        all_keywords: bool,

        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}

/// Command-line overrides of the configuration file
#[derive(Parser, Debug, Clone, Default)]
pub struct ProcessOptions {
    /// solve-field executable
    #[arg(long)]
    pub solve_field: Option<PathBuf>,

    /// Lower bound of the image scale for the solver
    #[arg(long)]
    pub scale_low: Option<f64>,

    /// Upper bound of the image scale for the solver
    #[arg(long)]
    pub scale_high: Option<f64>,

    /// Units of the scale bounds (degwidth, arcminwidth, arcsecperpix)
    #[arg(long)]
    pub scale_units: Option<String>,

    /// Downsample factor passed to the solver
    #[arg(long)]
    pub downsample: Option<u32>,

    /// Maximum source to reference star separation in arcseconds
    #[arg(long)]
    pub match_radius: Option<f64>,

    /// Only reference stars brighter than this calibrate the zeropoint
    #[arg(long)]
    pub mag_limit: Option<f64>,

    /// Background mesh tile size in pixels
    #[arg(long)]
    pub box_size: Option<usize>,

    /// Detection threshold in robust sigma
    #[arg(long)]
    pub nsigma: Option<f64>,
}

impl ProcessOptions {
    /// Apply the options that were given on the command line to `config`.
    pub fn apply_to(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(binary) = &self.solve_field {
            config.solver.binary = binary.clone();
        }
        if let Some(low) = self.scale_low {
            config.solver.scale_low = Some(low);
        }
        if let Some(high) = self.scale_high {
            config.solver.scale_high = Some(high);
        }
        if let Some(units) = &self.scale_units {
            config.solver.scale_units = Some(units.clone());
        }
        if let Some(factor) = self.downsample {
            config.solver.downsample = Some(factor);
        }
        if let Some(radius) = self.match_radius {
            config.catalog.match_radius_arcsec = radius;
        }
        if let Some(limit) = self.mag_limit {
            config.photometry.calibration_mag_limit = limit;
        }
        if let Some(box_size) = self.box_size {
            config.background.box_size = box_size;
        }
        if let Some(nsigma) = self.nsigma {
            config.segmentation.nsigma = nsigma;
        }
        config
    }
}
