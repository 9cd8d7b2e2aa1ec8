/// Plate solving through astrometry.net's `solve-field`
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::config::SolverConfig;
use crate::error::{PipelineError, Result};

/// Contract for plate solvers. Takes the path of an image and returns the
/// path of a file carrying the same pixels plus a WCS.
pub trait AstrometricSolver {
    fn solve(&self, path: &Path) -> Result<PathBuf>;
}

/// Lines of solver stderr kept in a failure report
const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct SolveField {
    config: SolverConfig,
}

impl SolveField {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    /// Where the solved image is written: the input with its last extension
    /// replaced by `.new`, which is also solve-field's own default.
    pub fn output_path(input: &Path) -> PathBuf {
        input.with_extension("new")
    }

    pub fn command_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let cfg = &self.config;
        let mut args: Vec<OsString> = ["--overwrite", "--no-plots", "--no-verify"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push("--new-fits".into());
        args.push(output.into());

        if let Some(units) = &cfg.scale_units {
            args.push("--scale-units".into());
            args.push(units.into());
        }
        if let Some(low) = cfg.scale_low {
            args.push("--scale-low".into());
            args.push(low.to_string().into());
        }
        if let Some(high) = cfg.scale_high {
            args.push("--scale-high".into());
            args.push(high.to_string().into());
        }
        if let Some(factor) = cfg.downsample {
            args.push("--downsample".into());
            args.push(factor.to_string().into());
        }
        if let Some(limit) = cfg.cpu_limit {
            args.push("--cpulimit".into());
            args.push(limit.to_string().into());
        }
        if let (Some(ra), Some(dec)) = (cfg.ra, cfg.dec) {
            args.push("--ra".into());
            args.push(ra.to_string().into());
            args.push("--dec".into());
            args.push(dec.to_string().into());
            if let Some(radius) = cfg.radius {
                args.push("--radius".into());
                args.push(radius.to_string().into());
            }
        }
        args.extend(cfg.extra_args.iter().map(OsString::from));
        args.push(input.into());
        args
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

impl AstrometricSolver for SolveField {
    fn solve(&self, path: &Path) -> Result<PathBuf> {
        let output_path = Self::output_path(path);
        let args = self.command_args(path, &output_path);
        let failure = |reason: String| PipelineError::SolveFailure {
            path: path.to_path_buf(),
            reason,
        };

        info!("Plate solving {}", path.display());
        debug!("{} {:?}", self.config.binary.display(), args);

        let output = Command::new(&self.config.binary)
            .args(&args)
            .output()
            .map_err(|e| {
                failure(format!(
                    "could not run {}: {}",
                    self.config.binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(failure(format!(
                "{} exited with {}: {}",
                self.config.binary.display(),
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        if !output_path.exists() {
            return Err(failure(format!(
                "no solution written to {}: {}",
                output_path.display(),
                stderr_tail(&output.stderr)
            )));
        }

        info!("Solved field written to {}", output_path.display());
        Ok(output_path)
    }
}
