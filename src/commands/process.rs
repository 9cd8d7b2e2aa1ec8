use anyhow::{Context, Result};
use std::path::Path;

use crate::cli::ProcessOptions;
use crate::config::PipelineConfig;
use crate::pipeline::{Pipeline, PipelineOutput};
use crate::preview::{write_preview, StretchParameters};
use crate::reference::ReferenceCatalog;
use crate::utils::{escape_csv, truncate_string, OutputFormat};

pub fn process_image(
    fits: &Path,
    reference: &Path,
    config_path: Option<&Path>,
    options: &ProcessOptions,
    preview: bool,
    format: &str,
) -> Result<()> {
    let config = match config_path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let config = options.apply_to(config);

    let reference = ReferenceCatalog::load(reference)
        .with_context(|| format!("Failed to load reference stars: {}", reference.display()))?;
    tracing::debug!("Loaded {} reference stars", reference.len());

    let pipeline = Pipeline::from_config(config, reference)?;
    let output = pipeline
        .process(fits)
        .with_context(|| format!("Failed to process {}", fits.display()))?;

    if preview {
        let png = output.paths.sky.with_extension("png");
        write_preview(&output.sky_image, &png, &StretchParameters::default(), true)?;
        tracing::info!("Wrote preview {}", png.display());
    }

    match OutputFormat::from_name(format) {
        OutputFormat::Json => output_json(&output)?,
        OutputFormat::Csv => output_csv(&output),
        OutputFormat::Table => output_table(&output),
    }

    Ok(())
}

fn format_mag(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{:.3}", v),
        _ => String::new(),
    }
}

fn output_table(output: &PipelineOutput) {
    let band = output.band;
    println!(
        "{:<6} {:>9} {:>9} {:>6} {:>12} {:>9} {:>10} {:>10} {:<20} {:>8}",
        "Label", "X", "Y", "Area", "Flux", "ObsMag", "RA", "Dec", "Reference",
        band.column_name()
    );
    println!("{:-<110}", "");

    for source in &output.catalog.sources {
        println!(
            "{:<6} {:>9.2} {:>9.2} {:>6} {:>12.1} {:>9} {:>10.4} {:>10.4} {:<20} {:>8}",
            source.label,
            source.x,
            source.y,
            source.area,
            source.flux,
            format_mag(Some(source.obs_mag)),
            source.ra,
            source.dec,
            truncate_string(
                source.reference.as_ref().map_or("", |r| r.name.as_str()),
                20
            ),
            format_mag(source.reference_mag(band))
        );
    }

    let zp = &output.zeropoint;
    println!("\nSources: {} ({} matched)", output.catalog.len(), output.catalog.matched().count());
    println!(
        "Zeropoint ({}): {:.3} ± {:.3} mag from {} stars",
        zp.band, zp.value, zp.std_dev, zp.n_stars
    );
    println!("Pixel area: {:.2} arcsec²", output.pixel_area);
    println!(
        "Sky brightness: {:.2} / {:.2} / {:.2} mag/arcsec² (min / median / max)",
        output.sky.min, output.sky.median, output.sky.max
    );
    if output.sky.non_finite_pixels > 0 {
        println!("Undefined sky pixels: {}", output.sky.non_finite_pixels);
    }
    println!("Sky map: {}", output.paths.sky.display());
}

fn output_json(output: &PipelineOutput) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(output)?);
    Ok(())
}

fn output_csv(output: &PipelineOutput) {
    let band = output.band;
    println!(
        "label,x,y,area,flux,obs_mag,ra,dec,reference,separation_arcsec,{}",
        band.column_name()
    );
    for source in &output.catalog.sources {
        let reference = source.reference.as_ref();
        println!(
            "{},{:.3},{:.3},{},{},{},{:.6},{:.6},{},{},{}",
            source.label,
            source.x,
            source.y,
            source.area,
            source.flux,
            format_mag(Some(source.obs_mag)),
            source.ra,
            source.dec,
            escape_csv(reference.map_or("", |r| r.name.as_str())),
            reference
                .map(|r| format!("{:.2}", r.separation_arcsec))
                .unwrap_or_default(),
            format_mag(source.reference_mag(band))
        );
    }
}
