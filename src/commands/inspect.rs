use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::fits::{format_fits_metadata, read_fits_metadata, FitsMetadata};
use crate::utils::{escape_csv, OutputFormat};

const CSV_HEADER: &str =
    "filename,width,height,bit_depth,filter,unit,date_obs,center_ra,center_dec,pixel_scale_arcsec";

pub fn inspect(path: &Path, all_keywords: bool, format: &str) -> Result<()> {
    if path.is_file() {
        inspect_single(path, all_keywords, format)
    } else if path.is_dir() {
        inspect_directory(path, all_keywords, format)
    } else {
        Err(anyhow::anyhow!(
            "Path does not exist or is not accessible: {}",
            path.display()
        ))
    }
}

fn inspect_single(path: &Path, all_keywords: bool, format: &str) -> Result<()> {
    let metadata = read_fits_metadata(path)
        .with_context(|| format!("Failed to read FITS header: {}", path.display()))?;

    match OutputFormat::from_name(format) {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&metadata)?),
        OutputFormat::Csv => output_csv(std::slice::from_ref(&metadata), all_keywords),
        _ => {
            println!("Reading FITS file: {}\n", path.display());
            println!("{}", format_fits_metadata(&metadata, all_keywords));
        }
    }
    Ok(())
}

fn inspect_directory(dir: &Path, all_keywords: bool, format: &str) -> Result<()> {
    let mut fits_files = Vec::new();
    find_fits_files(dir, &mut fits_files)?;
    fits_files.sort();

    let mut successful = Vec::new();
    let mut error_count = 0;
    for file in &fits_files {
        match read_fits_metadata(file) {
            Ok(metadata) => successful.push(metadata),
            Err(e) => {
                tracing::debug!("Skipping {}: {}", file.display(), e);
                error_count += 1;
            }
        }
    }

    match OutputFormat::from_name(format) {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&successful)?),
        OutputFormat::Csv => output_csv(&successful, all_keywords),
        _ => {
            if fits_files.is_empty() {
                println!("No FITS files found in directory.");
                return Ok(());
            }
            println!("Scanning directory: {}\n", dir.display());
            println!("Found {} FITS files\n", fits_files.len());

            for (index, metadata) in successful.iter().enumerate() {
                println!("File {}/{}:", index + 1, successful.len());
                println!("{}", format_fits_metadata(metadata, all_keywords));
                if index + 1 < successful.len() {
                    println!("{:-<60}", "");
                }
            }

            println!("\nSummary:");
            println!("  Successfully read: {}", successful.len());
            if error_count > 0 {
                println!("  Errors: {}", error_count);
            }
        }
    }
    Ok(())
}

fn output_csv(metadata_list: &[FitsMetadata], all_keywords: bool) {
    if all_keywords {
        println!("filename,key,value");
        for metadata in metadata_list {
            for (key, value) in &metadata.keywords {
                println!(
                    "{},{},{}",
                    escape_csv(&metadata.filename),
                    escape_csv(key),
                    escape_csv(value)
                );
            }
        }
        return;
    }

    println!("{}", CSV_HEADER);
    for metadata in metadata_list {
        println!("{}", csv_row(metadata));
    }
}

fn csv_row(metadata: &FitsMetadata) -> String {
    let info = metadata.image_info.as_ref();
    let wcs = metadata.wcs.as_ref();
    let keyword = |key: &str| escape_csv(metadata.keywords.get(key).map_or("", String::as_str));

    [
        escape_csv(&metadata.filename),
        info.map(|i| i.width.to_string()).unwrap_or_default(),
        info.map(|i| i.height.to_string()).unwrap_or_default(),
        info.map(|i| i.bit_depth.to_string()).unwrap_or_default(),
        escape_csv(metadata.filter.as_deref().unwrap_or("")),
        keyword("BUNIT"),
        keyword("DATE-OBS"),
        wcs.map(|w| format!("{:.6}", w.center_ra)).unwrap_or_default(),
        wcs.map(|w| format!("{:.6}", w.center_dec)).unwrap_or_default(),
        wcs.map(|w| format!("{:.3}", w.pixel_scale_arcsec)).unwrap_or_default(),
    ]
    .join(",")
}

fn find_fits_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            find_fits_files(&path, files)?;
        } else if is_fits_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_fits_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_lowercase();
            ext == "fits" || ext == "fit" || ext == "fts"
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fits_file() {
        assert!(is_fits_file(Path::new("frame.fits")));
        assert!(is_fits_file(Path::new("frame.sky.FIT")));
        assert!(!is_fits_file(Path::new("frame.subt.new")));
        assert!(!is_fits_file(Path::new("stars.json")));
    }

    #[test]
    fn test_find_fits_files_recurses() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("night1");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("a.fits"), b"").unwrap();
        fs::write(nested.join("b.fts"), b"").unwrap();
        fs::write(nested.join("notes.txt"), b"").unwrap();

        let mut files = Vec::new();
        find_fits_files(dir.path(), &mut files).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_missing_path() {
        assert!(inspect(Path::new("/nonexistent/dir"), false, "table").is_err());
    }
}
