/// FITS reading and writing for sky camera frames and derived products.
///
/// Headers are parsed directly from the 2880-byte header blocks so every card
/// is available with its type; pixel data goes through `fitrs`.
use fitrs::{Fits, FitsData, FitsDataArray, HeaderValue, Hdu};
use ndarray::Array2;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::filter::FilterBand;
use crate::image::{CardValue, FitsHeader, SkyImage};
use crate::units::PixelUnit;
use crate::wcs::Wcs;

const BLOCK_SIZE: usize = 2880;
const CARD_SIZE: usize = 80;
/// Refuse headers longer than this many blocks
const MAX_HEADER_BLOCKS: usize = 64;

/// Keywords that describe the data layout; `fitrs` writes these itself.
const STRUCTURAL_KEYS: [&str; 11] = [
    "SIMPLE", "BITPIX", "NAXIS", "NAXIS1", "NAXIS2", "NAXIS3", "EXTEND", "BZERO", "BSCALE", "BLANK",
    "END",
];

fn read_error(path: &Path, reason: impl ToString) -> PipelineError {
    PipelineError::FileRead {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn write_error(path: &Path, reason: impl ToString) -> PipelineError {
    PipelineError::FileWrite {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

/// Read the primary header of a FITS file.
pub fn read_header(path: &Path) -> Result<FitsHeader> {
    let file = File::open(path).map_err(|e| read_error(path, e))?;
    let mut reader = BufReader::new(file);
    let mut header = FitsHeader::new();
    let mut block = vec![0u8; BLOCK_SIZE];

    for block_index in 0..MAX_HEADER_BLOCKS {
        reader.read_exact(&mut block).map_err(|e| {
            read_error(path, format!("truncated header in block {}: {}", block_index, e))
        })?;

        if block_index == 0 && !block.starts_with(b"SIMPLE") {
            return Err(read_error(path, "not a FITS file (no SIMPLE card)"));
        }

        for chunk in block.chunks(CARD_SIZE) {
            let card = String::from_utf8_lossy(chunk);
            if card.trim_end() == "END" {
                return Ok(header);
            }
            if let Some((key, value)) = parse_card(&card) {
                header.set(&key, value);
            }
        }
    }

    Err(read_error(
        path,
        format!("no END card within {} header blocks", MAX_HEADER_BLOCKS),
    ))
}

/// Parse one 80-character `KEYWORD = VALUE / COMMENT` card.
///
/// Commentary cards (COMMENT, HISTORY, blank) and cards without a value
/// indicator yield `None`.
fn parse_card(card: &str) -> Option<(String, CardValue)> {
    if card.get(8..10)? != "= " {
        return None;
    }
    let keyword = card.get(..8)?.trim();
    if keyword.is_empty() {
        return None;
    }

    let value_part = card.get(10..)?.trim_start();
    let value = if let Some(quoted) = value_part.strip_prefix('\'') {
        CardValue::Text(parse_quoted(quoted))
    } else {
        let token = value_part
            .split('/')
            .next()
            .unwrap_or("")
            .trim();
        parse_token(token)?
    };

    Some((keyword.to_string(), value))
}

/// String value after the opening quote; `''` is an escaped quote.
fn parse_quoted(s: &str) -> String {
    let mut out = String::new();
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\'' {
            if chars.peek() == Some(&'\'') {
                out.push('\'');
                chars.next();
            } else {
                break;
            }
        } else {
            out.push(c);
        }
    }
    // Trailing blanks are not significant in FITS strings
    out.trim_end().to_string()
}

fn parse_token(token: &str) -> Option<CardValue> {
    match token {
        "" => None,
        "T" => Some(CardValue::Logical(true)),
        "F" => Some(CardValue::Logical(false)),
        _ => {
            if let Ok(n) = token.parse::<i64>() {
                Some(CardValue::Integer(n))
            } else if let Ok(x) = token.replace(['D', 'd'], "E").parse::<f64>() {
                Some(CardValue::Real(x))
            } else {
                Some(CardValue::Text(token.to_string()))
            }
        }
    }
}

/// Image dimensions `(width, height)` from NAXIS keywords. Degenerate third
/// axes (NAXIS3 = 1) are accepted.
fn image_dimensions(header: &FitsHeader, path: &Path) -> Result<(usize, usize)> {
    let naxis = header
        .get_i64("NAXIS")
        .ok_or_else(|| read_error(path, "missing NAXIS"))?;
    let third_axis = header.get_i64("NAXIS3").unwrap_or(1);
    if naxis < 2 || (naxis == 3 && third_axis != 1) || naxis > 3 {
        return Err(read_error(
            path,
            format!("expected 2-D image data, found NAXIS={}", naxis),
        ));
    }

    let axis = |key: &str| {
        header
            .get_i64(key)
            .filter(|&n| n > 0)
            .map(|n| n as usize)
            .ok_or_else(|| read_error(path, format!("missing or invalid {}", key)))
    };
    Ok((axis("NAXIS1")?, axis("NAXIS2")?))
}

/// Physical pixel values `BZERO + BSCALE * raw`; blank integer pixels become
/// NaN. `None` for character data.
fn physical_values(data: FitsData, bzero: f64, bscale: f64) -> Option<Vec<f64>> {
    let scale = |raw: f64| bzero + bscale * raw;
    let values = match data {
        FitsData::Characters(_) => return None,
        FitsData::IntegersI32(FitsDataArray { data, .. }) => data
            .iter()
            .map(|&v| v.map(|raw| scale(raw as f64)).unwrap_or(f64::NAN))
            .collect(),
        // Unsigned data already has the BZERO offset folded in
        FitsData::IntegersU32(FitsDataArray { data, .. }) => data
            .iter()
            .map(|&v| v.map(|raw| bscale * raw as f64).unwrap_or(f64::NAN))
            .collect(),
        FitsData::FloatingPoint32(FitsDataArray { data, .. }) => {
            data.iter().map(|&v| scale(v as f64)).collect()
        }
        FitsData::FloatingPoint64(FitsDataArray { data, .. }) => {
            data.iter().map(|&v| scale(v)).collect()
        }
    };
    Some(values)
}

/// Pixel data and header of the primary HDU, without WCS parsing.
fn read_pixels(path: &Path, unit: Option<PixelUnit>) -> Result<SkyImage> {
    let header = read_header(path)?;
    let (width, height) = image_dimensions(&header, path)?;

    let bzero = header.get_f64("BZERO").unwrap_or(0.0);
    let bscale = header.get_f64("BSCALE").unwrap_or(1.0);

    let fits = Fits::open(path).map_err(|e| read_error(path, e))?;
    let hdu = fits
        .get(0)
        .ok_or_else(|| read_error(path, "no primary HDU"))?;
    let pixels = physical_values(hdu.read_data(), bzero, bscale)
        .ok_or_else(|| read_error(path, "character data is not an image"))?;

    if pixels.len() != width * height {
        return Err(read_error(
            path,
            format!(
                "data size mismatch: expected {} pixels, got {}",
                width * height,
                pixels.len()
            ),
        ));
    }

    let data = Array2::from_shape_vec((height, width), pixels).map_err(|e| read_error(path, e))?;
    let unit = unit.unwrap_or_else(|| {
        header
            .get_str("BUNIT")
            .map(PixelUnit::from_bunit)
            .unwrap_or(PixelUnit::Adu)
    });
    Ok(SkyImage::new(data, unit).with_header(header))
}

/// Read a 2-D image, tagging it with `unit`.
///
/// When `unit` is `None` the unit comes from `BUNIT`, defaulting to ADU.
/// BZERO/BSCALE are applied and blank integer pixels become NaN. A WCS is
/// attached when the header carries one; a WCS that is present but
/// unsupported or incomplete is an `InvalidWcs` error.
pub fn read_image(path: &Path, unit: Option<PixelUnit>) -> Result<SkyImage> {
    let mut image = read_pixels(path, unit)?;
    image.wcs = Wcs::from_header(&image.header)?;
    Ok(image)
}

/// Read a raw camera frame. Like [`read_image`], except that a WCS the
/// header describes but we cannot use (ZEA/ARC/STG all-sky projections,
/// partial keyword sets) is logged and dropped.
pub fn read_raw_image(path: &Path, unit: Option<PixelUnit>) -> Result<SkyImage> {
    let mut image = read_pixels(path, unit)?;
    image.wcs = match Wcs::from_header(&image.header) {
        Ok(wcs) => wcs,
        Err(e) => {
            tracing::warn!("Ignoring WCS in raw frame {}: {}", path.display(), e);
            None
        }
    };
    Ok(image)
}

fn to_header_value(value: &CardValue) -> Option<HeaderValue> {
    match value {
        CardValue::Text(s) => Some(HeaderValue::CharacterString(s.clone())),
        CardValue::Logical(b) => Some(HeaderValue::Logical(*b)),
        CardValue::Integer(n) => Some(match i32::try_from(*n) {
            Ok(n) => HeaderValue::IntegerNumber(n),
            Err(_) => HeaderValue::RealFloatingNumber(*n as f64),
        }),
        // NaN and infinities have no FITS header representation
        CardValue::Real(x) if x.is_finite() => Some(HeaderValue::RealFloatingNumber(*x)),
        CardValue::Real(_) => None,
    }
}

/// Write `image` as a 64-bit float primary HDU, replacing any existing file.
///
/// The image header is copied without its layout keywords; `BUNIT`, the WCS
/// (if any) and a `DATE` stamp are set from the image itself.
pub fn write_image(path: &Path, image: &SkyImage) -> Result<()> {
    let mut header = image.header.clone();
    header.retain_keys(|k| !STRUCTURAL_KEYS.contains(&k));
    header.set("BUNIT", CardValue::Text(image.unit.as_bunit().to_string()));
    match &image.wcs {
        Some(wcs) => wcs.write_header(&mut header),
        None => crate::wcs::strip_wcs_keys(&mut header),
    }
    header.set(
        "DATE",
        CardValue::Text(chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()),
    );

    let pixels: Vec<f64> = image.data.iter().copied().collect();
    let mut hdu = Hdu::new(&[image.width(), image.height()], pixels);
    for (key, value) in header.iter() {
        if let Some(value) = to_header_value(value) {
            hdu.insert(key, value);
        }
    }

    if path.exists() {
        std::fs::remove_file(path).map_err(|e| write_error(path, e))?;
    }
    Fits::create(path, hdu).map_err(|e| write_error(path, e))?;
    tracing::debug!(
        "Wrote {}x{} image ({}) to {}",
        image.width(),
        image.height(),
        image.unit,
        path.display()
    );
    Ok(())
}

/// Summary of a FITS file for display
#[derive(Debug, serde::Serialize)]
pub struct FitsMetadata {
    pub filename: String,
    pub keywords: BTreeMap<String, String>,
    pub image_info: Option<ImageInfo>,
    pub filter: Option<String>,
    pub wcs: Option<WcsSummary>,
}

#[derive(Debug, serde::Serialize)]
pub struct ImageInfo {
    pub width: usize,
    pub height: usize,
    pub bit_depth: i64,
}

#[derive(Debug, serde::Serialize)]
pub struct WcsSummary {
    pub center_ra: f64,
    pub center_dec: f64,
    pub pixel_scale_arcsec: f64,
    pub pixel_area_arcsec2: f64,
}

/// Read the metadata summary of a FITS file without loading pixel data
pub fn read_fits_metadata(path: &Path) -> Result<FitsMetadata> {
    let header = read_header(path)?;

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let image_info = image_dimensions(&header, path)
        .ok()
        .map(|(width, height)| ImageInfo {
            width,
            height,
            bit_depth: header.get_i64("BITPIX").unwrap_or(0),
        });

    let wcs = match (Wcs::from_header(&header), &image_info) {
        (Ok(Some(wcs)), Some(info)) => {
            let (center_ra, center_dec) =
                wcs.pixel_to_sky((info.width as f64 - 1.0) / 2.0, (info.height as f64 - 1.0) / 2.0);
            Some(WcsSummary {
                center_ra,
                center_dec,
                pixel_scale_arcsec: wcs.pixel_scale_arcsec(),
                pixel_area_arcsec2: wcs.pixel_area_arcsec2(),
            })
        }
        _ => None,
    };

    let keywords = header
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    Ok(FitsMetadata {
        filename,
        filter: header.get_str("FILTER").map(str::to_string),
        keywords,
        image_info,
        wcs,
    })
}

/// Format FITS metadata for display
pub fn format_fits_metadata(metadata: &FitsMetadata, verbose: bool) -> String {
    let mut output = String::new();

    output.push_str(&format!("FITS File: {}\n", metadata.filename));

    if let Some(ref img_info) = metadata.image_info {
        output.push_str(&format!(
            "  Dimensions: {} x {}\n",
            img_info.width, img_info.height
        ));
        output.push_str(&format!("  Bit Depth: {}\n", img_info.bit_depth));
    }

    if let Some(date_obs) = metadata.keywords.get("DATE-OBS") {
        output.push_str(&format!("  Date: {}\n", date_obs));
    }
    if let Some(exptime) = metadata
        .keywords
        .get("EXPTIME")
        .or_else(|| metadata.keywords.get("EXPOSURE"))
    {
        output.push_str(&format!("  Exposure: {}s\n", exptime));
    }

    match metadata.filter.as_deref() {
        Some(filter) => {
            let band = filter
                .parse::<FilterBand>()
                .map(|b| b.to_string())
                .unwrap_or_else(|_| "unrecognized".to_string());
            output.push_str(&format!("  Filter: {} (band {})\n", filter, band));
        }
        None => output.push_str("  Filter: <missing>\n"),
    }

    if let Some(unit) = metadata.keywords.get("BUNIT") {
        output.push_str(&format!("  Unit: {}\n", unit));
    }
    if let Some(instrument) = metadata.keywords.get("INSTRUME") {
        output.push_str(&format!("  Instrument: {}\n", instrument));
    }

    match &metadata.wcs {
        Some(wcs) => {
            output.push_str(&format!(
                "  WCS Center: RA {:.4} / Dec {:.4}\n",
                wcs.center_ra, wcs.center_dec
            ));
            output.push_str(&format!(
                "  Pixel Scale: {:.2}\"/px ({:.1} arcsec^2/px)\n",
                wcs.pixel_scale_arcsec, wcs.pixel_area_arcsec2
            ));
        }
        None => output.push_str("  WCS: none\n"),
    }

    if verbose {
        output.push_str("\n  All Keywords:\n");
        for (key, value) in &metadata.keywords {
            output.push_str(&format!("    {:<16} = {}\n", key, value));
        }
    }

    output
}
