use ndarray::Array2;
use std::fmt;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::units::PixelUnit;
use crate::wcs::Wcs;

/// Typed value of a FITS header card.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum CardValue {
    Text(String),
    Logical(bool),
    Integer(i64),
    Real(f64),
}

impl CardValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            CardValue::Integer(n) => Some(*n as f64),
            CardValue::Real(x) => Some(*x),
            // Some writers quote numbers
            CardValue::Text(s) => s.trim().parse().ok(),
            CardValue::Logical(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CardValue::Integer(n) => Some(*n),
            CardValue::Real(x) if x.fract() == 0.0 => Some(*x as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CardValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CardValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardValue::Text(s) => f.write_str(s),
            CardValue::Logical(b) => f.write_str(if *b { "T" } else { "F" }),
            CardValue::Integer(n) => write!(f, "{}", n),
            CardValue::Real(x) => write!(f, "{}", x),
        }
    }
}

/// Ordered list of header cards. Keywords are unique; setting an existing
/// keyword replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitsHeader {
    cards: Vec<(String, CardValue)>,
}

impl FitsHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CardValue> {
        self.cards
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(CardValue::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(CardValue::as_f64)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(CardValue::as_i64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn set(&mut self, key: &str, value: CardValue) {
        let key = key.to_ascii_uppercase();
        match self.cards.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.cards.push((key, value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<CardValue> {
        let idx = self
            .cards
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(key))?;
        Some(self.cards.remove(idx).1)
    }

    /// Keep only the cards whose keyword satisfies `predicate`.
    pub fn retain_keys<F: Fn(&str) -> bool>(&mut self, predicate: F) {
        self.cards.retain(|(k, _)| predicate(k));
    }

    /// Keyword that must be present, e.g. `FILTER`.
    pub fn require(&self, key: &str, path: &Path) -> Result<&CardValue> {
        self.get(key).ok_or_else(|| PipelineError::MissingHeaderKey {
            key: key.to_string(),
            path: path.to_path_buf(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CardValue)> {
        self.cards.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

impl FromIterator<(String, CardValue)> for FitsHeader {
    fn from_iter<T: IntoIterator<Item = (String, CardValue)>>(iter: T) -> Self {
        let mut header = FitsHeader::new();
        for (key, value) in iter {
            header.set(&key, value);
        }
        header
    }
}

/// A 2-D image with its unit, header and (once plate-solved) WCS.
///
/// `data` is indexed `[[y, x]]` in FITS pixel order: row 0 is the first row
/// stored in the file.
#[derive(Debug, Clone)]
pub struct SkyImage {
    pub data: Array2<f64>,
    pub unit: PixelUnit,
    pub header: FitsHeader,
    pub wcs: Option<Wcs>,
}

impl SkyImage {
    pub fn new(data: Array2<f64>, unit: PixelUnit) -> Self {
        Self {
            data,
            unit,
            header: FitsHeader::new(),
            wcs: None,
        }
    }

    pub fn with_header(mut self, header: FitsHeader) -> Self {
        self.header = header;
        self
    }

    pub fn with_wcs(mut self, wcs: Wcs) -> Self {
        self.wcs = Some(wcs);
        self
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// `(height, width)`, the ndarray dimension order.
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn ensure_dim(&self, expected: (usize, usize)) -> Result<()> {
        if self.dim() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected,
                found: self.dim(),
            });
        }
        Ok(())
    }

    /// Elementwise `self - other`, keeping unit and header. The result has no WCS.
    pub fn subtract(&self, other: &Array2<f64>) -> Result<SkyImage> {
        if other.dim() != self.dim() {
            return Err(PipelineError::ShapeMismatch {
                expected: self.dim(),
                found: other.dim(),
            });
        }

        Ok(SkyImage {
            data: &self.data - other,
            unit: self.unit.clone(),
            header: self.header.clone(),
            wcs: None,
        })
    }

    /// Number of finite pixels.
    pub fn finite_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_finite()).count()
    }
}
