use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;
use crate::image::CardValue;

/// Photometric band of an exposure, parsed from the FITS `FILTER` keyword.
///
/// Reference magnitudes are keyed by this enum instead of by free-form
/// column names, so an unknown band is rejected where the header is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilterBand {
    U,
    B,
    V,
    R,
    I,
    /// Gaia broad G band
    G,
}

impl FilterBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterBand::U => "U",
            FilterBand::B => "B",
            FilterBand::V => "V",
            FilterBand::R => "R",
            FilterBand::I => "I",
            FilterBand::G => "G",
        }
    }

    /// Band named by a `FILTER` card. A numeric or logical value names no
    /// band and is rejected like an unknown name.
    pub fn from_card(value: &CardValue) -> Result<Self, PipelineError> {
        match value {
            CardValue::Text(name) => name.parse(),
            other => Err(PipelineError::UnknownFilter(other.to_string())),
        }
    }

    /// Name of the reference magnitude column for this band, e.g. `V_mag`.
    pub fn column_name(&self) -> String {
        format!("{}_mag", self.as_str())
    }
}

impl fmt::Display for FilterBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterBand {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Accept "V", "v", "Johnson V", "V_mag" and the like
        let name = trimmed
            .strip_suffix("_mag")
            .unwrap_or(trimmed)
            .rsplit([' ', '-', '_'])
            .next()
            .unwrap_or("");

        match name.to_ascii_uppercase().as_str() {
            "U" => Ok(FilterBand::U),
            "B" => Ok(FilterBand::B),
            "V" => Ok(FilterBand::V),
            "R" | "RC" => Ok(FilterBand::R),
            "I" | "IC" => Ok(FilterBand::I),
            "G" => Ok(FilterBand::G),
            _ => Err(PipelineError::UnknownFilter(trimmed.to_string())),
        }
    }
}

impl TryFrom<String> for FilterBand {
    type Error = PipelineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FilterBand> for String {
    fn from(band: FilterBand) -> Self {
        band.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_band_names() {
        assert_eq!("V".parse::<FilterBand>().unwrap(), FilterBand::V);
        assert_eq!("b".parse::<FilterBand>().unwrap(), FilterBand::B);
        assert_eq!(" R ".parse::<FilterBand>().unwrap(), FilterBand::R);
    }

    #[test]
    fn test_parse_decorated_band_names() {
        assert_eq!("Johnson V".parse::<FilterBand>().unwrap(), FilterBand::V);
        assert_eq!("Cousins-Ic".parse::<FilterBand>().unwrap(), FilterBand::I);
        assert_eq!("B_mag".parse::<FilterBand>().unwrap(), FilterBand::B);
    }

    #[test]
    fn test_parse_unknown_band() {
        let err = "Halpha".parse::<FilterBand>().unwrap_err();
        assert!(matches!(err, PipelineError::UnknownFilter(name) if name == "Halpha"));
        assert!("".parse::<FilterBand>().is_err());
    }

    #[test]
    fn test_band_from_card() {
        assert_eq!(
            FilterBand::from_card(&CardValue::Text("Johnson B".to_string())).unwrap(),
            FilterBand::B
        );
        let err = FilterBand::from_card(&CardValue::Integer(1)).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownFilter(name) if name == "1"));
        assert!(FilterBand::from_card(&CardValue::Logical(true)).is_err());
    }

    #[test]
    fn test_column_name() {
        assert_eq!(FilterBand::V.column_name(), "V_mag");
        assert_eq!(FilterBand::G.column_name(), "G_mag");
    }

    #[test]
    fn test_serde_as_map_key() {
        let json = r#"{"V": 1.5, "b": 2.0}"#;
        let mags: std::collections::BTreeMap<FilterBand, f64> = serde_json::from_str(json).unwrap();
        assert_eq!(mags[&FilterBand::V], 1.5);
        assert_eq!(mags[&FilterBand::B], 2.0);
    }
}
