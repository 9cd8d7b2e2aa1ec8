use std::fmt;

/// Physical unit attached to image pixels, written to and read from `BUNIT`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum PixelUnit {
    /// Raw detector counts
    Adu,
    /// Calibrated surface brightness
    MagPerArcsec2,
    /// Anything else found in a header, kept verbatim
    Other(String),
}

impl PixelUnit {
    pub fn as_bunit(&self) -> &str {
        match self {
            PixelUnit::Adu => "adu",
            PixelUnit::MagPerArcsec2 => "mag / arcsec2",
            PixelUnit::Other(s) => s,
        }
    }

    /// Parse a `BUNIT` value. Matching ignores case and whitespace.
    pub fn from_bunit(value: &str) -> Self {
        let compact: String = value
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_lowercase();

        match compact.as_str() {
            "adu" | "count" | "counts" => PixelUnit::Adu,
            "mag/arcsec2" | "mag/arcsec**2" | "mag/arcsec^2" | "mag.arcsec-2" => {
                PixelUnit::MagPerArcsec2
            }
            _ => PixelUnit::Other(value.trim().to_string()),
        }
    }
}

impl fmt::Display for PixelUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_bunit())
    }
}
