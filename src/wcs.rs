/// World Coordinate System support for plate-solved frames.
///
/// Gnomonic (TAN) projection with optional SIP forward distortion, which is
/// what astrometry.net writes into its solved files.
use nalgebra::{Matrix2, Vector2};

use crate::error::{PipelineError, Result};
use crate::image::{CardValue, FitsHeader};

const ARCSEC_PER_DEG: f64 = 3600.0;

/// SIP polynomial distortion terms (`A_p_q`, `B_p_q`).
#[derive(Debug, Clone, PartialEq)]
pub struct Sip {
    pub a: Vec<(u32, u32, f64)>,
    pub b: Vec<(u32, u32, f64)>,
}

impl Sip {
    fn from_header(header: &FitsHeader) -> Option<Sip> {
        let a_order = header.get_i64("A_ORDER")?;
        let b_order = header.get_i64("B_ORDER")?;
        Some(Sip {
            a: Self::read_terms(header, "A", a_order),
            b: Self::read_terms(header, "B", b_order),
        })
    }

    fn read_terms(header: &FitsHeader, prefix: &str, order: i64) -> Vec<(u32, u32, f64)> {
        let order = order.max(0) as u32;
        let mut terms = Vec::new();
        for p in 0..=order {
            for q in 0..=(order - p) {
                if let Some(coeff) = header.get_f64(&format!("{}_{}_{}", prefix, p, q)) {
                    if coeff != 0.0 {
                        terms.push((p, q, coeff));
                    }
                }
            }
        }
        terms
    }

    fn order(terms: &[(u32, u32, f64)]) -> u32 {
        terms.iter().map(|(p, q, _)| p + q).max().unwrap_or(0)
    }

    /// Distorted offsets `(u + f(u, v), v + g(u, v))`.
    fn apply(&self, u: f64, v: f64) -> (f64, f64) {
        let poly = |terms: &[(u32, u32, f64)]| {
            terms
                .iter()
                .map(|&(p, q, c)| c * u.powi(p as i32) * v.powi(q as i32))
                .sum::<f64>()
        };
        (u + poly(&self.a), v + poly(&self.b))
    }
}

/// Astrometric solution of an image.
#[derive(Debug, Clone, PartialEq)]
pub struct Wcs {
    /// Reference pixel, 1-based FITS convention
    pub crpix: Vector2<f64>,
    /// Reference sky position (RA, Dec) in degrees
    pub crval: Vector2<f64>,
    /// Linear transform from pixel offsets to intermediate world coordinates (deg)
    pub cd: Matrix2<f64>,
    pub sip: Option<Sip>,
}

impl Wcs {
    pub fn new(crpix: (f64, f64), crval: (f64, f64), cd: [[f64; 2]; 2]) -> Self {
        Self {
            crpix: Vector2::new(crpix.0, crpix.1),
            crval: Vector2::new(crval.0, crval.1),
            cd: Matrix2::new(cd[0][0], cd[0][1], cd[1][0], cd[1][1]),
            sip: None,
        }
    }

    /// North-up, east-left solution with square pixels of `scale_deg` rotated by
    /// `rotation_deg` (north through east).
    pub fn from_scale_rotation(
        crpix: (f64, f64),
        crval: (f64, f64),
        scale_deg: f64,
        rotation_deg: f64,
    ) -> Self {
        let (sin_r, cos_r) = rotation_deg.to_radians().sin_cos();
        Self::new(
            crpix,
            crval,
            [
                [-scale_deg * cos_r, scale_deg * sin_r],
                [scale_deg * sin_r, scale_deg * cos_r],
            ],
        )
    }

    /// Parse a TAN solution from header keywords.
    ///
    /// Returns `Ok(None)` when the header carries no WCS at all. The linear
    /// part is taken from `CDi_j`, else `PCi_j` scaled by `CDELTi`, else
    /// `CDELTi` with `CROTA2`.
    pub fn from_header(header: &FitsHeader) -> Result<Option<Wcs>> {
        let (ctype1, ctype2) = match (header.get_str("CTYPE1"), header.get_str("CTYPE2")) {
            (Some(c1), Some(c2)) => (c1.trim().to_string(), c2.trim().to_string()),
            _ => return Ok(None),
        };

        if !ctype1.starts_with("RA--") || !ctype2.starts_with("DEC-") {
            return Err(PipelineError::InvalidWcs(format!(
                "unsupported celestial axes {} / {}",
                ctype1, ctype2
            )));
        }
        if !ctype1.contains("-TAN") || !ctype2.contains("-TAN") {
            return Err(PipelineError::InvalidWcs(format!(
                "unsupported projection {} / {}",
                ctype1, ctype2
            )));
        }

        let require = |key: &str| {
            header
                .get_f64(key)
                .ok_or_else(|| PipelineError::InvalidWcs(format!("missing {}", key)))
        };

        let crpix = Vector2::new(require("CRPIX1")?, require("CRPIX2")?);
        let crval = Vector2::new(require("CRVAL1")?, require("CRVAL2")?);
        let cd = Self::linear_transform(header)?;

        if cd.determinant().abs() < 1e-20 {
            return Err(PipelineError::InvalidWcs("singular CD matrix".to_string()));
        }

        let sip = if ctype1.ends_with("-SIP") {
            Sip::from_header(header)
        } else {
            None
        };

        Ok(Some(Wcs {
            crpix,
            crval,
            cd,
            sip,
        }))
    }

    fn linear_transform(header: &FitsHeader) -> Result<Matrix2<f64>> {
        let cd_keys = ["CD1_1", "CD1_2", "CD2_1", "CD2_2"];
        if cd_keys.iter().any(|k| header.contains(k)) {
            let v: Vec<f64> = cd_keys
                .iter()
                .map(|k| header.get_f64(k).unwrap_or(0.0))
                .collect();
            return Ok(Matrix2::new(v[0], v[1], v[2], v[3]));
        }

        let cdelt1 = header.get_f64("CDELT1");
        let cdelt2 = header.get_f64("CDELT2");
        let (cdelt1, cdelt2) = match (cdelt1, cdelt2) {
            (Some(c1), Some(c2)) => (c1, c2),
            _ => {
                return Err(PipelineError::InvalidWcs(
                    "neither CDi_j nor CDELTi keywords present".to_string(),
                ))
            }
        };
        let pc_keys = ["PC1_1", "PC1_2", "PC2_1", "PC2_2"];
        if pc_keys.iter().any(|k| header.contains(k)) {
            let identity = [1.0, 0.0, 0.0, 1.0];
            let v: Vec<f64> = pc_keys
                .iter()
                .zip(identity)
                .map(|(k, default)| header.get_f64(k).unwrap_or(default))
                .collect();
            let scale = Matrix2::new(cdelt1, 0.0, 0.0, cdelt2);
            return Ok(scale * Matrix2::new(v[0], v[1], v[2], v[3]));
        }

        let (sin_r, cos_r) = header
            .get_f64("CROTA2")
            .unwrap_or(0.0)
            .to_radians()
            .sin_cos();
        Ok(Matrix2::new(
            cdelt1 * cos_r,
            -cdelt2 * sin_r,
            cdelt1 * sin_r,
            cdelt2 * cos_r,
        ))
    }

    /// Convert 0-based pixel coordinates to (RA, Dec) in degrees.
    pub fn pixel_to_sky(&self, x: f64, y: f64) -> (f64, f64) {
        let mut u = x + 1.0 - self.crpix.x;
        let mut v = y + 1.0 - self.crpix.y;
        if let Some(sip) = &self.sip {
            (u, v) = sip.apply(u, v);
        }

        let intermediate = self.cd * Vector2::new(u, v);
        let xi = intermediate.x.to_radians();
        let eta = intermediate.y.to_radians();

        let ra0 = self.crval.x.to_radians();
        let (sin_dec0, cos_dec0) = self.crval.y.to_radians().sin_cos();
        let denom = cos_dec0 - eta * sin_dec0;

        let ra = ra0 + xi.atan2(denom);
        let dec = (sin_dec0 + eta * cos_dec0).atan2((xi * xi + denom * denom).sqrt());

        (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    /// Convert (RA, Dec) in degrees to 0-based pixel coordinates through the
    /// linear part of the solution. `None` for positions on the far side of the
    /// tangent plane.
    pub fn sky_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        let (sin_dec, cos_dec) = dec.to_radians().sin_cos();
        let (sin_dec0, cos_dec0) = self.crval.y.to_radians().sin_cos();
        let (sin_dra, cos_dra) = (ra - self.crval.x).to_radians().sin_cos();

        let d = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_dra;
        if d <= 0.0 {
            return None;
        }

        let xi = (cos_dec * sin_dra / d).to_degrees();
        let eta = ((sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_dra) / d).to_degrees();

        let offset = self.cd.try_inverse()? * Vector2::new(xi, eta);
        Some((
            offset.x + self.crpix.x - 1.0,
            offset.y + self.crpix.y - 1.0,
        ))
    }

    /// Pixel scale along each image axis in degrees per pixel, from the
    /// column norms of the CD matrix.
    pub fn proj_plane_pixel_scales(&self) -> (f64, f64) {
        (self.cd.column(0).norm(), self.cd.column(1).norm())
    }

    /// Solid angle of one pixel in square arcseconds.
    pub fn pixel_area_arcsec2(&self) -> f64 {
        crate::photometry::pixel_area_arcsec2(self.proj_plane_pixel_scales())
    }

    /// Mean pixel scale in arcseconds.
    pub fn pixel_scale_arcsec(&self) -> f64 {
        let (sx, sy) = self.proj_plane_pixel_scales();
        (sx + sy) / 2.0 * ARCSEC_PER_DEG
    }

    /// Write the solution into `header`, replacing any WCS already there.
    pub fn write_header(&self, header: &mut FitsHeader) {
        strip_wcs_keys(header);

        let suffix = if self.sip.is_some() { "-SIP" } else { "" };
        header.set("WCSAXES", CardValue::Integer(2));
        header.set("CTYPE1", CardValue::Text(format!("RA---TAN{}", suffix)));
        header.set("CTYPE2", CardValue::Text(format!("DEC--TAN{}", suffix)));
        header.set("CUNIT1", CardValue::Text("deg".to_string()));
        header.set("CUNIT2", CardValue::Text("deg".to_string()));
        header.set("CRPIX1", CardValue::Real(self.crpix.x));
        header.set("CRPIX2", CardValue::Real(self.crpix.y));
        header.set("CRVAL1", CardValue::Real(self.crval.x));
        header.set("CRVAL2", CardValue::Real(self.crval.y));
        header.set("CD1_1", CardValue::Real(self.cd[(0, 0)]));
        header.set("CD1_2", CardValue::Real(self.cd[(0, 1)]));
        header.set("CD2_1", CardValue::Real(self.cd[(1, 0)]));
        header.set("CD2_2", CardValue::Real(self.cd[(1, 1)]));

        if let Some(sip) = &self.sip {
            for (prefix, terms) in [("A", &sip.a), ("B", &sip.b)] {
                header.set(
                    &format!("{}_ORDER", prefix),
                    CardValue::Integer(Sip::order(terms) as i64),
                );
                for &(p, q, coeff) in terms {
                    header.set(&format!("{}_{}_{}", prefix, p, q), CardValue::Real(coeff));
                }
            }
        }
    }
}

/// Whether `key` belongs to a celestial WCS description.
pub fn is_wcs_key(key: &str) -> bool {
    const PREFIXES: [&str; 10] = [
        "CTYPE", "CRPIX", "CRVAL", "CDELT", "CUNIT", "CROTA", "CD1_", "CD2_", "PC1_", "PC2_",
    ];
    const SIP: [&str; 4] = ["A_", "B_", "AP_", "BP_"];

    key == "WCSAXES"
        || key == "LONPOLE"
        || key == "LATPOLE"
        || key == "EQUINOX"
        || key == "RADESYS"
        || PREFIXES.iter().any(|p| key.starts_with(p))
        || SIP.iter().any(|p| key.starts_with(p))
}

/// Remove every WCS keyword from `header`.
pub fn strip_wcs_keys(header: &mut FitsHeader) {
    header.retain_keys(|k| !is_wcs_key(k));
}

/// Great-circle distance between two sky positions, all in degrees.
pub fn angular_separation_deg(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1, ra2, dec2) = (
        ra1.to_radians(),
        dec1.to_radians(),
        ra2.to_radians(),
        dec2.to_radians(),
    );
    let sin_ddec = ((dec2 - dec1) / 2.0).sin();
    let sin_dra = ((ra2 - ra1) / 2.0).sin();
    let h = sin_ddec * sin_ddec + dec1.cos() * dec2.cos() * sin_dra * sin_dra;
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}
