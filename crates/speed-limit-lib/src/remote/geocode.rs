//! Nominatim reverse geocoding, country code only

use crate::{EngineError, Result};
use serde_json::Value;

pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org/reverse";

/// Reverse-geocode URL at a zoom level coarse enough to always resolve a country
pub fn reverse_url(base: &str, lat: f64, lon: f64) -> Result<String> {
    let url = reqwest::Url::parse_with_params(
        base,
        &[
            ("format", "jsonv2".to_string()),
            ("lat", format!("{lat:.6}")),
            ("lon", format!("{lon:.6}")),
            ("zoom", "10".to_string()),
            ("addressdetails", "1".to_string()),
        ],
    )
    .map_err(|e| EngineError::Parse(format!("invalid geocoder URL {base}: {e}")))?;
    Ok(url.into())
}

/// Lowercase `address.country_code` of a reverse-geocode response
pub fn parse_country(body: &str) -> Result<String> {
    let root: Value = serde_json::from_str(body.trim())?;
    root.pointer("/address/country_code")
        .and_then(Value::as_str)
        .map(|code| code.trim().to_ascii_lowercase())
        .filter(|code| !code.is_empty())
        .ok_or_else(|| EngineError::NoMatch("response has no country code".to_string()))
}
