//! Overpass "ways" queries and their JSON responses

use crate::utils;
use crate::{EngineError, Result};
use serde_json::Value;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Public Overpass API mirrors, tried in order
pub const DEFAULT_MIRRORS: [&str; 4] = [
    "https://overpass.kumi.systems/api/interpreter",
    "https://overpass-api.de/api/interpreter",
    "https://overpass.openstreetmap.fr/api/interpreter",
    "https://overpass.nchc.org.tw/api/interpreter",
];

/// Highway types that never carry a limit relevant to a car
const EXCLUDED_HIGHWAYS: &str =
    "cycleway|footway|path|track|service|bridleway|steps|living_street|pedestrian";

/// Hard bounds of the search radius in meters
pub const MIN_RADIUS_M: u32 = 7;
pub const MAX_RADIUS_M: u32 = 25;

/// Search radius per accuracy band
///
/// A fix with accuracy ≤ `precise_accuracy_m` searches `precise_m` around it, and so
/// on; anything worse (or unknown) searches `coarse_m`. All radii are clamped to
/// [`MIN_RADIUS_M`]..=[`MAX_RADIUS_M`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RadiusBands {
    pub precise_accuracy_m: f64,
    pub precise_m: u32,
    pub good_accuracy_m: f64,
    pub good_m: u32,
    pub fair_accuracy_m: f64,
    pub fair_m: u32,
    pub coarse_m: u32,
}

impl Default for RadiusBands {
    fn default() -> Self {
        Self {
            precise_accuracy_m: 2.5,
            precise_m: 10,
            good_accuracy_m: 5.0,
            good_m: 15,
            fair_accuracy_m: 10.0,
            fair_m: 20,
            coarse_m: 25,
        }
    }
}

impl RadiusBands {
    /// Search radius in meters for a fix with the given accuracy
    pub fn radius_for(&self, accuracy_m: Option<f64>) -> u32 {
        let radius = match accuracy_m {
            Some(acc) if acc <= self.precise_accuracy_m => self.precise_m,
            Some(acc) if acc <= self.good_accuracy_m => self.good_m,
            Some(acc) if acc <= self.fair_accuracy_m => self.fair_m,
            _ => self.coarse_m,
        };
        radius.clamp(MIN_RADIUS_M, MAX_RADIUS_M)
    }
}

/// Overpass QL for all car-relevant ways with a `maxspeed` tag around a point
pub fn build_query(lat: f64, lon: f64, radius_m: u32) -> String {
    format!(
        "[out:json][timeout:5];\
         way(around:{radius_m},{lat:.6},{lon:.6})[\"highway\"][\"maxspeed\"]\
         [highway!~\"^({EXCLUDED_HIGHWAYS})$\"];\
         out tags geom;"
    )
}

/// Full request URL for a query against one mirror
pub fn ways_url(server: &str, query: &str) -> Result<String> {
    let url = reqwest::Url::parse_with_params(server, &[("data", query)])
        .map_err(|e| EngineError::Parse(format!("invalid mirror URL {server}: {e}")))?;
    Ok(url.into())
}

/// Parse an OSM `maxspeed` value into km/h
///
/// Takes the leading integer; `"30 mph"` is converted. Symbolic values (`none`,
/// `signals`, `walk`, `DE:urban`, ...) have no number and yield `None`.
pub fn parse_maxspeed(raw: &str) -> Option<i32> {
    let raw = raw.trim();
    let digits_end = raw
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(raw.len());
    let value: i32 = raw[..digits_end].parse().ok()?;
    if value <= 0 {
        return None;
    }

    let unit = raw[digits_end..].trim().to_ascii_lowercase();
    if unit.starts_with("mph") {
        Some(utils::mph_to_kmh(f64::from(value)).round() as i32)
    } else {
        Some(value)
    }
}

/// The way vertex closest to the query point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WayMatch {
    pub limit_kmh: i32,
    pub distance_m: f64,
    pub way_id: Option<i64>,
}

/// Pick the limit of the way with the vertex nearest to `(lat, lon)`
///
/// Elements without a numeric `maxspeed` or without geometry are skipped. A body
/// that is not JSON is a [`EngineError::Parse`]; no candidate at all, or a nearest
/// vertex beyond `max_accept_m`, is a [`EngineError::NoMatch`].
pub fn parse_ways(body: &str, lat: f64, lon: f64, max_accept_m: f64) -> Result<WayMatch> {
    let root: Value = serde_json::from_str(body.trim())?;
    let elements = root
        .get("elements")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::Parse("response has no elements array".to_string()))?;

    let mut best: Option<WayMatch> = None;
    for element in elements {
        let Some(limit_kmh) = element
            .pointer("/tags/maxspeed")
            .and_then(Value::as_str)
            .and_then(parse_maxspeed)
        else {
            continue;
        };
        let Some(geometry) = element.get("geometry").and_then(Value::as_array) else {
            continue;
        };

        for vertex in geometry {
            let (Some(v_lat), Some(v_lon)) = (
                vertex.get("lat").and_then(Value::as_f64),
                vertex.get("lon").and_then(Value::as_f64),
            ) else {
                continue;
            };
            let distance_m = utils::haversine_meters(lat, lon, v_lat, v_lon);
            if best.is_none_or(|b| distance_m < b.distance_m) {
                best = Some(WayMatch {
                    limit_kmh,
                    distance_m,
                    way_id: element.get("id").and_then(Value::as_i64),
                });
            }
        }
    }

    match best {
        Some(found) if found.distance_m <= max_accept_m => Ok(found),
        Some(found) => Err(EngineError::NoMatch(format!(
            "nearest way is {:.1}m away (limit {:.0}m)",
            found.distance_m, max_accept_m
        ))),
        None => Err(EngineError::NoMatch(
            "no way with a numeric maxspeed".to_string(),
        )),
    }
}
