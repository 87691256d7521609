//! Value types shared between the engine and its collaborators

use geo::Point;
use std::fmt;
use std::time::SystemTime;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// One fix from the location provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationSample {
    /// Latitude in degrees
    pub latitude: f64,
    /// Longitude in degrees
    pub longitude: f64,
    /// Instantaneous ground speed in m/s (may be NaN when unknown)
    pub speed_mps: f64,
    /// Horizontal accuracy radius in meters (negative or NaN when unknown)
    pub accuracy_m: f64,
    /// When the fix was taken
    pub timestamp: SystemTime,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64, speed_mps: f64, accuracy_m: f64) -> Self {
        Self {
            latitude,
            longitude,
            speed_mps,
            accuracy_m,
            timestamp: SystemTime::now(),
        }
    }

    /// Position as a `geo` point (x = longitude, y = latitude)
    #[inline]
    pub fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Accuracy if the provider reported a usable one
    #[inline]
    pub fn accuracy(&self) -> Option<f64> {
        (self.accuracy_m.is_finite() && self.accuracy_m >= 0.0).then_some(self.accuracy_m)
    }
}

/// Where a speed limit came from
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum LimitSource {
    /// Nothing resolved yet
    #[default]
    None,
    /// Local per-country database (lowercase country code)
    LocalDb(String),
    /// Overpass over direct HTTP
    RawOverpass,
    /// Overpass through the rendering engine
    WebOverpass,
    /// Only a country was found, via direct HTTP
    RawGeocode(String),
    /// Only a country was found, via the rendering engine
    WebGeocode(String),
    /// Country default table (`None` when the country is unknown)
    Fallback(Option<String>),
}

impl fmt::Display for LimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::LocalDb(cc) => write!(f, "local-db:{cc}"),
            Self::RawOverpass => f.write_str("raw-overpass"),
            Self::WebOverpass => f.write_str("web-overpass"),
            Self::RawGeocode(cc) => write!(f, "raw-geocode:{cc}"),
            Self::WebGeocode(cc) => write!(f, "web-geocode:{cc}"),
            Self::Fallback(Some(cc)) => write!(f, "fallback:{cc}"),
            Self::Fallback(None) => f.write_str("fallback:unknown"),
        }
    }
}

/// Result of one resolution attempt
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpeedLimitResult {
    /// Speed measured when the attempt started, -1 if unknown
    pub measured_speed_kmh: i32,
    /// Resolved limit in km/h, -1 if unknown or none
    pub limit_kmh: i32,
    pub source: LimitSource,
}

impl SpeedLimitResult {
    /// The "nothing known" result
    pub fn none() -> Self {
        Self {
            measured_speed_kmh: -1,
            limit_kmh: -1,
            source: LimitSource::None,
        }
    }

    pub fn new(limit_kmh: i32, source: LimitSource) -> Self {
        Self {
            measured_speed_kmh: -1,
            limit_kmh,
            source,
        }
    }

    /// Whether this result carries a usable limit
    #[inline]
    pub fn has_limit(&self) -> bool {
        self.limit_kmh > 0
    }
}

impl Default for SpeedLimitResult {
    fn default() -> Self {
        Self::none()
    }
}

/// What the driving loop publishes once per tick
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TickReport {
    /// Smoothed speed, rounded
    pub speed_kmh: i32,
    /// Last known limit, -1 if none
    pub limit_kmh: i32,
    pub overspeed: bool,
    /// Accuracy of the latest fix, -1 if unknown
    pub accuracy_m: f64,
    /// Whether a fix arrived recently enough to trust the speed
    pub has_fix: bool,
    /// Whether the alert sound should play on this tick
    pub alert: bool,
    /// Provenance of `limit_kmh`
    pub source: LimitSource,
    /// Last resolved country (lowercase ISO code)
    pub country: Option<String>,
}
