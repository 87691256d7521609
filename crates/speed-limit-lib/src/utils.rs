//! Utility functions for great-circle distances and speed unit conversions

use geo::Point;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per second to kilometers per hour
const MPS_TO_KMH: f64 = 3.6;

/// Kilometers per hour to miles per hour
const KMH_TO_MPH: f64 = 0.621_371;

/// Highest raw speed accepted from a location provider, in km/h
///
/// Anything above is treated as a GPS glitch and clamped.
pub const MAX_PLAUSIBLE_SPEED_KMH: f64 = 400.0;

/// Great-circle distance between two WGS84 coordinates in meters
///
/// # Arguments
/// * `lat1`, `lon1` - First coordinate in degrees
/// * `lat2`, `lon2` - Second coordinate in degrees
///
/// # Returns
/// The haversine distance in meters (0 for identical points)
#[inline]
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (delta_lon / 2.0).sin().powi(2);
    // Rounding can push `a` a hair above 1 for antipodal points
    let a = a.clamp(0.0, 1.0);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

/// Haversine distance between two `geo` points (x = longitude, y = latitude)
#[inline]
pub fn haversine_points(a: Point<f64>, b: Point<f64>) -> f64 {
    haversine_meters(a.y(), a.x(), b.y(), b.x())
}

/// Convert meters per second to kilometers per hour
#[inline(always)]
pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * MPS_TO_KMH
}

/// Convert kilometers per hour to miles per hour
#[inline(always)]
pub fn kmh_to_mph(kmh: f64) -> f64 {
    kmh * KMH_TO_MPH
}

/// Convert miles per hour to kilometers per hour
#[inline(always)]
pub fn mph_to_kmh(mph: f64) -> f64 {
    mph / KMH_TO_MPH
}

/// Clamp a raw speed to a finite value in `0..=MAX_PLAUSIBLE_SPEED_KMH`
///
/// Location providers report NaN or negative speeds when they have no velocity
/// solution; the smoothing filter must never see those.
#[inline]
pub fn sanitize_speed_kmh(raw_kmh: f64) -> f64 {
    if raw_kmh.is_finite() {
        raw_kmh.clamp(0.0, MAX_PLAUSIBLE_SPEED_KMH)
    } else {
        0.0
    }
}
