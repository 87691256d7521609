//! Time + distance throttle for speed-limit resolution attempts

use crate::utils;
use geo::Point;
use std::time::{Duration, Instant};

/// Outcome of a gate check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GateDecision {
    /// A new attempt may start; the gate has recorded it
    Open,
    /// Less than the minimum interval has elapsed since the last attempt
    TooSoon { elapsed: Duration },
    /// The vehicle has not moved far enough since the last attempt
    TooClose { moved_m: f64 },
}

impl GateDecision {
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Gate deciding when a new resolution attempt may start
///
/// Both conditions must hold: at least `min_interval` since the last accepted
/// attempt and at least `min_distance_m` from where it was made. Without a
/// previous attempt the gate is open.
#[derive(Debug, Clone)]
pub struct FetchGate {
    last_fetch_at: Option<Instant>,
    last_fetch_location: Option<Point<f64>>,
    min_interval: Duration,
    min_distance_m: f64,
}

impl FetchGate {
    pub fn new(min_interval: Duration, min_distance_m: f64) -> Self {
        Self {
            last_fetch_at: None,
            last_fetch_location: None,
            min_interval,
            min_distance_m: min_distance_m.max(0.0),
        }
    }

    /// Check the gate for a sample at `location` (x = lon, y = lat) taken at `now`
    ///
    /// An `Open` decision records `now` and `location` as the last attempt.
    pub fn check(&mut self, now: Instant, location: Point<f64>) -> GateDecision {
        if let Some(last_at) = self.last_fetch_at {
            let elapsed = now.saturating_duration_since(last_at);
            if elapsed < self.min_interval {
                return GateDecision::TooSoon { elapsed };
            }
        }

        if let Some(last_location) = self.last_fetch_location {
            let moved_m = utils::haversine_points(last_location, location);
            if moved_m < self.min_distance_m {
                return GateDecision::TooClose { moved_m };
            }
        }

        self.last_fetch_at = Some(now);
        self.last_fetch_location = Some(location);
        GateDecision::Open
    }

    /// Update the thresholds (settings may change while driving)
    pub fn set_thresholds(&mut self, min_interval: Duration, min_distance_m: f64) {
        self.min_interval = min_interval;
        self.min_distance_m = min_distance_m.max(0.0);
    }

    /// Forget the last attempt so the next check opens
    pub fn reset(&mut self) {
        self.last_fetch_at = None;
        self.last_fetch_location = None;
    }

    pub fn last_fetch_location(&self) -> Option<Point<f64>> {
        self.last_fetch_location
    }
}
