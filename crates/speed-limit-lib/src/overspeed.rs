//! Overspeed decision and alert cadence

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How much above the limit counts as overspeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OverspeedMode {
    /// Tolerance as a percentage of the limit
    Percentage(u32),
    /// Tolerance as a fixed number of km/h
    Fixed(u32),
}

impl Default for OverspeedMode {
    fn default() -> Self {
        Self::Percentage(10)
    }
}

impl OverspeedMode {
    /// Highest speed still tolerated at `limit_kmh`
    ///
    /// Saturates at `i32::MAX`, so an absurd tolerance means "never overspeed".
    pub fn threshold(&self, limit_kmh: i32) -> i32 {
        let limit = i64::from(limit_kmh);
        let tolerance = match *self {
            // Integer math: 10% of 55 tolerates 5, not 5.5
            Self::Percentage(pct) => limit * i64::from(pct) / 100,
            Self::Fixed(kmh) => i64::from(kmh),
        };
        (limit + tolerance).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
    }

    /// Overspeed means strictly above the threshold; an unknown limit never is
    pub fn is_overspeed(&self, limit_kmh: i32, speed_kmh: i32) -> bool {
        limit_kmh > 0 && speed_kmh > self.threshold(limit_kmh)
    }
}

impl fmt::Display for OverspeedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percentage(pct) => write!(f, "{pct}%"),
            Self::Fixed(kmh) => write!(f, "+{kmh}"),
        }
    }
}

/// Parses `"10%"` as a percentage and `"5"` or `"+5"` as a fixed offset
impl FromStr for OverspeedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let parse = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| format!("invalid overspeed tolerance: {s:?}"))
        };
        match s.strip_suffix('%') {
            Some(pct) => parse(pct).map(Self::Percentage),
            None => parse(s.strip_prefix('+').unwrap_or(s)).map(Self::Fixed),
        }
    }
}

/// Rate limit for the audible alert while overspeed persists
///
/// Fires on the first overspeed tick, then at most once per `interval`; the cadence
/// restarts as soon as the vehicle is back under the threshold.
#[derive(Debug, Clone)]
pub struct AlertThrottle {
    interval: Duration,
    last_alert: Option<Instant>,
}

impl AlertThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_alert: None,
        }
    }

    /// Whether to alert on this tick
    pub fn should_alert(&mut self, now: Instant, overspeed: bool) -> bool {
        if !overspeed {
            self.last_alert = None;
            return false;
        }
        match self.last_alert {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_alert = Some(now);
                true
            }
        }
    }
}
