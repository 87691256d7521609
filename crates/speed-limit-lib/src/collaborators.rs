//! Interfaces to the host: where samples come from, where reports go, and where
//! settings live

use crate::filter::FilterProfile;
use crate::overspeed::OverspeedMode;
use crate::types::{LocationSample, TickReport};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Handle a location provider uses to hand fixes to the engine
///
/// Only the newest sample is kept; the engine reads it once per tick.
#[derive(Debug, Clone)]
pub struct SampleSender {
    inner: watch::Sender<Option<LocationSample>>,
}

impl SampleSender {
    pub fn new(inner: watch::Sender<Option<LocationSample>>) -> Self {
        Self { inner }
    }

    /// Replace the latest sample
    pub fn send(&self, sample: LocationSample) {
        self.inner.send_replace(Some(sample));
    }

    /// Whether the session that owns the receiving end is gone
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Source of location fixes
pub trait LocationProvider: Send {
    /// Begin delivering fixes roughly every `interval_hint` through `sender`
    fn start(&mut self, interval_hint: Duration, sender: SampleSender) -> Result<()>;

    fn stop(&mut self);

    /// Re-register after the stream went stale
    fn restart(&mut self) -> Result<()>;
}

/// Engine-relevant user settings
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EngineSettings {
    pub filter_profile: FilterProfile,
    /// Minimum time between two resolution attempts
    pub fetch_interval: Duration,
    /// Minimum distance between two resolution attempts
    pub min_fetch_distance_m: f64,
    pub overspeed: OverspeedMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            filter_profile: FilterProfile::default(),
            fetch_interval: Duration::from_secs(4),
            min_fetch_distance_m: 10.0,
            overspeed: OverspeedMode::default(),
        }
    }
}

/// Where the engine reads its settings from (once per tick)
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> EngineSettings;
}

/// Fixed settings
impl SettingsSource for EngineSettings {
    fn snapshot(&self) -> EngineSettings {
        self.clone()
    }
}

/// Optional platform geocoder, consulted before the remote one
#[async_trait]
pub trait CountryGeocoder: Send + Sync {
    async fn country_code(&self, lat: f64, lon: f64) -> Option<String>;
}

/// Receiver of per-tick reports (overlay, console, ...)
///
/// Called from the tick task; must not block.
pub trait ReportSink: Send + Sync {
    fn publish(&self, report: &TickReport);
}
