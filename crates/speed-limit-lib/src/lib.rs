//! Speed Limit Library - Speed Estimation and Speed-Limit Resolution
//!
//! This library turns a stream of noisy GPS samples into a smoothed vehicle speed and
//! resolves the legal speed limit at the vehicle's position, so a host can raise an
//! overspeed alert.
//!
//! # Architecture
//!
//! - **[`SpeedFilter`]**: Scalar Kalman smoothing of raw GPS speed
//! - **[`FetchGate`]**: Time + distance throttle for resolution attempts
//! - **[`LocalLimitStore`]**: Per-country SQLite bounding-box lookup
//! - **[`RemoteLimitResolver`]**: Overpass mirrors and Nominatim, over two transports
//! - **[`fallback`]**: Static per-country default speed bands
//! - **[`DrivingSession`]**: The periodic loop tying everything together
//!
//! # Resolution order
//!
//! Local database → direct Overpass → direct Nominatim → rendered Overpass →
//! rendered Nominatim → country default table. The first positive limit wins; an
//! attempt that yields nothing keeps the previously known limit in effect.

pub mod collaborators;
mod driving;
pub mod fallback;
mod filter;
mod gate;
mod local_store;
mod overspeed;
pub mod remote;
mod types;
pub mod utils;

// Public API exports
pub use collaborators::{
    CountryGeocoder, EngineSettings, LocationProvider, ReportSink, SampleSender, SettingsSource,
};
pub use driving::{DrivingSession, LoopConfig, SessionState};
pub use fallback::{FallbackSpeeds, RoadClass};
pub use filter::{FilterProfile, KalmanParams, SpeedFilter};
pub use gate::{FetchGate, GateDecision};
pub use local_store::{LocalHit, LocalLimitStore, StoreError};
pub use overspeed::{AlertThrottle, OverspeedMode};
pub use remote::{
    CountryHint, PageFetcher, RadiusBands, RemoteLimitResolver, RemoteOutcome, ResolverConfig,
    TransportKind,
};
pub use types::{LimitSource, LocationSample, SpeedLimitResult, TickReport};

use std::time::Duration;

/// Error types for the engine
///
/// None of these ever reach the driving loop: every resolution step converts its
/// failure into "try the next step".
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("No usable match: {0}")]
    NoMatch(String),

    #[error("Location provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Local store error: {0}")]
    Resource(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            // reqwest does not report which of its timeouts fired
            EngineError::Network(format!("timeout: {err}"))
        } else if let Some(status) = err.status() {
            EngineError::HttpStatus {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            EngineError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Parse(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
