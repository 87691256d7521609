//! Remote speed-limit resolution
//!
//! Online fallback chain used when the local database has nothing for a position:
//!
//! 1. Overpass "ways" query over direct HTTP, each mirror in turn
//! 2. Nominatim reverse geocode over direct HTTP (country only)
//! 3. Overpass "ways" query through the rendering engine
//! 4. Nominatim reverse geocode through the rendering engine
//!
//! The first positive limit ends the chain. A country answer is remembered and the
//! chain continues, since a country alone carries no limit. The geocode steps are
//! skipped when the caller already knows the country or has already asked for it
//! (see [`CountryHint`]).

pub mod geocode;
pub mod overpass;
pub mod transport;

pub use overpass::{RadiusBands, WayMatch};
pub use transport::{DirectHttpFetcher, PageFetcher, RenderedPageFetcher};

use crate::types::LimitSource;
use crate::{EngineError, Result};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// How a remote request reaches the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TransportKind {
    /// Plain HTTP client
    Direct,
    /// Headless rendering engine
    Rendered,
}

impl TransportKind {
    pub fn all() -> [Self; 2] {
        [Self::Direct, Self::Rendered]
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => f.write_str("direct"),
            Self::Rendered => f.write_str("rendered"),
        }
    }
}

/// Configuration of the remote chain
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ResolverConfig {
    /// Overpass interpreter endpoints, tried in order
    pub mirrors: Vec<String>,
    /// Nominatim `reverse` endpoint
    pub geocoder_url: String,
    /// Nearest way vertex must be at most this far away (meters)
    pub max_accept_distance_m: f64,
    pub radius: RadiusBands,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Wall-clock bound on one rendered page load
    pub render_timeout: Duration,
    /// Rendering engine binary; searched on `PATH` when `None`
    pub browser: Option<PathBuf>,
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mirrors: overpass::DEFAULT_MIRRORS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            geocoder_url: geocode::DEFAULT_GEOCODER_URL.to_string(),
            max_accept_distance_m: 35.0,
            radius: RadiusBands::default(),
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            render_timeout: Duration::from_secs(8),
            browser: None,
            user_agent: format!("SpeedAlert/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// What one pass through the remote chain produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    /// Limit in km/h, -1 when no way matched
    pub limit_kmh: i32,
    pub source: LimitSource,
    /// Country known after the pass (given by the caller or geocoded)
    pub country: Option<String>,
}

impl RemoteOutcome {
    #[inline]
    pub fn has_limit(&self) -> bool {
        self.limit_kmh > 0
    }
}

/// What the caller already knows about the country before the chain runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountryHint<'a> {
    /// Not looked up yet; the chain geocodes between its ways steps
    Unknown,
    /// Already resolved
    Known(&'a str),
    /// Already asked over every transport without an answer
    Unavailable,
}

impl CountryHint<'_> {
    fn needs_geocode(&self) -> bool {
        matches!(self, CountryHint::Unknown)
    }
}

/// Remote limit resolver over two interchangeable transports
pub struct RemoteLimitResolver {
    config: ResolverConfig,
    direct: Arc<dyn PageFetcher>,
    rendered: Arc<dyn PageFetcher>,
}

impl fmt::Debug for RemoteLimitResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteLimitResolver")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RemoteLimitResolver {
    /// Resolver with the real HTTP client and the detected rendering engine
    pub fn new(config: ResolverConfig) -> Result<Self> {
        let direct = DirectHttpFetcher::new(
            config.connect_timeout,
            config.read_timeout,
            &config.user_agent,
        )?;
        let rendered = RenderedPageFetcher::detect(config.browser.clone(), config.render_timeout);
        Ok(Self::with_fetchers(
            config,
            Arc::new(direct),
            Arc::new(rendered),
        ))
    }

    /// Resolver with caller-provided transports
    pub fn with_fetchers(
        config: ResolverConfig,
        direct: Arc<dyn PageFetcher>,
        rendered: Arc<dyn PageFetcher>,
    ) -> Self {
        Self {
            config,
            direct,
            rendered,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    fn fetcher(&self, kind: TransportKind) -> &dyn PageFetcher {
        match kind {
            TransportKind::Direct => self.direct.as_ref(),
            TransportKind::Rendered => self.rendered.as_ref(),
        }
    }

    /// Search radius for a fix with the given accuracy
    pub fn search_radius(&self, accuracy_m: Option<f64>) -> u32 {
        self.config.radius.radius_for(accuracy_m)
    }

    /// Run the whole chain at a position
    ///
    /// Never fails: every step's error is logged and the next step is tried.
    pub async fn resolve(
        &self,
        lat: f64,
        lon: f64,
        accuracy_m: Option<f64>,
        hint: CountryHint<'_>,
    ) -> RemoteOutcome {
        profiling::scope!("remote_resolve");
        let mut country = match hint {
            CountryHint::Known(code) => Some(code.to_ascii_lowercase()),
            CountryHint::Unknown | CountryHint::Unavailable => None,
        };
        let mut geocoded: Option<TransportKind> = None;

        for kind in TransportKind::all() {
            match self.probe_ways(kind, lat, lon, accuracy_m).await {
                Ok(found) => {
                    tracing::debug!(
                        "{kind} overpass: {} km/h at {:.1}m",
                        found.limit_kmh,
                        found.distance_m
                    );
                    let source = match kind {
                        TransportKind::Direct => LimitSource::RawOverpass,
                        TransportKind::Rendered => LimitSource::WebOverpass,
                    };
                    return RemoteOutcome {
                        limit_kmh: found.limit_kmh,
                        source,
                        country,
                    };
                }
                Err(e) => tracing::debug!("{kind} overpass failed: {e}"),
            }

            if hint.needs_geocode() && country.is_none() {
                match self.probe_country(kind, lat, lon).await {
                    Ok(code) => {
                        tracing::debug!("{kind} geocode: {code}");
                        country = Some(code);
                        geocoded = Some(kind);
                    }
                    Err(e) => tracing::debug!("{kind} geocode failed: {e}"),
                }
            }
        }

        let source = match (geocoded, &country) {
            (Some(TransportKind::Direct), Some(code)) => LimitSource::RawGeocode(code.clone()),
            (Some(TransportKind::Rendered), Some(code)) => LimitSource::WebGeocode(code.clone()),
            _ => LimitSource::None,
        };
        RemoteOutcome {
            limit_kmh: -1,
            source,
            country,
        }
    }

    /// One "ways" step: every mirror in order over one transport
    pub async fn probe_ways(
        &self,
        kind: TransportKind,
        lat: f64,
        lon: f64,
        accuracy_m: Option<f64>,
    ) -> Result<WayMatch> {
        let query = overpass::build_query(lat, lon, self.search_radius(accuracy_m));
        let fetcher = self.fetcher(kind);
        let mut last_error = EngineError::NoMatch("no mirrors configured".to_string());

        for mirror in &self.config.mirrors {
            let attempt = async {
                let url = overpass::ways_url(mirror, &query)?;
                let body = fetcher.fetch(&url).await?;
                overpass::parse_ways(&body, lat, lon, self.config.max_accept_distance_m)
            };
            match attempt.await {
                Ok(found) => return Ok(found),
                Err(e) => {
                    tracing::debug!("{kind} mirror {mirror}: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    /// One geocode step over one transport
    pub async fn probe_country(&self, kind: TransportKind, lat: f64, lon: f64) -> Result<String> {
        let url = geocode::reverse_url(&self.config.geocoder_url, lat, lon)?;
        let body = self.fetcher(kind).fetch(&url).await?;
        geocode::parse_country(&body)
    }

    /// Unparsed response of the first mirror, for diagnostics
    pub async fn raw_ways_response(
        &self,
        kind: TransportKind,
        lat: f64,
        lon: f64,
        accuracy_m: Option<f64>,
    ) -> Result<String> {
        let mirror = self
            .config
            .mirrors
            .first()
            .ok_or_else(|| EngineError::NoMatch("no mirrors configured".to_string()))?;
        let query = overpass::build_query(lat, lon, self.search_radius(accuracy_m));
        let url = overpass::ways_url(mirror, &query)?;
        self.fetcher(kind).fetch(&url).await
    }
}
