//! The driving loop
//!
//! A [`DrivingSession`] owns everything that lives for one drive: the smoothing
//! filter, the fetch gate, the last known limit and the tick task. Once per tick the
//! loop reads the newest location sample, possibly starts a resolution attempt,
//! updates the smoothed speed, checks the provider for staleness and publishes a
//! [`TickReport`].
//!
//! Resolution attempts run as separate tasks, at most one at a time: the fetch gate
//! stays closed while an attempt is running within its budget. The network part of an
//! attempt is bounded by that budget and falls back to the country defaults when it
//! runs out. An attempt that overruns anyway is aborted by the next one, and a
//! generation counter makes sure its late result is never applied.

use crate::collaborators::{
    CountryGeocoder, EngineSettings, LocationProvider, ReportSink, SampleSender, SettingsSource,
};
use crate::fallback;
use crate::filter::{FilterProfile, SpeedFilter};
use crate::gate::FetchGate;
use crate::local_store::LocalLimitStore;
use crate::overspeed::AlertThrottle;
use crate::remote::{CountryHint, RemoteLimitResolver, TransportKind};
use crate::types::{LimitSource, LocationSample, SpeedLimitResult, TickReport};
use crate::utils;
use crate::Result;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Timing of the driving loop
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LoopConfig {
    /// Period of the tick task
    pub tick_interval: Duration,
    /// Restart the location provider after this long without a fix
    pub staleness_threshold: Duration,
    /// A fix older than this no longer counts as "has fix"
    pub fix_timeout: Duration,
    /// Minimum time between two audible alerts while overspeed persists
    pub alert_interval: Duration,
    /// Update interval requested from the location provider
    pub location_interval: Duration,
    /// Upper bound on the network part of one resolution attempt
    pub attempt_budget: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            staleness_threshold: Duration::from_secs(15),
            fix_timeout: Duration::from_secs(5),
            alert_interval: Duration::from_secs(10),
            location_interval: Duration::from_secs(1),
            attempt_budget: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Running,
}

/// State shared between the tick task and resolution attempts
#[derive(Debug)]
struct SessionShared {
    last_limit: Mutex<SpeedLimitResult>,
    country: Mutex<Option<String>>,
    generation: AtomicU64,
    /// Latest smoothed speed, for the fallback road class
    speed_kmh: AtomicI32,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            last_limit: Mutex::new(SpeedLimitResult::none()),
            country: Mutex::new(None),
            generation: AtomicU64::new(0),
            speed_kmh: AtomicI32::new(0),
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Publish a country as soon as attempt `generation` knows it
    fn note_country(&self, generation: u64, code: &str) {
        if self.is_current(generation) {
            *self.country.lock().unwrap_or_else(PoisonError::into_inner) = Some(code.to_string());
        }
    }

    fn last_limit(&self) -> SpeedLimitResult {
        self.last_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn country(&self) -> Option<String> {
        self.country
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store the result of attempt `generation`
    ///
    /// Results of superseded attempts are dropped. Only a positive limit replaces the
    /// last known one; a resolved country is always kept.
    fn apply(&self, generation: u64, result: SpeedLimitResult, country: Option<String>) -> bool {
        if !self.is_current(generation) {
            tracing::debug!("Dropping result of superseded attempt {}", generation);
            return false;
        }
        if country.is_some() {
            *self.country.lock().unwrap_or_else(PoisonError::into_inner) = country;
        }
        if !result.has_limit() {
            return false;
        }
        tracing::debug!("Limit {} km/h from {}", result.limit_kmh, result.source);
        *self.last_limit.lock().unwrap_or_else(PoisonError::into_inner) = result;
        true
    }
}

/// Everything a resolution attempt needs
struct Resolution {
    resolver: Arc<RemoteLimitResolver>,
    store: Arc<Mutex<LocalLimitStore>>,
    geocoder: Option<Arc<dyn CountryGeocoder>>,
    shared: Arc<SessionShared>,
    budget: Duration,
}

impl Resolution {
    async fn run(self: Arc<Self>, generation: u64, sample: LocationSample) {
        profiling::scope!("resolution_attempt");
        let measured_speed_kmh = self.shared.speed_kmh.load(Ordering::Relaxed);

        let platform_country = self.platform_country(sample.latitude, sample.longitude).await;
        let found = tokio::time::timeout(
            self.budget,
            self.find_limit(generation, &sample, platform_country.clone()),
        )
        .await;
        let (limit, country) = match found {
            Ok(found) => found,
            Err(_) => {
                tracing::warn!(
                    "Resolution attempt {} ran out of its {:?} budget",
                    generation,
                    self.budget
                );
                (None, platform_country.or_else(|| self.shared.country()))
            }
        };

        let mut result = limit.unwrap_or_else(|| {
            // Band from the speed now, not when the attempt started
            let speed = self.shared.speed_kmh.load(Ordering::Relaxed);
            let limit = fallback::limit_for_speed(country.as_deref(), speed);
            SpeedLimitResult::new(limit, LimitSource::Fallback(country.clone()))
        });
        result.measured_speed_kmh = measured_speed_kmh;

        self.shared.apply(generation, result, country);
    }

    /// Country, local database, then the remote chain
    ///
    /// Returns no limit when none of them has one, along with the best country known.
    async fn find_limit(
        &self,
        generation: u64,
        sample: &LocationSample,
        mut country: Option<String>,
    ) -> (Option<SpeedLimitResult>, Option<String>) {
        let (lat, lon) = (sample.latitude, sample.longitude);
        if country.is_none() {
            country = self.remote_country(lat, lon).await;
        }
        if let Some(code) = &country {
            self.shared.note_country(generation, code);
        }

        let local = self.lookup_local(generation, lat, lon, country.clone()).await;
        if let Some((limit, code)) = local {
            let result = SpeedLimitResult::new(limit, LimitSource::LocalDb(code));
            return (Some(result), country);
        }

        // Both geocode transports were already asked above
        let hint = match &country {
            Some(code) => CountryHint::Known(code.as_str()),
            None => CountryHint::Unavailable,
        };
        let outcome = self.resolver.resolve(lat, lon, sample.accuracy(), hint).await;
        let limit = if outcome.has_limit() {
            Some(SpeedLimitResult::new(outcome.limit_kmh, outcome.source))
        } else {
            None
        };
        (limit, outcome.country.or(country))
    }

    async fn platform_country(&self, lat: f64, lon: f64) -> Option<String> {
        let geocoder = self.geocoder.as_ref()?;
        geocoder
            .country_code(lat, lon)
            .await
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty())
    }

    /// Remote geocode over each transport in turn
    async fn remote_country(&self, lat: f64, lon: f64) -> Option<String> {
        for kind in TransportKind::all() {
            match self.resolver.probe_country(kind, lat, lon).await {
                Ok(code) => return Some(code),
                Err(e) => tracing::debug!("{kind} country lookup failed: {e}"),
            }
        }
        None
    }

    /// Switch the local store to `country` and look the point up, off the runtime
    async fn lookup_local(
        &self,
        generation: u64,
        lat: f64,
        lon: f64,
        country: Option<String>,
    ) -> Option<(i32, String)> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let lookup = tokio::task::spawn_blocking(move || {
            let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
            // Superseded, or the session stopped and closed the store
            if !shared.is_current(generation) {
                return None;
            }
            store.select_country(country.as_deref());
            let code = store.active_country()?.to_string();
            store.lookup(lat, lon).map(|limit| (limit, code))
        });
        match lookup.await {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!("Local lookup task failed: {e}");
                None
            }
        }
    }
}

/// A running resolution attempt
struct Attempt {
    task: JoinHandle<()>,
    started_at: Instant,
}

/// Per-tick state, owned by the tick task
struct TickLoop {
    config: LoopConfig,
    settings: Arc<dyn SettingsSource>,
    sink: Arc<dyn ReportSink>,
    provider: Arc<Mutex<Box<dyn LocationProvider>>>,
    samples: watch::Receiver<Option<LocationSample>>,
    resolution: Arc<Resolution>,
    shared: Arc<SessionShared>,

    profile: FilterProfile,
    filter: SpeedFilter,
    gate: FetchGate,
    throttle: AlertThrottle,
    in_flight: Option<Attempt>,

    started_at: Instant,
    last_fix_at: Option<Instant>,
    last_restart_at: Option<Instant>,
}

impl TickLoop {
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let now = interval.tick().await;
            self.tick(now);
        }
    }

    fn tick(&mut self, now: Instant) {
        profiling::scope!("tick");
        let settings = self.settings.snapshot();
        self.apply_settings(&settings);

        let fresh = self.samples.has_changed().unwrap_or(false);
        let sample = *self.samples.borrow_and_update();
        if fresh {
            self.last_fix_at = Some(now);
        }

        if let Some(sample) = sample {
            // At most one outstanding attempt: the gate is not even consulted meanwhile
            let busy = self.attempt_busy(now);
            if !busy && self.gate.check(now.into_std(), sample.point()).is_open() {
                self.spawn_attempt(sample, now);
            }
            let raw_kmh = utils::sanitize_speed_kmh(utils::mps_to_kmh(sample.speed_mps));
            self.filter.update(raw_kmh);
        }
        let speed_kmh = self.filter.estimate().round() as i32;
        self.shared.speed_kmh.store(speed_kmh, Ordering::Relaxed);

        self.watchdog(now);

        let has_fix = self
            .last_fix_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.fix_timeout);
        let limit = self.shared.last_limit();
        let overspeed = settings.overspeed.is_overspeed(limit.limit_kmh, speed_kmh);
        // A stale speed is not worth beeping about
        let alert = self.throttle.should_alert(now, overspeed && has_fix);
        if alert {
            tracing::info!(
                "Overspeed: {} km/h in a {} km/h zone ({})",
                speed_kmh,
                limit.limit_kmh,
                limit.source
            );
        }

        let report = TickReport {
            speed_kmh,
            limit_kmh: limit.limit_kmh,
            overspeed,
            accuracy_m: sample.and_then(|s| s.accuracy()).unwrap_or(-1.0),
            has_fix,
            alert,
            source: limit.source,
            country: self.shared.country(),
        };
        self.sink.publish(&report);
    }

    fn apply_settings(&mut self, settings: &EngineSettings) {
        if settings.filter_profile != self.profile {
            tracing::info!("Filter profile changed to {}", settings.filter_profile);
            self.profile = settings.filter_profile;
            self.filter = SpeedFilter::new(self.profile);
        }
        self.gate
            .set_thresholds(settings.fetch_interval, settings.min_fetch_distance_m);
    }

    /// An unfinished attempt within its budget keeps the gate closed
    fn attempt_busy(&self, now: Instant) -> bool {
        self.in_flight.as_ref().is_some_and(|attempt| {
            !attempt.task.is_finished()
                && now.saturating_duration_since(attempt.started_at) < self.config.attempt_budget
        })
    }

    fn spawn_attempt(&mut self, sample: LocationSample, now: Instant) {
        if let Some(previous) = self.in_flight.take() {
            if !previous.task.is_finished() {
                tracing::debug!("Aborting resolution attempt past its budget");
            }
            previous.task.abort();
        }
        let generation = self.shared.next_generation();
        let resolution = Arc::clone(&self.resolution);
        self.in_flight = Some(Attempt {
            task: tokio::spawn(resolution.run(generation, sample)),
            started_at: now,
        });
    }

    fn watchdog(&mut self, now: Instant) {
        let reference = [Some(self.started_at), self.last_fix_at, self.last_restart_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.started_at);
        let silent_for = now.saturating_duration_since(reference);
        if silent_for <= self.config.staleness_threshold {
            return;
        }

        tracing::warn!(
            "No location fix for {:.0}s, restarting provider",
            silent_for.as_secs_f64()
        );
        let mut provider = self.provider.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = provider.restart() {
            tracing::warn!("Location provider restart failed: {e}");
        }
        self.last_restart_at = Some(now);
    }
}

impl Drop for TickLoop {
    fn drop(&mut self) {
        if let Some(attempt) = self.in_flight.take() {
            attempt.task.abort();
        }
    }
}

struct Running {
    tick_task: AbortHandle,
    shared: Arc<SessionShared>,
    // Keeps the sample channel open even if the provider drops its handle
    _sender: SampleSender,
}

/// One driving session
///
/// Built stopped; [`start`](Self::start) must be called from within a tokio runtime.
pub struct DrivingSession {
    config: LoopConfig,
    provider: Arc<Mutex<Box<dyn LocationProvider>>>,
    settings: Arc<dyn SettingsSource>,
    sink: Arc<dyn ReportSink>,
    resolver: Arc<RemoteLimitResolver>,
    store: Arc<Mutex<LocalLimitStore>>,
    geocoder: Option<Arc<dyn CountryGeocoder>>,
    running: Option<Running>,
}

impl std::fmt::Debug for DrivingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrivingSession")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DrivingSession {
    pub fn new(
        config: LoopConfig,
        provider: Box<dyn LocationProvider>,
        settings: Arc<dyn SettingsSource>,
        sink: Arc<dyn ReportSink>,
        resolver: Arc<RemoteLimitResolver>,
        store: LocalLimitStore,
    ) -> Self {
        Self {
            config,
            provider: Arc::new(Mutex::new(provider)),
            settings,
            sink,
            resolver,
            store: Arc::new(Mutex::new(store)),
            geocoder: None,
            running: None,
        }
    }

    /// Consult a platform geocoder before the remote one
    pub fn with_geocoder(mut self, geocoder: Arc<dyn CountryGeocoder>) -> Self {
        self.geocoder = Some(geocoder);
        self
    }

    pub fn state(&self) -> SessionState {
        match self.running {
            Some(_) => SessionState::Running,
            None => SessionState::Stopped,
        }
    }

    /// Start the provider and the tick task
    ///
    /// A provider that fails to start is left to the staleness watchdog.
    pub fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        tracing::info!("Driving session starting");

        let (tx, samples) = watch::channel(None);
        let sender = SampleSender::new(tx);
        {
            let mut provider = self.provider.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = provider.start(self.config.location_interval, sender.clone()) {
                tracing::warn!("Location provider failed to start: {e}");
            }
        }

        let settings = self.settings.snapshot();
        let shared = Arc::new(SessionShared::new());
        let tick_loop = TickLoop {
            config: self.config.clone(),
            settings: Arc::clone(&self.settings),
            sink: Arc::clone(&self.sink),
            provider: Arc::clone(&self.provider),
            samples,
            resolution: Arc::new(Resolution {
                resolver: Arc::clone(&self.resolver),
                store: Arc::clone(&self.store),
                geocoder: self.geocoder.clone(),
                shared: Arc::clone(&shared),
                budget: self.config.attempt_budget,
            }),
            shared: Arc::clone(&shared),
            profile: settings.filter_profile,
            filter: SpeedFilter::new(settings.filter_profile),
            gate: FetchGate::new(settings.fetch_interval, settings.min_fetch_distance_m),
            throttle: AlertThrottle::new(self.config.alert_interval),
            in_flight: None,
            started_at: Instant::now(),
            last_fix_at: None,
            last_restart_at: None,
        };

        let tick_task = tokio::spawn(tick_loop.run()).abort_handle();
        self.running = Some(Running {
            tick_task,
            shared,
            _sender: sender,
        });
        Ok(())
    }

    /// Stop everything started by [`start`](Self::start)
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        // Any attempt still in flight can no longer apply its result
        running.shared.next_generation();
        running.tick_task.abort();

        self.provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stop();
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .close();
        tracing::info!("Driving session stopped");
    }

    /// Last known limit, `None` while stopped
    pub fn last_limit(&self) -> Option<SpeedLimitResult> {
        self.running.as_ref().map(|r| r.shared.last_limit())
    }

    /// Last resolved country, `None` while stopped or unknown
    pub fn country(&self) -> Option<String> {
        self.running.as_ref().and_then(|r| r.shared.country())
    }
}

impl Drop for DrivingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_store::tests::write_db;
    use crate::overspeed::OverspeedMode;
    use crate::remote::tests::{country_body, is_geocode, ways_body, FakeFetcher};
    use crate::remote::ResolverConfig;
    use crate::EngineError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const LAT: f64 = 48.85;
    const LON: f64 = 2.35;

    fn north(meters: f64) -> f64 {
        LAT + (meters / utils::EARTH_RADIUS_M).to_degrees()
    }

    #[derive(Clone, Default)]
    struct FakeProvider {
        sender: Arc<Mutex<Option<SampleSender>>>,
        starts: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
        restarts: Arc<AtomicUsize>,
    }

    impl FakeProvider {
        fn send(&self, sample: LocationSample) {
            if let Some(sender) = self.sender.lock().unwrap().as_ref() {
                sender.send(sample);
            }
        }
    }

    impl LocationProvider for FakeProvider {
        fn start(&mut self, _interval_hint: Duration, sender: SampleSender) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.sender.lock().unwrap() = Some(sender);
            Ok(())
        }

        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn restart(&mut self) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        reports: Mutex<Vec<TickReport>>,
    }

    impl CollectingSink {
        fn last(&self) -> TickReport {
            self.reports.lock().unwrap().last().cloned().unwrap()
        }
    }

    impl ReportSink for CollectingSink {
        fn publish(&self, report: &TickReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }

    struct FixedGeocoder(&'static str);

    #[async_trait]
    impl CountryGeocoder for FixedGeocoder {
        async fn country_code(&self, _lat: f64, _lon: f64) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    /// Never answers its first call; later calls return `nl`
    #[derive(Default)]
    struct StuckOnceGeocoder {
        calls: AtomicUsize,
        dropped: Arc<AtomicBool>,
    }

    #[async_trait]
    impl CountryGeocoder for StuckOnceGeocoder {
        async fn country_code(&self, _lat: f64, _lon: f64) -> Option<String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let _flag = DropFlag(Arc::clone(&self.dropped));
                std::future::pending::<()>().await;
            }
            Some("nl".to_string())
        }
    }

    /// Overpass handler answering with a way right at the queried point
    fn way_at_query_point(limit: i32) -> impl Fn(&str) -> Result<String> + Send + Sync {
        move |url| {
            let not_a_ways_query = || EngineError::NoMatch(url.to_string());
            let args = url.split("around%3A").nth(1).ok_or_else(not_a_ways_query)?;
            let mut parts = args.split("%2C").skip(1);
            let lat: f64 = parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(not_a_ways_query)?;
            let lon: f64 = parts
                .next()
                .and_then(|p| p.split("%29").next())
                .and_then(|p| p.parse().ok())
                .ok_or_else(not_a_ways_query)?;
            Ok(ways_body(limit, lat, lon))
        }
    }

    struct Harness {
        session: DrivingSession,
        provider: FakeProvider,
        sink: Arc<CollectingSink>,
    }

    fn harness(
        direct: Arc<FakeFetcher>,
        rendered: Arc<FakeFetcher>,
        store: LocalLimitStore,
        settings: EngineSettings,
    ) -> Harness {
        harness_with_config(LoopConfig::default(), direct, rendered, store, settings)
    }

    fn harness_with_config(
        config: LoopConfig,
        direct: Arc<FakeFetcher>,
        rendered: Arc<FakeFetcher>,
        store: LocalLimitStore,
        settings: EngineSettings,
    ) -> Harness {
        let provider = FakeProvider::default();
        let sink = Arc::new(CollectingSink::default());
        let resolver = Arc::new(RemoteLimitResolver::with_fetchers(
            ResolverConfig::default(),
            direct,
            rendered,
        ));
        let session = DrivingSession::new(
            config,
            Box::new(provider.clone()),
            Arc::new(settings),
            sink.clone(),
            resolver,
            store,
        );
        Harness {
            session,
            provider,
            sink,
        }
    }

    fn sample(lat: f64, kmh: f64) -> LocationSample {
        LocationSample::new(lat, LON, kmh / 3.6, 4.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_rendered_overpass_after_direct_timeouts() {
        let direct = FakeFetcher::new(|url| {
            if is_geocode(url) {
                Ok(country_body("fr"))
            } else {
                Err(EngineError::Network("timeout".to_string()))
            }
        });
        let rendered = FakeFetcher::new(|_| Ok(ways_body(90, north(5.0), LON)));
        let mut h = harness(
            direct,
            rendered,
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );

        h.session.start().unwrap();
        h.provider.send(sample(LAT, 0.0));
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let limit = h.session.last_limit().unwrap();
        assert_eq!(limit.limit_kmh, 90);
        assert_eq!(limit.source.to_string(), "web-overpass");
        assert_eq!(h.session.country().as_deref(), Some("fr"));

        let report = h.sink.last();
        assert_eq!(report.limit_kmh, 90);
        assert_eq!(report.source, LimitSource::WebOverpass);
        assert!(report.has_fix);
        assert!(!report.overspeed);
        h.session.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_country_fallback_uses_smoothed_speed() {
        let direct = FakeFetcher::new(|url| {
            if is_geocode(url) {
                Ok(country_body("de"))
            } else {
                Err(EngineError::Network("timeout".to_string()))
            }
        });
        let mut h = harness(
            direct,
            FakeFetcher::failing(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );

        h.session.start().unwrap();
        // 95 km/h northbound, one fix per second
        for i in 0..10 {
            h.provider.send(sample(north(i as f64 * 26.4), 95.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let limit = h.session.last_limit().unwrap();
        assert_eq!(limit.limit_kmh, 120);
        assert_eq!(limit.source.to_string(), "fallback:de");

        let report = h.sink.last();
        assert_eq!(report.speed_kmh, 95);
        assert_eq!(report.limit_kmh, 120);
        assert!(!report.overspeed);
        assert_eq!(report.country.as_deref(), Some("de"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_database_hit_and_alert_cadence() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(
            &tmp.path().join("fr.sqlite"),
            &[(LAT - 0.01, LAT + 0.01, LON - 0.01, LON + 0.01, 50)],
        );
        let direct = FakeFetcher::failing();
        let mut h = harness(
            direct.clone(),
            FakeFetcher::failing(),
            LocalLimitStore::discover(tmp.path()),
            EngineSettings {
                overspeed: OverspeedMode::Fixed(5),
                ..EngineSettings::default()
            },
        );
        h.session = h.session.with_geocoder(Arc::new(FixedGeocoder("FR")));

        h.session.start().unwrap();
        for i in 0..13 {
            h.provider.send(sample(north(i as f64 * 20.0), 80.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let limit = h.session.last_limit().unwrap();
        assert_eq!(limit.limit_kmh, 50);
        assert_eq!(limit.source, LimitSource::LocalDb("fr".to_string()));
        // Geocoder and local hit: the network was never needed
        assert!(direct.calls().is_empty());

        let reports = h.sink.reports.lock().unwrap().clone();
        let overspeed_ticks = reports.iter().filter(|r| r.overspeed).count();
        let alerts = reports.iter().filter(|r| r.alert).count();
        assert!(overspeed_ticks >= 10, "got {overspeed_ticks}");
        // First overspeed tick, then once more 10s later
        assert_eq!(alerts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_direct_transport_while_moving() {
        let direct = FakeFetcher::delayed(Duration::from_secs(10), |_| {
            Err(EngineError::Network("timed out".to_string()))
        });
        let rendered = FakeFetcher::delayed(Duration::from_secs(2), way_at_query_point(90));
        let mut h = harness(
            direct.clone(),
            rendered,
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );

        h.session.start().unwrap();
        // 50 km/h northbound, so the gate would reopen every few seconds
        for i in 0..90 {
            h.provider.send(sample(north(i as f64 * 13.9), 50.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let limit = h.session.last_limit().unwrap();
        assert_eq!(limit.limit_kmh, 90);
        assert_eq!(limit.source, LimitSource::WebOverpass);

        // One country lookup, then every mirror, without geocoding again
        let calls = direct.calls();
        assert!(is_geocode(&calls[0]));
        assert!(!calls[1..5].iter().any(|u| is_geocode(u)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_network_ends_in_country_fallback() {
        let hang = || {
            FakeFetcher::delayed(Duration::from_secs(3600), |_| {
                Err(EngineError::Network("no answer".to_string()))
            })
        };
        let direct = hang();
        let mut h = harness(
            direct.clone(),
            hang(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );
        h.session = h.session.with_geocoder(Arc::new(FixedGeocoder("de")));

        h.session.start().unwrap();
        for i in 0..30 {
            h.provider.send(sample(north(i as f64 * 26.4), 95.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // Still on the first attempt, its country already published
        assert_eq!(direct.calls().len(), 1);
        assert_eq!(h.session.last_limit().unwrap().limit_kmh, -1);
        assert_eq!(h.session.country().as_deref(), Some("de"));

        for i in 30..65 {
            h.provider.send(sample(north(i as f64 * 26.4), 95.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let limit = h.session.last_limit().unwrap();
        assert_eq!(limit.limit_kmh, 120);
        assert_eq!(limit.source.to_string(), "fallback:de");
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_past_budget_is_superseded() {
        let geocoder = Arc::new(StuckOnceGeocoder::default());
        let config = LoopConfig {
            attempt_budget: Duration::from_secs(10),
            ..LoopConfig::default()
        };
        let mut h = harness_with_config(
            config,
            FakeFetcher::failing(),
            FakeFetcher::failing(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );
        h.session = h.session.with_geocoder(geocoder.clone());

        h.session.start().unwrap();
        for i in 0..8 {
            h.provider.send(sample(north(i as f64 * 22.0), 80.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // Stuck but within its budget: no second attempt yet
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.last_limit().unwrap(), SpeedLimitResult::none());

        for i in 8..13 {
            h.provider.send(sample(north(i as f64 * 22.0), 80.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert!(geocoder.dropped.load(Ordering::SeqCst));

        let limit = h.session.last_limit().unwrap();
        assert_eq!(limit.source, LimitSource::Fallback(Some("nl".to_string())));
        assert!(limit.has_limit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_aborts_attempt_in_flight() {
        let geocoder = Arc::new(StuckOnceGeocoder::default());
        let mut h = harness(
            FakeFetcher::failing(),
            FakeFetcher::failing(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );
        h.session = h.session.with_geocoder(geocoder.clone());

        h.session.start().unwrap();
        h.provider.send(sample(LAT, 30.0));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 1);
        assert!(!geocoder.dropped.load(Ordering::SeqCst));

        h.session.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(geocoder.dropped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_local_lookup_of_stopped_session_keeps_store_closed() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(
            &tmp.path().join("fr.sqlite"),
            &[(LAT - 0.01, LAT + 0.01, LON - 0.01, LON + 0.01, 50)],
        );
        let shared = Arc::new(SessionShared::new());
        let resolution = Resolution {
            resolver: Arc::new(RemoteLimitResolver::with_fetchers(
                ResolverConfig::default(),
                FakeFetcher::failing(),
                FakeFetcher::failing(),
            )),
            store: Arc::new(Mutex::new(LocalLimitStore::discover(tmp.path()))),
            geocoder: None,
            shared: Arc::clone(&shared),
            budget: Duration::from_secs(60),
        };

        let generation = shared.next_generation();
        // What stop() does before closing the store
        shared.next_generation();
        let hit = resolution
            .lookup_local(generation, LAT, LON, Some("fr".to_string()))
            .await;
        assert_eq!(hit, None);
        assert_eq!(resolution.store.lock().unwrap().active_country(), None);

        let current = shared.next_generation();
        let hit = resolution
            .lookup_local(current, LAT, LON, Some("fr".to_string()))
            .await;
        assert_eq!(hit, Some((50, "fr".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_alert_without_fix() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(
            &tmp.path().join("fr.sqlite"),
            &[(LAT - 0.01, LAT + 0.01, LON - 0.01, LON + 0.01, 50)],
        );
        let mut h = harness(
            FakeFetcher::failing(),
            FakeFetcher::failing(),
            LocalLimitStore::discover(tmp.path()),
            EngineSettings {
                overspeed: OverspeedMode::Fixed(5),
                ..EngineSettings::default()
            },
        );
        h.session = h.session.with_geocoder(Arc::new(FixedGeocoder("fr")));

        h.session.start().unwrap();
        for i in 0..5 {
            h.provider.send(sample(north(i as f64 * 20.0), 80.0));
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        // Into a tunnel: the stale speed stays above the limit
        tokio::time::sleep(Duration::from_secs(30)).await;

        let reports = h.sink.reports.lock().unwrap().clone();
        let alerts: Vec<_> = reports.iter().filter(|r| r.alert).collect();
        assert_eq!(alerts.len(), 1);
        assert!(alerts.iter().all(|r| r.has_fix));
        let last = reports.last().unwrap();
        assert!(!last.has_fix);
        assert!(!last.alert);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_restarts_silent_provider() {
        let mut h = harness(
            FakeFetcher::failing(),
            FakeFetcher::failing(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );
        h.session.start().unwrap();
        assert_eq!(h.provider.starts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(14_500)).await;
        assert_eq!(h.provider.restarts.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.provider.restarts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(h.provider.restarts.load(Ordering::SeqCst), 2);

        let report = h.sink.last();
        assert!(!report.has_fix);
        assert_eq!(report.limit_kmh, -1);
        assert_eq!(report.accuracy_m, -1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixes_keep_watchdog_quiet() {
        let mut h = harness(
            FakeFetcher::failing(),
            FakeFetcher::failing(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );
        h.session.start().unwrap();
        for _ in 0..20 {
            h.provider.send(sample(LAT, 30.0));
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        assert_eq!(h.provider.restarts.load(Ordering::SeqCst), 0);
        assert!(h.sink.last().has_fix);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_stops_provider_and_ticks() {
        let mut h = harness(
            FakeFetcher::failing(),
            FakeFetcher::failing(),
            LocalLimitStore::empty(),
            EngineSettings::default(),
        );
        assert_eq!(h.session.state(), SessionState::Stopped);
        h.session.start().unwrap();
        assert_eq!(h.session.state(), SessionState::Running);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        h.session.stop();
        assert_eq!(h.session.state(), SessionState::Stopped);
        assert_eq!(h.provider.stops.load(Ordering::SeqCst), 1);
        assert!(h.session.last_limit().is_none());

        let published = h.sink.reports.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.sink.reports.lock().unwrap().len(), published);
    }

    #[test]
    fn test_superseded_results_are_dropped() {
        let shared = SessionShared::new();
        let first = shared.next_generation();
        let second = shared.next_generation();

        let stale = SpeedLimitResult::new(30, LimitSource::RawOverpass);
        assert!(!shared.apply(first, stale, Some("nl".to_string())));
        assert_eq!(shared.last_limit(), SpeedLimitResult::none());
        assert_eq!(shared.country(), None);

        let fresh = SpeedLimitResult::new(80, LimitSource::WebOverpass);
        assert!(shared.apply(second, fresh.clone(), None));
        assert_eq!(shared.last_limit(), fresh);
    }

    #[test]
    fn test_empty_result_keeps_previous_limit() {
        let shared = SessionShared::new();
        let generation = shared.next_generation();
        let known = SpeedLimitResult::new(100, LimitSource::LocalDb("nl".to_string()));
        shared.apply(generation, known.clone(), None);

        let generation = shared.next_generation();
        assert!(!shared.apply(generation, SpeedLimitResult::none(), Some("be".to_string())));
        assert_eq!(shared.last_limit(), known);
        assert_eq!(shared.country().as_deref(), Some("be"));
    }
}
