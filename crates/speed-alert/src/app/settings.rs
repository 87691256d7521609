use crate::app::storage::{
    StorageBackend, StorageResult, load_json_backend, save_json_backend,
};
use alert_entrypoints::{get_env, parse_args};
use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use speed_limit_lib::{EngineSettings, FilterProfile, OverspeedMode, SettingsSource};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Storage key of the persisted engine settings
const SETTINGS_KEY: &str = "engine_settings";

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
/// Speed Alert - smoothed speed, speed-limit resolution and overspeed warnings
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,

    /// Directory with per-country `<cc>.sqlite` speed databases [env: SPEED_ALERT_DB_DIR]
    #[clap(long, global = true, value_name = "DIR")]
    pub db_dir: Option<PathBuf>,

    /// Headless browser used for the rendered transport [env: SPEED_ALERT_BROWSER]
    #[clap(long, global = true, value_name = "FILE")]
    pub browser: Option<PathBuf>,

    /// Settings file (defaults to the per-user config directory)
    #[clap(long, global = true, value_name = "FILE")]
    pub storage: Option<PathBuf>,

    /// Ignore previously persisted settings and start fresh
    #[clap(long, global = true, default_value = "false")]
    pub ignore_persisted: bool,

    #[clap(flatten)]
    pub engine: EngineArgs,
}

/// Engine settings overrides; given values are persisted for the next run
#[derive(Args, Debug, Clone, Default)]
pub struct EngineArgs {
    /// Speed smoothing profile (normal, sport, raw)
    #[clap(long, global = true)]
    pub profile: Option<FilterProfile>,

    /// Minimum time between two speed-limit lookups, in milliseconds
    #[clap(long, global = true, value_name = "MS")]
    pub fetch_interval_ms: Option<u64>,

    /// Minimum distance between two speed-limit lookups, in meters
    #[clap(long, global = true, value_name = "METERS")]
    pub min_fetch_distance: Option<f64>,

    /// Overspeed tolerance: a percentage ("10%") or fixed km/h ("5")
    #[clap(long, global = true)]
    pub tolerance: Option<OverspeedMode>,
}

impl EngineArgs {
    fn apply(&self, settings: &mut EngineSettings) {
        if let Some(profile) = self.profile {
            settings.filter_profile = profile;
        }
        if let Some(ms) = self.fetch_interval_ms {
            settings.fetch_interval = Duration::from_millis(ms);
        }
        if let Some(meters) = self.min_fetch_distance {
            settings.min_fetch_distance_m = meters.max(0.0);
        }
        if let Some(mode) = self.tolerance {
            settings.overspeed = mode;
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Replay a GPX track through the driving loop, one line per tick
    Run(RunArgs),
    /// Run each resolution step once at a coordinate and print what it returns
    Probe(ProbeArgs),
    /// Print the default speed limits of a country
    Fallback(FallbackArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// GPX file to replay
    #[clap(value_name = "FILE")]
    pub gpx: PathBuf,

    /// Replay speed multiplier (2.0 = twice as fast as recorded)
    #[clap(long, default_value = "1.0")]
    pub time_scale: f64,

    /// Keep the loop running this many seconds after the last point
    #[clap(long, default_value = "5")]
    pub grace_secs: u64,

    /// Accuracy reported for points without HDOP, in meters
    #[clap(long, default_value = "5.0")]
    pub accuracy: f64,
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    /// Latitude in degrees
    #[clap(allow_negative_numbers = true)]
    pub lat: f64,

    /// Longitude in degrees
    #[clap(allow_negative_numbers = true)]
    pub lon: f64,

    /// Fix accuracy used to pick the search radius, in meters
    #[clap(long)]
    pub accuracy: Option<f64>,

    /// Country for the local database lookup (geocoded when omitted)
    #[clap(long)]
    pub country: Option<String>,

    /// Also print the raw response of the first mirror
    #[clap(long, default_value = "false")]
    pub raw: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FallbackArgs {
    /// ISO 3166 alpha-2 country code (omit for the global row)
    pub country: Option<String>,
}

impl Cli {
    /// Parse the command line, exiting with clap's message on error
    pub fn from_cli() -> Self {
        match parse_args::<Cli>() {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Local database directory: flag, then environment, then the per-user data dir
    pub fn db_dir(&self) -> PathBuf {
        self.db_dir
            .clone()
            .or_else(|| get_env("SPEED_ALERT_DB_DIR"))
            .unwrap_or_else(default_db_dir)
    }

    /// Rendering engine binary: flag, then environment (`None` means search `PATH`)
    pub fn browser(&self) -> Option<PathBuf> {
        self.browser.clone().or_else(|| get_env("SPEED_ALERT_BROWSER"))
    }
}

fn default_db_dir() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home)
            .join(".local")
            .join("share")
            .join("speed-alert"),
        Err(_) => PathBuf::from("SpeedAlert"),
    }
}

/// Persisted engine settings (human-editable JSON)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PersistedSettings {
    pub filter_profile: FilterProfile,
    pub fetch_interval_ms: u64,
    pub min_fetch_distance_m: f64,
    /// `"10%"` or `"5"`
    pub overspeed: String,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self::from_engine(&EngineSettings::default())
    }
}

impl PersistedSettings {
    pub fn from_engine(settings: &EngineSettings) -> Self {
        Self {
            filter_profile: settings.filter_profile,
            fetch_interval_ms: settings.fetch_interval.as_millis() as u64,
            min_fetch_distance_m: settings.min_fetch_distance_m,
            overspeed: settings.overspeed.to_string(),
        }
    }

    /// Engine settings; an unusable tolerance becomes the default one
    pub fn to_engine(&self) -> EngineSettings {
        let overspeed = self.parse_overspeed().unwrap_or_default();
        EngineSettings {
            filter_profile: self.filter_profile,
            fetch_interval: Duration::from_millis(self.fetch_interval_ms),
            min_fetch_distance_m: self.min_fetch_distance_m.max(0.0),
            overspeed,
        }
    }

    pub fn parse_overspeed(&self) -> Result<OverspeedMode, String> {
        self.overspeed.parse()
    }
}

/// Remembers the last rejected tolerance so a bad value is reported once, not on
/// every reload
#[derive(Debug, Default)]
struct ToleranceCheck {
    rejected: Option<String>,
}

impl ToleranceCheck {
    /// The problem with `persisted`'s tolerance, if it is new
    fn check(&mut self, persisted: &PersistedSettings) -> Option<String> {
        match persisted.parse_overspeed() {
            Ok(_) => {
                self.rejected = None;
                None
            }
            Err(_) if self.rejected.as_deref() == Some(persisted.overspeed.as_str()) => None,
            Err(e) => {
                self.rejected = Some(persisted.overspeed.clone());
                Some(e)
            }
        }
    }
}

struct LiveState {
    last: EngineSettings,
    tolerance: ToleranceCheck,
}

/// Settings re-read from storage on every snapshot, so edits to the settings file
/// apply while driving
pub struct StoredSettings {
    backend: Arc<dyn StorageBackend>,
    state: Mutex<LiveState>,
}

impl StoredSettings {
    /// Merge persisted settings with command line overrides and write the result back
    pub fn load(
        backend: Arc<dyn StorageBackend>,
        overrides: &EngineArgs,
        ignore_persisted: bool,
    ) -> StorageResult<Self> {
        let persisted = if ignore_persisted {
            None
        } else {
            match load_json_backend::<PersistedSettings>(backend.as_ref(), SETTINGS_KEY) {
                Ok(persisted) => persisted,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable persisted settings: {e}");
                    None
                }
            }
        };

        let mut tolerance = ToleranceCheck::default();
        if let Some(e) = persisted.as_ref().and_then(|p| tolerance.check(p)) {
            tracing::warn!("{e}, using the default tolerance");
        }
        let mut settings = persisted
            .map(|p| p.to_engine())
            .unwrap_or_default();
        overrides.apply(&mut settings);
        save_json_backend(
            backend.as_ref(),
            SETTINGS_KEY,
            &PersistedSettings::from_engine(&settings),
        )?;
        tracing::info!(
            "Settings: profile {}, lookups every {:?} / {}m, tolerance {}",
            settings.filter_profile,
            settings.fetch_interval,
            settings.min_fetch_distance_m,
            settings.overspeed
        );

        Ok(Self {
            backend,
            state: Mutex::new(LiveState {
                last: settings,
                tolerance,
            }),
        })
    }
}

impl SettingsSource for StoredSettings {
    fn snapshot(&self) -> EngineSettings {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.backend.reload() {
            tracing::debug!("Settings file unreadable, keeping previous settings: {e}");
            return state.last.clone();
        }
        match load_json_backend::<PersistedSettings>(self.backend.as_ref(), SETTINGS_KEY) {
            Ok(Some(persisted)) => {
                if let Some(e) = state.tolerance.check(&persisted) {
                    tracing::warn!("{e}, using the default tolerance");
                }
                state.last = persisted.to_engine();
            }
            Ok(None) => {}
            Err(e) => tracing::debug!("Keeping previous settings: {e}"),
        }
        state.last.clone()
    }
}
