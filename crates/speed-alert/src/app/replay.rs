//! GPX replay location provider
//!
//! Plays a recorded track back in (optionally scaled) real time, handing each
//! point to the engine as a location fix.

use geo::Point;
use gpx::Gpx;
use speed_limit_lib::{EngineError, LocationProvider, LocationSample, SampleSender, utils};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Rough horizontal error per unit of HDOP, in meters
const METERS_PER_HDOP: f64 = 5.0;

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse GPX: {0}")]
    Parse(String),

    #[error("Track has no points")]
    Empty,
}

/// One fix of the replayed track
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub speed_mps: f64,
    pub accuracy_m: f64,
    /// Time since the first point of the track
    pub offset: Duration,
}

/// Read all track points of a GPX file
pub fn read_track(path: &Path, default_accuracy_m: f64) -> Result<Vec<ReplayPoint>, ReplayError> {
    profiling::scope!("read_track");
    let file = std::fs::File::open(path).map_err(|source| ReplayError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = std::io::BufReader::new(file);
    let gpx = gpx::read(reader).map_err(|e| ReplayError::Parse(e.to_string()))?;

    let points = points_from_gpx(&gpx, default_accuracy_m);
    if points.is_empty() {
        return Err(ReplayError::Empty);
    }
    tracing::info!(
        "Loaded {} points ({:.0}s) from {}",
        points.len(),
        points.last().map(|p| p.offset.as_secs_f64()).unwrap_or(0.0),
        path.display()
    );
    Ok(points)
}

/// Flatten all tracks and segments into replay points
///
/// Offsets come from the waypoint timestamps (points without one follow the
/// previous point after one second). Speeds come from the waypoint `<speed>` when
/// present, otherwise from distance over time to the previous point.
pub fn points_from_gpx(gpx: &Gpx, default_accuracy_m: f64) -> Vec<ReplayPoint> {
    let waypoints = gpx
        .tracks
        .iter()
        .flat_map(|track| &track.segments)
        .flat_map(|segment| &segment.points);

    let mut points: Vec<ReplayPoint> = Vec::new();
    let mut first_time: Option<i128> = None;

    for waypoint in waypoints {
        let position: Point<f64> = waypoint.point();
        let previous = points.last().copied();

        let timestamp = waypoint
            .time
            .map(|t| OffsetDateTime::from(t).unix_timestamp_nanos());
        let offset = match (timestamp, first_time) {
            (Some(t), Some(first)) => {
                let since_first = Duration::from_nanos((t - first).max(0) as u64);
                since_first.max(previous.map(|p| p.offset).unwrap_or_default())
            }
            (Some(t), None) => {
                let offset = previous
                    .map(|p| p.offset + Duration::from_secs(1))
                    .unwrap_or_default();
                first_time = Some(t - offset.as_nanos() as i128);
                offset
            }
            (None, _) => previous
                .map(|p| p.offset + Duration::from_secs(1))
                .unwrap_or_default(),
        };

        let recorded_speed = waypoint.speed.filter(|s| s.is_finite() && *s >= 0.0);
        let speed_mps = match (recorded_speed, previous) {
            (Some(speed), _) => speed,
            (None, Some(prev)) => {
                let dt = (offset - prev.offset).as_secs_f64();
                if dt > 0.0 {
                    utils::haversine_meters(
                        prev.latitude,
                        prev.longitude,
                        position.y(),
                        position.x(),
                    ) / dt
                } else {
                    prev.speed_mps
                }
            }
            (None, None) => 0.0,
        };

        points.push(ReplayPoint {
            latitude: position.y(),
            longitude: position.x(),
            speed_mps,
            accuracy_m: waypoint
                .hdop
                .map(|hdop| hdop * METERS_PER_HDOP)
                .unwrap_or(default_accuracy_m),
            offset,
        });
    }
    points
}

/// Location provider replaying a track
pub struct GpxReplay {
    points: Arc<[ReplayPoint]>,
    time_scale: f64,
    /// Index of the next point to deliver; a restart resumes from here
    next_index: Arc<AtomicUsize>,
    sender: Option<SampleSender>,
    task: Option<JoinHandle<()>>,
    finished: watch::Sender<bool>,
}

impl GpxReplay {
    pub fn new(points: Vec<ReplayPoint>, time_scale: f64) -> Self {
        let time_scale = if time_scale.is_finite() && time_scale > 0.0 {
            time_scale
        } else {
            tracing::warn!("Invalid time scale {time_scale}, replaying in real time");
            1.0
        };
        let (finished, _) = watch::channel(points.is_empty());
        Self {
            points: points.into(),
            time_scale,
            next_index: Arc::new(AtomicUsize::new(0)),
            sender: None,
            task: None,
            finished,
        }
    }

    pub fn from_file(
        path: &Path,
        time_scale: f64,
        default_accuracy_m: f64,
    ) -> Result<Self, ReplayError> {
        Ok(Self::new(read_track(path, default_accuracy_m)?, time_scale))
    }

    /// Becomes `true` once the last point has been delivered
    pub fn finished(&self) -> watch::Receiver<bool> {
        self.finished.subscribe()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    fn spawn(&mut self, sender: SampleSender) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let points = Arc::clone(&self.points);
        let next_index = Arc::clone(&self.next_index);
        let finished = self.finished.clone();
        let time_scale = self.time_scale;

        self.task = Some(tokio::spawn(async move {
            let start = next_index.load(Ordering::SeqCst);
            let Some(base) = points.get(start).map(|p| p.offset) else {
                finished.send_replace(true);
                return;
            };
            let started = Instant::now();

            for (index, point) in points.iter().enumerate().skip(start) {
                let due = (point.offset - base).div_f64(time_scale);
                tokio::time::sleep_until(started + due).await;
                sender.send(LocationSample {
                    latitude: point.latitude,
                    longitude: point.longitude,
                    speed_mps: point.speed_mps,
                    accuracy_m: point.accuracy_m,
                    timestamp: SystemTime::now(),
                });
                next_index.store(index + 1, Ordering::SeqCst);
            }

            tracing::info!("Replay finished after {} points", points.len());
            finished.send_replace(true);
        }));
    }
}

impl LocationProvider for GpxReplay {
    fn start(&mut self, _interval_hint: Duration, sender: SampleSender) -> speed_limit_lib::Result<()> {
        if self.points.is_empty() {
            return Err(EngineError::ProviderUnavailable("empty track".to_string()));
        }
        self.sender = Some(sender.clone());
        self.spawn(sender);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn restart(&mut self) -> speed_limit_lib::Result<()> {
        let Some(sender) = self.sender.clone() else {
            return Err(EngineError::ProviderUnavailable(
                "replay was never started".to_string(),
            ));
        };
        tracing::info!(
            "Restarting replay at point {}",
            self.next_index.load(Ordering::SeqCst)
        );
        self.spawn(sender);
        Ok(())
    }
}

impl Drop for GpxReplay {
    fn drop(&mut self) {
        self.stop();
    }
}
