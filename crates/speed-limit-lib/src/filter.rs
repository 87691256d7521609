//! Scalar Kalman filter for GPS speed smoothing
//!
//! The filter has no control input: each tick predicts "speed stays the same plus
//! process noise" and corrects towards the new measurement.

use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Noise constants for one filter profile
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct KalmanParams {
    /// Starting error covariance
    pub initial_error: f64,
    /// Added to the covariance on every prediction step
    pub process_noise: f64,
    /// Expected variance of the raw GPS speed
    pub measurement_noise: f64,
}

/// Named filter profiles
///
/// Higher process noise and lower measurement noise track raw GPS more closely;
/// the reverse smooths harder at the cost of lag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FilterProfile {
    /// Balanced, smooth
    #[default]
    Normal,
    /// Fast, responsive
    Sport,
    /// Closest to the raw GPS reading
    Raw,
}

impl FilterProfile {
    pub fn params(&self) -> KalmanParams {
        match self {
            Self::Normal => KalmanParams {
                initial_error: 0.2,
                process_noise: 1.0,
                measurement_noise: 1.0,
            },
            Self::Sport => KalmanParams {
                initial_error: 0.05,
                process_noise: 5.0,
                measurement_noise: 0.3,
            },
            Self::Raw => KalmanParams {
                initial_error: 0.02,
                process_noise: 8.0,
                measurement_noise: 0.2,
            },
        }
    }

    pub fn all() -> &'static [Self] {
        &[Self::Normal, Self::Sport, Self::Raw]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Sport => "sport",
            Self::Raw => "raw",
        }
    }
}

impl fmt::Display for FilterProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilterProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown filter profile '{s}' (expected normal, sport or raw)"))
    }
}

/// Single-state speed estimator
#[derive(Debug, Clone)]
pub struct SpeedFilter {
    /// Current speed estimate (same unit as the measurements, km/h in practice)
    estimate: f64,
    /// Current error covariance
    error: f64,
    params: KalmanParams,
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl SpeedFilter {
    /// Create a filter at rest with the profile's initial error
    pub fn new(profile: FilterProfile) -> Self {
        Self::with_params(profile.params())
    }

    pub fn with_params(params: KalmanParams) -> Self {
        Self {
            estimate: 0.0,
            error: params.initial_error,
            params,
        }
    }

    /// Feed one raw speed sample and return the new estimate
    ///
    /// The caller guarantees `measurement` is finite and non-negative
    /// (see [`crate::utils::sanitize_speed_kmh`]).
    pub fn update(&mut self, measurement: f64) -> f64 {
        // Prediction
        self.error += self.params.process_noise;

        // Kalman gain
        let gain = self.error / (self.error + self.params.measurement_noise);

        // Correction
        self.estimate += gain * (measurement - self.estimate);
        self.error *= 1.0 - gain;

        self.estimate
    }

    #[inline]
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    #[inline]
    pub fn error_covariance(&self) -> f64 {
        self.error
    }

    #[inline]
    pub fn params(&self) -> KalmanParams {
        self.params
    }
}
