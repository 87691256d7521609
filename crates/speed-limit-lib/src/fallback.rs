//! Default speed limits per country, used when no way-level limit is known
//!
//! Values are in km/h:
//! - urban: inside a built-up area
//! - rural: outside a built-up area, single carriageway
//! - divided: dual carriageway / expressway
//! - motorway: full motorway

use std::collections::HashMap;
use std::sync::LazyLock;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Fallback speed bands for one country
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FallbackSpeeds {
    pub urban: i32,
    pub rural: i32,
    pub divided: i32,
    pub motorway: i32,
}

impl FallbackSpeeds {
    const fn new(urban: i32, rural: i32, divided: i32, motorway: i32) -> Self {
        Self {
            urban,
            rural,
            divided,
            motorway,
        }
    }

    /// The band matching a road class
    pub fn for_class(&self, class: RoadClass) -> i32 {
        match class {
            RoadClass::Urban => self.urban,
            RoadClass::Rural => self.rural,
            RoadClass::Divided => self.divided,
            RoadClass::Motorway => self.motorway,
        }
    }
}

/// Road class guessed from the current speed when no real road data exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoadClass {
    Urban,
    Rural,
    Divided,
    Motorway,
}

impl RoadClass {
    /// Guess the road class from the smoothed speed in km/h
    pub fn from_speed(speed_kmh: i32) -> Self {
        match speed_kmh {
            s if s < 60 => Self::Urban,
            s if s < 90 => Self::Rural,
            s if s < 120 => Self::Divided,
            _ => Self::Motorway,
        }
    }
}

/// Global row for unknown countries
pub const GLOBAL_DEFAULT: FallbackSpeeds = FallbackSpeeds::new(50, 80, 100, 120);

// ISO 3166 alpha-2 code → fallback speeds
static DEFAULTS: LazyLock<HashMap<&'static str, FallbackSpeeds>> = LazyLock::new(|| {
    HashMap::from([
        ("NL", FallbackSpeeds::new(50, 80, 100, 100)),
        ("BE", FallbackSpeeds::new(50, 70, 120, 120)),
        ("DE", FallbackSpeeds::new(50, 100, 120, 130)), // motorway is advisory
        ("FR", FallbackSpeeds::new(50, 80, 110, 130)),
        ("GB", FallbackSpeeds::new(30, 60, 70, 70)),
        ("DK", FallbackSpeeds::new(50, 80, 110, 130)),
        ("RU", FallbackSpeeds::new(60, 90, 110, 110)),
        ("PL", FallbackSpeeds::new(50, 90, 120, 140)),
        ("UA", FallbackSpeeds::new(50, 90, 110, 130)),
        ("IL", FallbackSpeeds::new(50, 80, 90, 110)),
        ("NO", FallbackSpeeds::new(50, 80, 90, 110)),
        ("SE", FallbackSpeeds::new(50, 70, 100, 120)),
        ("IT", FallbackSpeeds::new(50, 90, 110, 130)),
        ("ES", FallbackSpeeds::new(50, 90, 100, 120)),
        ("PT", FallbackSpeeds::new(50, 90, 100, 120)),
        ("US", FallbackSpeeds::new(40, 70, 90, 120)), // varies by state
        ("VN", FallbackSpeeds::new(50, 80, 100, 120)),
        ("TR", FallbackSpeeds::new(50, 90, 110, 120)),
        ("KR", FallbackSpeeds::new(50, 80, 90, 110)),
        ("JP", FallbackSpeeds::new(40, 60, 80, 100)),
        ("BR", FallbackSpeeds::new(50, 80, 100, 110)),
        ("AU", FallbackSpeeds::new(50, 100, 110, 110)),
        ("CA", FallbackSpeeds::new(50, 80, 100, 110)),
        ("IE", FallbackSpeeds::new(50, 80, 100, 120)),
        ("CN", FallbackSpeeds::new(50, 80, 100, 120)),
        ("IN", FallbackSpeeds::new(50, 80, 100, 120)),
        ("TW", FallbackSpeeds::new(50, 70, 90, 110)),
    ])
});

// Countries whose signs are posted in mph
const MPH_COUNTRIES: [&str; 7] = ["US", "GB", "LR", "MM", "BS", "BZ", "KY"];

/// Fallback speeds for an ISO country code (case-insensitive)
///
/// Unknown or missing codes return [`GLOBAL_DEFAULT`].
pub fn get(country_code: Option<&str>) -> FallbackSpeeds {
    country_code
        .map(|code| code.trim().to_ascii_uppercase())
        .and_then(|code| DEFAULTS.get(code.as_str()).copied())
        .unwrap_or(GLOBAL_DEFAULT)
}

/// Fallback limit for a country at the given smoothed speed
pub fn limit_for_speed(country_code: Option<&str>, speed_kmh: i32) -> i32 {
    get(country_code).for_class(RoadClass::from_speed(speed_kmh))
}

/// Whether speeds in this country are usually displayed in mph
pub fn uses_mph(country_code: Option<&str>) -> bool {
    country_code.is_some_and(|code| {
        let code = code.trim().to_ascii_uppercase();
        MPH_COUNTRIES.contains(&code.as_str())
    })
}

/// All country codes with a dedicated row, sorted
pub fn known_countries() -> Vec<&'static str> {
    let mut codes: Vec<&'static str> = DEFAULTS.keys().copied().collect();
    codes.sort_unstable();
    codes
}
