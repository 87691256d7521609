//! Local per-country speed-limit databases
//!
//! A directory holds one SQLite file per country (`nl.sqlite`, `de.sqlite`, ...).
//! Each file maps bounding boxes to a speed:
//!
//! ```sql
//! speed_index(id INTEGER PRIMARY KEY, minLat REAL, maxLat REAL, minLon REAL, maxLon REAL)
//! speed_data(id INTEGER PRIMARY KEY, speed INTEGER)
//! ```
//!
//! Only the database of the current country is open at any time. Every failure in
//! here degrades to "no local data".

use geo::{Coord, Rect};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of the per-country database files
const DB_EXTENSION: &str = "sqlite";

/// Smallest box containing the point wins; ties go to the lowest id
const LOOKUP_SQL: &str = "
    SELECT speed_data.speed, speed_index.minLat, speed_index.maxLat,
           speed_index.minLon, speed_index.maxLon
    FROM speed_index
    JOIN speed_data ON speed_index.id = speed_data.id
    WHERE speed_index.minLat <= ?1 AND speed_index.maxLat >= ?1
      AND speed_index.minLon <= ?2 AND speed_index.maxLon >= ?2
    ORDER BY (speed_index.maxLat - speed_index.minLat)
           * (speed_index.maxLon - speed_index.minLon) ASC,
             speed_index.id ASC
    LIMIT 1
";

/// Errors raised while working with the local databases
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No local database for country '{0}'")]
    MissingCountry(String),
}

/// A database hit
#[derive(Debug, Clone, PartialEq)]
pub struct LocalHit {
    pub speed_kmh: i32,
    /// The matched box (x = longitude, y = latitude)
    pub bounds: Rect<f64>,
}

/// The currently open database
struct ActiveDb {
    country: String,
    conn: Connection,
}

/// Manager for the per-country databases found in one directory
pub struct LocalLimitStore {
    dir: PathBuf,
    /// Lowercase country code → database file
    databases: HashMap<String, PathBuf>,
    active: Option<ActiveDb>,
}

impl std::fmt::Debug for LocalLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLimitStore")
            .field("dir", &self.dir)
            .field("countries", &self.countries())
            .field("active", &self.active_country())
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl LocalLimitStore {
    /// Scan `dir` for `*.sqlite` files, creating the directory if it is missing
    ///
    /// Never fails: a directory that cannot be created or read just yields a store
    /// without databases.
    pub fn discover(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let databases = match Self::scan(&dir) {
            Ok(found) => {
                tracing::info!(
                    "Local DB: found {} database(s) in {}: {:?}",
                    found.len(),
                    dir.display(),
                    found.keys().collect::<Vec<_>>()
                );
                found
            }
            Err(e) => {
                tracing::warn!("Local DB: cannot use {}: {}", dir.display(), e);
                HashMap::new()
            }
        };

        Self {
            dir,
            databases,
            active: None,
        }
    }

    /// A store with no databases at all
    pub fn empty() -> Self {
        Self {
            dir: PathBuf::new(),
            databases: HashMap::new(),
            active: None,
        }
    }

    fn scan(dir: &Path) -> Result<HashMap<String, PathBuf>, StoreError> {
        if !dir.exists() {
            tracing::info!("Local DB: folder not found at {}, creating it", dir.display());
            fs::create_dir_all(dir)?;
            return Ok(HashMap::new());
        }

        let mut found = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let is_db = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(DB_EXTENSION));
            if !is_db {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.insert(stem.to_lowercase(), path.clone());
            }
        }
        Ok(found)
    }

    /// Make `country_code`'s database the active one
    ///
    /// The previous database is closed before the new one is opened. A missing file
    /// or an open failure leaves no database active.
    pub fn select_country(&mut self, country_code: Option<&str>) {
        let Some(code) = country_code.map(|c| c.trim().to_lowercase()) else {
            tracing::debug!("Local DB: select_country called without a country");
            return;
        };

        if self.active_country() == Some(code.as_str()) {
            return;
        }

        self.close();

        match self.open(&code) {
            Ok(conn) => {
                tracing::info!("Local DB: using database for country {}", code);
                self.active = Some(ActiveDb {
                    country: code,
                    conn,
                });
            }
            Err(StoreError::MissingCountry(_)) => {
                tracing::debug!("Local DB: no database for country {}", code);
            }
            Err(e) => {
                tracing::warn!("Local DB: failed to open database for {}: {}", code, e);
            }
        }
    }

    fn open(&self, code: &str) -> Result<Connection, StoreError> {
        let path = self
            .databases
            .get(code)
            .ok_or_else(|| StoreError::MissingCountry(code.to_string()))?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        // Fail now rather than on the first lookup if the schema is wrong
        conn.prepare_cached(LOOKUP_SQL)?;
        Ok(conn)
    }

    /// Speed limit of the smallest box containing the point, if any
    pub fn lookup(&self, lat: f64, lon: f64) -> Option<i32> {
        self.lookup_hit(lat, lon).map(|hit| hit.speed_kmh)
    }

    /// Like [`Self::lookup`] but also returns the matched box
    pub fn lookup_hit(&self, lat: f64, lon: f64) -> Option<LocalHit> {
        let active = self.active.as_ref()?;
        match Self::query(&active.conn, lat, lon) {
            Ok(Some(hit)) => {
                tracing::debug!(
                    "Local DB: HIT speed={} at ({}, {}) in {}",
                    hit.speed_kmh,
                    lat,
                    lon,
                    active.country
                );
                Some(hit)
            }
            Ok(None) => {
                tracing::debug!("Local DB: MISS at ({}, {}) in {}", lat, lon, active.country);
                None
            }
            Err(e) => {
                tracing::warn!("Local DB: lookup error: {}", e);
                None
            }
        }
    }

    fn query(conn: &Connection, lat: f64, lon: f64) -> Result<Option<LocalHit>, StoreError> {
        let mut stmt = conn.prepare_cached(LOOKUP_SQL)?;
        let hit = stmt
            .query_row(params![lat, lon], |row| {
                let speed: i64 = row.get(0)?;
                let min_lat: f64 = row.get(1)?;
                let max_lat: f64 = row.get(2)?;
                let min_lon: f64 = row.get(3)?;
                let max_lon: f64 = row.get(4)?;
                Ok(LocalHit {
                    speed_kmh: i32::try_from(speed).unwrap_or(-1),
                    bounds: Rect::new(
                        Coord { x: min_lon, y: min_lat },
                        Coord { x: max_lon, y: max_lat },
                    ),
                })
            })
            .optional()?;
        Ok(hit.filter(|h| h.speed_kmh > 0))
    }

    /// Close the active database, if any
    pub fn close(&mut self) {
        if let Some(active) = self.active.take() {
            if let Err((_, e)) = active.conn.close() {
                tracing::warn!("Local DB: error closing {}: {}", active.country, e);
            } else {
                tracing::debug!("Local DB: closed {}", active.country);
            }
        }
    }

    pub fn active_country(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.country.as_str())
    }

    /// Country codes with a database, sorted
    pub fn countries(&self) -> Vec<&str> {
        let mut codes: Vec<&str> = self.databases.keys().map(String::as_str).collect();
        codes.sort_unstable();
        codes
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for LocalLimitStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a country database with `(minLat, maxLat, minLon, maxLon, speed)` rows
    pub(crate) fn write_db(path: &Path, rows: &[(f64, f64, f64, f64, i64)]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE speed_index (id INTEGER PRIMARY KEY, minLat REAL, maxLat REAL, minLon REAL, maxLon REAL);
             CREATE TABLE speed_data (id INTEGER PRIMARY KEY, speed INTEGER);",
        )
        .unwrap();
        for (i, (min_lat, max_lat, min_lon, max_lon, speed)) in rows.iter().enumerate() {
            let id = i as i64 + 1;
            conn.execute(
                "INSERT INTO speed_index VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, min_lat, max_lat, min_lon, max_lon],
            )
            .unwrap();
            conn.execute("INSERT INTO speed_data VALUES (?1, ?2)", params![id, speed])
                .unwrap();
        }
    }

    #[test]
    fn test_missing_directory_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("SpeedAlert");
        let store = LocalLimitStore::discover(&dir);
        assert!(dir.is_dir());
        assert!(store.countries().is_empty());
        assert_eq!(store.lookup(52.0, 5.0), None);
    }

    #[test]
    fn test_discovery_keys_by_lowercase_stem() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(&tmp.path().join("NL.sqlite"), &[]);
        write_db(&tmp.path().join("de.SQLITE"), &[]);
        fs::write(tmp.path().join("notes.txt"), "not a database").unwrap();
        fs::create_dir(tmp.path().join("fr.sqlite")).unwrap();

        let store = LocalLimitStore::discover(tmp.path());
        assert_eq!(store.countries(), vec!["de", "nl"]);
    }

    #[test]
    fn test_lookup_inside_and_outside() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(
            &tmp.path().join("nl.sqlite"),
            &[(52.0, 52.1, 5.0, 5.1, 80), (52.2, 52.3, 5.2, 5.3, 50)],
        );
        let mut store = LocalLimitStore::discover(tmp.path());
        store.select_country(Some("NL"));
        assert_eq!(store.active_country(), Some("nl"));

        assert_eq!(store.lookup(52.05, 5.05), Some(80));
        assert_eq!(store.lookup(52.25, 5.25), Some(50));
        assert_eq!(store.lookup(52.15, 5.15), None);
        // Box edges are inclusive
        assert_eq!(store.lookup(52.0, 5.1), Some(80));
    }

    #[test]
    fn test_overlapping_boxes_prefer_smallest() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(
            &tmp.path().join("de.sqlite"),
            &[
                (48.0, 49.0, 11.0, 12.0, 100), // large rural box
                (48.10, 48.20, 11.50, 11.60, 50), // town inside it
                (48.14, 48.16, 11.54, 11.56, 30), // zone inside the town
            ],
        );
        let mut store = LocalLimitStore::discover(tmp.path());
        store.select_country(Some("de"));

        assert_eq!(store.lookup(48.15, 11.55), Some(30));
        assert_eq!(store.lookup(48.12, 11.52), Some(50));
        assert_eq!(store.lookup(48.5, 11.2), Some(100));

        let hit = store.lookup_hit(48.15, 11.55).unwrap();
        assert!((hit.bounds.width() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_equal_boxes_prefer_lowest_id() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(
            &tmp.path().join("be.sqlite"),
            &[(50.0, 50.1, 4.0, 4.1, 70), (50.0, 50.1, 4.0, 4.1, 90)],
        );
        let mut store = LocalLimitStore::discover(tmp.path());
        store.select_country(Some("be"));
        assert_eq!(store.lookup(50.05, 4.05), Some(70));
    }

    #[test]
    fn test_switching_country_replaces_active_db() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(&tmp.path().join("nl.sqlite"), &[(52.0, 53.0, 5.0, 6.0, 80)]);
        write_db(&tmp.path().join("be.sqlite"), &[(50.0, 51.0, 4.0, 5.0, 70)]);
        let mut store = LocalLimitStore::discover(tmp.path());

        store.select_country(Some("nl"));
        assert_eq!(store.lookup(52.5, 5.5), Some(80));

        store.select_country(Some("be"));
        assert_eq!(store.active_country(), Some("be"));
        assert_eq!(store.lookup(52.5, 5.5), None);
        assert_eq!(store.lookup(50.5, 4.5), Some(70));

        // A country without a database leaves nothing active
        store.select_country(Some("fr"));
        assert_eq!(store.active_country(), None);
        assert_eq!(store.lookup(50.5, 4.5), None);
    }

    #[test]
    fn test_corrupt_database_is_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("pl.sqlite"), b"definitely not sqlite").unwrap();
        let mut store = LocalLimitStore::discover(tmp.path());
        assert_eq!(store.countries(), vec!["pl"]);

        store.select_country(Some("pl"));
        assert_eq!(store.active_country(), None);
        assert_eq!(store.lookup(52.0, 21.0), None);
    }

    #[test]
    fn test_close_releases_active_db() {
        let tmp = tempfile::tempdir().unwrap();
        write_db(&tmp.path().join("nl.sqlite"), &[(52.0, 53.0, 5.0, 6.0, 80)]);
        let mut store = LocalLimitStore::discover(tmp.path());
        store.select_country(Some("nl"));
        store.close();
        assert_eq!(store.active_country(), None);
        assert_eq!(store.lookup(52.5, 5.5), None);
        store.select_country(None);
        assert_eq!(store.active_country(), None);
    }
}
