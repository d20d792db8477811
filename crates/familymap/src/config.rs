//! Configuration management for familymap.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::device::{Position, WatchOptions};
use crate::error::{Error, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "familymap";

/// Default cache database file name.
const DATABASE_FILE_NAME: &str = "cache.db";

/// Default map page file name.
const MAP_FILE_NAME: &str = "map.html";

/// Highest zoom level served by the default tile layer.
const MAX_ZOOM: u8 = 19;

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `FAMILYMAP_`, sections split on `__`)
/// 2. TOML config file at `~/.config/familymap/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend (auth, database, realtime) configuration.
    pub backend: BackendConfig,
    /// Device position configuration.
    pub location: LocationConfig,
    /// Realtime subscription configuration.
    pub realtime: RealtimeConfig,
    /// Map rendering configuration.
    pub map: MapConfig,
    /// Local cache configuration.
    pub storage: StorageConfig,
}

/// Backend-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://abcd.supabase.co`.
    pub url: String,
    /// Public (anon) API key sent with every request.
    pub anon_key: String,
    /// Table holding one location row per member.
    pub table: String,
    /// Database schema of `table`.
    pub schema: String,
    /// Timeout for a single HTTP request in seconds.
    pub request_timeout_secs: u64,
    /// Interval between realtime heartbeats in seconds.
    pub heartbeat_secs: u64,
}

/// Where device positions come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// A gpsd daemon reachable over TCP.
    #[default]
    Gpsd,
    /// Fixed coordinates from this configuration.
    Fixed,
}

/// Device position configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Position source to watch.
    pub source: SourceKind,
    /// Ask the device for its most accurate fix.
    pub high_accuracy: bool,
    /// Maximum age of a cached position in milliseconds.
    pub maximum_age_ms: u64,
    /// Maximum wait for a position in milliseconds.
    pub timeout_ms: u64,
    /// gpsd address.
    pub gpsd_addr: String,
    /// Latitude for the fixed source.
    pub fixed_lat: Option<f64>,
    /// Longitude for the fixed source.
    pub fixed_lng: Option<f64>,
}

/// Realtime subscription configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Subscribe to table changes while signed in.
    pub enabled: bool,
    /// Coalescing window for change events in milliseconds. 0 disables it.
    pub debounce_ms: u64,
}

/// What the map does when the roster changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecenterPolicy {
    /// Pan to the first member with coordinates whenever it moves.
    #[default]
    PanToFirst,
    /// Keep the center of the first rendered view.
    Keep,
}

/// Map rendering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    /// Latitude used when no member has coordinates.
    pub fallback_lat: f64,
    /// Longitude used when no member has coordinates.
    pub fallback_lng: f64,
    /// Initial zoom level.
    pub zoom: u8,
    /// Tile URL template with `{z}`, `{x}` and `{y}` placeholders.
    pub tile_url: String,
    /// Attribution shown in the map corner.
    pub attribution: String,
    /// Recenter behavior on roster change.
    pub recenter: RecenterPolicy,
    /// Path of the generated map page.
    /// Defaults to `~/.local/share/familymap/map.html`
    pub output_path: Option<PathBuf>,
    /// Browser reload interval for the map page in seconds. 0 disables it.
    pub reload_secs: u32,
}

/// Local cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the cache database file.
    /// Defaults to `~/.local/share/familymap/cache.db`
    pub database_path: Option<PathBuf>,
    /// Keep the last roster on disk to show before the first fetch.
    pub cache_roster: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            table: "profiles".to_string(),
            schema: "public".to_string(),
            request_timeout_secs: 10,
            heartbeat_secs: 30,
        }
    }
}

impl BackendConfig {
    /// HTTP request timeout, at least one second.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Realtime heartbeat interval, at least one second.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Gpsd,
            high_accuracy: true,
            maximum_age_ms: 10_000,
            timeout_ms: 5_000,
            gpsd_addr: "127.0.0.1:2947".to_string(),
            fixed_lat: None,
            fixed_lng: None,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 0,
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            fallback_lat: 37.5665,
            fallback_lng: 126.9780,
            zoom: 13,
            tile_url: "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            attribution: "&copy; OpenStreetMap".to_string(),
            recenter: RecenterPolicy::PanToFirst,
            output_path: None,
            reload_secs: 15,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            cache_roster: true,
        }
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern"))
}

impl Config {
    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed("FAMILYMAP_").split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// The backend URL and key may be empty here; commands that talk to the
    /// backend check them through [`Config::require_backend`].
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(Error::ConfigValidation { message });

        if !self.backend.url.is_empty() && reqwest::Url::parse(&self.backend.url).is_err() {
            return invalid(format!("backend.url is not a valid URL: {}", self.backend.url));
        }
        for (key, value) in [
            ("backend.table", &self.backend.table),
            ("backend.schema", &self.backend.schema),
        ] {
            if !identifier_pattern().is_match(value) {
                return invalid(format!("{key} must be a plain SQL identifier, got {value:?}"));
            }
        }
        if self.backend.request_timeout_secs == 0 {
            return invalid("backend.request_timeout_secs must be greater than 0".to_string());
        }
        if self.backend.heartbeat_secs == 0 {
            return invalid("backend.heartbeat_secs must be greater than 0".to_string());
        }

        if self.location.timeout_ms == 0 {
            return invalid("location.timeout_ms must be greater than 0".to_string());
        }
        if self.location.source == SourceKind::Fixed {
            match (self.location.fixed_lat, self.location.fixed_lng) {
                (Some(lat), Some(lng)) => {
                    if Position::new(lat, lng).is_none() {
                        return invalid(format!(
                            "location.fixed_lat/fixed_lng out of range: {lat}, {lng}"
                        ));
                    }
                }
                _ => {
                    return invalid(
                        "location.source = \"fixed\" needs fixed_lat and fixed_lng".to_string(),
                    )
                }
            }
        }

        if Position::new(self.map.fallback_lat, self.map.fallback_lng).is_none() {
            return invalid(format!(
                "map.fallback_lat/fallback_lng out of range: {}, {}",
                self.map.fallback_lat, self.map.fallback_lng
            ));
        }
        if self.map.zoom > MAX_ZOOM {
            return invalid(format!(
                "map.zoom must be at most {MAX_ZOOM}, got {}",
                self.map.zoom
            ));
        }
        for placeholder in ["{z}", "{x}", "{y}"] {
            if !self.map.tile_url.contains(placeholder) {
                return invalid(format!("map.tile_url is missing {placeholder}"));
            }
        }

        Ok(())
    }

    /// Check that the backend is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend URL or anon key is missing.
    pub fn require_backend(&self) -> Result<()> {
        if self.backend.url.is_empty() {
            return Err(Error::ConfigValidation {
                message: "backend.url is not set (FAMILYMAP_BACKEND__URL)".to_string(),
            });
        }
        if self.backend.anon_key.is_empty() {
            return Err(Error::ConfigValidation {
                message: "backend.anon_key is not set (FAMILYMAP_BACKEND__ANON_KEY)".to_string(),
            });
        }
        Ok(())
    }

    /// Get the cache database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Get the map page path, resolving defaults if not set.
    #[must_use]
    pub fn map_output_path(&self) -> PathBuf {
        self.map
            .output_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(MAP_FILE_NAME))
    }

    /// Get the position watch options.
    #[must_use]
    pub fn watch_options(&self) -> WatchOptions {
        WatchOptions {
            high_accuracy: self.location.high_accuracy,
            maximum_age: Duration::from_millis(self.location.maximum_age_ms),
            timeout: Duration::from_millis(self.location.timeout_ms),
        }
    }

    /// Get the fallback map center.
    #[must_use]
    pub fn fallback_center(&self) -> Position {
        Position {
            lat: self.map.fallback_lat,
            lng: self.map.fallback_lng,
        }
    }

    /// Get the realtime coalescing window, if enabled.
    #[must_use]
    pub fn debounce(&self) -> Option<Duration> {
        if self.realtime.debounce_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.realtime.debounce_ms))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.backend.table, "profiles");
        assert!(config.location.high_accuracy);
        assert!(config.realtime.enabled);
        assert_eq!(config.map.recenter, RecenterPolicy::PanToFirst);
        assert!(config.storage.cache_roster);
    }

    #[test]
    fn test_default_location_config() {
        let location = LocationConfig::default();

        assert_eq!(location.source, SourceKind::Gpsd);
        assert_eq!(location.maximum_age_ms, 10_000);
        assert_eq!(location.timeout_ms, 5_000);
        assert_eq!(location.gpsd_addr, "127.0.0.1:2947");
    }

    #[test]
    fn test_default_map_config() {
        let map = MapConfig::default();

        assert!((map.fallback_lat - 37.5665).abs() < f64::EPSILON);
        assert!((map.fallback_lng - 126.9780).abs() < f64::EPSILON);
        assert_eq!(map.zoom, 13);
        assert!(map.tile_url.contains("openstreetmap"));
    }

    #[test]
    fn test_validate_valid_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_bad_url() {
        let mut config = Config::default();
        config.backend.url = "not a url".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("backend.url"));
    }

    #[test]
    fn test_validate_table_identifier() {
        let mut config = Config::default();
        config.backend.table = "profiles; drop table x".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("backend.table"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.location.timeout_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("timeout_ms"));
    }

    #[test]
    fn test_validate_fixed_source_needs_coordinates() {
        let mut config = Config::default();
        config.location.source = SourceKind::Fixed;
        assert!(config.validate().is_err());

        config.location.fixed_lat = Some(52.52);
        config.location.fixed_lng = Some(13.405);
        assert!(config.validate().is_ok());

        config.location.fixed_lat = Some(91.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zoom() {
        let mut config = Config::default();
        config.map.zoom = 20;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("map.zoom"));
    }

    #[test]
    fn test_validate_tile_url_placeholders() {
        let mut config = Config::default();
        config.map.tile_url = "https://tiles.example.com/{z}/{x}.png".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("{y}"));
    }

    #[test]
    fn test_validate_fallback_range() {
        let mut config = Config::default();
        config.map.fallback_lng = 200.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_require_backend() {
        let mut config = Config::default();
        assert!(config.require_backend().is_err());

        config.backend.url = "https://abcd.supabase.co".to_string();
        let err = config.require_backend().unwrap_err().to_string();
        assert!(err.contains("anon_key"));

        config.backend.anon_key = "key".to_string();
        assert!(config.require_backend().is_ok());
    }

    #[test]
    fn test_database_path_default() {
        let config = Config::default();
        assert!(config.database_path().to_string_lossy().contains("cache.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/cache.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/cache.sqlite")
        );
    }

    #[test]
    fn test_map_output_path_default() {
        let config = Config::default();
        assert!(config.map_output_path().to_string_lossy().contains("map.html"));
    }

    #[test]
    fn test_watch_options() {
        let options = Config::default().watch_options();

        assert!(options.high_accuracy);
        assert_eq!(options.maximum_age, Duration::from_secs(10));
        assert_eq!(options.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_debounce() {
        let mut config = Config::default();
        assert!(config.debounce().is_none());

        config.realtime.debounce_ms = 250;
        assert_eq!(config.debounce(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_backend_durations() {
        let mut backend = BackendConfig::default();
        assert_eq!(backend.request_timeout(), Duration::from_secs(10));
        assert_eq!(backend.heartbeat_interval(), Duration::from_secs(30));

        backend.request_timeout_secs = 0;
        backend.heartbeat_secs = 0;
        assert_eq!(backend.request_timeout(), Duration::from_secs(1));
        assert_eq!(backend.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("familymap"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let result = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml")));
        assert!(result.is_ok());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!(
            "familymap_config_test_{}.toml",
            std::process::id()
        ));
        std::fs::write(
            &path,
            "[backend]\nurl = \"https://abcd.supabase.co\"\nanon_key = \"anon\"\n\n[map]\nzoom = 15\nrecenter = \"keep\"\n",
        )
        .unwrap();

        let config = Config::load_from(Some(path.clone())).unwrap();
        assert_eq!(config.backend.url, "https://abcd.supabase.co");
        assert_eq!(config.map.zoom, 15);
        assert_eq!(config.map.recenter, RecenterPolicy::Keep);
        assert_eq!(config.backend.table, "profiles");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_source_kind_deserialize() {
        let location: LocationConfig = serde_json::from_str(r#"{"source": "fixed"}"#).unwrap();
        assert_eq!(location.source, SourceKind::Fixed);
    }
}
