//! JSON configuration for the recorder.
//!
//! The file maps venue names to their subscription and buffering
//! parameters, plus a storage section and global connection tuning:
//!
//! ```json
//! {
//!   "base_data_dir": "orderbook_data",
//!   "venues": {
//!     "binance_spot": {
//!       "enabled": true,
//!       "symbols": ["BTCUSDT", "ETHUSDT"],
//!       "depth_levels": 20,
//!       "buffer_size": 1000,
//!       "flush_interval_secs": 5
//!     }
//!   },
//!   "storage": { "compression": "snappy", "max_records_per_file": 100000 }
//! }
//! ```
//!
//! The core treats the loaded structure as immutable; CLI override
//! merging happens upstream in `main`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;

/// Root configuration for the recorder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Root of the partitioned output tree
    #[serde(default = "default_base_data_dir")]
    pub base_data_dir: PathBuf,
    /// Venue name -> per-venue settings
    pub venues: BTreeMap<String, VenueConfig>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub global: GlobalConfig,
}

/// Configuration for a single venue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Instruments to subscribe to (symbols, or market ids for venues
    /// that address books numerically)
    #[serde(default)]
    pub symbols: Vec<String>,
    /// Price levels per side retained in each recorded row
    #[serde(default = "default_depth_levels")]
    pub depth_levels: usize,
    /// Maximum rows buffered per instrument before oldest are dropped
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// WebSocket endpoint override (tests, regional mirrors)
    #[serde(default)]
    pub ws_url: Option<String>,
    /// REST endpoint override for snapshot requests
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Per-venue idle timeout override; falls back to `global`
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

impl VenueConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Output file tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "snappy", "zstd" or "none"
    #[serde(default = "default_compression")]
    pub compression: String,
    /// Rotate a partition file early once it holds this many rows
    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            compression: default_compression(),
            max_records_per_file: default_max_records_per_file(),
        }
    }
}

/// Connection tuning shared by all venues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_reconnect_base_delay")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_ms: u64,
    /// Reconnect when no message arrives within this window
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Deltas buffered per instrument while a resync is in flight
    #[serde(default = "default_resync_pending_limit")]
    pub resync_pending_limit: usize,
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            reconnect_base_delay_ms: default_reconnect_base_delay(),
            reconnect_max_delay_ms: default_reconnect_max_delay(),
            idle_timeout_ms: default_idle_timeout(),
            resync_pending_limit: default_resync_pending_limit(),
            telemetry_interval_secs: default_telemetry_interval(),
        }
    }
}

impl GlobalConfig {
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }
}

impl RecorderConfig {
    /// Venues that will actually be recorded
    pub fn enabled_venues(&self) -> impl Iterator<Item = (&String, &VenueConfig)> {
        self.venues
            .iter()
            .filter(|(_, cfg)| cfg.enabled && !cfg.symbols.is_empty())
    }

    /// Effective idle timeout for one venue
    pub fn idle_timeout_for(&self, venue: &VenueConfig) -> Duration {
        venue
            .idle_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.global.idle_timeout())
    }

    /// Keep only the named venues enabled (CLI allow-list)
    pub fn retain_venues(&mut self, allow: &[String]) {
        for (name, cfg) in self.venues.iter_mut() {
            cfg.enabled = allow.iter().any(|a| a.eq_ignore_ascii_case(name));
        }
    }

    /// Replace every enabled venue's instrument list (CLI override)
    pub fn override_symbols(&mut self, symbols: &[String]) {
        for cfg in self.venues.values_mut() {
            if cfg.enabled {
                cfg.symbols = symbols.to_vec();
            }
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<RecorderConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

pub fn load_config_from_str(contents: &str) -> Result<RecorderConfig, ConfigError> {
    Ok(serde_json::from_str(contents)?)
}

/// Built-in configuration used when no file is given
pub fn default_config() -> RecorderConfig {
    let mut venues = BTreeMap::new();
    venues.insert(
        "binance_spot".to_string(),
        VenueConfig {
            enabled: true,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            depth_levels: 20,
            buffer_size: 1000,
            flush_interval_secs: 5,
            ws_url: None,
            rest_url: None,
            idle_timeout_ms: None,
        },
    );
    venues.insert(
        "binance_futures".to_string(),
        VenueConfig {
            enabled: true,
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            depth_levels: 20,
            buffer_size: 1000,
            flush_interval_secs: 5,
            ws_url: None,
            rest_url: None,
            idle_timeout_ms: None,
        },
    );
    venues.insert(
        "lighter".to_string(),
        VenueConfig {
            enabled: false,
            symbols: vec!["1".to_string(), "2".to_string()],
            depth_levels: 10,
            buffer_size: 500,
            flush_interval_secs: 3,
            ws_url: None,
            rest_url: None,
            idle_timeout_ms: None,
        },
    );

    RecorderConfig {
        base_data_dir: default_base_data_dir(),
        venues,
        storage: StorageConfig::default(),
        global: GlobalConfig::default(),
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_base_data_dir() -> PathBuf {
    PathBuf::from("orderbook_data")
}

fn default_depth_levels() -> usize {
    20
}

fn default_buffer_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    5
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_max_records_per_file() -> usize {
    100_000
}

fn default_reconnect_base_delay() -> u64 {
    1000
}

fn default_reconnect_max_delay() -> u64 {
    60_000
}

fn default_idle_timeout() -> u64 {
    30_000
}

fn default_resync_pending_limit() -> usize {
    1000
}

fn default_telemetry_interval() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_venue_config() {
        let json = r#"{
            "enabled": true,
            "symbols": ["BTCUSDT", "ETHUSDT"],
            "depth_levels": 10,
            "buffer_size": 500,
            "flush_interval_secs": 3
        }"#;

        let config: VenueConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.depth_levels, 10);
        assert_eq!(config.flush_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_defaults() {
        let json = r#"{ "symbols": ["BTCUSDT"] }"#;

        let config: VenueConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.depth_levels, 20);
        assert_eq!(config.buffer_size, 1000);
        assert!(config.ws_url.is_none());
    }

    #[test]
    fn test_full_config_round_trip() {
        let json = r#"{
            "base_data_dir": "/tmp/books",
            "venues": {
                "binance_spot": { "symbols": ["BTCUSDT"] },
                "lighter": { "enabled": false, "symbols": ["1"] }
            },
            "global": { "reconnect_base_delay_ms": 250 }
        }"#;

        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.base_data_dir, PathBuf::from("/tmp/books"));
        assert_eq!(config.venues.len(), 2);
        assert_eq!(config.global.reconnect_base_delay_ms, 250);
        assert_eq!(config.enabled_venues().count(), 1);
    }

    #[test]
    fn test_disabled_and_empty_venues_excluded() {
        let json = r#"{
            "venues": {
                "binance_spot": { "enabled": false, "symbols": ["BTCUSDT"] },
                "binance_futures": { "symbols": [] }
            }
        }"#;

        let config = load_config_from_str(json).unwrap();
        assert_eq!(config.enabled_venues().count(), 0);
    }

    #[test]
    fn test_retain_venues() {
        let mut config = default_config();
        config.retain_venues(&["binance_spot".to_string()]);
        let enabled: Vec<_> = config.enabled_venues().map(|(n, _)| n.clone()).collect();
        assert_eq!(enabled, vec!["binance_spot".to_string()]);
    }

    #[test]
    fn test_override_symbols() {
        let mut config = default_config();
        config.override_symbols(&["SOLUSDT".to_string()]);
        let spot = &config.venues["binance_spot"];
        assert_eq!(spot.symbols, vec!["SOLUSDT".to_string()]);
        // disabled venues keep their list
        assert_eq!(config.venues["lighter"].symbols.len(), 2);
    }
}
