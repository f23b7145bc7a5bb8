//! Configuration sections, their defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Per-user config directory, `<config_dir>/tether`, falling back to the
/// working directory when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("tether"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub state_bag: StateBagConfig,
    pub events: EventsConfig,
    pub reassembly: ReassemblyConfig,
    pub sync: SyncConfig,
    pub debug: DebugConfig,
}

/// Host loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Replication ticks per second.
    pub tick_rate_hz: u32,
    /// Connected peers the server accepts.
    pub max_peers: u16,
}

/// State bag rate limits and replication behavior.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateBagConfig {
    /// Updates per second before updates are dropped.
    pub update_rate: f64,
    pub update_burst: f64,
    /// Updates per second before the client is dropped.
    pub flood_rate: f64,
    pub flood_burst: f64,
    /// Body bytes per second before the client is dropped.
    pub size_rate: f64,
    pub size_burst: f64,
    /// Send changes as they happen instead of on the next tick.
    pub immediate_replication: bool,
    /// Client peers write the V2 packet format.
    pub use_v2: bool,
}

/// Game event delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    /// Seconds an event waits for a reply, and a rejected event is retried.
    pub ttl_secs: f64,
    /// Largest payload sent as a single packet.
    pub max_payload: usize,
    /// Address events by name hash rather than legacy type index.
    pub use_v2: bool,
}

/// Reassembly of oversized payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Pacing of outbound fragments.
    pub bytes_per_second: i32,
    /// Incomplete jobs one client may hold open.
    pub max_pending: u8,
    /// Seconds before idle jobs are collected.
    pub job_ttl_secs: u64,
}

/// How sync frames are acknowledged.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncMode {
    Arq,
    #[default]
    Nak,
}

/// Frame reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Frames remembered per client for ack and nack processing.
    pub frame_history: usize,
}

/// Development settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Fallback filter when `RUST_LOG` is unset ("debug", "info", ...).
    pub log_level: String,
    /// Also write JSON logs to the log directory.
    pub json_logs: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 20,
            max_peers: 32,
        }
    }
}

impl Default for StateBagConfig {
    fn default() -> Self {
        Self {
            update_rate: 75.0,
            update_burst: 125.0,
            flood_rate: 150.0,
            flood_burst: 175.0,
            size_rate: 128.0 * 1024.0,
            size_burst: 256.0 * 1024.0,
            immediate_replication: true,
            use_v2: true,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 5.0,
            max_payload: 1025,
            use_v2: true,
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            bytes_per_second: 25_000,
            max_pending: 4,
            job_ttl_secs: 120,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Nak,
            frame_history: 64,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: cfg!(debug_assertions),
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

impl Config {
    /// Load `config.ron` from `config_dir`, writing the defaults first if it
    /// does not exist.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let path = config_dir.join(CONFIG_FILE);
        if !path.exists() {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Wrote default config to {}", path.display());
            return Ok(config);
        }

        let config = Self::read(&path)?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let text = ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;
        std::fs::write(config_dir.join(CONFIG_FILE), text).map_err(ConfigError::WriteError)
    }

    /// Re-read the file; `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let fresh = Self::read(&config_dir.join(CONFIG_FILE))?;
        if fresh == *self {
            return Ok(None);
        }
        log::info!("Config changed on disk");
        Ok(Some(fresh))
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        ron::from_str(&text).map_err(ConfigError::ParseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_serialize() {
        let text = ron::ser::to_string_pretty(&Config::default(), ron::ser::PrettyConfig::new())
            .unwrap();
        assert!(text.contains("update_rate: 75.0"));
        assert!(text.contains("mode: Nak"));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config: Config = ron::from_str("(events: (ttl_secs: 2.5))").unwrap();
        assert_eq!(config.events.ttl_secs, 2.5);
        assert_eq!(config.events.max_payload, 1025);
        assert_eq!(config.sync, SyncConfig::default());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let config: Config = ron::from_str("(render: (width: 3), sync: (mode: Arq))").unwrap();
        assert_eq!(config.sync.mode, SyncMode::Arq);
    }

    #[test]
    fn test_invalid_ron_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "(sync: [").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.reassembly.max_pending = 9;
        config.state_bag.immediate_replication = false;
        config.save(dir.path()).unwrap();

        assert_eq!(Config::load_or_create(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_reload_reports_changes_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut changed = config.clone();
        changed.sync.frame_history = 8;
        changed.save(dir.path()).unwrap();
        let reloaded = config.reload(dir.path()).unwrap();
        assert_eq!(reloaded.map(|c| c.sync.frame_history), Some(8));
    }
}
