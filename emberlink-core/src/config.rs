//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/emberlink/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/emberlink/` (~/.config/emberlink/)
//! - State/Logs: `$XDG_STATE_HOME/emberlink/` (~/.local/state/emberlink/)
//!
//! Configuration is loaded once before the pipeline starts and treated as
//! immutable thereafter.

use crate::error::{Error, Result};
use crate::obfuscate::ObfuscationRule;
use serde::Deserialize;
use std::path::PathBuf;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Brightwell collector connection
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Harvest retry/backoff tuning
    #[serde(default)]
    pub harvest: HarvestConfig,

    /// Clock synchronization tuning
    #[serde(default)]
    pub clock: ClockConfig,

    /// Default buffer limits (overridable per feature)
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Features to register at startup
    #[serde(default)]
    pub features: Vec<FeatureConfig>,

    /// Payload obfuscation rules
    #[serde(default)]
    pub obfuscation: ObfuscationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Brightwell collector configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Collector base URL (e.g., `https://brightwell.example.com`)
    pub base_url: Option<String>,

    /// API key (from registration, format: "bw_live_xxxx")
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_collector_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: default_collector_timeout(),
        }
    }
}

impl CollectorConfig {
    /// Check if the collector is properly configured
    pub fn is_ready(&self) -> bool {
        self.base_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_none() {
            return Err(Error::Config(
                "collector.base_url is required".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "collector.timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_collector_timeout() -> u64 {
    30
}

/// Harvest retry/backoff configuration
#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    /// Max retry attempts per harvest cycle before the payload is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_ceiling_ms() -> u64 {
    30_000
}

/// Clock synchronization configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ClockConfig {
    /// Sanity ceiling for round-trip latency in milliseconds; samples above
    /// it are discarded
    #[serde(default = "default_max_rtt_ms")]
    pub max_rtt_ms: i64,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            max_rtt_ms: default_max_rtt_ms(),
        }
    }
}

fn default_max_rtt_ms() -> i64 {
    5_000
}

/// Buffer limit configuration
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BufferConfig {
    /// Soft cap on buffered events per feature
    #[serde(default = "default_max_events")]
    pub max_events: usize,

    /// Soft cap on approximate buffered bytes per feature
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_bytes: default_max_bytes(),
        }
    }
}

fn default_max_events() -> usize {
    1000
}

fn default_max_bytes() -> usize {
    64 * 1024
}

/// One feature registration from configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FeatureConfig {
    /// Feature name (ajax, errors, page-actions, ...)
    pub name: String,

    /// Endpoint path at the collector (e.g. "/harvest/ajax")
    pub endpoint: String,

    /// Harvest interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Per-feature event-count override
    pub max_events: Option<usize>,

    /// Per-feature byte-size override
    pub max_bytes: Option<usize>,

    /// When true, a permanent failure on this feature's endpoint blocks the
    /// feature itself (records become no-ops), not just the harvest job
    #[serde(default)]
    pub cascade_block: bool,
}

fn default_interval_ms() -> u64 {
    10_000
}

/// Obfuscation rule list
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ObfuscationConfig {
    /// Ordered rewrite rules applied to every outgoing payload
    #[serde(default)]
    pub rules: Vec<ObfuscationRule>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-section validation beyond what serde enforces
    pub fn validate(&self) -> Result<()> {
        for feature in &self.features {
            if feature.name.is_empty() {
                return Err(Error::Config("feature name must not be empty".to_string()));
            }
            if feature.endpoint.is_empty() {
                return Err(Error::Config(format!(
                    "feature {:?} needs an endpoint",
                    feature.name
                )));
            }
            if feature.interval_ms == 0 {
                return Err(Error::Config(format!(
                    "feature {:?} interval_ms must be at least 1",
                    feature.name
                )));
            }
        }
        if self.harvest.backoff_base_ms == 0 {
            return Err(Error::Config(
                "harvest.backoff_base_ms must be at least 1".to_string(),
            ));
        }
        if self.harvest.backoff_ceiling_ms < self.harvest.backoff_base_ms {
            return Err(Error::Config(
                "harvest.backoff_ceiling_ms must be >= harvest.backoff_base_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/emberlink/config.toml` (~/.config/emberlink/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("emberlink").join("config.toml")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/emberlink/` (~/.local/state/emberlink/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("emberlink")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/emberlink/emberlink.log` (~/.local/state/emberlink/emberlink.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("emberlink.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.collector.base_url.is_none());
        assert_eq!(config.harvest.max_retries, 3);
        assert_eq!(config.clock.max_rtt_ms, 5_000);
        assert_eq!(config.buffer.max_events, 1000);
        assert!(config.features.is_empty());
        assert!(config.obfuscation.rules.is_empty());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[collector]
base_url = "https://brightwell.example.com"
api_key = "bw_live_xxxxxxxxxxxx"

[harvest]
max_retries = 5
backoff_base_ms = 250

[clock]
max_rtt_ms = 2000

[[features]]
name = "ajax"
endpoint = "/harvest/ajax"
interval_ms = 5000
max_events = 200

[[features]]
name = "errors"
endpoint = "/harvest/errors"
cascade_block = true

[[obfuscation.rules]]
pattern = "secret"
replacement = "***"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(
            config.collector.base_url.as_deref(),
            Some("https://brightwell.example.com")
        );
        assert!(config.collector.is_ready());
        assert_eq!(config.harvest.max_retries, 5);
        assert_eq!(config.harvest.backoff_base_ms, 250);
        assert_eq!(config.clock.max_rtt_ms, 2000);

        assert_eq!(config.features.len(), 2);
        assert_eq!(config.features[0].name, "ajax");
        assert_eq!(config.features[0].interval_ms, 5000);
        assert_eq!(config.features[0].max_events, Some(200));
        assert!(!config.features[0].cascade_block);
        assert_eq!(config.features[1].interval_ms, 10_000);
        assert!(config.features[1].cascade_block);

        assert_eq!(config.obfuscation.rules.len(), 1);
        assert!(config.obfuscation.rules[0].enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[collector]
base_url = "https://brightwell.example.com"

[[features]]
name = "ajax"
endpoint = "/harvest/ajax"
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.collector.is_ready());
        assert_eq!(config.features[0].name, "ajax");
    }

    #[test]
    fn test_load_from_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not valid toml [").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_collector_config_validation() {
        let config = CollectorConfig::default();
        assert!(!config.is_ready());
        assert!(config.validate().is_err());

        let config = CollectorConfig {
            base_url: Some("https://brightwell.example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert!(config.is_ready());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let toml = r#"
[[features]]
name = "ajax"
endpoint = "/harvest/ajax"
interval_ms = 0
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let toml = r#"
[harvest]
backoff_base_ms = 5000
backoff_ceiling_ms = 100
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }
}
