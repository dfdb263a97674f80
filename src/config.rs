//! Configuration management for Pathguard.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PathguardError, Result};

/// Placeholder in the snapshot path template that is replaced by a timestamp.
pub const TIMESTAMP_PLACEHOLDER: &str = "{timestamp}";

/// Format used for the snapshot path timestamp.
const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Main configuration for Pathguard.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathguardConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Interval between garbage collection cycles in milliseconds
    #[serde(default = "default_gc_interval")]
    pub gc_interval_ms: u64,

    /// Write a snapshot file on every garbage collection cycle
    #[serde(default = "default_snapshot_enabled")]
    pub snapshot_enabled: bool,

    /// Snapshot path template; `{timestamp}` is replaced with the local time
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,

    /// Inactivity after which a limiter is reclaimed, in milliseconds
    #[serde(default = "default_staleness_threshold")]
    pub staleness_threshold_ms: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: default_gc_interval(),
            snapshot_enabled: default_snapshot_enabled(),
            snapshot_path: default_snapshot_path(),
            staleness_threshold_ms: default_staleness_threshold(),
        }
    }
}

fn default_gc_interval() -> u64 {
    60 * 60 * 1000
}

fn default_snapshot_enabled() -> bool {
    true
}

fn default_snapshot_path() -> String {
    format!("rate/rate-{}.json", TIMESTAMP_PLACEHOLDER)
}

fn default_staleness_threshold() -> u64 {
    60 * 1000
}

impl RateLimitingConfig {
    /// Interval between garbage collection cycles.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    /// Inactivity threshold after which a leaf is pruned.
    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    /// Resolve the snapshot path template for the given moment.
    pub fn snapshot_path_for(&self, now: DateTime<Local>) -> PathBuf {
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        PathBuf::from(self.snapshot_path.replace(TIMESTAMP_PLACEHOLDER, &stamp))
    }

    /// Check that the values can drive a reclaimer.
    pub fn validate(&self) -> Result<()> {
        if self.gc_interval_ms == 0 {
            return Err(PathguardError::Config(
                "gc_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.snapshot_enabled && self.snapshot_path.trim().is_empty() {
            return Err(PathguardError::Config(
                "snapshot_path is required when snapshots are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

impl PathguardConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PathguardConfig = serde_yaml::from_str(yaml)
            .map_err(|e| PathguardError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with environment
    /// variables such as `PATHGUARD__RATE_LIMITING__GC_INTERVAL_MS`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("PATHGUARD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: PathguardConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PathguardError::Config(e.to_string()))?;
        config.rate_limiting.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = PathguardConfig::default();
        assert_eq!(config.rate_limiting.gc_interval(), Duration::from_secs(3600));
        assert_eq!(config.rate_limiting.staleness_threshold(), Duration::from_secs(60));
        assert!(config.rate_limiting.snapshot_enabled);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
rate_limiting:
  gc_interval_ms: 7200000
  snapshot_enabled: false
"#;
        let config = PathguardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limiting.gc_interval(), Duration::from_secs(7200));
        assert!(!config.rate_limiting.snapshot_enabled);
        // untouched fields keep their defaults
        assert_eq!(config.rate_limiting.staleness_threshold_ms, 60_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_interval_rejected() {
        let yaml = r#"
rate_limiting:
  gc_interval_ms: 0
"#;
        assert_err!(PathguardConfig::from_yaml(yaml));
    }

    #[test]
    fn test_snapshot_path_template() {
        let config = RateLimitingConfig::default();
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            config.snapshot_path_for(at),
            PathBuf::from("rate/rate-20240309140507.json")
        );
    }

    #[test]
    fn test_snapshot_path_without_placeholder() {
        let config = RateLimitingConfig {
            snapshot_path: "/var/lib/pathguard/latest.json".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.snapshot_path_for(Local::now()),
            PathBuf::from("/var/lib/pathguard/latest.json")
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pathguard.yaml");
        std::fs::write(&path, "logging:\n  level: debug\n  json: true\n").unwrap();

        let config = assert_ok!(PathguardConfig::from_file(path.to_str().unwrap()));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_layers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("layered.yaml");
        std::fs::write(&path, "rate_limiting:\n  staleness_threshold_ms: 1500\n").unwrap();

        let config = assert_ok!(PathguardConfig::load(path.to_str()));
        assert_eq!(
            config.rate_limiting.staleness_threshold(),
            Duration::from_millis(1500)
        );
    }
}
