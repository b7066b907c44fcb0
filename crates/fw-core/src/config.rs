//! Engine configuration.
//!
//! All knobs have defaults tuned for a small fleet; a YAML file can
//! override any subset. Durations are plain seconds so config files
//! stay easy to diff.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunable parameters for the signal store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deduplication cooldown window.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Live-detection TTL.
    #[serde(default = "default_detection_ttl_secs")]
    pub detection_ttl_secs: u64,
    /// Maximum detections kept per section.
    #[serde(default = "default_section_cap")]
    pub section_cap: usize,
    /// Maximum devices tracked before eviction kicks in.
    #[serde(default = "default_max_devices")]
    pub max_devices: usize,
    /// Heartbeat silence after which a session is considered over.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Silence after which a device is eligible for eviction.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// Minimum gap between retention sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Rolling window of hourly aggregate buckets.
    #[serde(default = "default_hourly_window_hours")]
    pub hourly_window_hours: u64,
    /// TTL for durable records (registry entries, rollups, sessions).
    #[serde(default = "default_record_ttl_secs")]
    pub record_ttl_secs: u64,
    /// Prefix for all durable-tier keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Redis URL for the durable tier. Absent means volatile-only.
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_detection_ttl_secs() -> u64 {
    600
}

fn default_section_cap() -> usize {
    200
}

fn default_max_devices() -> usize {
    100
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

fn default_stale_after_secs() -> u64 {
    1_800
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_hourly_window_hours() -> u64 {
    24
}

fn default_record_ttl_secs() -> u64 {
    7 * 24 * 3_600
}

fn default_key_prefix() -> String {
    "fw".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            detection_ttl_secs: default_detection_ttl_secs(),
            section_cap: default_section_cap(),
            max_devices: default_max_devices(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            hourly_window_hours: default_hourly_window_hours(),
            record_ttl_secs: default_record_ttl_secs(),
            key_prefix: default_key_prefix(),
            redis_url: None,
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.cooldown_secs, 30);
        assert_eq!(config.detection_ttl_secs, 600);
        assert_eq!(config.section_cap, 200);
        assert_eq!(config.max_devices, 100);
        assert_eq!(config.heartbeat_timeout_secs, 120);
        assert_eq!(config.stale_after_secs, 1_800);
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.hourly_window_hours, 24);
        assert_eq!(config.record_ttl_secs, 604_800);
        assert_eq!(config.key_prefix, "fw");
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_partial_yaml_overrides() {
        let yaml = "cooldown_secs: 10\nredis_url: redis://localhost:6379\n";
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cooldown_secs, 10);
        assert_eq!(config.redis_url.as_deref(), Some("redis://localhost:6379"));
        // Untouched fields keep their defaults.
        assert_eq!(config.section_cap, 200);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let err = EngineConfig::load("/nonexistent/fleetwatch.yaml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
