//! Configuration parsing and validation.
//!
//! Distributor configuration is loaded from TOML files. Sections mirror the
//! tier's components: the update path switches, the initial cluster view,
//! feed admission, and telemetry.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level distributor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Update path behavior.
    #[serde(default)]
    pub distributor: DistributorConfig,

    /// Initial cluster view.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Timestamp allocation.
    #[serde(default)]
    pub timestamps: TimestampsConfig,

    /// Feed admission.
    #[serde(default)]
    pub feed: FeedConfig,

    /// Telemetry and logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Update path configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Open the slow path with a cheap metadata round before any full get.
    ///
    /// When disabled the slow path sends full gets to every replica instead.
    #[serde(default = "default_true")]
    pub enable_metadata_phase: bool,

    /// Force every update onto the safe (read-modify-write) path.
    #[serde(default)]
    pub force_safe_path: bool,

    /// Bound on the stripe event queue.
    #[serde(default = "default_stripe_queue_depth")]
    pub stripe_queue_depth: usize,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            enable_metadata_phase: true,
            force_safe_path: false,
            stripe_queue_depth: default_stripe_queue_depth(),
        }
    }
}

/// Initial cluster view configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of distributors sharing the bucket space.
    #[serde(default = "default_one")]
    pub distributor_count: u16,

    /// This distributor's index.
    #[serde(default)]
    pub distributor_index: u16,

    /// Initial cluster-state version.
    #[serde(default = "default_one_u64")]
    pub state_version: u64,

    /// Bucket spaces served by this distributor.
    #[serde(default = "default_bucket_spaces")]
    pub bucket_spaces: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            distributor_count: 1,
            distributor_index: 0,
            state_version: 1,
            bucket_spaces: default_bucket_spaces(),
        }
    }
}

/// Timestamp allocation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TimestampsConfig {
    /// Floor in microseconds: the stripe never issues a timestamp at or
    /// below this value. Set when restoring a distributor whose stored
    /// versions must stay strictly in the past.
    #[serde(default)]
    pub floor_micros: u64,
}

/// Feed admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FeedConfig {
    /// Start with the feed gate closed.
    #[serde(default)]
    pub initially_blocked: bool,

    /// Reason reported while the gate is closed at startup.
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_one() -> u16 {
    1
}

fn default_one_u64() -> u64 {
    1
}

fn default_stripe_queue_depth() -> usize {
    1024
}

fn default_bucket_spaces() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.cluster.distributor_count == 0 {
            anyhow::bail!("cluster.distributor_count must be > 0");
        }
        if self.cluster.distributor_index >= self.cluster.distributor_count {
            anyhow::bail!(
                "cluster.distributor_index {} out of range for {} distributors",
                self.cluster.distributor_index,
                self.cluster.distributor_count
            );
        }
        if self.cluster.bucket_spaces.is_empty() {
            anyhow::bail!("cluster.bucket_spaces must not be empty");
        }
        if self.distributor.stripe_queue_depth == 0 {
            anyhow::bail!("distributor.stripe_queue_depth must be > 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            distributor: DistributorConfig::default(),
            cluster: ClusterConfig::default(),
            timestamps: TimestampsConfig::default(),
            feed: FeedConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.distributor.enable_metadata_phase);
        assert!(!config.distributor.force_safe_path);
        assert_eq!(config.cluster.distributor_count, 1);
        assert_eq!(config.cluster.bucket_spaces, vec!["default"]);
    }

    #[test]
    fn index_out_of_range_rejected() {
        let config: Config = toml::from_str(
            r#"
            [cluster]
            distributor_count = 2
            distributor_index = 2
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn timestamp_floor_is_parsed() {
        let config: Config = toml::from_str(
            r#"
            [timestamps]
            floor_micros = 1700000000000000
            "#,
        )
        .unwrap();
        assert_eq!(config.timestamps.floor_micros, 1_700_000_000_000_000);

        let defaulted: Config = toml::from_str("").unwrap();
        assert_eq!(defaulted.timestamps.floor_micros, 0);
    }

    #[test]
    fn metadata_phase_can_be_disabled() {
        let config: Config = toml::from_str(
            r#"
            [distributor]
            enable_metadata_phase = false
            "#,
        )
        .unwrap();
        assert!(!config.distributor.enable_metadata_phase);
    }
}
