// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use msgline_storage::{CacheAsideConfig, RetryPolicy, StorageOptions};
use serde::{Deserialize, Serialize};

use crate::ingestion::BatcherConfig;

/// Msgline Server Configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub topics: TopicsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Accumulator drain interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Maximum records per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Number of worker lanes. Changing it remaps conversations to lanes;
    /// drain the inbound topic before restarting with a new value.
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    /// Mailbox capacity per lane
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Message slots per shard document
    #[serde(default = "default_shard_capacity")]
    pub shard_capacity: usize,

    /// TTL of cached message envelopes in seconds
    #[serde(default = "default_msg_cache_ttl_secs")]
    pub msg_cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Fraction of the TTL randomly added to each entry
    #[serde(default = "default_expiry_jitter")]
    pub expiry_jitter: f64,

    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,

    /// How long a waiter polls for another loader's result
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,

    #[serde(default = "default_invalidation_attempts")]
    pub invalidation_attempts: u32,

    #[serde(default = "default_invalidation_interval_ms")]
    pub invalidation_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_retention_enabled")]
    pub enabled: bool,

    /// Seconds between compaction sweeps
    #[serde(default = "default_retention_interval_secs")]
    pub interval_secs: u64,

    /// Messages older than this are compacted. 0 deletes everything.
    #[serde(default = "default_remain_secs")]
    pub remain_secs: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP collector endpoint (e.g., "http://localhost:4317")
    #[serde(default)]
    pub otlp_endpoint: Option<String>,

    #[serde(default)]
    pub json_logs: bool,

    /// Filter used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicsConfig {
    #[serde(default = "default_to_transfer")]
    pub to_transfer: String,
    #[serde(default = "default_to_push")]
    pub to_push: String,
    #[serde(default = "default_to_store")]
    pub to_store: String,
    #[serde(default = "default_to_modify")]
    pub to_modify: String,
}

// Default values
fn default_flush_interval_ms() -> u64 {
    100
}

fn default_page_size() -> usize {
    1000
}

fn default_lanes() -> usize {
    100
}

fn default_lane_capacity() -> usize {
    50
}

fn default_shard_capacity() -> usize {
    msgline_core::SHARD_CAPACITY
}

fn default_msg_cache_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_expiry_jitter() -> f64 {
    0.2
}

fn default_lock_ttl_ms() -> u64 {
    3000
}

fn default_lock_wait_ms() -> u64 {
    3000
}

fn default_lock_poll_interval_ms() -> u64 {
    20
}

fn default_invalidation_attempts() -> u32 {
    5
}

fn default_invalidation_interval_ms() -> u64 {
    100
}

fn default_retention_enabled() -> bool {
    true
}

fn default_retention_interval_secs() -> u64 {
    60 * 60
}

fn default_remain_secs() -> i64 {
    365 * 24 * 60 * 60
}

fn default_service_name() -> String {
    "msgline".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_to_transfer() -> String {
    "to_transfer".to_string()
}

fn default_to_push() -> String {
    "to_push".to_string()
}

fn default_to_store() -> String {
    "to_store".to_string()
}

fn default_to_modify() -> String {
    "to_modify".to_string()
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: default_flush_interval_ms(),
            page_size: default_page_size(),
            lanes: default_lanes(),
            lane_capacity: default_lane_capacity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shard_capacity: default_shard_capacity(),
            msg_cache_ttl_secs: default_msg_cache_ttl_secs(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry_jitter: default_expiry_jitter(),
            lock_ttl_ms: default_lock_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            invalidation_attempts: default_invalidation_attempts(),
            invalidation_interval_ms: default_invalidation_interval_ms(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: default_retention_enabled(),
            interval_secs: default_retention_interval_secs(),
            remain_secs: default_remain_secs(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            otlp_endpoint: None,
            json_logs: false,
            log_filter: default_log_filter(),
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            to_transfer: default_to_transfer(),
            to_push: default_to_push(),
            to_store: default_to_store(),
            to_modify: default_to_modify(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

impl ServerConfig {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from environment variables
    ///
    /// Supported environment variables:
    /// - MSGLINE_LANES: worker lane count (default: 100)
    /// - MSGLINE_PAGE_SIZE: records per page (default: 1000)
    /// - MSGLINE_FLUSH_INTERVAL_MS: accumulator drain interval (default: 100)
    /// - MSGLINE_SHARD_CAPACITY: slots per shard document (default: 5000)
    /// - MSGLINE_MSG_CACHE_TTL_SECS: cached envelope TTL (default: 86400)
    /// - MSGLINE_RETENTION_ENABLED: run the compaction sweep (default: true)
    /// - MSGLINE_RETENTION_INTERVAL_SECS: seconds between sweeps (default: 3600)
    /// - MSGLINE_RETENTION_REMAIN_SECS: retained history in seconds
    /// - MSGLINE_OTLP_ENDPOINT: OTLP collector endpoint
    /// - MSGLINE_JSON_LOGS: JSON log lines (default: false)
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        // Ingest
        if let Some(val) = env_parse("MSGLINE_LANES") {
            self.ingest.lanes = val;
        }
        if let Some(val) = env_parse("MSGLINE_PAGE_SIZE") {
            self.ingest.page_size = val;
        }
        if let Some(val) = env_parse("MSGLINE_FLUSH_INTERVAL_MS") {
            self.ingest.flush_interval_ms = val;
        }

        // Storage
        if let Some(val) = env_parse("MSGLINE_SHARD_CAPACITY") {
            self.storage.shard_capacity = val;
        }
        if let Some(val) = env_parse("MSGLINE_MSG_CACHE_TTL_SECS") {
            self.storage.msg_cache_ttl_secs = val;
        }

        // Retention
        if let Some(val) = env_parse("MSGLINE_RETENTION_ENABLED") {
            self.retention.enabled = val;
        }
        if let Some(val) = env_parse("MSGLINE_RETENTION_INTERVAL_SECS") {
            self.retention.interval_secs = val;
        }
        if let Some(val) = env_parse("MSGLINE_RETENTION_REMAIN_SECS") {
            self.retention.remain_secs = val;
        }

        // Telemetry
        if let Ok(endpoint) = std::env::var("MSGLINE_OTLP_ENDPOINT") {
            self.telemetry.otlp_endpoint = Some(endpoint);
        }
        if let Some(val) = env_parse("MSGLINE_JSON_LOGS") {
            self.telemetry.json_logs = val;
        }
    }

    /// Load configuration with priority: env > file > defaults
    pub fn load(config_file: Option<PathBuf>) -> Result<Self> {
        let config = if let Some(path) = config_file {
            if path.exists() {
                tracing::info!("Loading configuration from file: {:?}", path);
                Self::from_file(&path)?
            } else {
                tracing::warn!("Config file not found: {:?}, using defaults", path);
                Self::default()
            }
        } else {
            Self::default()
        };

        Ok(Self::merge_with_env(config))
    }

    /// Merge config with environment variables (env takes priority)
    fn merge_with_env(mut config: Self) -> Self {
        config.apply_env();
        config
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ingest.lanes == 0 {
            anyhow::bail!("ingest.lanes must be at least 1");
        }
        if self.ingest.page_size == 0 {
            anyhow::bail!("ingest.page_size must be at least 1");
        }
        if self.ingest.lane_capacity == 0 {
            anyhow::bail!("ingest.lane_capacity must be at least 1");
        }
        if self.storage.shard_capacity == 0 {
            anyhow::bail!("storage.shard_capacity must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.cache.expiry_jitter) {
            anyhow::bail!(
                "cache.expiry_jitter must be within [0, 1], got {}",
                self.cache.expiry_jitter
            );
        }
        if self.cache.invalidation_attempts == 0 {
            anyhow::bail!("cache.invalidation_attempts must be at least 1");
        }
        if self.retention.enabled {
            if self.retention.interval_secs == 0 {
                anyhow::bail!("retention.interval_secs must be at least 1");
            }
            if self.retention.remain_secs < 0 {
                anyhow::bail!("retention.remain_secs must not be negative");
            }
        }
        Ok(())
    }

    pub fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            interval: Duration::from_millis(self.ingest.flush_interval_ms),
            page_size: self.ingest.page_size,
            lanes: self.ingest.lanes,
            lane_capacity: self.ingest.lane_capacity,
            ..Default::default()
        }
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            shard_capacity: self.storage.shard_capacity,
            msg_cache_ttl: Duration::from_secs(self.storage.msg_cache_ttl_secs),
            cache: CacheAsideConfig {
                expiry_jitter: self.cache.expiry_jitter,
                lock_ttl: Duration::from_millis(self.cache.lock_ttl_ms),
                lock_poll_interval: Duration::from_millis(self.cache.lock_poll_interval_ms),
                lock_wait: Duration::from_millis(self.cache.lock_wait_ms),
                invalidation_retry: RetryPolicy::fixed(
                    self.cache.invalidation_attempts,
                    Duration::from_millis(self.cache.invalidation_interval_ms),
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.ingest.lanes, 100);
        assert_eq!(config.ingest.page_size, 1000);
        assert_eq!(config.storage.shard_capacity, 5000);
        assert_eq!(config.topics.to_store, "to_store");
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[ingest]
lanes = 8

[retention]
remain_secs = 604800

[topics]
to_push = "push_v2"
"#
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.ingest.lanes, 8);
        assert_eq!(config.ingest.lane_capacity, 50);
        assert_eq!(config.retention.remain_secs, 604_800);
        assert!(config.retention.enabled);
        assert_eq!(config.topics.to_push, "push_v2");
        assert_eq!(config.topics.to_transfer, "to_transfer");
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("MSGLINE_SHARD_CAPACITY", "100");
        std::env::set_var("MSGLINE_JSON_LOGS", "true");

        let config = ServerConfig::from_env();
        assert_eq!(config.storage.shard_capacity, 100);
        assert!(config.telemetry.json_logs);

        std::env::remove_var("MSGLINE_SHARD_CAPACITY");
        std::env::remove_var("MSGLINE_JSON_LOGS");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load(Some(PathBuf::from("/nonexistent/msgline.toml"))).unwrap();
        assert_eq!(config.topics.to_modify, "to_modify");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ServerConfig::default();
        config.ingest.lanes = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.cache.expiry_jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.retention.remain_secs = -1;
        assert!(config.validate().is_err());
        config.retention.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_storage_options_follow_config() {
        let mut config = ServerConfig::default();
        config.storage.shard_capacity = 10;
        config.cache.invalidation_attempts = 3;

        let options = config.storage_options();
        assert_eq!(options.shard_capacity, 10);
        assert_eq!(options.cache.invalidation_retry.max_attempts, 3);
        assert_eq!(config.batcher_config().lanes, 100);
    }
}
