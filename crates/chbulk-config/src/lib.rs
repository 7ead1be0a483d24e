// chbulk-config - Resolved runtime configuration
//
// Sources, in priority order:
// 1. Environment variables (CHBULK_* prefix, highest)
// 2. Config file path from CHBULK_CONFIG env var
// 3. Default config file location (./config.toml)
// 4. Built-in defaults (lowest)
//
// The core consumes the fully resolved struct; layering lives here only.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

mod env_overrides;

use env_overrides::StdEnvSource;

/// Fully resolved proxy configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// HTTP listen address.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Row-fragment count per table before a forced flush.
    #[serde(default = "default_flush_count")]
    pub flush_count: usize,

    /// Wall-clock cap on buffer age, milliseconds.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Directory for undeliverable batches.
    #[serde(default = "default_dump_dir")]
    pub dump_dir: String,

    /// Overflow-sweep interval in seconds; negative disables replay.
    #[serde(default = "default_dump_check_interval_secs")]
    pub dump_check_interval_secs: i64,

    /// Log incoming requests at debug level.
    #[serde(default)]
    pub debug: bool,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub clickhouse: ClickhouseConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format: {other} (expected text or json)"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClickhouseConfig {
    /// Backend node base URLs.
    #[serde(default = "default_servers")]
    pub servers: Vec<String>,

    /// Seconds a failed node is skipped before the optimistic retry.
    #[serde(default = "default_down_timeout_secs")]
    pub down_timeout_secs: u64,

    /// Optional per-attempt connect timeout, seconds.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Number of dedup cache shards, must be a power of two.
    #[serde(default = "default_cache_shards")]
    pub shards: usize,

    /// Minutes after which an entry can be evicted.
    #[serde(default = "default_life_window_mins")]
    pub life_window_mins: u64,

    /// Minutes between active sweeps of expired entries; <= 0 disables.
    #[serde(default)]
    pub clean_window_mins: i64,

    /// Expected entries per life window, a shard-sizing hint only.
    #[serde(default = "default_max_entries_in_window")]
    pub max_entries_in_window: usize,

    /// Expected entry size in bytes, a shard-sizing hint only.
    #[serde(default = "default_max_entry_size")]
    pub max_entry_size: usize,

    /// Log cache evictions.
    #[serde(default)]
    pub verbose: bool,

    /// Hard cache size ceiling in megabytes; 0 means unbounded.
    #[serde(default)]
    pub max_cache_size_mb: usize,
}

fn default_listen() -> String {
    "0.0.0.0:8124".to_string()
}
fn default_flush_count() -> usize {
    10_000
}
fn default_flush_interval_ms() -> u64 {
    1_000
}
fn default_dump_dir() -> String {
    "dumps".to_string()
}
fn default_dump_check_interval_secs() -> i64 {
    300
}
fn default_servers() -> Vec<String> {
    vec!["http://127.0.0.1:8123".to_string()]
}
fn default_down_timeout_secs() -> u64 {
    300
}
fn default_cache_shards() -> usize {
    1024
}
fn default_life_window_mins() -> u64 {
    10
}
fn default_max_entries_in_window() -> usize {
    600_000
}
fn default_max_entry_size() -> usize {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            flush_count: default_flush_count(),
            flush_interval_ms: default_flush_interval_ms(),
            dump_dir: default_dump_dir(),
            dump_check_interval_secs: default_dump_check_interval_secs(),
            debug: false,
            log_format: LogFormat::default(),
            clickhouse: ClickhouseConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for ClickhouseConfig {
    fn default() -> Self {
        Self {
            servers: default_servers(),
            down_timeout_secs: default_down_timeout_secs(),
            connect_timeout_secs: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shards: default_cache_shards(),
            life_window_mins: default_life_window_mins(),
            clean_window_mins: 0,
            max_entries_in_window: default_max_entries_in_window(),
            max_entry_size: default_max_entry_size(),
            verbose: false,
            max_cache_size_mb: 0,
        }
    }
}

impl Config {
    /// Load from an explicit file path, then apply environment overrides
    /// and validate.
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        env_overrides::apply(&mut config, &StdEnvSource)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from standard locations with graceful fallback to defaults,
    /// then apply environment overrides and validate.
    pub fn load_or_default() -> Result<Self> {
        let mut config = match std::env::var("CHBULK_CONFIG") {
            Ok(path) => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read config file: {path}"))?;
                toml::from_str(&content)
                    .with_context(|| format!("failed to parse config file: {path}"))?
            }
            Err(_) => {
                let default_path = std::path::Path::new("./config.toml");
                if default_path.exists() {
                    let content = std::fs::read_to_string(default_path)
                        .context("failed to read ./config.toml")?;
                    toml::from_str(&content).context("failed to parse ./config.toml")?
                } else {
                    Config::default()
                }
            }
        };
        env_overrides::apply(&mut config, &StdEnvSource)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_count == 0 {
            anyhow::bail!("flush_count must be at least 1");
        }
        if self.flush_interval_ms == 0 {
            anyhow::bail!("flush_interval_ms must be at least 1");
        }
        if self.clickhouse.servers.is_empty() {
            anyhow::bail!("at least one backend server is required");
        }
        if self.cache.shards == 0 || !self.cache.shards.is_power_of_two() {
            anyhow::bail!(
                "cache.shards must be a power of two, got {}",
                self.cache.shards
            );
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Overflow-sweep interval; `None` means replay is disabled.
    pub fn dump_check_interval(&self) -> Option<Duration> {
        if self.dump_check_interval_secs < 0 {
            None
        } else {
            Some(Duration::from_secs(self.dump_check_interval_secs as u64))
        }
    }
}

impl ClickhouseConfig {
    pub fn down_timeout(&self) -> Duration {
        Duration::from_secs(self.down_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

impl CacheConfig {
    pub fn life_window(&self) -> Duration {
        Duration::from_secs(self.life_window_mins * 60)
    }

    /// Active-sweep interval; `None` when sweeping is disabled.
    pub fn clean_window(&self) -> Option<Duration> {
        if self.clean_window_mins <= 0 {
            None
        } else {
            Some(Duration::from_secs(self.clean_window_mins as u64 * 60))
        }
    }

    pub fn max_bytes(&self) -> usize {
        self.max_cache_size_mb * 1024 * 1024
    }
}
