// Configuration types for backend selection, pools and the sync bridge

use crate::error::{Error, Result};
use crate::runtime::PayloadRef;
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// A closed set of named values that a setting may take besides `auto`
pub trait SettingValue: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    /// Setting name used in error messages
    const SETTING: &'static str;

    /// Environment variable that carries the setting
    const ENV_VAR: &'static str;

    /// Recognized spellings, in canonical order
    const VARIANTS: &'static [(&'static str, Self)];

    fn name(self) -> &'static str {
        Self::VARIANTS
            .iter()
            .find(|(_, v)| *v == self)
            .map(|(name, _)| *name)
            .unwrap_or("?")
    }
}

/// Three-valued setting: `auto` or an explicit value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting<T> {
    Auto,
    Explicit(T),
}

impl<T> Default for Setting<T> {
    fn default() -> Self {
        Setting::Auto
    }
}

impl<T: SettingValue> Setting<T> {
    /// Read the setting from its environment variable, `auto` when unset
    pub fn from_env() -> Result<Self> {
        match std::env::var(T::ENV_VAR) {
            Ok(raw) => raw.parse(),
            Err(std::env::VarError::NotPresent) => Ok(Setting::Auto),
            Err(std::env::VarError::NotUnicode(raw)) => {
                Err(Error::configuration(T::SETTING, &raw.to_string_lossy()))
            }
        }
    }

    pub fn explicit(self) -> Option<T> {
        match self {
            Setting::Auto => None,
            Setting::Explicit(value) => Some(value),
        }
    }
}

impl<T: SettingValue> FromStr for Setting<T> {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed == "auto" {
            return Ok(Setting::Auto);
        }
        T::VARIANTS
            .iter()
            .find(|(name, _)| *name == trimmed)
            .map(|(_, value)| Setting::Explicit(*value))
            .ok_or_else(|| Error::configuration(T::SETTING, raw))
    }
}

impl<T: SettingValue> fmt::Display for Setting<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Setting::Auto => f.write_str("auto"),
            Setting::Explicit(value) => f.write_str(value.name()),
        }
    }
}

impl<'de, T: SettingValue> Deserialize<'de> for Setting<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Concrete execution backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Run the module on the calling thread
    InProcess,
    /// OS worker threads with direct value passing
    ThreadPool,
    /// Message-passing workers loaded from a script reference
    WorkerPool,
}

impl SettingValue for BackendKind {
    const SETTING: &'static str = "backend";
    const ENV_VAR: &'static str = "OFFCHECK_BACKEND";
    const VARIANTS: &'static [(&'static str, Self)] = &[
        ("in-process", BackendKind::InProcess),
        ("thread-pool", BackendKind::ThreadPool),
        ("worker-pool", BackendKind::WorkerPool),
    ];
}

/// How the synchronous surface reaches the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMode {
    /// Hand the call to the bridge helper and park until it replies
    Bridge,
    /// Block directly on the executor's pending call
    Direct,
}

impl SettingValue for SyncMode {
    const SETTING: &'static str = "sync-backend";
    const ENV_VAR: &'static str = "OFFCHECK_SYNC_BACKEND";
    const VARIANTS: &'static [(&'static str, Self)] =
        &[("bridge", SyncMode::Bridge), ("direct", SyncMode::Direct)];
}

/// Host runtime family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Server runtime with OS threads and filesystem access
    Server,
    /// Sandboxed runtime that only offers message-passing workers
    Browser,
}

impl SettingValue for Platform {
    const SETTING: &'static str = "platform";
    const ENV_VAR: &'static str = "OFFCHECK_PLATFORM";
    const VARIANTS: &'static [(&'static str, Self)] =
        &[("server", Platform::Server), ("browser", Platform::Browser)];
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of execution units to spawn
    pub max_workers: usize,

    /// Prefix for unit thread names
    pub thread_name: String,

    /// Stack size for unit threads, platform default when unset
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_workers: parallelism.min(4),
            thread_name: "offcheck-worker".to_string(),
            stack_size: None,
        }
    }
}

impl PoolConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::configuration("max_workers", "0"));
        }
        Ok(())
    }
}

/// Default size of the bridge's shared channel
pub const DEFAULT_BRIDGE_CAPACITY: usize = 1024 * 1024;

/// Synchronous bridge configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Deadline for one blocking call; waits forever when unset
    #[serde(rename = "timeout_ms", deserialize_with = "millis")]
    pub timeout: Option<Duration>,

    /// Maximum serialized size of a request or reply in bytes
    pub capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            capacity: DEFAULT_BRIDGE_CAPACITY,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error> {
    Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
}

/// Top-level configuration, passed once to [`crate::CheckService::new`]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: Setting<BackendKind>,
    pub sync_backend: Setting<SyncMode>,
    pub platform: Setting<Platform>,
    pub pool: PoolConfig,
    pub bridge: BridgeConfig,

    /// Payload reference for the execution units, inline module when unset
    pub payload: Option<PayloadRef>,
}

impl Config {
    /// Build a configuration from `OFFCHECK_*` environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            backend: Setting::from_env()?,
            sync_backend: Setting::from_env()?,
            platform: Setting::from_env()?,
            ..Self::default()
        })
    }

    /// Parse a TOML document with the same fields as [`Config`]
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source)
            .map_err(|e| Error::configuration("config", e.message()))?;
        config.pool.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_known_values() {
        assert_eq!(
            "auto".parse::<Setting<BackendKind>>().unwrap(),
            Setting::Auto
        );
        assert_eq!(
            " thread-pool ".parse::<Setting<BackendKind>>().unwrap(),
            Setting::Explicit(BackendKind::ThreadPool)
        );
        assert_eq!(
            "bridge".parse::<Setting<SyncMode>>().unwrap(),
            Setting::Explicit(SyncMode::Bridge)
        );
        assert_eq!(
            "browser".parse::<Setting<Platform>>().unwrap(),
            Setting::Explicit(Platform::Browser)
        );
    }

    #[test]
    fn unknown_setting_names_the_value() {
        let err = "bogus-backend".parse::<Setting<BackendKind>>().unwrap_err();
        assert_eq!(
            err,
            Error::Configuration {
                setting: "backend".to_string(),
                value: "bogus-backend".to_string(),
            }
        );
        assert!(err.to_string().contains("bogus-backend"));

        // names are case-sensitive
        assert!("Thread-Pool".parse::<Setting<BackendKind>>().is_err());
        assert!("".parse::<Setting<SyncMode>>().is_err());
    }

    #[test]
    fn setting_display_round_trips() {
        for (name, value) in BackendKind::VARIANTS {
            assert_eq!(Setting::Explicit(*value).to_string(), *name);
        }
        assert_eq!(Setting::<Platform>::Auto.to_string(), "auto");
    }

    #[test]
    fn default_config_is_all_auto() {
        let config = Config::default();
        assert_eq!(config.backend, Setting::Auto);
        assert_eq!(config.sync_backend, Setting::Auto);
        assert_eq!(config.platform, Setting::Auto);
        assert!(config.pool.max_workers >= 1 && config.pool.max_workers <= 4);
        assert_eq!(config.bridge.capacity, DEFAULT_BRIDGE_CAPACITY);
        assert!(config.bridge.timeout.is_none());
        assert!(config.payload.is_none());
    }

    #[test]
    fn toml_config_is_parsed() {
        let config = Config::from_toml_str(
            r#"
            backend = "worker-pool"
            platform = "server"

            [pool]
            max_workers = 2

            [bridge]
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.backend, Setting::Explicit(BackendKind::WorkerPool));
        assert_eq!(config.sync_backend, Setting::Auto);
        assert_eq!(config.platform, Setting::Explicit(Platform::Server));
        assert_eq!(config.pool.max_workers, 2);
        assert_eq!(config.bridge.timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn toml_config_rejects_unknown_values() {
        let err = Config::from_toml_str(r#"sync_backend = "synckit""#).unwrap_err();
        assert!(err.to_string().contains("synckit"));

        let err = Config::from_toml_str("[pool]\nmax_workers = 0").unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
