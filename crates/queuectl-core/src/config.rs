//! Configuration - JSON ファイルの読み書きと検証
//!
//! - ファイルが無い・空の場合はデフォルト値
//! - 数値が文字列で保存されていても受け付ける（古いツールの書式）
//! - 未知のキーは読み込み時に無視、`set` では拒否

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{BackoffPolicy, DEFAULT_MAX_RETRIES, DEFAULT_NAMESPACE};

pub const DEFAULT_CONFIG_PATH: &str = "data/config.json";
pub const CONFIG_PATH_ENV: &str = "QUEUECTL_CONFIG";
pub const REDIS_URL_ENV: &str = "QUEUECTL_REDIS_URL";
pub const NAMESPACE_ENV: &str = "QUEUECTL_NAMESPACE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unknown config key `{0}` (known keys: {known})", known = ConfigKey::names().join(", "))]
    UnknownKey(String),

    #[error("invalid value for `{key}`: {value:?} ({reason})")]
    InvalidValue {
        key: ConfigKey,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(deserialize_with = "lenient_u32")]
    pub max_retries: u32,

    #[serde(deserialize_with = "lenient_u32")]
    pub backoff_base: u32,

    #[serde(
        deserialize_with = "lenient_opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_backoff_secs: Option<u64>,

    pub redis_url: String,
    pub namespace: String,

    #[serde(deserialize_with = "lenient_u64")]
    pub poll_interval_ms: u64,

    #[serde(deserialize_with = "lenient_u64")]
    pub scheduler_interval_ms: u64,

    #[serde(
        deserialize_with = "lenient_opt_u64",
        skip_serializing_if = "Option::is_none"
    )]
    pub job_timeout_secs: Option<u64>,

    #[serde(deserialize_with = "lenient_u64")]
    pub stop_timeout_secs: u64,

    #[serde(deserialize_with = "lenient_u64")]
    pub stop_pid_timeout_secs: u64,

    pub api_listen: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: 2,
            max_backoff_secs: None,
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            poll_interval_ms: 500,
            scheduler_interval_ms: 2000,
            job_timeout_secs: None,
            stop_timeout_secs: 10,
            stop_pid_timeout_secs: 5,
            api_listen: "127.0.0.1:5000".to_string(),
        }
    }
}

/// Settable configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    MaxRetries,
    BackoffBase,
    MaxBackoffSecs,
    RedisUrl,
    Namespace,
    PollIntervalMs,
    SchedulerIntervalMs,
    JobTimeoutSecs,
    StopTimeoutSecs,
    StopPidTimeoutSecs,
    ApiListen,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 11] = [
        ConfigKey::MaxRetries,
        ConfigKey::BackoffBase,
        ConfigKey::MaxBackoffSecs,
        ConfigKey::RedisUrl,
        ConfigKey::Namespace,
        ConfigKey::PollIntervalMs,
        ConfigKey::SchedulerIntervalMs,
        ConfigKey::JobTimeoutSecs,
        ConfigKey::StopTimeoutSecs,
        ConfigKey::StopPidTimeoutSecs,
        ConfigKey::ApiListen,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConfigKey::MaxRetries => "max_retries",
            ConfigKey::BackoffBase => "backoff_base",
            ConfigKey::MaxBackoffSecs => "max_backoff_secs",
            ConfigKey::RedisUrl => "redis_url",
            ConfigKey::Namespace => "namespace",
            ConfigKey::PollIntervalMs => "poll_interval_ms",
            ConfigKey::SchedulerIntervalMs => "scheduler_interval_ms",
            ConfigKey::JobTimeoutSecs => "job_timeout_secs",
            ConfigKey::StopTimeoutSecs => "stop_timeout_secs",
            ConfigKey::StopPidTimeoutSecs => "stop_pid_timeout_secs",
            ConfigKey::ApiListen => "api_listen",
        }
    }

    pub fn names() -> Vec<&'static str> {
        Self::ALL.iter().map(|k| k.as_str()).collect()
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownKey(s.to_string()))
    }
}

impl QueueConfig {
    /// `--config` flag, then `QUEUECTL_CONFIG`, then `./data/config.json`.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Read the file; missing or blank files yield defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `load` followed by the `QUEUECTL_REDIS_URL` / `QUEUECTL_NAMESPACE` overrides.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(REDIS_URL_ENV).filter(|v| !v.trim().is_empty()) {
            self.redis_url = url;
        }
        if let Some(ns) = lookup(NAMESPACE_ENV).filter(|v| !v.trim().is_empty()) {
            self.namespace = ns;
        }
    }

    /// Write pretty JSON, creating the parent directory.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let mut json = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: io::Error::other(e),
        })?;
        json.push('\n');
        fs::write(path, json).map_err(write_err)
    }

    /// Current value of `key` as shown to the user. Unset optionals print as `none`.
    pub fn get(&self, key: ConfigKey) -> String {
        fn opt(v: Option<u64>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "none".to_string())
        }
        match key {
            ConfigKey::MaxRetries => self.max_retries.to_string(),
            ConfigKey::BackoffBase => self.backoff_base.to_string(),
            ConfigKey::MaxBackoffSecs => opt(self.max_backoff_secs),
            ConfigKey::RedisUrl => self.redis_url.clone(),
            ConfigKey::Namespace => self.namespace.clone(),
            ConfigKey::PollIntervalMs => self.poll_interval_ms.to_string(),
            ConfigKey::SchedulerIntervalMs => self.scheduler_interval_ms.to_string(),
            ConfigKey::JobTimeoutSecs => opt(self.job_timeout_secs),
            ConfigKey::StopTimeoutSecs => self.stop_timeout_secs.to_string(),
            ConfigKey::StopPidTimeoutSecs => self.stop_pid_timeout_secs.to_string(),
            ConfigKey::ApiListen => self.api_listen.clone(),
        }
    }

    /// Validate `value` for `key` and store it. Optionals accept `none` to unset.
    pub fn set(&mut self, key: ConfigKey, value: &str) -> Result<(), ConfigError> {
        let raw = value.trim();
        let invalid = |reason: &str| ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let uint = || raw.parse::<u64>().map_err(|_| invalid("expected a non-negative integer"));
        let positive = || match uint()? {
            0 => Err(invalid("must be greater than zero")),
            n => Ok(n),
        };
        let optional = || -> Result<Option<u64>, ConfigError> {
            if raw.eq_ignore_ascii_case("none") || raw.is_empty() {
                Ok(None)
            } else {
                positive().map(Some)
            }
        };
        let non_empty = || {
            if raw.is_empty() {
                Err(invalid("must not be empty"))
            } else {
                Ok(raw.to_string())
            }
        };

        match key {
            ConfigKey::MaxRetries => {
                self.max_retries =
                    u32::try_from(uint()?).map_err(|_| invalid("value is too large"))?;
            }
            ConfigKey::BackoffBase => {
                let base = u32::try_from(uint()?).map_err(|_| invalid("value is too large"))?;
                if base < 1 {
                    return Err(invalid("must be at least 1"));
                }
                self.backoff_base = base;
            }
            ConfigKey::MaxBackoffSecs => self.max_backoff_secs = optional()?,
            ConfigKey::RedisUrl => {
                let url = non_empty()?;
                if !(url.starts_with("redis://")
                    || url.starts_with("rediss://")
                    || url.starts_with("redis+unix://")
                    || url.starts_with("unix://"))
                {
                    return Err(invalid("expected a redis:// URL"));
                }
                self.redis_url = url;
            }
            ConfigKey::Namespace => {
                let ns = non_empty()?;
                if ns.contains(char::is_whitespace) {
                    return Err(invalid("must not contain whitespace"));
                }
                self.namespace = ns;
            }
            ConfigKey::PollIntervalMs => self.poll_interval_ms = positive()?,
            ConfigKey::SchedulerIntervalMs => self.scheduler_interval_ms = positive()?,
            ConfigKey::JobTimeoutSecs => self.job_timeout_secs = optional()?,
            ConfigKey::StopTimeoutSecs => self.stop_timeout_secs = positive()?,
            ConfigKey::StopPidTimeoutSecs => self.stop_pid_timeout_secs = positive()?,
            ConfigKey::ApiListen => {
                let addr = non_empty()?;
                if addr.parse::<std::net::SocketAddr>().is_err() {
                    return Err(invalid("expected HOST:PORT"));
                }
                self.api_listen = addr;
            }
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::new(self.backoff_base);
        match self.max_backoff_secs {
            Some(secs) => policy.with_max_delay(Duration::from_secs(secs)),
            None => policy,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs.map(Duration::from_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stop_pid_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_pid_timeout_secs)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(u64),
    Text(String),
    Null(()),
}

fn lenient_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(Some(n)),
        NumberOrString::Text(s) if s.trim().is_empty() || s.trim().eq_ignore_ascii_case("none") => {
            Ok(None)
        }
        NumberOrString::Text(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a number, got {s:?}"))),
        NumberOrString::Null(()) => Ok(None),
    }
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    lenient_number(deserializer)?.ok_or_else(|| de::Error::custom("expected a number"))
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let n = lenient_u64(deserializer)?;
    u32::try_from(n).map_err(|_| de::Error::custom(format!("{n} is out of range")))
}

fn lenient_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    lenient_number(deserializer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    #[test]
    fn missing_and_empty_files_give_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        assert_eq!(QueueConfig::load(&path).unwrap(), QueueConfig::default());

        fs::write(&path, "  \n").unwrap();
        assert_eq!(QueueConfig::load(&path).unwrap(), QueueConfig::default());
    }

    #[test]
    fn numeric_strings_and_unknown_keys_are_accepted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"max_retries": "5", "backoff_base": 3, "legacy_option": true}"#,
        )
        .unwrap();

        let config = QueueConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff_base, 3);
        assert_eq!(config.namespace, "queuectl");
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_retries": "many"}"#).unwrap();
        assert!(matches!(
            QueueConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn save_creates_parent_dirs_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/data/config.json");
        let mut config = QueueConfig::default();
        config.set(ConfigKey::MaxRetries, "7").unwrap();
        config.set(ConfigKey::JobTimeoutSecs, "30").unwrap();

        config.save(&path).unwrap();
        assert_eq!(QueueConfig::load(&path).unwrap(), config);
    }

    #[rstest]
    #[case("max_retries", "0", "0")]
    #[case("max-retries", "4", "4")]
    #[case("backoff_base", "3", "3")]
    #[case("max_backoff_secs", "none", "none")]
    #[case("max_backoff_secs", "60", "60")]
    #[case("namespace", "jobs", "jobs")]
    #[case("redis_url", "redis://localhost:6380/1", "redis://localhost:6380/1")]
    #[case("api_listen", "0.0.0.0:8080", "0.0.0.0:8080")]
    fn set_then_get(#[case] key: &str, #[case] value: &str, #[case] shown: &str) {
        let key: ConfigKey = key.parse().unwrap();
        let mut config = QueueConfig::default();
        config.set(key, value).unwrap();
        assert_eq!(config.get(key), shown);
    }

    #[rstest]
    #[case("max_retries", "-1")]
    #[case("backoff_base", "0")]
    #[case("poll_interval_ms", "0")]
    #[case("redis_url", "http://localhost")]
    #[case("namespace", "two words")]
    #[case("api_listen", "localhost")]
    fn invalid_values_are_rejected(#[case] key: &str, #[case] value: &str) {
        let key: ConfigKey = key.parse().unwrap();
        let mut config = QueueConfig::default();
        assert!(matches!(
            config.set(key, value),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert_eq!(config, QueueConfig::default());
    }

    #[test]
    fn unknown_key_is_rejected() {
        assert!(matches!(
            "retries".parse::<ConfigKey>(),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn env_overrides_win() {
        let mut config = QueueConfig::default();
        config.apply_env_overrides(|name| match name {
            REDIS_URL_ENV => Some("redis://other:6379/2".to_string()),
            NAMESPACE_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.redis_url, "redis://other:6379/2");
        assert_eq!(config.namespace, "queuectl");
    }

    #[test]
    fn backoff_policy_follows_config() {
        let mut config = QueueConfig::default();
        assert_eq!(config.backoff(), BackoffPolicy::default());

        config.set(ConfigKey::MaxBackoffSecs, "10").unwrap();
        assert_eq!(config.backoff().delay(8), Duration::from_secs(10));
    }

    #[test]
    fn explicit_path_wins() {
        let path = QueueConfig::resolve_path(Some(Path::new("/tmp/x.json")));
        assert_eq!(path, PathBuf::from("/tmp/x.json"));
    }
}
