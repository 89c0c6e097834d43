//! Runtime configuration: defaults, then an optional TOML file, then the environment.

use crate::cache::CacheSettings;
use crate::cache::mirror::DEFAULT_PREFIX;
use crate::provider::ProviderSettings;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base level for this crate's log events.
    pub log_level: String,
    #[serde(with = "human_duration")]
    pub cache_ttl: Duration,
    /// How long a caller waits on another caller's in-flight fetch.
    #[serde(with = "human_duration")]
    pub wait_timeout: Duration,
    #[serde(with = "human_duration")]
    pub debounce_delay: Duration,
    /// Quiet period before refetching after changes to tables not patched locally.
    #[serde(with = "human_duration")]
    pub refetch_delay: Duration,
    /// Directory for the durable mirror. No mirror when unset.
    pub mirror_dir: Option<PathBuf>,
    pub mirror_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        let cache = CacheSettings::default();
        Self {
            log_level: "info".to_owned(),
            cache_ttl: cache.ttl,
            wait_timeout: cache.wait_timeout,
            debounce_delay: cache.debounce_delay,
            refetch_delay: ProviderSettings::default().refetch_delay,
            mirror_dir: None,
            mirror_prefix: DEFAULT_PREFIX.to_owned(),
        }
    }
}

impl Config {
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = file {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::raw().only(&[
            "LOG_LEVEL",
            "CACHE_TTL",
            "WAIT_TIMEOUT",
            "DEBOUNCE_DELAY",
            "REFETCH_DELAY",
            "MIRROR_DIR",
            "MIRROR_PREFIX",
        ]))
    }

    pub fn load(file: Option<&Path>) -> Result<Self, figment::Error> {
        Self::figment(file).extract()
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            ttl: self.cache_ttl,
            wait_timeout: self.wait_timeout,
            debounce_delay: self.debounce_delay,
        }
    }

    pub fn provider_settings(&self) -> ProviderSettings {
        ProviderSettings {
            refetch_delay: self.refetch_delay,
        }
    }
}

/// Durations as strings like `"300ms"` or `"5m"`; plain integers are seconds.
mod human_duration {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => {
                crate::utils::parse_duration(&text).map_err(serde::de::Error::custom)
            }
        }
    }
}
