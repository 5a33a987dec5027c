//! Engine configuration.
//!
//! Values come from the environment (`SOURCEKIT_*`) or from the `with_*`
//! builders. Loading never fails: an unparseable value falls back to its
//! default and is reported with `warn!`.

use std::env;
use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

pub const SNAPSHOT_MODE_ENV: &str = "SOURCEKIT_SNAPSHOT_MODE";
pub const SNAPSHOT_THRESHOLD_ENV: &str = "SOURCEKIT_SNAPSHOT_THRESHOLD";
pub const PUBLISH_EVENTS_ENV: &str = "SOURCEKIT_PUBLISH_EVENTS";
pub const DATABASE_URL_ENV: &str = "SOURCEKIT_DATABASE_URL";
pub const DATABASE_MAX_CONNECTIONS_ENV: &str = "SOURCEKIT_DATABASE_MAX_CONNECTIONS";

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// How threshold-triggered snapshots are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotMode {
    /// Spawned on the tokio runtime; `dispatch` does not wait for it.
    #[default]
    Background,
    /// Awaited before `dispatch` returns.
    Inline,
    /// Never written automatically.
    Disabled,
}

impl FromStr for SnapshotMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "background" => Ok(Self::Background),
            "inline" => Ok(Self::Inline),
            "disabled" | "off" => Ok(Self::Disabled),
            other => Err(ConfigError::Invalid {
                key: SNAPSHOT_MODE_ENV,
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} is not set")]
    Missing { key: &'static str },

    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime knobs of the event-sourcing service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub snapshot_mode: SnapshotMode,
    /// Replaces every aggregate's own threshold when set. `0` disables.
    pub snapshot_threshold_override: Option<u64>,
    pub publish_events: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_mode: SnapshotMode::Background,
            snapshot_threshold_override: None,
            publish_events: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            snapshot_mode: parse_or(&lookup, SNAPSHOT_MODE_ENV, defaults.snapshot_mode),
            snapshot_threshold_override: lookup(SNAPSHOT_THRESHOLD_ENV).and_then(|raw| {
                raw.trim()
                    .parse()
                    .inspect_err(|_| {
                        tracing::warn!(
                            key = SNAPSHOT_THRESHOLD_ENV,
                            value = %raw,
                            "ignoring invalid value"
                        )
                    })
                    .ok()
            }),
            publish_events: parse_or(&lookup, PUBLISH_EVENTS_ENV, defaults.publish_events),
        }
    }

    pub fn with_snapshot_mode(mut self, mode: SnapshotMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold_override = Some(threshold);
        self
    }

    pub fn with_publish_events(mut self, publish: bool) -> Self {
        self.publish_events = publish;
        self
    }

    /// Threshold in effect for an aggregate declaring `declared`.
    pub fn snapshot_threshold(&self, declared: u64) -> u64 {
        self.snapshot_threshold_override.unwrap_or(declared)
    }
}

/// Connection settings for [`PostgresEventStore`](crate::event_store::PostgresEventStore).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    DEFAULT_MAX_CONNECTIONS
}

impl PostgresConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(DATABASE_URL_ENV)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigError::Missing {
                key: DATABASE_URL_ENV,
            })?;

        Ok(Self {
            url,
            max_connections: parse_or(
                &lookup,
                DATABASE_MAX_CONNECTIONS_ENV,
                DEFAULT_MAX_CONNECTIONS,
            ),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring invalid value");
            default
        }),
        None => default,
    }
}
