//! Configuration for ddmux.
//!
//! All sections are optional in TOML; missing keys fall back to defaults that
//! match what ART/Dalvik debuggers typically tolerate. Durations are stored as
//! milliseconds so the file format stays flat, with `Duration` accessors for
//! callers.

use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JdwpConfig {
    /// Timeout for the `JDWP-Handshake` exchange (in milliseconds).
    #[serde(default = "JdwpConfig::default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Timeout applied to a single packet write (in milliseconds).
    #[serde(default = "JdwpConfig::default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Optional timeout applied to each transport read.
    ///
    /// Expiring while waiting for a new packet is harmless: the pump keeps
    /// waiting. Expiring inside a packet breaks the session. When unset the
    /// pump waits for the next packet forever, which is the normal mode for a
    /// long-lived debug channel.
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,

    /// Largest packet (header included) accepted from the peer.
    #[serde(default = "JdwpConfig::default_max_packet_bytes")]
    pub max_packet_bytes: usize,
}

impl JdwpConfig {
    fn default_handshake_timeout_ms() -> u64 {
        5_000
    }

    fn default_write_timeout_ms() -> u64 {
        10_000
    }

    fn default_max_packet_bytes() -> usize {
        16 * 1024 * 1024
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms
            .map(|ms| Duration::from_millis(ms.max(1)))
    }
}

impl Default for JdwpConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: Self::default_handshake_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            read_timeout_ms: None,
            max_packet_bytes: Self::default_max_packet_bytes(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    /// Delay before a property collection is restarted on a fresh session.
    #[serde(default = "CollectorConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Number of collection attempts per process before giving up.
    #[serde(default = "CollectorConfig::default_max_attempts")]
    pub max_attempts: u32,
}

impl CollectorConfig {
    fn default_retry_delay_ms() -> u64 {
        2_000
    }

    fn default_max_attempts() -> u32 {
        5
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.max(1))
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: Self::default_retry_delay_ms(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    /// Backoff before re-subscribing to a device's process list after a
    /// transient failure.
    #[serde(default = "TrackerConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl TrackerConfig {
    fn default_retry_delay_ms() -> u64 {
        2_000
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.max(1))
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: Self::default_retry_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Logging level, or a full `EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    /// Emit logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_owned()
    }

    pub(crate) fn normalize_level_directives(input: &str) -> String {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Self::default_level();
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "trace" => "trace".to_owned(),
            "debug" => "debug".to_owned(),
            "info" => "info".to_owned(),
            "warn" | "warning" => "warn".to_owned(),
            "error" => "error".to_owned(),
            _ => trimmed.to_owned(),
        }
    }

    fn config_env_filter(&self) -> tracing_subscriber::EnvFilter {
        let directives = Self::normalize_level_directives(&self.level);
        tracing_subscriber::EnvFilter::try_new(directives).unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::default()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        })
    }

    /// Effective `EnvFilter`: the configured level, merged with `RUST_LOG`
    /// when that is set.
    pub fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        let env_directives = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        match env_directives {
            Some(env_directives) => {
                let config_directives = Self::normalize_level_directives(&self.level);
                let combined = format!("{config_directives},{env_directives}");
                tracing_subscriber::EnvFilter::try_new(combined)
                    .or_else(|_| tracing_subscriber::EnvFilter::try_new(env_directives))
                    .unwrap_or_else(|_| self.config_env_filter())
            }
            None => self.config_env_filter(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            json: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DdmuxConfig {
    #[serde(default)]
    pub jdwp: JdwpConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // Keep only the message; the default `Display` embeds a source snippet.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl DdmuxConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

static TRACING_INIT: Once = Once::new();

/// Install the global tracing subscriber.
///
/// Only the first call has an effect; later calls (and calls made after some
/// other subscriber was installed) are ignored.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INIT.call_once(|| {
        let filter = config.env_filter();
        let layer: Box<dyn tracing_subscriber::Layer<_> + Send + Sync> = if config.json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .boxed()
        };

        let subscriber = tracing_subscriber::registry().with(filter).with(layer);
        if tracing::subscriber::set_global_default(subscriber).is_ok() {
            tracing::debug!(
                target: "ddmux.config",
                level = %config.level,
                json = config.json,
                "tracing initialized"
            );
        }
    });
}
