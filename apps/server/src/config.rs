// SPDX-FileCopyrightText: © 2025 WebMCast Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::Level;

use webmcast_engine::ebml::DEFAULT_MAX_ELEMENT_SIZE;
use webmcast_engine::{RegistryConfig, DEFAULT_MAX_ENQUEUED_FRAMES};

const fn default_max_downtime_secs() -> u64 {
    10
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8085".to_string(),
        }
    }
}

/// Limits enforced by the broadcast engine: how long a publisher's stream
/// name stays reserved after it disconnects, how deep each subscriber's
/// backlog is allowed to grow, and the largest single EBML element the
/// tokenizer will buffer before rejecting the stream.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct EngineLimitsConfig {
    #[serde(default = "default_max_downtime_secs")]
    pub max_downtime_secs: u64,
    #[serde(default = "default_max_enqueued_frames")]
    pub max_enqueued_frames: usize,
    #[serde(default = "default_max_element_size")]
    pub max_element_size: u64,
}

const fn default_max_enqueued_frames() -> usize {
    DEFAULT_MAX_ENQUEUED_FRAMES
}

const fn default_max_element_size() -> u64 {
    DEFAULT_MAX_ELEMENT_SIZE
}

impl Default for EngineLimitsConfig {
    fn default() -> Self {
        Self {
            max_downtime_secs: default_max_downtime_secs(),
            max_enqueued_frames: default_max_enqueued_frames(),
            max_element_size: default_max_element_size(),
        }
    }
}

impl EngineLimitsConfig {
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_downtime: Duration::from_secs(self.max_downtime_secs),
            max_enqueued_frames: self.max_enqueued_frames,
            max_element_size: self.max_element_size,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./webmcast.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Root configuration for the webmcast server.
#[derive(Deserialize, Serialize, Default, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub limits: EngineLimitsConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and
/// environment variables (`WEBMCAST_SERVER__ADDRESS`, etc.).
///
/// # Errors
///
/// Returns an error if the configuration file exists but contains invalid
/// TOML, or if environment variables hold values that don't deserialize
/// into [`Config`].
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

    let mut file_missing = None;
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config = figment
        .merge(Env::prefixed("WEBMCAST_").split("__"))
        .extract()
        .map_err(Box::new)?;

    Ok(ConfigLoadResult {
        config,
        file_missing,
    })
}

/// Generates the default configuration as a pretty-printed TOML string,
/// for `webmcast-server config default`.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized,
/// which would indicate a programming error rather than a runtime fault.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}
