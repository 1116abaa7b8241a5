// SPDX-FileCopyrightText: © 2025 NodeFlow Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use nodeflow_engine::NetworkExecutorConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::Level;

const fn default_release_timeout_ms() -> u64 {
    5_000
}

const fn default_hook_grace_timeout_ms() -> u64 {
    2_000
}

/// Engine tuning for every network the runner starts.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct EngineConfig {
    /// Per-consumer delivery queue capacity in events (default: 4)
    /// Lower = earlier backpressure, higher = more buffered latency
    pub delivery_capacity: Option<usize>,
    /// Mailbox capacity of each node executor (default: 32)
    pub mailbox_capacity: Option<usize>,
    /// Upper bound on releasing one node, in milliseconds.
    /// A node that has not released by then has its executor aborted.
    #[serde(default = "default_release_timeout_ms")]
    pub release_timeout_ms: u64,
    /// Upper bound on a node's `on_release` hook, in milliseconds
    #[serde(default = "default_hook_grace_timeout_ms")]
    pub hook_grace_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery_capacity: None, // Uses DEFAULT_DELIVERY_CAPACITY when None
            mailbox_capacity: None,  // Uses DEFAULT_NODE_MAILBOX_CAPACITY when None
            release_timeout_ms: default_release_timeout_ms(),
            hook_grace_timeout_ms: default_hook_grace_timeout_ms(),
        }
    }
}

impl EngineConfig {
    pub fn network_config(&self, name: Option<String>) -> NetworkExecutorConfig {
        NetworkExecutorConfig {
            name,
            delivery_capacity: self.delivery_capacity,
            mailbox_capacity: self.mailbox_capacity,
            release_timeout: Duration::from_millis(self.release_timeout_ms),
            hook_grace_timeout: Duration::from_millis(self.hook_grace_timeout_ms),
            shared: None,
        }
    }
}

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
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

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
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
    /// Format for file logging: "text" (default) or "json"
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
            file_path: "./nodeflow.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Metrics export configuration (OpenTelemetry).
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enable: bool,
    /// OTLP endpoint for metrics (e.g., `http://localhost:4318/v1/metrics`).
    /// Metrics are collected but not exported when unset.
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

/// Root configuration of the `nodeflow` binary.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub engine: EngineConfig,
}

/// Result of loading configuration, including the path of a missing config file.
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the configuration from defaults, a TOML file, and `NF_`-prefixed
/// environment variables (e.g. `NF_ENGINE__DELIVERY_CAPACITY=8`).
///
/// # Errors
///
/// Returns an error if the file or environment holds values of the wrong shape.
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // A missing file is not an error; defaults apply.
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("NF_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let result = load("/nonexistent/nodeflow.toml").unwrap();
        assert_eq!(result.file_missing.as_deref(), Some("/nonexistent/nodeflow.toml"));
        assert_eq!(result.config.engine.release_timeout_ms, 5_000);
        assert!(result.config.log.console_enable);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\ndelivery_capacity = 8\nrelease_timeout_ms = 250").unwrap();

        let result = load(file.path().to_str().unwrap()).unwrap();
        assert!(result.file_missing.is_none());
        let network = result.config.engine.network_config(Some("g".to_string()));
        assert_eq!(network.delivery_capacity, Some(8));
        assert_eq!(network.release_timeout, Duration::from_millis(250));
        assert_eq!(network.hook_grace_timeout, Duration::from_millis(2_000));
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = generate_default().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine.hook_grace_timeout_ms, 2_000);
    }
}
