//! Runtime configuration.
//!
//! Layered as: built-in defaults, then a TOML file (`config/default.toml` or
//! the path given on the command line), then `TRADEBOT__SECTION__KEY`
//! environment variables. All durations are milliseconds.

use crate::execution::RetryPolicy;
use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "config/default";
const ENV_PREFIX: &str = "TRADEBOT";

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorSettings,
    pub recorder: RecorderSettings,
    pub gateway: GatewaySettings,
    pub market_data: MarketDataSettings,
    pub controllers: Vec<ControllerSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub tick_interval_ms: u64,
    pub queue_capacity: usize,
    pub shutdown_deadline_ms: u64,
    /// Deadline applied to every gateway call
    pub gateway_timeout_ms: u64,
    /// Rejected actions kept per controller in its report
    pub error_history: usize,
    pub retry: RetryPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            queue_capacity: 256,
            shutdown_deadline_ms: 5_000,
            gateway_timeout_ms: 2_000,
            error_history: 20,
            retry: RetryPolicy::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_millis(self.shutdown_deadline_ms)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RecorderBackend {
    #[default]
    Memory,
    Redis,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub backend: RecorderBackend,
    /// Connection URL, required for redis and postgres
    pub url: Option<String>,
    /// Key prefix for the redis backend
    pub namespace: String,
    /// Backoff for retrying failed writes
    pub retry: RetryPolicy,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            backend: RecorderBackend::Memory,
            url: None,
            namespace: "tradebot".to_string(),
            retry: RetryPolicy {
                max_attempts: u32::MAX,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 60_000,
                multiplier: 2.0,
                jitter: 0.1,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Fee rate charged by the paper gateway
    pub taker_fee: Decimal,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            taker_fee: Decimal::new(1, 3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketDataSettings {
    /// Book ticker endpoint host, polling is off when unset
    pub base_url: Option<String>,
    pub poll_interval_ms: u64,
    pub requests_per_minute: u32,
    pub instruments: Vec<String>,
}

impl Default for MarketDataSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            poll_interval_ms: 1_000,
            requests_per_minute: 600,
            instruments: Vec::new(),
        }
    }
}

impl MarketDataSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One controller instance to build at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSettings {
    pub id: String,
    pub controller_type: String,
    pub instrument: String,
    #[serde(default = "default_controller_tick_ms")]
    pub tick_interval_ms: u64,
    /// Free-form parameters, interpreted by the controller type
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_controller_tick_ms() -> u64 {
    1_000
}

impl ControllerSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Settings {
    /// Load from `path`, or from `config/default.toml` when it exists
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse a TOML document without touching the environment
    pub fn from_toml(toml: &str) -> Result<Self, SettingsError> {
        let settings: Settings = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let o = &self.orchestrator;
        if o.tick_interval_ms == 0 {
            return Err(invalid("orchestrator.tick_interval_ms must be positive"));
        }
        if o.queue_capacity == 0 {
            return Err(invalid("orchestrator.queue_capacity must be positive"));
        }
        if o.gateway_timeout_ms == 0 {
            return Err(invalid("orchestrator.gateway_timeout_ms must be positive"));
        }
        if o.retry.max_attempts == 0 || self.recorder.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be positive"));
        }
        if self.recorder.backend != RecorderBackend::Memory && self.recorder.url.is_none() {
            return Err(invalid("recorder.url is required for redis and postgres"));
        }
        if self.gateway.taker_fee < Decimal::ZERO {
            return Err(invalid("gateway.taker_fee must not be negative"));
        }
        if self.market_data.base_url.is_some() && self.market_data.poll_interval_ms == 0 {
            return Err(invalid("market_data.poll_interval_ms must be positive"));
        }

        let mut seen = std::collections::HashSet::new();
        for controller in &self.controllers {
            if controller.id.trim().is_empty() {
                return Err(invalid("controller id must not be empty"));
            }
            if !seen.insert(controller.id.as_str()) {
                return Err(invalid(format!("duplicate controller id '{}'", controller.id)));
            }
            if controller.tick_interval_ms == 0 {
                return Err(invalid(format!(
                    "controller '{}' tick_interval_ms must be positive",
                    controller.id
                )));
            }
        }

        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> SettingsError {
    SettingsError::Invalid(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.orchestrator.tick_interval(), Duration::from_secs(1));
        assert_eq!(settings.recorder.backend, RecorderBackend::Memory);
    }

    #[test]
    fn test_parse_toml() {
        let settings = Settings::from_toml(
            r#"
            [orchestrator]
            tick_interval_ms = 250
            queue_capacity = 8

            [orchestrator.retry]
            max_attempts = 3
            initial_backoff_ms = 100

            [recorder]
            backend = "redis"
            url = "redis://127.0.0.1:6379"

            [gateway]
            taker_fee = 0.0005

            [[controllers]]
            id = "btc-momentum"
            controller_type = "simple_trading"
            instrument = "BTCUSDT"

            [controllers.params]
            total_amount_quote = 100
            take_profit = 0.02
            "#,
        )
        .unwrap();

        assert_eq!(settings.orchestrator.queue_capacity, 8);
        assert_eq!(settings.orchestrator.retry.max_attempts, 3);
        assert_eq!(settings.orchestrator.retry.max_backoff_ms, 30_000);
        assert_eq!(settings.recorder.backend, RecorderBackend::Redis);
        assert_eq!(settings.gateway.taker_fee, dec!(0.0005));
        assert_eq!(settings.controllers.len(), 1);
        assert_eq!(settings.controllers[0].tick_interval_ms, 1_000);
        assert!(settings.controllers[0].params.contains_key("take_profit"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(Settings::from_toml("[orchestrator]\nqueue_capacity = 0").is_err());
        assert!(Settings::from_toml("[recorder]\nbackend = \"postgres\"").is_err());

        let duplicate = r#"
            [[controllers]]
            id = "a"
            controller_type = "simple_trading"
            instrument = "BTCUSDT"

            [[controllers]]
            id = "a"
            controller_type = "simple_trading"
            instrument = "ETHUSDT"
        "#;
        assert!(matches!(
            Settings::from_toml(duplicate),
            Err(SettingsError::Invalid(_))
        ));
    }
}
