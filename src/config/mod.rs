//! Application configuration.
//!
//! Aggregates broker, consumer, saga, and routing-slip options into a single
//! `BusConfig` loadable from a YAML file and/or environment variables,
//! mirroring `angzarr::config::Config::load`.

mod consumer;
mod routing_slip;
mod saga;

pub use consumer::{ConsumerEndpointConfig, RedeliveryConfig};
pub use routing_slip::{ExecutionMode, RoutingSlipConfig};
pub use saga::SagaConfig;

use serde::Deserialize;

/// Environment variable holding an explicit config file path.
pub const CONFIG_ENV_VAR: &str = "TXBUS_CONFIG";
/// Prefix for configuration environment variables (`TXBUS__BROKER__URL`, ...).
pub const CONFIG_ENV_PREFIX: &str = "TXBUS";
/// Default configuration file name, probed in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "txbus.yaml";

/// Broker connection configuration (spec §4.1 startup sequence).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// AMQP connection URL, e.g. `amqp://localhost:5672`.
    pub url: String,
    /// Cluster namespace prefix applied to exchange/queue names (spec §3.4).
    pub cluster: String,
    /// Default request/reply timeout (spec §4.1 "default 10 s").
    pub reply_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            cluster: "default".to_string(),
            reply_timeout_secs: 10,
        }
    }
}

/// Top-level configuration aggregate.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub broker: BrokerConfig,
    pub sagas: std::collections::HashMap<String, SagaConfig>,
    pub routing_slip: RoutingSlipConfig,
}

impl BusConfig {
    /// Load configuration from file and environment, in priority order:
    /// 1. `txbus.yaml` in the current directory (if present)
    /// 2. the file named by `path`, if given
    /// 3. the file named by `TXBUS_CONFIG`, if set
    /// 4. environment variables prefixed `TXBUS__`
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(p) = path {
            builder = builder.add_source(File::new(p, FileFormat::Yaml).required(true));
        }

        if let Ok(p) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&p, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))
    }

    /// Configuration suitable for tests: defaults only, no file/env lookups.
    pub fn for_test() -> Self {
        Self::default()
    }

    /// Parse a YAML document directly, bypassing the `config` crate's
    /// layered file/env loading (`angzarr::config::Config::from_file`'s
    /// `serde_yaml::from_str` shape) — used by tests and by callers that
    /// already have the document in hand rather than a path.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::Deserialize(e.to_string()))
    }
}

/// Errors loading or parsing configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("failed to deserialize configuration: {0}")]
    Deserialize(String),
}
