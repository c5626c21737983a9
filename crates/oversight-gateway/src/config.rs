//! Process configuration: the figment-layered recipe from
//! `gateway_common::config`, extended with the fields this service alone
//! needs (policy file path, listen port, API key allow-list).

use std::path::PathBuf;

use gateway_common::config::{DatabaseConfig, ObservabilityConfig};
use gateway_common::GatewayResult;
use serde::{Deserialize, Serialize};

fn default_policy_path() -> PathBuf {
    PathBuf::from("policies/default.yaml")
}

fn default_port() -> u16 {
    8001
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub api_keys: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            observability: ObservabilityConfig::default(),
            policy_path: default_policy_path(),
            port: default_port(),
            api_keys: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load from (in precedence order) defaults, an optional TOML file, and
    /// `GATEWAY_`-prefixed environment variables, then fold in
    /// `API_KEY_DEV` / `API_KEY_TEST` if the allow-list is still empty.
    pub fn load(config_file: Option<&str>) -> GatewayResult<Self> {
        let mut config: GatewayConfig = gateway_common::config::load_config("gateway", config_file)?;

        if config.api_keys.is_empty() {
            config.api_keys = ["API_KEY_DEV", "API_KEY_TEST"]
                .iter()
                .filter_map(|var| std::env::var(var).ok())
                .collect();
        }

        Ok(config)
    }
}
