//! Layered configuration loading.
//!
//! Sources, in order of precedence:
//! 1. Defaults (compiled in)
//! 2. Configuration file (TOML), if provided
//! 3. Environment variables (highest)

#[cfg(feature = "config")]
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL.
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_database_url() -> String {
    "postgres://localhost/oversight_gateway".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging.
    #[serde(default)]
    pub json_logs: bool,

    /// OpenTelemetry OTLP endpoint (optional).
    pub otlp_endpoint: Option<String>,

    /// Service name for tracing.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "oversight-gateway".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otlp_endpoint: None,
            service_name: default_service_name(),
        }
    }
}

/// Load configuration of type `T` from layered sources.
///
/// Environment variables are prefixed with the uppercase `prefix` followed
/// by `_`. For example, with prefix "gateway", `GATEWAY_DATABASE_URL` sets
/// `database.url`.
#[cfg(feature = "config")]
pub fn load_config<T: Default + Serialize + for<'de> Deserialize<'de>>(
    prefix: &str,
    config_file: Option<&str>,
) -> Result<T, figment::Error> {
    let mut figment = Figment::new().merge(Serialized::defaults(T::default()));

    if let Some(path) = config_file {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed(&format!("{}_", prefix.to_uppercase())).split("_"));

    figment.extract()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.connect_timeout_secs, 30);
    }

    #[test]
    fn test_observability_config_defaults() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.otlp_endpoint.is_none());
    }
}
