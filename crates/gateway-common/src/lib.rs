//! # gateway-common
//!
//! Shared ambient stack for the Oversight Gateway workspace: the unified
//! error type, layered configuration, and the health-check response used by
//! `oversight-gateway`.

pub mod error;
pub mod health;

#[cfg(feature = "config")]
pub mod config;

pub use error::{GatewayError, GatewayResult};
pub use health::{health_check, HealthResponse};

#[cfg(feature = "config")]
pub use config::{load_config, DatabaseConfig, ObservabilityConfig};
