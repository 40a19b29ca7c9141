//! Relay configuration module.
//!
//! Configuration is loaded from environment variables with fallback to defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Interface to bind
    pub bind_addr: String,

    /// HTTP + WebSocket port
    pub port: u16,

    /// Secret used to sign socket tokens
    pub jwt_secret: String,

    /// Socket token lifetime in seconds
    pub token_lifetime_secs: i64,

    /// Interval of `__system_heartbeat` sent to every socket
    pub heartbeat_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            bind_addr: "0.0.0.0".to_string(),
            port: 8700,
            jwt_secret: "tandem-relay-dev-secret".to_string(),
            token_lifetime_secs: 300,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let defaults = RelayConfig::default();
        let config = RelayConfig {
            bind_addr: env::var("RELAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse_var("RELAY_PORT", defaults.port)?,
            // Development fallback; deployments set RELAY_JWT_SECRET.
            jwt_secret: env::var("RELAY_JWT_SECRET").unwrap_or(defaults.jwt_secret),
            token_lifetime_secs: parse_var("RELAY_TOKEN_LIFETIME_SECS", defaults.token_lifetime_secs)?,
            heartbeat_interval_ms: parse_var("RELAY_HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval_ms)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jwt_secret.is_empty() {
            return Err(ConfigError::MissingRequired("RELAY_JWT_SECRET".to_string()));
        }
        if self.token_lifetime_secs <= 0 {
            return Err(ConfigError::InvalidValue("RELAY_TOKEN_LIFETIME_SECS".to_string()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue("RELAY_HEARTBEAT_INTERVAL_MS".to_string()));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}")]
    InvalidValue(String),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_address(), "0.0.0.0:8700");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_rejects_zero_heartbeat() {
        let config = RelayConfig {
            heartbeat_interval_ms: 0,
            ..RelayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_rejects_empty_secret() {
        let config = RelayConfig {
            jwt_secret: String::new(),
            ..RelayConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingRequired(_))));
    }
}
