use secrecy::SecretString;
use serde::Deserialize;

use crate::shared::ValidationError;

/// Broker carrying the change and status topics and the readiness flag.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusConfig {
    /// Process-local broker, only useful when publisher and listeners share a process.
    Memory,
    Redis(RedisConfig),
}

impl BusConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            BusConfig::Memory => Ok(()),
            BusConfig::Redis(config) => config.validate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SecretString>,
}

fn default_redis_port() -> u16 {
    6379
}

impl RedisConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::invalid_field("bus.host", "must not be empty"));
        }

        Ok(())
    }
}
