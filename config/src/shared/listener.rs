use serde::Deserialize;

use crate::Config;
use crate::shared::{BusConfig, ChannelsConfig, RetryConfig, ValidationError};

/// Configuration of a consumer service running a change listener.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub bus: BusConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.bus.validate()?;
        self.channels.validate()?;
        self.retry.validate()
    }
}

impl Config for ListenerConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}
