use serde::Deserialize;

use crate::shared::ValidationError;

/// Names used on the bus.
///
/// Publisher and listeners must agree on every value here.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Topic receiving one message per published row.
    #[serde(default = "default_change_topic")]
    pub change_topic: String,
    /// Topic receiving the single backfill complete broadcast.
    #[serde(default = "default_status_topic")]
    pub status_topic: String,
    /// Key of the durable readiness flag.
    #[serde(default = "default_readiness_key")]
    pub readiness_key: String,
    /// Payload sent on the status topic at the transition.
    #[serde(default = "default_status_message")]
    pub status_message: String,
}

impl ChannelsConfig {
    pub const DEFAULT_CHANGE_TOPIC: &'static str = "weather_data";
    pub const DEFAULT_STATUS_TOPIC: &'static str = "db_status";
    pub const DEFAULT_READINESS_KEY: &'static str = "db_initial_load_complete";
    pub const DEFAULT_STATUS_MESSAGE: &'static str = "initial_load_complete";

    pub fn validate(&self) -> Result<(), ValidationError> {
        let fields = [
            ("channels.change_topic", &self.change_topic),
            ("channels.status_topic", &self.status_topic),
            ("channels.readiness_key", &self.readiness_key),
            ("channels.status_message", &self.status_message),
        ];
        for (field, value) in fields {
            if value.is_empty() {
                return Err(ValidationError::invalid_field(field, "must not be empty"));
            }
        }

        if self.change_topic == self.status_topic {
            return Err(ValidationError::invalid_field(
                "channels.status_topic",
                "must differ from `change_topic`",
            ));
        }

        Ok(())
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            change_topic: default_change_topic(),
            status_topic: default_status_topic(),
            readiness_key: default_readiness_key(),
            status_message: default_status_message(),
        }
    }
}

fn default_change_topic() -> String {
    ChannelsConfig::DEFAULT_CHANGE_TOPIC.to_string()
}

fn default_status_topic() -> String {
    ChannelsConfig::DEFAULT_STATUS_TOPIC.to_string()
}

fn default_readiness_key() -> String {
    ChannelsConfig::DEFAULT_READINESS_KEY.to_string()
}

fn default_status_message() -> String {
    ChannelsConfig::DEFAULT_STATUS_MESSAGE.to_string()
}
