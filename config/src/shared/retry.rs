use std::time::Duration;

use serde::Deserialize;

use crate::shared::ValidationError;

/// Fixed delays used by the always-retrying loops.
///
/// None of these back off exponentially.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Pause between a lost replication stream and the reconnection attempt.
    #[serde(default = "default_reader_reconnect_delay_ms")]
    pub reader_reconnect_delay_ms: u64,
    /// Upper bound of one blocking read, after which shutdown is checked.
    #[serde(default = "default_reader_poll_timeout_ms")]
    pub reader_poll_timeout_ms: u64,
    /// Pause after a bus failure before subscribing or writing again.
    #[serde(default = "default_bus_retry_delay_ms")]
    pub bus_retry_delay_ms: u64,
    /// How long the readiness gate waits for the broadcast before re-reading the flag.
    #[serde(default = "default_readiness_poll_interval_ms")]
    pub readiness_poll_interval_ms: u64,
}

impl RetryConfig {
    pub fn reader_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reader_reconnect_delay_ms)
    }

    pub fn reader_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_poll_timeout_ms)
    }

    pub fn bus_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bus_retry_delay_ms)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.reader_poll_timeout_ms == 0 {
            return Err(ValidationError::invalid_field(
                "retry.reader_poll_timeout_ms",
                "must be greater than 0",
            ));
        }
        if self.readiness_poll_interval_ms == 0 {
            return Err(ValidationError::invalid_field(
                "retry.readiness_poll_interval_ms",
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reader_reconnect_delay_ms: default_reader_reconnect_delay_ms(),
            reader_poll_timeout_ms: default_reader_poll_timeout_ms(),
            bus_retry_delay_ms: default_bus_retry_delay_ms(),
            readiness_poll_interval_ms: default_readiness_poll_interval_ms(),
        }
    }
}

fn default_reader_reconnect_delay_ms() -> u64 {
    5_000
}

fn default_reader_poll_timeout_ms() -> u64 {
    1_000
}

fn default_bus_retry_delay_ms() -> u64 {
    5_000
}

fn default_readiness_poll_interval_ms() -> u64 {
    5_000
}
