//! Gate holding consumers back until the initial load was published.
//!
//! Readiness is signalled twice: by a durable flag for consumers starting late and by a
//! broadcast on the status topic for consumers already waiting. The broadcast is not
//! retained, so the gate re-reads the flag periodically in case it missed it.

use config::shared::{ChannelsConfig, RetryConfig};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::bus::Broker;
use crate::workers::dispatcher::READINESS_FLAG_SET;

#[derive(Debug, Clone)]
pub struct ReadinessGate<B> {
    broker: B,
    channels: ChannelsConfig,
    retry: RetryConfig,
}

impl<B: Broker> ReadinessGate<B> {
    pub fn new(broker: B, channels: ChannelsConfig, retry: RetryConfig) -> Self {
        Self {
            broker,
            channels,
            retry,
        }
    }

    /// Returns whether the readiness flag is set. Bus failures count as not ready.
    pub async fn is_ready(&self) -> bool {
        match self.broker.get(&self.channels.readiness_key).await {
            Ok(value) => value.as_deref() == Some(READINESS_FLAG_SET),
            Err(err) => {
                warn!(error = %err, "failed to read readiness flag");
                false
            }
        }
    }

    /// Waits until the initial load is complete.
    ///
    /// Returns immediately, without subscribing, when the flag is already set. Otherwise
    /// waits for the status broadcast while re-reading the flag every poll interval. Bus
    /// failures are retried forever, so this only returns once the load is complete.
    pub async fn wait_until_ready(&self) {
        if self.is_ready().await {
            info!("initial load already complete");
            return;
        }

        info!(topic = %self.channels.status_topic, "waiting for initial load to complete");

        loop {
            let mut subscription = match self.broker.subscribe(&self.channels.status_topic).await {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(error = %err, "failed to subscribe to status topic, retrying");
                    tokio::time::sleep(self.retry.bus_retry_delay()).await;
                    continue;
                }
            };

            // The broadcast may have been sent between the first read and the subscription.
            if self.is_ready().await {
                info!("initial load complete");
                return;
            }

            loop {
                match timeout(self.retry.readiness_poll_interval(), subscription.next()).await {
                    Ok(Some(Ok(message))) if message == self.channels.status_message => {
                        info!("initial load complete broadcast received");
                        return;
                    }
                    Ok(Some(Ok(message))) => {
                        debug!(%message, "ignoring unrelated status message");
                    }
                    Ok(Some(Err(err))) => {
                        warn!(error = %err, "status subscription failed, resubscribing");
                        break;
                    }
                    Ok(None) => {
                        warn!("status subscription closed, resubscribing");
                        break;
                    }
                    Err(_) => {
                        if self.is_ready().await {
                            info!("initial load complete");
                            return;
                        }
                        debug!("still waiting for initial load to complete");
                    }
                }
            }

            drop(subscription);
            tokio::time::sleep(self.retry.bus_retry_delay()).await;
        }
    }
}
