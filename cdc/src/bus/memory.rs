use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info};

use crate::bus::{Broker, Subscription};
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;

/// Messages a slow subscriber may fall behind before it starts losing them.
const TOPIC_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct Inner {
    values: HashMap<String, String>,
    topics: HashMap<String, broadcast::Sender<String>>,
}

/// In-process broker.
///
/// Only reaches subscribers living in the same process. Used by tests and by deployments
/// that run publisher and listeners together.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Inner>>,
    disconnect_tx: broadcast::Sender<()>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);

        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            disconnect_tx,
        }
    }

    /// Ends every active subscription with a connection error, as a dropped connection would.
    pub fn disconnect_subscribers(&self) {
        let _ = self.disconnect_tx.send(());
    }

    /// Returns a copy of every stored key.
    pub async fn values(&self) -> HashMap<String, String> {
        self.inner.lock().await.values.clone()
    }

    /// Number of subscriptions currently attached to `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .await
            .topics
            .get(topic)
            .map(broadcast::Sender::receiver_count)
            .unwrap_or(0)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker for MemoryBroker {
    fn name() -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> EtlResult<Option<String>> {
        Ok(self.inner.lock().await.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> EtlResult<()> {
        self.inner
            .lock()
            .await
            .values
            .insert(key.to_string(), value.to_string());

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> EtlResult<()> {
        let inner = self.inner.lock().await;

        // Without subscribers the message is dropped, like on a real broker.
        let receivers = match inner.topics.get(topic) {
            Some(sender) => sender.send(payload.to_string()).unwrap_or(0),
            None => 0,
        };
        debug!(topic, receivers, "published message");

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EtlResult<Subscription> {
        let mut messages_rx = {
            let mut inner = self.inner.lock().await;
            inner
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe()
        };
        let mut disconnect_rx = self.disconnect_tx.subscribe();

        let (feed, subscription) = Subscription::channel();
        let topic = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = feed.closed() => break,
                    _ = disconnect_rx.recv() => {
                        info!(topic = %topic, "memory subscription disconnected");

                        feed.send(Err(etl_error!(
                            ErrorKind::BusConnectionFailed,
                            "Subscription connection dropped",
                            format!("subscription to topic '{topic}' was disconnected")
                        )))
                        .await;
                        break;
                    }
                    message = messages_rx.recv() => match message {
                        Ok(payload) => {
                            if !feed.send(Ok(payload)).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(topic = %topic, skipped, "memory subscription lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn subscribers_receive_messages_in_order() {
        let broker = MemoryBroker::new();
        let mut first = broker.subscribe("weather_data").await.unwrap();
        let mut second = broker.subscribe("weather_data").await.unwrap();

        for payload in ["a", "b", "c"] {
            broker.publish("weather_data", payload).await.unwrap();
        }

        for subscription in [&mut first, &mut second] {
            for expected in ["a", "b", "c"] {
                assert_eq!(subscription.next().await.unwrap().unwrap(), expected);
            }
        }
    }

    #[tokio::test]
    async fn late_subscribers_miss_earlier_messages() {
        let broker = MemoryBroker::new();
        broker.publish("db_status", "early").await.unwrap();

        let mut subscription = broker.subscribe("db_status").await.unwrap();
        broker.publish("db_status", "late").await.unwrap();

        assert_eq!(subscription.next().await.unwrap().unwrap(), "late");
    }

    #[tokio::test]
    async fn keys_are_stored() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.get("flag").await.unwrap(), None);

        broker.set("flag", "1").await.unwrap();
        assert_eq!(broker.get("flag").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn disconnect_ends_subscriptions_with_an_error() {
        let broker = MemoryBroker::new();
        let mut subscription = broker.subscribe("weather_data").await.unwrap();

        broker.disconnect_subscribers();

        let item = tokio::time::timeout(Duration::from_secs(1), subscription.next())
            .await
            .unwrap();
        let err = item.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusConnectionFailed);
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_a_subscription_detaches_it() {
        let broker = MemoryBroker::new();
        let subscription = broker.subscribe("weather_data").await.unwrap();
        assert_eq!(broker.subscriber_count("weather_data").await, 1);

        drop(subscription);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.subscriber_count("weather_data").await, 0);
    }
}
