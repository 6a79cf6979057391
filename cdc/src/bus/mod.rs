//! Topic based pub/sub with a key/value side channel.
//!
//! The same broker carries the change topic, the status topic and the durable readiness
//! flag. Delivery is best effort: a subscriber only sees messages published while it is
//! subscribed.

use std::future::Future;

use tokio::sync::mpsc;

use crate::error::EtlResult;

pub mod memory;
pub mod redis;

/// Trait for brokers carrying change events and the readiness handshake.
pub trait Broker {
    /// Returns the name of the broker.
    fn name() -> &'static str;

    /// Reads `key`, returning `None` when it is not set.
    fn get(&self, key: &str) -> impl Future<Output = EtlResult<Option<String>>> + Send;

    /// Sets `key` to `value` without expiration.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = EtlResult<()>> + Send;

    /// Publishes `payload` to every current subscriber of `topic`.
    fn publish(&self, topic: &str, payload: &str) -> impl Future<Output = EtlResult<()>> + Send;

    /// Subscribes to `topic`.
    ///
    /// The subscription is active once the returned future resolves.
    fn subscribe(&self, topic: &str) -> impl Future<Output = EtlResult<Subscription>> + Send;
}

/// Messages received on a subscribed topic.
///
/// The subscription ends with `None`, or with an error item when the connection failed.
/// Either way a new subscription must be made to keep receiving. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<EtlResult<String>>,
}

impl Subscription {
    /// Creates a subscription together with the feed its broker task writes to.
    pub fn channel() -> (SubscriptionFeed, Self) {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);

        (SubscriptionFeed { tx }, Self { rx })
    }

    pub async fn next(&mut self) -> Option<EtlResult<String>> {
        self.rx.recv().await
    }
}

/// Broker side of a [`Subscription`].
///
/// The task owning the feed must watch [`SubscriptionFeed::closed`] and release its
/// connection once the subscription is dropped.
#[derive(Debug)]
pub struct SubscriptionFeed {
    tx: mpsc::Sender<EtlResult<String>>,
}

impl SubscriptionFeed {
    /// Delivers `item`, returning `false` when the subscription was dropped.
    pub async fn send(&self, item: EtlResult<String>) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Resolves once the subscription was dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Capacity of the channel between a subscription task and its [`Subscription`].
const SUBSCRIPTION_BUFFER: usize = 1024;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn dropping_a_subscription_lets_the_feed_release_its_connection() {
        let (feed, subscription) = Subscription::channel();
        let (released_tx, released_rx) = oneshot::channel();

        tokio::spawn(async move {
            feed.closed().await;
            let _ = released_tx.send(());
        });

        drop(subscription);
        tokio::time::timeout(Duration::from_secs(1), released_rx)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn feed_reports_a_dropped_subscription() {
        let (feed, mut subscription) = Subscription::channel();

        assert!(feed.send(Ok("a".to_string())).await);
        assert_eq!(subscription.next().await.unwrap().unwrap(), "a");

        drop(subscription);
        assert!(!feed.send(Ok("b".to_string())).await);
    }
}
