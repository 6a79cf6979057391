use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Notify, RwLock};

use crate::bail;
use crate::bus::{Broker, Subscription};
use crate::error::{ErrorKind, EtlResult};
use crate::test_utils::notify::TimedNotify;

/// A successful operation performed through a [`TestBrokerWrapper`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Get { key: String },
    Set { key: String, value: String },
    Publish { topic: String, payload: String },
    Subscribe { topic: String },
}

type OpCondition = Box<dyn Fn(&[BrokerOp]) -> bool + Send + Sync>;

#[derive(Default)]
struct Inner {
    ops: Vec<BrokerOp>,
    conditions: Vec<(OpCondition, Arc<Notify>)>,
    get_failures: u32,
    set_failures: u32,
    subscribe_failures: u32,
    publish_failures: HashMap<String, u32>,
}

impl Inner {
    fn record(&mut self, op: BrokerOp) {
        self.ops.push(op);

        let ops = &self.ops;
        self.conditions.retain(|(condition, notify)| {
            let should_retain = !condition(ops);
            if !should_retain {
                notify.notify_one();
            }
            should_retain
        });
    }
}

/// Broker wrapper recording every successful operation and failing scripted ones.
///
/// Injected failures are consumed in call order and are not recorded.
#[derive(Clone)]
pub struct TestBrokerWrapper<B> {
    wrapped: B,
    inner: Arc<RwLock<Inner>>,
}

impl<B> TestBrokerWrapper<B> {
    pub fn wrap(broker: B) -> Self {
        Self {
            wrapped: broker,
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    pub fn wrapped(&self) -> &B {
        &self.wrapped
    }

    pub async fn ops(&self) -> Vec<BrokerOp> {
        self.inner.read().await.ops.clone()
    }

    /// Payloads published on `topic`, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<String> {
        published_on(&self.inner.read().await.ops, topic)
    }

    /// Number of subscriptions made to `topic`.
    pub async fn subscriptions(&self, topic: &str) -> usize {
        self.inner
            .read()
            .await
            .ops
            .iter()
            .filter(|op| matches!(op, BrokerOp::Subscribe { topic: t } if t == topic))
            .count()
    }

    /// Fails the next `count` publishes on `topic`.
    pub async fn fail_next_publishes(&self, topic: &str, count: u32) {
        self.inner
            .write()
            .await
            .publish_failures
            .insert(topic.to_string(), count);
    }

    pub async fn fail_next_gets(&self, count: u32) {
        self.inner.write().await.get_failures = count;
    }

    pub async fn fail_next_sets(&self, count: u32) {
        self.inner.write().await.set_failures = count;
    }

    pub async fn fail_next_subscribes(&self, count: u32) {
        self.inner.write().await.subscribe_failures = count;
    }

    /// Returns a notification fired once the recorded operations satisfy `condition`.
    pub async fn notify_on_ops<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&[BrokerOp]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.write().await;

        if condition(&inner.ops) {
            notify.notify_one();
        } else {
            inner.conditions.push((Box::new(condition), notify.clone()));
        }

        TimedNotify::new(notify)
    }

    /// Returns a notification fired once `count` payloads were published on `topic`.
    pub async fn wait_for_publishes(&self, topic: &str, count: usize) -> TimedNotify {
        let topic = topic.to_string();
        self.notify_on_ops(move |ops| published_on(ops, &topic).len() >= count)
            .await
    }

    /// Returns a notification fired once `count` subscriptions to `topic` were made.
    pub async fn wait_for_subscriptions(&self, topic: &str, count: usize) -> TimedNotify {
        let topic = topic.to_string();
        self.notify_on_ops(move |ops| {
            ops.iter()
                .filter(|op| matches!(op, BrokerOp::Subscribe { topic: t } if *t == topic))
                .count()
                >= count
        })
        .await
    }
}

fn published_on(ops: &[BrokerOp], topic: &str) -> Vec<String> {
    ops.iter()
        .filter_map(|op| match op {
            BrokerOp::Publish { topic: t, payload } if t == topic => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter == 0 {
        return false;
    }
    *counter -= 1;
    true
}

impl<B> Broker for TestBrokerWrapper<B>
where
    B: Broker + Send + Sync,
{
    fn name() -> &'static str {
        B::name()
    }

    async fn get(&self, key: &str) -> EtlResult<Option<String>> {
        if take_failure(&mut self.inner.write().await.get_failures) {
            bail!(
                ErrorKind::BusConnectionFailed,
                "Injected get failure",
                format!("reading key '{key}' failed")
            );
        }

        let value = self.wrapped.get(key).await?;
        self.inner.write().await.record(BrokerOp::Get {
            key: key.to_string(),
        });

        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> EtlResult<()> {
        if take_failure(&mut self.inner.write().await.set_failures) {
            bail!(
                ErrorKind::BusConnectionFailed,
                "Injected set failure",
                format!("writing key '{key}' failed")
            );
        }

        self.wrapped.set(key, value).await?;
        self.inner.write().await.record(BrokerOp::Set {
            key: key.to_string(),
            value: value.to_string(),
        });

        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> EtlResult<()> {
        let failed = {
            let mut inner = self.inner.write().await;
            inner
                .publish_failures
                .get_mut(topic)
                .is_some_and(take_failure)
        };
        if failed {
            bail!(
                ErrorKind::PublishFailed,
                "Injected publish failure",
                format!("publishing to '{topic}' failed")
            );
        }

        self.wrapped.publish(topic, payload).await?;
        self.inner.write().await.record(BrokerOp::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EtlResult<Subscription> {
        if take_failure(&mut self.inner.write().await.subscribe_failures) {
            bail!(
                ErrorKind::BusConnectionFailed,
                "Injected subscribe failure",
                format!("subscribing to '{topic}' failed")
            );
        }

        let subscription = self.wrapped.subscribe(topic).await?;
        self.inner.write().await.record(BrokerOp::Subscribe {
            topic: topic.to_string(),
        });

        Ok(subscription)
    }
}
