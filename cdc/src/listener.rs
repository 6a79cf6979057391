//! Consumer side of the change topic.
//!
//! A downstream service implements [`ChangeProcessor`] and runs it through a
//! [`ChangeListener`], which waits for the initial load, runs the initial pass and then
//! feeds every published change to the processor, resubscribing after bus failures.

use std::future::Future;

use config::shared::{ChannelsConfig, ListenerConfig, RetryConfig};
use tracing::{Instrument, debug, error, info, warn};

use crate::bus::Broker;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::EtlResult;
use crate::readiness::ReadinessGate;
use crate::types::ChangeEvent;

/// Derived computation run by a downstream service.
pub trait ChangeProcessor {
    /// Returns the name of the processor, used in logs.
    fn name(&self) -> &str;

    /// Runs the full pass over historical data, once the initial load completed.
    ///
    /// A failure is logged and live processing starts anyway.
    fn initial(&mut self) -> impl Future<Output = EtlResult<()>> + Send;

    /// Runs the incremental pass for one published change.
    ///
    /// A failure is logged and the listener moves on to the next change.
    fn process(&mut self, event: ChangeEvent) -> impl Future<Output = EtlResult<()>> + Send;
}

pub struct ChangeListener<B, P> {
    broker: B,
    processor: P,
    channels: ChannelsConfig,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
}

impl<B, P> ChangeListener<B, P>
where
    B: Broker + Clone,
    P: ChangeProcessor,
{
    pub fn new(
        broker: B,
        processor: P,
        channels: ChannelsConfig,
        retry: RetryConfig,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            broker,
            processor,
            channels,
            retry,
            shutdown_rx,
        }
    }

    pub fn from_config(
        broker: B,
        processor: P,
        config: &ListenerConfig,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self::new(
            broker,
            processor,
            config.channels.clone(),
            config.retry.clone(),
            shutdown_rx,
        )
    }

    /// Runs until shutdown is requested, then returns the processor.
    pub async fn run(mut self) -> EtlResult<P> {
        let span = tracing::info_span!("change_listener", processor = %self.processor.name());
        async move {
            let gate = ReadinessGate::new(
                self.broker.clone(),
                self.channels.clone(),
                self.retry.clone(),
            );

            tokio::select! {
                _ = gate.wait_until_ready() => {}
                _ = self.shutdown_rx.wait() => {
                    info!("shutdown requested while waiting for initial load");
                    return Ok(self.processor);
                }
            }

            match self.processor.initial().await {
                Ok(()) => info!("initial pass completed"),
                Err(err) => error!(error = %err, "initial pass failed, listening for changes anyway"),
            }

            while !self.shutdown_rx.is_shutdown() {
                self.listen().await;

                if self.shutdown_rx.is_shutdown() {
                    break;
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.retry.bus_retry_delay()) => {}
                    _ = self.shutdown_rx.wait() => {}
                }
            }

            info!("change listener stopped due to shutdown");

            Ok(self.processor)
        }
        .instrument(span)
        .await
    }

    /// Consumes one subscription until it fails or shutdown is requested.
    async fn listen(&mut self) {
        let topic = self.channels.change_topic.clone();
        let mut subscription = match self.broker.subscribe(&topic).await {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(%topic, error = %err, "failed to subscribe to change topic, retrying");
                return;
            }
        };
        info!(%topic, "listening for changes");

        loop {
            let item = tokio::select! {
                item = subscription.next() => item,
                _ = self.shutdown_rx.wait() => return,
            };

            let payload = match item {
                Some(Ok(payload)) => payload,
                Some(Err(err)) => {
                    warn!(%topic, error = %err, "change subscription failed, resubscribing");
                    return;
                }
                None => {
                    warn!(%topic, "change subscription closed, resubscribing");
                    return;
                }
            };

            let event = match ChangeEvent::from_payload(&payload) {
                Ok(event) => event,
                Err(err) => {
                    error!(error = %err, "failed to decode change payload, skipping it");
                    continue;
                }
            };

            debug!(table = %event.table, change_type = %event.change_type, "processing change");
            if let Err(err) = self.processor.process(event).await {
                error!(error = %err, "failed to process change");
            }
        }
    }
}
