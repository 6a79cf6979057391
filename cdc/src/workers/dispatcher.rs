use config::shared::{BackfillConfig, ChannelsConfig, RetryConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::backfill::{BackfillDetector, LoadPhase, Step, TransitionTrigger};
use crate::bus::Broker;
use crate::concurrency::queue::ChangeQueueRx;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::types::ChangeEvent;
use crate::workers::base::{Worker, WorkerHandle};

/// Value stored under the readiness key once the initial load completed.
pub const READINESS_FLAG_SET: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherState {
    pub phase: LoadPhase,
    /// Rows seen while loading.
    pub rows_seen: u64,
    /// Events published on the change topic, replayed ones included.
    pub published: u64,
    /// Events that could not be published.
    pub dropped: u64,
}

impl Default for DispatcherState {
    fn default() -> Self {
        Self {
            phase: LoadPhase::Loading,
            rows_seen: 0,
            published: 0,
            dropped: 0,
        }
    }
}

#[derive(Debug)]
pub struct DispatcherWorkerHandle {
    state_rx: watch::Receiver<DispatcherState>,
    handle: Option<JoinHandle<EtlResult<()>>>,
}

impl DispatcherWorkerHandle {
    /// Returns a receiver notified on every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatcherState> {
        self.state_rx.clone()
    }
}

impl WorkerHandle<DispatcherState> for DispatcherWorkerHandle {
    fn state(&self) -> DispatcherState {
        self.state_rx.borrow().clone()
    }

    async fn wait(mut self) -> EtlResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err: tokio::task::JoinError| {
            etl_error!(
                ErrorKind::DispatcherWorkerPanic,
                "Dispatcher worker panicked",
                err
            )
        })??;

        Ok(())
    }
}

/// Worker draining the change queue onto the bus.
///
/// While loading, events are buffered by a [`BackfillDetector`]. At the transition the
/// readiness flag is written, the status message is broadcast and the buffer is replayed in
/// arrival order. From then on every event is published as it arrives.
pub struct DispatcherWorker<B> {
    broker: B,
    queue_rx: ChangeQueueRx,
    channels: ChannelsConfig,
    backfill: BackfillConfig,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
}

impl<B> DispatcherWorker<B> {
    pub fn new(
        broker: B,
        queue_rx: ChangeQueueRx,
        channels: ChannelsConfig,
        backfill: BackfillConfig,
        retry: RetryConfig,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            broker,
            queue_rx,
            channels,
            backfill,
            retry,
            shutdown_rx,
        }
    }
}

impl<B> Worker<DispatcherWorkerHandle, DispatcherState> for DispatcherWorker<B>
where
    B: Broker + Clone + Send + Sync + 'static,
{
    type Error = EtlError;

    async fn start(self) -> EtlResult<DispatcherWorkerHandle> {
        info!(
            broker = B::name(),
            row_threshold = self.backfill.row_threshold,
            "starting dispatcher"
        );

        let (state_tx, state_rx) = watch::channel(DispatcherState::default());
        let dispatcher = Dispatcher {
            broker: self.broker,
            channels: self.channels,
            backfill: self.backfill,
            retry: self.retry,
            shutdown_rx: self.shutdown_rx,
            state_tx,
        };

        let queue_rx = self.queue_rx;
        let handle = tokio::spawn(
            dispatcher
                .run(queue_rx)
                .instrument(tracing::info_span!("dispatcher")),
        );

        Ok(DispatcherWorkerHandle {
            state_rx,
            handle: Some(handle),
        })
    }
}

struct Dispatcher<B> {
    broker: B,
    channels: ChannelsConfig,
    backfill: BackfillConfig,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
    state_tx: watch::Sender<DispatcherState>,
}

impl<B: Broker> Dispatcher<B> {
    /// Dispatches queued items until the reader is gone and the queue is drained.
    async fn run(mut self, mut queue_rx: ChangeQueueRx) -> EtlResult<()> {
        let mut detector = self.initial_detector().await;
        self.state_tx
            .send_modify(|state| state.phase = detector.phase());

        while let Some(item) = queue_rx.recv().await {
            match detector.observe(item) {
                Step::Buffered { progress } => {
                    if let Some(progress) = progress {
                        info!(
                            rows_seen = detector.rows_seen(),
                            threshold = detector.threshold(),
                            "initial load {progress}% buffered"
                        );
                    }
                }
                Step::Transition { trigger, replay } => {
                    self.complete_initial_load(trigger, replay).await;
                }
                Step::Publish(event) => self.publish(&event).await,
                Step::Ignore => debug!("ignoring backfill marker, initial load already complete"),
            }

            self.state_tx.send_modify(|state| {
                state.phase = detector.phase();
                state.rows_seen = detector.rows_seen();
            });
        }

        info!("change queue drained, dispatcher stopped");

        Ok(())
    }

    /// Starts live when the readiness flag shows a load completed by an earlier run.
    async fn initial_detector(&mut self) -> BackfillDetector {
        let threshold = self.backfill.row_threshold;
        if !self.backfill.resume_when_ready {
            return BackfillDetector::new(threshold);
        }

        loop {
            match self.broker.get(&self.channels.readiness_key).await {
                Ok(Some(value)) if value == READINESS_FLAG_SET => {
                    info!(
                        key = %self.channels.readiness_key,
                        "initial load already complete, publishing changes right away"
                    );
                    return BackfillDetector::live(threshold);
                }
                Ok(_) => return BackfillDetector::new(threshold),
                Err(err) => {
                    warn!(error = %err, "failed to read readiness flag, retrying");
                    if !self.sleep_unless_shutdown().await {
                        return BackfillDetector::new(threshold);
                    }
                }
            }
        }
    }

    async fn complete_initial_load(&mut self, trigger: TransitionTrigger, replay: Vec<ChangeEvent>) {
        info!(
            ?trigger,
            buffered = replay.len(),
            "initial load complete, switching to live mode"
        );

        self.write_readiness_flag().await;

        if let Err(err) = self
            .broker
            .publish(&self.channels.status_topic, &self.channels.status_message)
            .await
        {
            error!(
                topic = %self.channels.status_topic,
                error = %err,
                "failed to broadcast initial load completion"
            );
        }

        for event in &replay {
            self.publish(event).await;
        }

        info!(replayed = replay.len(), "buffered changes replayed");
    }

    /// Writes the readiness flag, retrying until it succeeds or shutdown is requested.
    async fn write_readiness_flag(&mut self) {
        loop {
            match self
                .broker
                .set(&self.channels.readiness_key, READINESS_FLAG_SET)
                .await
            {
                Ok(()) => {
                    info!(key = %self.channels.readiness_key, "readiness flag set");
                    return;
                }
                Err(err) => {
                    error!(error = %err, "failed to set readiness flag, retrying");
                    if !self.sleep_unless_shutdown().await {
                        warn!("shutdown requested before the readiness flag could be set");
                        return;
                    }
                }
            }
        }
    }

    async fn publish(&self, event: &ChangeEvent) {
        let result = match event.to_payload() {
            Ok(payload) => {
                self.broker
                    .publish(&self.channels.change_topic, &payload)
                    .await
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.state_tx.send_modify(|state| state.published += 1);
            }
            Err(err) => {
                error!(table = %event.table, error = %err, "failed to publish change, dropping it");
                self.state_tx.send_modify(|state| state.dropped += 1);
            }
        }
    }

    /// Waits the bus retry delay. Returns `false` if shutdown was requested meanwhile.
    async fn sleep_unless_shutdown(&mut self) -> bool {
        if self.shutdown_rx.is_shutdown() {
            return false;
        }

        tokio::select! {
            _ = tokio::time::sleep(self.retry.bus_retry_delay()) => true,
            _ = self.shutdown_rx.wait() => false,
        }
    }
}
