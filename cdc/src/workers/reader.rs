use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use config::shared::RetryConfig;
use postgres::schema::TableName;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::concurrency::queue::{ChangeQueueTx, QueueItem};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::mapping::ColumnMapping;
use crate::source::{LogSource, NextRecord, RawRowEvent, RowEventStream};
use crate::types::ReplicationPosition;
use crate::workers::base::{Worker, WorkerHandle};

/// Granularity at which a sleeping reader notices a shutdown request.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// Connection status of the reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStatus {
    Connecting,
    Streaming,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderState {
    pub status: ReaderStatus,
    /// Position of the last row handed to the change queue.
    pub last_position: Option<ReplicationPosition>,
}

impl Default for ReaderState {
    fn default() -> Self {
        Self {
            status: ReaderStatus::Connecting,
            last_position: None,
        }
    }
}

/// Handle to the reader thread.
#[derive(Debug)]
pub struct ReaderWorkerHandle {
    state_rx: watch::Receiver<ReaderState>,
    result_rx: Option<oneshot::Receiver<EtlResult<()>>>,
}

impl ReaderWorkerHandle {
    /// Returns a receiver notified on every state change, for health checks.
    pub fn subscribe_state(&self) -> watch::Receiver<ReaderState> {
        self.state_rx.clone()
    }
}

impl WorkerHandle<ReaderState> for ReaderWorkerHandle {
    fn state(&self) -> ReaderState {
        self.state_rx.borrow().clone()
    }

    async fn wait(mut self) -> EtlResult<()> {
        let Some(result_rx) = self.result_rx.take() else {
            return Ok(());
        };

        match result_rx.await {
            Ok(result) => result,
            Err(_) => Err(etl_error!(
                ErrorKind::ReaderWorkerPanic,
                "Replication reader panicked"
            )),
        }
    }
}

/// Worker tailing the replication log on a dedicated thread.
///
/// Rows of mapped tables are decoded and handed to the change queue in log order. Rows of
/// the marker table become [`QueueItem::BackfillMarker`]. Transport failures close the
/// stream and reopen it after the configured delay from the last handed off position.
pub struct ReaderWorker<S> {
    source: S,
    mapping: Arc<ColumnMapping>,
    marker_table: Option<TableName>,
    queue_tx: ChangeQueueTx,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
}

impl<S> ReaderWorker<S> {
    pub fn new(
        source: S,
        mapping: Arc<ColumnMapping>,
        marker_table: Option<TableName>,
        queue_tx: ChangeQueueTx,
        retry: RetryConfig,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            source,
            mapping,
            marker_table,
            queue_tx,
            retry,
            shutdown_rx,
        }
    }
}

impl<S> Worker<ReaderWorkerHandle, ReaderState> for ReaderWorker<S>
where
    S: LogSource,
{
    type Error = crate::error::EtlError;

    /// Spawns the reader thread and waits until the column mapping was validated against
    /// the live schema.
    async fn start(self) -> EtlResult<ReaderWorkerHandle> {
        info!("starting replication reader");

        let (state_tx, state_rx) = watch::channel(ReaderState::default());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        let span = tracing::info_span!("replication_reader");
        let mut reader = ReaderLoop {
            source: self.source,
            mapping: self.mapping,
            marker_table: self.marker_table,
            queue_tx: self.queue_tx,
            retry: self.retry,
            shutdown_rx: self.shutdown_rx,
            state_tx,
            last_position: None,
            attempt: 0,
        };

        thread::Builder::new()
            .name("replication-reader".to_string())
            .spawn(move || {
                let _guard = span.enter();

                if let Err(err) = reader.validate_mapping() {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                let result = reader.run();
                let _ = result_tx.send(result);
            })?;

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => {
                return Err(etl_error!(
                    ErrorKind::ReaderWorkerPanic,
                    "Replication reader panicked during startup"
                ));
            }
        }

        Ok(ReaderWorkerHandle {
            state_rx,
            result_rx: Some(result_rx),
        })
    }
}

enum StreamExit {
    Shutdown,
    Ended,
    QueueClosed,
}

struct ReaderLoop<S> {
    source: S,
    mapping: Arc<ColumnMapping>,
    marker_table: Option<TableName>,
    queue_tx: ChangeQueueTx,
    retry: RetryConfig,
    shutdown_rx: ShutdownRx,
    state_tx: watch::Sender<ReaderState>,
    last_position: Option<ReplicationPosition>,
    attempt: u32,
}

impl<S: LogSource> ReaderLoop<S> {
    /// Checks every mapped table against its live schema.
    ///
    /// Schema mismatches are fatal, failures to reach the source are retried.
    fn validate_mapping(&mut self) -> EtlResult<()> {
        let tables: Vec<TableName> = self.mapping.tables().cloned().collect();

        for table in tables {
            loop {
                if self.shutdown_rx.is_shutdown() {
                    return Ok(());
                }

                match self.source.describe_table(&table) {
                    Ok(columns) => {
                        self.mapping.validate(&table, &columns)?;
                        info!(%table, "column mapping matches the table schema");
                        break;
                    }
                    Err(err) if err.kind() == ErrorKind::SourceSchemaError => return Err(err),
                    Err(err) => {
                        warn!(%table, error = %err, "failed to read table schema, retrying");
                        if !self.sleep(self.retry.reader_reconnect_delay()) {
                            return Ok(());
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn run(&mut self) -> EtlResult<()> {
        while !self.shutdown_rx.is_shutdown() {
            match self.stream() {
                Ok(StreamExit::Shutdown) => break,
                Ok(StreamExit::QueueClosed) => {
                    info!("change queue closed, stopping replication reader");
                    return Ok(());
                }
                Ok(StreamExit::Ended) => {
                    warn!("replication stream ended, reconnecting");
                }
                Err(err) => {
                    warn!(error = %err, "replication stream failed, reconnecting");
                }
            }

            self.attempt += 1;
            self.set_status(ReaderStatus::Reconnecting {
                attempt: self.attempt,
            });

            if !self.sleep(self.retry.reader_reconnect_delay()) {
                break;
            }
        }

        info!("replication reader stopped due to shutdown");

        Ok(())
    }

    /// Streams until the stream ends, fails, or shutdown is requested.
    fn stream(&mut self) -> EtlResult<StreamExit> {
        let mut stream = self.source.open_stream(self.last_position.as_ref())?;

        self.attempt = 0;
        self.set_status(ReaderStatus::Streaming);
        match &self.last_position {
            Some(position) => info!(%position, "streaming replication log"),
            None => info!("streaming replication log from its start position"),
        }

        loop {
            if self.shutdown_rx.is_shutdown() {
                return Ok(StreamExit::Shutdown);
            }

            let record = match stream.next_record(self.retry.reader_poll_timeout()) {
                Ok(NextRecord::Record(record)) => record,
                Ok(NextRecord::Timeout) => continue,
                Ok(NextRecord::End) => return Ok(StreamExit::Ended),
                Err(err) if err.kind().is_decode_error() => {
                    error!(error = %err, "failed to read row from replication stream, skipping it");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if self
                .last_position
                .as_ref()
                .is_some_and(|last| record.position <= *last)
            {
                debug!(position = %record.position, "skipping row that was already handed off");
                continue;
            }

            if let Some(item) = self.route(&record.row)
                && self.queue_tx.blocking_send(item).is_err()
            {
                return Ok(StreamExit::QueueClosed);
            }

            // The row is handed off from here on, so a failed confirm must not replay it.
            self.last_position = Some(record.position.clone());
            self.state_tx.send_modify(|state| {
                state.last_position = self.last_position.clone();
            });

            stream.confirm(&record.position)?;
        }
    }

    fn route(&self, row: &RawRowEvent) -> Option<QueueItem> {
        if self.marker_table.as_ref() == Some(&row.table) {
            info!(table = %row.table, "backfill marker row received");
            return Some(QueueItem::BackfillMarker);
        }

        if !self.mapping.contains(&row.table) {
            debug!(table = %row.table, "ignoring row of an unmapped table");
            return None;
        }

        match self.mapping.decode(row) {
            Ok(event) => {
                debug!(table = %event.table, change_type = %event.change_type, "decoded row");
                Some(QueueItem::Change(event))
            }
            Err(err) => {
                error!(table = %row.table, error = %err, "failed to decode row, skipping it");
                None
            }
        }
    }

    fn set_status(&self, status: ReaderStatus) {
        self.state_tx.send_modify(|state| state.status = status);
    }

    /// Sleeps for `duration`, returning `false` early if shutdown is requested.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;

        loop {
            if self.shutdown_rx.is_shutdown() {
                return false;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }

            thread::sleep(remaining.min(SHUTDOWN_CHECK_INTERVAL));
        }
    }
}
