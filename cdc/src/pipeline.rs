use std::collections::HashSet;
use std::sync::Arc;

use config::shared::PipelineConfig;
use postgres::schema::TableName;
use tracing::info;

use crate::bail;
use crate::bus::Broker;
use crate::concurrency::queue::create_change_queue;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::error::{ErrorKind, EtlResult};
use crate::mapping::{ColumnMapping, table_name};
use crate::source::LogSource;
use crate::workers::base::{Worker, WorkerHandle};
use crate::workers::dispatcher::{DispatcherState, DispatcherWorker, DispatcherWorkerHandle};
use crate::workers::reader::{ReaderState, ReaderWorker, ReaderWorkerHandle};

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        reader: ReaderWorkerHandle,
        dispatcher: DispatcherWorkerHandle,
    },
}

/// Returns the tables whose rows the log source must yield: the mapped tables and the
/// backfill marker table, if any.
pub fn watched_tables(config: &PipelineConfig) -> HashSet<TableName> {
    config
        .mapping
        .tables
        .iter()
        .map(|table| table_name(&table.table))
        .chain(config.backfill.marker_table.as_ref().map(table_name))
        .collect()
}

/// A replication reader and a dispatcher connected by the change queue.
#[derive(Debug)]
pub struct Pipeline<L, B> {
    config: PipelineConfig,
    source: Option<L>,
    broker: B,
    state: PipelineState,
    shutdown_tx: ShutdownTx,
}

impl<L, B> Pipeline<L, B>
where
    L: LogSource,
    B: Broker + Clone + Send + Sync + 'static,
{
    pub fn new(config: PipelineConfig, source: L, broker: B) -> Self {
        // Workers subscribe through `shutdown_tx`, so the initial receiver is not kept.
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config,
            source: Some(source),
            broker,
            state: PipelineState::NotStarted,
            shutdown_tx,
        }
    }

    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Validates the column mapping against the source and starts both workers.
    ///
    /// Fails when a mapped table does not match its live schema.
    pub async fn start(&mut self) -> EtlResult<()> {
        let Some(source) = self.source.take() else {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline already started",
                "a pipeline can only be started once"
            );
        };

        info!(
            broker = B::name(),
            change_topic = %self.config.channels.change_topic,
            row_threshold = self.config.backfill.row_threshold,
            "starting pipeline"
        );

        let mapping = Arc::new(ColumnMapping::new(&self.config.mapping)?);
        let marker_table = self.config.backfill.marker_table.as_ref().map(table_name);
        if let Some(marker_table) = &marker_table {
            info!(%marker_table, "initial load can be completed by a marker row");
        }

        let (queue_tx, queue_rx) = create_change_queue(self.config.backfill.queue_capacity);

        // The reader validates the mapping before returning, so a schema mismatch fails here
        // before anything is dispatched.
        let reader = ReaderWorker::new(
            source,
            mapping,
            marker_table,
            queue_tx,
            self.config.retry.clone(),
            self.shutdown_tx.subscribe(),
        )
        .start()
        .await?;

        let dispatcher = DispatcherWorker::new(
            self.broker.clone(),
            queue_rx,
            self.config.channels.clone(),
            self.config.backfill.clone(),
            self.config.retry.clone(),
            self.shutdown_tx.subscribe(),
        )
        .start()
        .await?;

        self.state = PipelineState::Started { reader, dispatcher };

        Ok(())
    }

    /// Snapshot of the reader state, once started.
    pub fn reader_state(&self) -> Option<ReaderState> {
        match &self.state {
            PipelineState::Started { reader, .. } => Some(reader.state()),
            PipelineState::NotStarted => None,
        }
    }

    /// Snapshot of the dispatcher state, once started.
    pub fn dispatcher_state(&self) -> Option<DispatcherState> {
        match &self.state {
            PipelineState::Started { dispatcher, .. } => Some(dispatcher.state()),
            PipelineState::NotStarted => None,
        }
    }

    pub async fn wait(self) -> EtlResult<()> {
        let PipelineState::Started { reader, dispatcher } = self.state else {
            info!("pipeline was not started, nothing to wait for");

            return Ok(());
        };

        info!("waiting for replication reader to complete");

        let mut errors = vec![];

        // The dispatcher only completes once the reader released the queue, so the reader is
        // waited first.
        if let Err(err) = reader.wait().await {
            errors.push(err);

            self.shutdown_tx.shutdown();

            info!("replication reader completed with an error, shutting down the dispatcher");
        }

        info!("waiting for dispatcher to complete");

        if let Err(err) = dispatcher.wait().await {
            errors.push(err);

            info!("dispatcher completed with an error");
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    pub fn shutdown(&self) {
        info!("trying to shut down the pipeline");

        self.shutdown_tx.shutdown();

        info!("shut down signal successfully sent to all workers");
    }

    pub async fn shutdown_and_wait(self) -> EtlResult<()> {
        self.shutdown();
        self.wait().await
    }
}
