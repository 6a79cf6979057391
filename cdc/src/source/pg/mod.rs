//! Postgres logical replication over the `pgoutput` plugin.

use std::collections::HashSet;
use std::sync::Arc;

use config::shared::{CDC_REPLICATION_OPTIONS, CDC_SCHEMA_OPTIONS, SourceConfig};
use postgres::schema::{ColumnSchema, TableName};
use tokio::runtime::{Builder, Runtime};
use tracing::info;

use crate::error::{EtlError, EtlResult};
use crate::source::LogSource;
use crate::types::ReplicationPosition;

mod client;
mod stream;

pub use client::{CreateSlotResult, GetOrCreateSlotResult, GetSlotResult, PgSourceClient};
pub use stream::{PgRowStream, log_file_for_lsn};

/// Log source reading the WAL of a Postgres database through a replication slot.
///
/// All I/O runs on a current thread runtime owned by the source. The runtime is built on
/// first use, which happens on the reader thread.
pub struct PgLogSource {
    config: SourceConfig,
    watched: Arc<HashSet<TableName>>,
    runtime: Option<Arc<Runtime>>,
}

impl PgLogSource {
    /// Creates a source yielding rows of the `watched` tables only.
    pub fn new(config: SourceConfig, watched: HashSet<TableName>) -> Self {
        Self {
            config,
            watched: Arc::new(watched),
            runtime: None,
        }
    }

    fn runtime(&mut self) -> EtlResult<Arc<Runtime>> {
        if let Some(runtime) = &self.runtime {
            return Ok(runtime.clone());
        }

        let runtime = Arc::new(Builder::new_current_thread().enable_all().build()?);
        self.runtime = Some(runtime.clone());

        Ok(runtime)
    }
}

impl LogSource for PgLogSource {
    type Stream = PgRowStream;

    fn describe_table(&mut self, table: &TableName) -> EtlResult<Vec<ColumnSchema>> {
        let runtime = self.runtime()?;

        runtime.block_on(async {
            let client =
                PgSourceClient::connect_regular(&self.config.connection, &CDC_SCHEMA_OPTIONS)
                    .await?;

            client.describe_table(table).await
        })
    }

    fn open_stream(&mut self, position: Option<&ReplicationPosition>) -> EtlResult<Self::Stream> {
        let runtime = self.runtime()?;

        let (client, stream, start_lsn) = runtime.block_on(async {
            let client = PgSourceClient::connect_replication(
                &self.config.connection,
                &CDC_REPLICATION_OPTIONS,
            )
            .await?;

            let slot = client.get_or_create_slot(&self.config.slot_name).await?;
            let start_lsn = slot.get_start_lsn();

            let stream = client
                .start_logical_replication(
                    &self.config.publication_name,
                    &self.config.slot_name,
                    start_lsn,
                )
                .await?;

            Ok::<_, EtlError>((client, stream, start_lsn))
        })?;

        match position {
            Some(position) => info!(%start_lsn, %position, "replication stream opened, resuming"),
            None => info!(%start_lsn, "replication stream opened"),
        }

        Ok(PgRowStream::new(
            runtime,
            client,
            stream,
            self.watched.clone(),
            start_lsn,
            position.cloned(),
        ))
    }
}
