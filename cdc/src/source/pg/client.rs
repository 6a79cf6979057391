use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use config::shared::{IntoConnectOptions, PgConnectionConfig, PgConnectionOptions};
use pg_escape::{quote_identifier, quote_literal};
use postgres::schema::{ColumnSchema, TableName};
use postgres_replication::LogicalReplicationStream;
use rustls::ClientConfig;
use tokio_postgres::error::SqlState;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{
    Client, Config, Connection, NoTls, SimpleQueryMessage, SimpleQueryRow, Socket,
    config::ReplicationMode,
};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{Instrument, error, info};

use crate::error::{ErrorKind, EtlResult};
use crate::{bail, etl_error};

/// Spawns a task driving `connection` until it terminates.
fn spawn_postgres_connection<T>(connection: Connection<Socket, T::Stream>)
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let span = tracing::Span::current();
    let task = async move {
        match connection.await {
            Err(err) => error!("an error occurred during the postgres connection: {}", err),
            Ok(()) => info!("postgres connection terminated successfully"),
        }
    }
    .instrument(span);

    // The client terminates the connection when dropped, so the handle is not kept.
    tokio::spawn(task);
}

/// Start position of a slot that was just created.
#[derive(Debug, Clone)]
pub struct CreateSlotResult {
    pub consistent_point: PgLsn,
}

/// Start position of a slot that already existed.
#[derive(Debug, Clone)]
pub struct GetSlotResult {
    pub confirmed_flush_lsn: PgLsn,
}

#[derive(Debug, Clone)]
pub enum GetOrCreateSlotResult {
    CreateSlot(CreateSlotResult),
    GetSlot(GetSlotResult),
}

impl GetOrCreateSlotResult {
    /// Returns the LSN replication should start from.
    ///
    /// A new slot starts at the current WAL tail, an existing one at its checkpoint.
    pub fn get_start_lsn(&self) -> PgLsn {
        match self {
            GetOrCreateSlotResult::CreateSlot(result) => result.consistent_point,
            GetOrCreateSlotResult::GetSlot(result) => result.confirmed_flush_lsn,
        }
    }
}

/// Async client of the source database.
///
/// Used both in logical replication mode, to manage the slot and stream changes, and in
/// regular mode, to read table schemas.
#[derive(Debug, Clone)]
pub struct PgSourceClient {
    client: Arc<Client>,
}

impl PgSourceClient {
    /// Connects in logical replication mode.
    pub async fn connect_replication(
        pg_connection_config: &PgConnectionConfig,
        options: &PgConnectionOptions,
    ) -> EtlResult<Self> {
        let mut config: Config = pg_connection_config.with_db(Some(options));
        config.replication_mode(ReplicationMode::Logical);

        Self::connect(pg_connection_config, config).await
    }

    /// Connects as a regular session for catalog queries.
    pub async fn connect_regular(
        pg_connection_config: &PgConnectionConfig,
        options: &PgConnectionOptions,
    ) -> EtlResult<Self> {
        let config: Config = pg_connection_config.with_db(Some(options));

        Self::connect(pg_connection_config, config).await
    }

    async fn connect(pg_connection_config: &PgConnectionConfig, config: Config) -> EtlResult<Self> {
        match pg_connection_config.tls.enabled {
            true => Self::connect_tls(pg_connection_config, config).await,
            false => Self::connect_no_tls(config).await,
        }
    }

    async fn connect_no_tls(config: Config) -> EtlResult<Self> {
        let (client, connection) = config.connect(NoTls).await?;

        spawn_postgres_connection::<NoTls>(connection);

        info!("successfully connected to postgres without tls");

        Ok(PgSourceClient {
            client: Arc::new(client),
        })
    }

    async fn connect_tls(
        pg_connection_config: &PgConnectionConfig,
        config: Config,
    ) -> EtlResult<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        let mut root_certs_reader =
            BufReader::new(pg_connection_config.tls.trusted_root_certs.as_bytes());
        for cert in rustls_pemfile::certs(&mut root_certs_reader) {
            let cert = cert?;
            root_store.add(cert)?;
        }

        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let (client, connection) = config.connect(MakeRustlsConnect::new(tls_config)).await?;

        spawn_postgres_connection::<MakeRustlsConnect>(connection);

        info!("successfully connected to postgres with tls");

        Ok(PgSourceClient {
            client: Arc::new(client),
        })
    }

    /// Gets the slot named `slot_name`, failing with [`ErrorKind::ReplicationSlotNotFound`]
    /// when it does not exist.
    pub async fn get_slot(&self, slot_name: &str) -> EtlResult<GetSlotResult> {
        let query = format!(
            r#"select confirmed_flush_lsn from pg_replication_slots where slot_name = {};"#,
            quote_literal(slot_name)
        );

        let results = self.client.simple_query(&query).await?;
        for result in results {
            if let SimpleQueryMessage::Row(row) = result {
                let confirmed_flush_lsn =
                    get_row_value::<PgLsn>(&row, "confirmed_flush_lsn", "pg_replication_slots")?;

                return Ok(GetSlotResult {
                    confirmed_flush_lsn,
                });
            }
        }

        bail!(
            ErrorKind::ReplicationSlotNotFound,
            "Replication slot not found",
            format!("Replication slot '{}' not found in database", slot_name)
        );
    }

    pub async fn get_or_create_slot(&self, slot_name: &str) -> EtlResult<GetOrCreateSlotResult> {
        match self.get_slot(slot_name).await {
            Ok(slot) => {
                info!("using existing replication slot '{}'", slot_name);

                Ok(GetOrCreateSlotResult::GetSlot(slot))
            }
            Err(err) if err.kind() == ErrorKind::ReplicationSlotNotFound => {
                info!("creating new replication slot '{}'", slot_name);

                let slot = self.create_slot(slot_name).await?;

                Ok(GetOrCreateSlotResult::CreateSlot(slot))
            }
            Err(err) => Err(err),
        }
    }

    /// Creates a `pgoutput` slot without exporting a snapshot.
    pub async fn create_slot(&self, slot_name: &str) -> EtlResult<CreateSlotResult> {
        // Replication commands must stay uppercase, the replication lexer does not accept
        // lowercase keywords.
        let query = format!(
            r#"CREATE_REPLICATION_SLOT {} LOGICAL pgoutput NOEXPORT_SNAPSHOT"#,
            quote_identifier(slot_name)
        );

        match self.client.simple_query(&query).await {
            Ok(results) => {
                for result in results {
                    if let SimpleQueryMessage::Row(row) = result {
                        let consistent_point =
                            get_row_value::<PgLsn>(&row, "consistent_point", "pg_replication_slots")?;

                        return Ok(CreateSlotResult { consistent_point });
                    }
                }
            }
            Err(err) => {
                if let Some(code) = err.code()
                    && *code == SqlState::DUPLICATE_OBJECT
                {
                    bail!(
                        ErrorKind::ReplicationSlotAlreadyExists,
                        "Replication slot already exists",
                        format!("Replication slot '{}' already exists in database", slot_name)
                    );
                }

                return Err(err.into());
            }
        }

        Err(etl_error!(
            ErrorKind::ReplicationSlotNotCreated,
            "Replication slot creation failed"
        ))
    }

    /// Starts streaming `publication_name` through `slot_name` from `start_lsn`.
    pub async fn start_logical_replication(
        &self,
        publication_name: &str,
        slot_name: &str,
        start_lsn: PgLsn,
    ) -> EtlResult<LogicalReplicationStream> {
        info!(
            "starting logical replication from publication '{}' with slot named '{}' at lsn {}",
            publication_name, slot_name, start_lsn
        );

        let options = format!(
            r#"("proto_version" '1', "publication_names" {})"#,
            quote_literal(quote_identifier(publication_name).as_ref())
        );
        let query = format!(
            r#"START_REPLICATION SLOT {} LOGICAL {} {}"#,
            quote_identifier(slot_name),
            start_lsn,
            options
        );

        let copy_stream = self.client.copy_both_simple::<bytes::Bytes>(&query).await?;

        Ok(LogicalReplicationStream::new(copy_stream))
    }

    /// Reads the columns of `table` from `information_schema.columns`.
    ///
    /// Returns an empty list when the table does not exist.
    pub async fn describe_table(&self, table: &TableName) -> EtlResult<Vec<ColumnSchema>> {
        let (schema, name) = table.as_quoted_literals();
        let query = format!(
            r#"select column_name, data_type, ordinal_position, is_nullable
            from information_schema.columns
            where table_schema = {schema} and table_name = {name}
            order by ordinal_position;"#
        );

        let mut columns = vec![];
        for result in self.client.simple_query(&query).await? {
            if let SimpleQueryMessage::Row(row) = result {
                let name = get_row_value::<String>(&row, "column_name", "information_schema.columns")?;
                let data_type =
                    get_row_value::<String>(&row, "data_type", "information_schema.columns")?;
                let ordinal_position =
                    get_row_value::<i32>(&row, "ordinal_position", "information_schema.columns")?;
                let is_nullable =
                    get_row_value::<String>(&row, "is_nullable", "information_schema.columns")?;

                columns.push(ColumnSchema::new(
                    name,
                    data_type,
                    ordinal_position,
                    is_nullable == "YES",
                ));
            }
        }

        Ok(columns)
    }
}

/// Extracts and parses a column of a simple query row.
fn get_row_value<T: std::str::FromStr>(
    row: &SimpleQueryRow,
    column_name: &str,
    table_name: &str,
) -> EtlResult<T>
where
    T::Err: fmt::Debug,
{
    let value = row.try_get(column_name)?.ok_or(etl_error!(
        ErrorKind::SourceSchemaError,
        "Column not found in source table",
        format!(
            "Column '{}' not found in table '{}'",
            column_name, table_name
        )
    ))?;

    value.parse().map_err(|e: T::Err| {
        etl_error!(
            ErrorKind::ConversionError,
            "Column parsing failed",
            format!(
                "Failed to parse value from column '{}' in table '{}': {:?}",
                column_name, table_name, e
            )
        )
    })
}
