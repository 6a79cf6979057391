use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use postgres::schema::TableName;
use postgres::time::POSTGRES_EPOCH;
use postgres_replication::LogicalReplicationStream;
use postgres_replication::protocol::{
    LogicalReplicationMessage, RelationBody, ReplicationMessage, TupleData,
};
use tokio::runtime::Runtime;
use tokio_postgres::types::PgLsn;
use tracing::debug;

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::source::pg::client::PgSourceClient;
use crate::source::{LogRecord, NextRecord, RawRowEvent, RowEventStream};
use crate::types::{ChangeType, ReplicationPosition};

/// Minimum time between two status updates that were not requested by the server.
const STATUS_UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Encodes the commit LSN of a transaction so that string order matches WAL order.
pub fn log_file_for_lsn(lsn: PgLsn) -> String {
    format!("{:016X}", u64::from(lsn))
}

#[derive(Debug)]
struct Relation {
    table: TableName,
    columns: Arc<[String]>,
}

#[derive(Debug)]
struct Transaction {
    log_file: String,
    next_offset: u64,
    last_position: Option<ReplicationPosition>,
}

#[derive(Debug)]
struct PendingCommit {
    end_lsn: PgLsn,
    last_position: ReplicationPosition,
}

/// Rows of the watched tables read from a `pgoutput` replication stream.
///
/// Every row is positioned at `(commit LSN of its transaction, index in the transaction)`.
/// The WAL is acknowledged up to the end of a transaction only once all of its rows were
/// confirmed, so a reconnect replays at most the rows that were not handed off yet.
pub struct PgRowStream {
    runtime: Arc<Runtime>,
    stream: Pin<Box<LogicalReplicationStream>>,
    _client: PgSourceClient,
    watched: Arc<HashSet<TableName>>,
    relations: HashMap<u32, Relation>,
    transaction: Option<Transaction>,
    pending_commits: VecDeque<PendingCommit>,
    confirmed: Option<ReplicationPosition>,
    received_lsn: PgLsn,
    flush_lsn: PgLsn,
    last_update: Option<Instant>,
    last_flush_lsn: Option<PgLsn>,
}

impl PgRowStream {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        client: PgSourceClient,
        stream: LogicalReplicationStream,
        watched: Arc<HashSet<TableName>>,
        start_lsn: PgLsn,
        resume_after: Option<ReplicationPosition>,
    ) -> Self {
        Self {
            runtime,
            stream: Box::pin(stream),
            _client: client,
            watched,
            relations: HashMap::new(),
            transaction: None,
            pending_commits: VecDeque::new(),
            confirmed: resume_after,
            received_lsn: start_lsn,
            flush_lsn: start_lsn,
            last_update: None,
            last_flush_lsn: None,
        }
    }

    fn handle_message(
        &mut self,
        message: ReplicationMessage<LogicalReplicationMessage>,
    ) -> EtlResult<Option<LogRecord>> {
        match message {
            ReplicationMessage::XLogData(message) => {
                let end_lsn = PgLsn::from(message.wal_end());
                if end_lsn > self.received_lsn {
                    self.received_lsn = end_lsn;
                }

                self.handle_logical_message(message.into_data())
            }
            ReplicationMessage::PrimaryKeepAlive(message) => {
                let end_lsn = PgLsn::from(message.wal_end());
                if end_lsn > self.received_lsn {
                    self.received_lsn = end_lsn;
                }

                debug!(
                    wal_end = %end_lsn,
                    reply_requested = message.reply() == 1,
                    "received keep alive",
                );

                self.send_status_update(message.reply() == 1)?;

                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn handle_logical_message(
        &mut self,
        message: LogicalReplicationMessage,
    ) -> EtlResult<Option<LogRecord>> {
        match message {
            LogicalReplicationMessage::Begin(begin) => {
                self.transaction = Some(Transaction {
                    log_file: log_file_for_lsn(PgLsn::from(begin.final_lsn())),
                    next_offset: 1,
                    last_position: None,
                });

                Ok(None)
            }
            LogicalReplicationMessage::Commit(commit) => {
                let end_lsn = PgLsn::from(commit.end_lsn());
                let transaction = self.transaction.take();

                match transaction.and_then(|transaction| transaction.last_position) {
                    Some(last_position) => self.pending_commits.push_back(PendingCommit {
                        end_lsn,
                        last_position,
                    }),
                    None if self.pending_commits.is_empty() => self.flush_lsn = end_lsn,
                    None => {
                        if let Some(last) = self.pending_commits.back() {
                            let last_position = last.last_position.clone();
                            self.pending_commits.push_back(PendingCommit {
                                end_lsn,
                                last_position,
                            });
                        }
                    }
                }

                self.release_commits();
                self.send_status_update(false)?;

                Ok(None)
            }
            LogicalReplicationMessage::Relation(relation) => {
                self.cache_relation(&relation)?;

                Ok(None)
            }
            LogicalReplicationMessage::Insert(insert) => {
                self.row(insert.rel_id(), ChangeType::Insert, Some(insert.tuple().tuple_data()))
            }
            LogicalReplicationMessage::Update(update) => self.row(
                update.rel_id(),
                ChangeType::Update,
                Some(update.new_tuple().tuple_data()),
            ),
            LogicalReplicationMessage::Delete(delete) => {
                let tuple = delete.old_tuple().or(delete.key_tuple());
                self.row(
                    delete.rel_id(),
                    ChangeType::Delete,
                    tuple.map(|tuple| tuple.tuple_data()),
                )
            }
            _ => Ok(None),
        }
    }

    fn cache_relation(&mut self, relation: &RelationBody) -> EtlResult<()> {
        let table = TableName::new(relation.namespace()?, relation.name()?);
        let columns = relation
            .columns()
            .iter()
            .map(|column| column.name().map(str::to_string))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(%table, rel_id = relation.rel_id(), "cached relation");

        self.relations.insert(
            relation.rel_id(),
            Relation {
                table,
                columns: columns.into(),
            },
        );

        Ok(())
    }

    fn row(
        &mut self,
        rel_id: u32,
        change_type: ChangeType,
        tuple: Option<&[TupleData]>,
    ) -> EtlResult<Option<LogRecord>> {
        let Some(relation) = self.relations.get(&rel_id) else {
            return Err(etl_error!(
                ErrorKind::SourceError,
                "Row received before its relation",
                format!("no relation message was received for relation id {rel_id}")
            ));
        };
        if !self.watched.contains(&relation.table) {
            return Ok(None);
        }

        let Some(transaction) = self.transaction.as_mut() else {
            return Err(etl_error!(
                ErrorKind::SourceError,
                "Row received outside of a transaction",
                format!("row of table {} arrived without a begin message", relation.table)
            ));
        };

        let position = ReplicationPosition::new(transaction.log_file.clone(), transaction.next_offset);
        transaction.next_offset += 1;

        // Rows at or before the resume point were handed off by a previous stream.
        if self
            .confirmed
            .as_ref()
            .is_some_and(|confirmed| position <= *confirmed)
        {
            return Ok(None);
        }

        let values = match tuple {
            Some(tuple) => tuple_to_values(tuple)?,
            None => vec![None; relation.columns.len()],
        };
        transaction.last_position = Some(position.clone());

        Ok(Some(LogRecord {
            position,
            row: RawRowEvent {
                table: relation.table.clone(),
                change_type,
                columns: relation.columns.clone(),
                values,
            },
        }))
    }

    /// Moves the flush position past every transaction whose rows are all confirmed.
    fn release_commits(&mut self) {
        while let Some(commit) = self.pending_commits.front() {
            let released = self
                .confirmed
                .as_ref()
                .is_some_and(|confirmed| commit.last_position <= *confirmed);
            if !released {
                break;
            }

            self.flush_lsn = commit.end_lsn;
            self.pending_commits.pop_front();
        }
    }

    fn send_status_update(&mut self, force: bool) -> EtlResult<()> {
        let write_lsn = self.received_lsn;
        let flush_lsn = self.flush_lsn;

        if !force
            && let (Some(last_update), Some(last_flush)) = (self.last_update, self.last_flush_lsn)
            && flush_lsn == last_flush
            && last_update.elapsed() < STATUS_UPDATE_INTERVAL
        {
            return Ok(());
        }

        // Microseconds since midnight on 2000-01-01.
        let ts = POSTGRES_EPOCH
            .elapsed()
            .map_err(|e| {
                etl_error!(
                    ErrorKind::InvalidState,
                    "Invalid Postgres epoch",
                    e.to_string()
                )
            })?
            .as_micros() as i64;

        self.runtime.block_on(
            self.stream
                .as_mut()
                .standby_status_update(write_lsn, flush_lsn, flush_lsn, ts, 0),
        )?;

        debug!(
            "status update successfully sent (write_lsn = {}, flush_lsn = {})",
            write_lsn, flush_lsn
        );

        self.last_update = Some(Instant::now());
        self.last_flush_lsn = Some(flush_lsn);

        Ok(())
    }
}

impl RowEventStream for PgRowStream {
    fn next_record(&mut self, wait: Duration) -> EtlResult<NextRecord> {
        let deadline = Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(NextRecord::Timeout);
            }

            let runtime = &self.runtime;
            let stream = &mut self.stream;
            let message = runtime.block_on(async { tokio::time::timeout(remaining, stream.next()).await });

            let message = match message {
                Err(_) => return Ok(NextRecord::Timeout),
                Ok(None) => return Ok(NextRecord::End),
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(Some(Ok(message))) => message,
            };

            if let Some(record) = self.handle_message(message)? {
                return Ok(NextRecord::Record(record));
            }
        }
    }

    fn confirm(&mut self, position: &ReplicationPosition) -> EtlResult<()> {
        if self
            .confirmed
            .as_ref()
            .is_none_or(|confirmed| position > confirmed)
        {
            self.confirmed = Some(position.clone());
        }

        let flush_lsn = self.flush_lsn;
        self.release_commits();
        if self.flush_lsn != flush_lsn {
            self.send_status_update(false)?;
        }

        Ok(())
    }
}

fn tuple_to_values(tuple: &[TupleData]) -> EtlResult<Vec<Option<String>>> {
    tuple
        .iter()
        .map(|data| match data {
            TupleData::Null | TupleData::UnchangedToast => Ok(None),
            TupleData::Text(bytes) => Ok(Some(std::str::from_utf8(&bytes[..])?.to_string())),
            TupleData::Binary(_) => Err(etl_error!(
                ErrorKind::ConversionError,
                "Binary format is not supported in tuple data"
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_order_matches_lsn_order() {
        let earlier = log_file_for_lsn(PgLsn::from(0x0000_0000_0FFF_FFFF));
        let later = log_file_for_lsn(PgLsn::from(0x0000_0001_0000_0000));

        assert_eq!(earlier.len(), 16);
        assert!(earlier < later);
    }

    #[test]
    fn unchanged_toast_and_null_become_missing() {
        let tuple = vec![
            TupleData::Null,
            TupleData::UnchangedToast,
            TupleData::Text(bytes::Bytes::from_static(b"21.5")),
        ];

        let values = tuple_to_values(&tuple).unwrap();
        assert_eq!(values, vec![None, None, Some("21.5".to_string())]);
    }
}
